//! Identity types for the pipeline model.
//!
//! Node ids are newtypes over `u32`, assigned sequentially by the owning
//! [`Model`](super::Model) in the order nodes are added.

use std::fmt;

/// Model-assigned node identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Id carried by nodes built outside of any model.
    pub const INVALID: NodeId = NodeId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "NodeId(INVALID)")
        } else {
            write!(f, "NodeId({})", self.0)
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "detached")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id() {
        let id = NodeId(42);
        assert!(id.is_valid());
        assert_eq!(id.index(), 42);
        assert!(!NodeId::INVALID.is_valid());
    }

    #[test]
    fn test_node_id_formatting() {
        assert_eq!(format!("{:?}", NodeId(3)), "NodeId(3)");
        assert_eq!(format!("{:?}", NodeId::INVALID), "NodeId(INVALID)");
        assert_eq!(NodeId(7).to_string(), "7");
    }
}
