//! Mock construction helpers

use mockall::mock;
use pipeline_autotune::prelude::*;
use pipeline_autotune::{AutotuneError, Result};
use std::sync::Mutex;

// Upstream iterator with scripted results
mock! {
    pub Upstream {}

    impl DatasetIterator for Upstream {
        type Item = i64;

        fn get_next(&mut self, ctx: &IteratorContext) -> Result<Option<i64>>;
        fn save(&mut self, checkpoint: &mut Checkpoint) -> Result<()>;
        fn restore(&mut self, ctx: &IteratorContext, checkpoint: &Checkpoint) -> Result<()>;
    }
}

/// Dataset that hands out one prepared [`MockUpstream`]
pub struct MockDataset {
    upstream: Mutex<Option<MockUpstream>>,
}

impl MockDataset {
    pub fn new(upstream: MockUpstream) -> Self {
        Self {
            upstream: Mutex::new(Some(upstream)),
        }
    }
}

impl Dataset for MockDataset {
    type Item = i64;
    type Iter = MockUpstream;

    fn make_iterator(&self, _ctx: &IteratorContext) -> Result<MockUpstream> {
        self.upstream
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AutotuneError::Configuration("mock upstream already taken".to_string()))
    }
}

/// Upstream yielding `0..n` and then end of sequence
pub fn counting_upstream(n: i64) -> MockUpstream {
    let mut upstream = MockUpstream::new();
    let mut next = 0;
    upstream.expect_get_next().returning(move |_| {
        let out = (next < n).then_some(next);
        next += 1;
        Ok(out)
    });
    upstream
}
