//! Consumer-side timing between `get_next` calls.

/// Measures the gap between one request returning and the next one starting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimingRecorder {
    num_input_events: u64,
    input_time_ns: u64,
    last_output_time_ns: Option<u64>,
}

impl TimingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request starts at `now_ns`.
    ///
    /// Counts an event only when a previous request has completed. A clock
    /// that went backwards contributes a gap of 0.
    pub fn record_input(&mut self, now_ns: u64) {
        if let Some(last) = self.last_output_time_ns {
            self.input_time_ns = self
                .input_time_ns
                .saturating_add(now_ns.saturating_sub(last));
            self.num_input_events += 1;
        }
    }

    /// A request returned at `now_ns`.
    pub fn record_output(&mut self, now_ns: u64) {
        self.last_output_time_ns = Some(now_ns);
    }

    pub fn num_input_events(&self) -> u64 {
        self.num_input_events
    }

    /// Sum of all recorded gaps.
    pub fn input_time_ns(&self) -> u64 {
        self.input_time_ns
    }

    /// Mean gap, 0 before the first event.
    pub fn self_input_time_ns(&self) -> u64 {
        if self.num_input_events == 0 {
            0
        } else {
            self.input_time_ns / self.num_input_events
        }
    }
}
