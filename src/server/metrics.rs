//! Packet counters and stage timings, injected into every stage as
//! `Arc<dyn MetricsSink>`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {
    GatewayIn,
    GatewayOut,
    Decoder,
    Decrypter,
    MacProcessor,
    SchedulerIn,
    SchedulerOut,
    Encoder,
    MicFailed,
    CounterFailed,
    ConfirmedUp,
    UnconfirmedUp,
    ConfirmedDown,
    UnconfirmedDown,
    JoinRequest,
    JoinAccept,
    MissedDeadline,
}

impl Counter {
    pub const ALL: [Counter; 17] = [
        Counter::GatewayIn,
        Counter::GatewayOut,
        Counter::Decoder,
        Counter::Decrypter,
        Counter::MacProcessor,
        Counter::SchedulerIn,
        Counter::SchedulerOut,
        Counter::Encoder,
        Counter::MicFailed,
        Counter::CounterFailed,
        Counter::ConfirmedUp,
        Counter::UnconfirmedUp,
        Counter::ConfirmedDown,
        Counter::UnconfirmedDown,
        Counter::JoinRequest,
        Counter::JoinAccept,
        Counter::MissedDeadline,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::GatewayIn => "gateway_in",
            Counter::GatewayOut => "gateway_out",
            Counter::Decoder => "decoder",
            Counter::Decrypter => "decrypter",
            Counter::MacProcessor => "mac_processor",
            Counter::SchedulerIn => "scheduler_in",
            Counter::SchedulerOut => "scheduler_out",
            Counter::Encoder => "encoder",
            Counter::MicFailed => "mic_failed",
            Counter::CounterFailed => "counter_failed",
            Counter::ConfirmedUp => "confirmed_up",
            Counter::UnconfirmedUp => "unconfirmed_up",
            Counter::ConfirmedDown => "confirmed_down",
            Counter::UnconfirmedDown => "unconfirmed_down",
            Counter::JoinRequest => "join_request",
            Counter::JoinAccept => "join_accept",
            Counter::MissedDeadline => "missed_deadline",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub trait MetricsSink: Send + Sync {
    fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    fn add(&self, counter: Counter, value: u64);

    /// Records how long one pass through a stage took
    fn observe(&self, counter: Counter, elapsed: Duration);
}

#[derive(Default)]
struct Timing {
    count: AtomicU64,
    total_micros: AtomicU64,
}

/// Lock-free counters kept in process
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: [AtomicU64; 17],
    timings: [Timing; 17],
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Number of observations and their mean
    pub fn timing(&self, counter: Counter) -> (u64, Duration) {
        let timing = &self.timings[counter.index()];
        let count = timing.count.load(Ordering::Relaxed);
        let total = timing.total_micros.load(Ordering::Relaxed);
        let mean = if count == 0 { 0 } else { total / count };
        (count, Duration::from_micros(mean))
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        Counter::ALL
            .iter()
            .map(|c| (c.name(), self.get(*c)))
            .collect()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn add(&self, counter: Counter, value: u64) {
        self.counters[counter.index()].fetch_add(value, Ordering::Relaxed);
    }

    fn observe(&self, counter: Counter, elapsed: Duration) {
        let timing = &self.timings[counter.index()];
        timing.count.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        timing.total_micros.fetch_add(micros, Ordering::Relaxed);
    }
}
