mod collector;
mod counters;

pub use collector::{spawn_stats_collector, write_request_log_line};
pub use counters::{Counters, DayCounters, RequestKind, TokenUsageEntry};
