// Scheduling and dispatch orchestration

pub mod engine;
pub mod report;

pub use engine::Dispatcher;
pub use report::{DeliveredPair, FireReport, PairFailure, ScheduleOutcome};
