use crate::core::window::Window;

/// Plan states the executor refuses to apply: nothing is written during the
/// tick and the status falls back to demand mode.
#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum PlanError {
    #[display("windows out of order or overlapping within a set: {first:?} then {second:?}")]
    UnorderedWindows { first: Window, second: Window },

    #[display("charge window {charge:?} still overlaps export window {export:?}")]
    OverlappingWindows { charge: Window, export: Window },

    #[display("charge target {percent}% exceeds capacity")]
    TargetAboveCapacity { percent: f64 },

    #[display("export limit {percent}% out of range")]
    ExportLimitOutOfRange { percent: f64 },
}

/// A single inverter call that failed or timed out. Counted and skipped;
/// the next tick re-derives the full target state, so there is no retry.
#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("inverter call failed: {message}")]
pub struct InverterError {
    pub message: String,
}

impl InverterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}
