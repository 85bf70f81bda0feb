//! State machine trait.

use crate::{Action, Event, SafetyViolation};
use std::time::Duration;

/// A deterministic, synchronous state machine.
///
/// `handle` runs to completion without blocking; all I/O happens through
/// the returned actions. An `Err` is a safety violation: the host must stop
/// feeding the machine and halt the replica.
pub trait StateMachine {
    /// Process one event.
    fn handle(&mut self, event: Event) -> Result<Vec<Action>, SafetyViolation>;

    /// Advance the machine's wall clock. Called by the host before `handle`.
    fn set_time(&mut self, now: Duration);
}
