//! Job records, timer recurrences and lease bookkeeping.

pub mod recurrence;
pub mod types;

pub use recurrence::{Iterations, Recurrence, RecurrenceError, Repeat};
pub use types::{
    ASYNC_CONTINUATION, DEFAULT_RETRIES, ExceptionPayload, Job, JobKind, Lease, TIMER_START_EVENT,
    TRIGGER_TIMER, TimerSpec,
};
