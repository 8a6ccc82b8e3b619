//! Job lifecycle notifications.
//!
//! The scheduler emits [`JobEvent`]s through an [`EventDispatcher`]. The
//! dispatcher is optional: a disabled dispatcher turns every emission into a
//! no-op, so callers never need to branch on whether anyone is listening.

pub mod bus;
pub mod dispatcher;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use dispatcher::{BusEventDispatcher, EventDispatcher, NoopEventDispatcher};
pub use event::{JobEvent, JobEventKind};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
