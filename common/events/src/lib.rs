pub mod model;
pub mod sink;

pub use model::{EventDisposition, EventError, EventResult, SecurityEvent};
pub use sink::EventSink;
