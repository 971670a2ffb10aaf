//! Live event stream: event types, push sources and the per-root listener.

mod listener;
mod source;
mod types;

pub use listener::{EventSink, StreamListener};
pub use source::{ChannelEventSource, EventSource, EventStream};
pub use types::{LedgerEvent, LedgerEventKind};
