//! Turn orchestration and trigger-run execution: the core of Shrimp, wiring
//! config, persistence, the LLM client, and the tool registry behind a
//! single [`Runtime`] capability object in place of a global singleton.

mod bubbles;
mod cancellation;
mod error;
mod events;
mod history;
mod trigger;
mod turn;

pub use cancellation::CancellationToken;
pub use error::{Result, RuntimeError};
pub use events::{EventSink, NullSink, TurnEvent};
pub use trigger::TriggerRunOutcome;
pub use turn::{resolve_channel_conversation, Runtime, TurnRequest, TurnResult};
