//! Errors surfaced by the runtime.
//!
//! Only handler failures are observable to the host (everything else is
//! recovered locally or dropped by design). A panic inside a handler is
//! caught at the actor dispatch boundary, wrapped with its delivery
//! context, carried on the completion back to the pump thread, and
//! returned from [`System::run`](crate::System::run).

use std::any::Any;
use std::fmt;

use crate::id::{ActorId, ChannelId};

/// A handler panicked while consuming a delivered batch.
///
/// The delivery still counts as complete: the batch was released and the
/// actor keeps processing subsequent messages.
#[derive(Debug, Clone)]
pub struct HandlerError {
    /// Actor whose handler failed.
    pub actor: ActorId,
    /// Source stamped on the failing batch.
    pub source: ActorId,
    /// Channel the batch travelled on.
    pub channel: ChannelId,
    /// Payload type name of the batch.
    pub payload_type: &'static str,
    /// Number of messages in the batch.
    pub message_count: usize,
    /// Text extracted from the panic payload.
    pub panic: String,
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handler for {} panicked on actor {} (source {}, channel {}, {} message(s)): {}",
            self.payload_type,
            self.actor,
            self.source,
            self.channel,
            self.message_count,
            self.panic
        )
    }
}

impl std::error::Error for HandlerError {}

/// Best-effort text extraction from a panic payload.
pub(crate) fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
