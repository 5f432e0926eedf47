//! Scoped batch builder.
//!
//! A [`Writer`] accumulates one outgoing batch: channel, source, an
//! ordered recipient list and an ordered message list. Closing the writer
//! (explicitly, or by dropping it) moves the accumulated state into a
//! pooled batch and hands one send request per recipient to the owning
//! outbox. The emptied core, vectors and all, goes back onto the outbox's
//! per-type writer stack for reuse.
//!
//! A writer with no recipients dispatches nothing. A writer that is still
//! open while its thread unwinds from a panic discards its contents
//! instead of dispatching a half-built batch.

use crate::id::{ActorId, ChannelId};
use crate::outbox::Outbox;
use crate::Payload;

/// Reusable accumulator behind a [`Writer`]; lives on the outbox's
/// per-type writer stack between uses.
pub(crate) struct WriterCore<T> {
    pub(crate) source: ActorId,
    pub(crate) channel: ChannelId,
    pub(crate) recipients: Vec<ActorId>,
    pub(crate) messages: Vec<T>,
}

impl<T> Default for WriterCore<T> {
    fn default() -> Self {
        Self {
            source: ActorId::UNDEFINED,
            channel: 0,
            recipients: Vec::new(),
            messages: Vec::new(),
        }
    }
}

impl<T> WriterCore<T> {
    pub(crate) fn clear(&mut self) {
        self.source = ActorId::UNDEFINED;
        self.channel = 0;
        self.recipients.clear();
        self.messages.clear();
    }
}

/// Builder for one outgoing batch of messages of type `T`.
///
/// Obtained from [`Outbox::begin_send`] (or
/// [`System::begin_send`](crate::System::begin_send)). Dispatches on
/// [`close`](Writer::close) or drop. On a disposed system the writer is
/// inert: every operation is a silent no-op.
pub struct Writer<'a, T: Payload> {
    outbox: &'a mut Outbox,
    core: Option<WriterCore<T>>,
}

impl<'a, T: Payload> Writer<'a, T> {
    pub(crate) fn new(outbox: &'a mut Outbox, core: Option<WriterCore<T>>) -> Self {
        Self { outbox, core }
    }

    /// Overrides the source id stamped on the batch (defaults to the
    /// outbox's current source).
    pub fn set_source(&mut self, source: ActorId) {
        if let Some(core) = &mut self.core {
            core.source = source;
        }
    }

    /// Sets the channel the batch travels on (defaults to 0).
    pub fn set_channel(&mut self, channel: ChannelId) {
        if let Some(core) = &mut self.core {
            core.channel = channel;
        }
    }

    /// Appends a destination; the batch is delivered once per recipient,
    /// in insertion order.
    pub fn add_recipient(&mut self, recipient: impl Into<ActorId>) {
        if let Some(core) = &mut self.core {
            core.recipients.push(recipient.into());
        }
    }

    /// Appends a message; handlers observe messages in insertion order.
    pub fn add_message(&mut self, message: T) {
        if let Some(core) = &mut self.core {
            core.messages.push(message);
        }
    }

    /// Closes the writer, dispatching the batch to every recipient.
    ///
    /// Equivalent to dropping the writer; provided for call sites that
    /// want the dispatch point visible.
    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };
        if std::thread::panicking() {
            self.outbox.discard_writer(core);
        } else {
            self.outbox.finish_writer(core);
        }
    }
}

impl<T: Payload> Drop for Writer<'_, T> {
    fn drop(&mut self) {
        self.finish();
    }
}
