//! In-process actor messaging runtime.
//!
//! `skein` delivers typed, batched messages between named actors running
//! on a mixture of the main (foreground) thread and a pool of background
//! workers. Producers accumulate batches through pooled [`Writer`]s;
//! closed batches travel through per-producer lock-free SPSC queues, are
//! routed by the main-thread pump, and are consumed by per-actor handler
//! tables. Delivery is ordered (pairwise FIFO per producer/consumer pair,
//! insertion order inside a batch) and at-most-once, and the host can
//! block until quiescence via [`System::run_all`].
//!
//! # Architecture
//!
//! ```text
//! Layer 0: id, error                         (no internal deps)
//! Layer 1: ring, chain                       (SPSC primitives)
//! Layer 2: batch, writer, outbox, inbox      (batching + dispatch)
//! Layer 3: actor, worker, registry           (execution)
//! Layer 4: system                            (pump + lifecycle)
//! ```
//!
//! # Example
//!
//! ```
//! use skein::{ActorId, Rule, System, SystemOptions};
//!
//! let mut system = System::new(SystemOptions {
//!     worker_threads: 0,
//!     ..SystemOptions::default()
//! });
//!
//! // Actor 1 echoes every i32 back to its sender.
//! system.register(Rule::foreground(
//!     |id| id == ActorId::from(1),
//!     |_, inbox| {
//!         inbox.on_all::<i32>(|mail| {
//!             for &value in mail.messages {
//!                 mail.respond(value);
//!             }
//!         });
//!     },
//! ));
//!
//! system.send_from(1u32, 41i32, ActorId::from(2), 0);
//! system.run().expect("no handler failures");
//! assert_eq!(system.pending(), 0);
//! ```

mod actor;
mod batch;
mod chain;
mod ring;
mod worker;

pub mod error;
pub mod id;
pub mod inbox;
pub mod outbox;
pub mod registry;
pub mod system;
pub mod writer;

pub use batch::Payload;
pub use error::HandlerError;
pub use id::{ActorId, ChannelId};
pub use inbox::{Inbox, Mail};
pub use outbox::{with_active, Outbox};
pub use registry::Rule;
pub use system::{System, SystemOptions};
pub use writer::Writer;
