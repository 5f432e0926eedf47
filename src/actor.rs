//! Actor cells and the dispatch loop.
//!
//! An [`ActorCell`] owns an actor's inbound queue (the consumer side of
//! its delivery chain), its handler table, and the ownership flag that
//! guarantees at most one thread dispatches it at a time. Cells are moved
//! to their runner at creation (a worker thread for background actors,
//! the system's foreground list otherwise) and stay there for the life of
//! the system.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::batch::BatchRef;
use crate::chain::{ChainReceiver, ChainSender};
use crate::error::{panic_text, HandlerError};
use crate::id::ActorId;
use crate::inbox::Inbox;
use crate::outbox::{Outbox, OutboxScope};

/// One batch queued for one recipient actor.
pub(crate) struct Delivery {
    pub(crate) dest: ActorId,
    pub(crate) batch: BatchRef,
}

/// Receipt for one completed delivery, routed back to the pump thread for
/// batch release (and error surfacing, when the handler failed).
pub(crate) struct Completion {
    pub(crate) batch: BatchRef,
    pub(crate) error: Option<HandlerError>,
}

const IDLE: u32 = 0;
const RUNNING: u32 = 1;

/// A live actor: inbound queue, handler table, ownership flag.
pub(crate) struct ActorCell {
    id: ActorId,
    inbox_rx: ChainReceiver<Delivery>,
    handlers: Inbox,
    owner: AtomicU32,
    processed: u64,
}

impl ActorCell {
    pub(crate) fn new(id: ActorId, inbox_rx: ChainReceiver<Delivery>, handlers: Inbox) -> Self {
        Self {
            id,
            inbox_rx,
            handlers,
            owner: AtomicU32::new(IDLE),
            processed: 0,
        }
    }

    pub(crate) fn id(&self) -> ActorId {
        self.id
    }

    /// Total deliveries this actor has consumed.
    pub(crate) fn processed(&self) -> u64 {
        self.processed
    }

    /// Drains up to `limit` deliveries, dispatching each through the
    /// handler table and emitting one completion per delivery. Returns
    /// the number consumed; returns 0 immediately when another caller
    /// holds the ownership flag (that caller drains whatever arrived
    /// before it releases).
    pub(crate) fn run(
        &mut self,
        outbox: &mut Outbox,
        completions: &mut ChainSender<Completion>,
        limit: usize,
    ) -> usize {
        if self
            .owner
            .compare_exchange(IDLE, RUNNING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return 0;
        }

        outbox.set_source(self.id);
        let mut handled = 0;
        while handled < limit {
            let Some(delivery) = self.inbox_rx.pop() else {
                break;
            };
            let error = self.dispatch(&delivery, outbox);
            completions.push(Completion {
                batch: delivery.batch,
                error,
            });
            handled += 1;
            self.processed += 1;
        }
        outbox.set_source(ActorId::UNDEFINED);

        self.owner.store(IDLE, Ordering::Release);
        handled
    }

    fn dispatch(&mut self, delivery: &Delivery, outbox: &mut Outbox) -> Option<HandlerError> {
        let scope = OutboxScope::enter(outbox);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.handlers.receive(delivery.dest, delivery.batch.as_ref());
        }));
        drop(scope);

        match outcome {
            Ok(()) => None,
            Err(payload) => Some(HandlerError {
                actor: self.id,
                source: delivery.batch.source(),
                channel: delivery.batch.channel(),
                payload_type: delivery.batch.payload_type_name(),
                message_count: delivery.batch.message_count(),
                panic: panic_text(payload.as_ref()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchPool;
    use crate::chain::{self, DEFAULT_CHAIN_CAPACITY};
    use crate::system::Shared;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    struct Fixture {
        cell: ActorCell,
        inbox_tx: ChainSender<Delivery>,
        outbox: Outbox,
        completion_tx: ChainSender<Completion>,
        completion_rx: ChainReceiver<Completion>,
    }

    fn fixture(build: impl FnOnce(&mut Inbox)) -> Fixture {
        let (inbox_tx, inbox_rx) = chain::channel(DEFAULT_CHAIN_CAPACITY);
        let (send_tx, _send_rx) = chain::channel(DEFAULT_CHAIN_CAPACITY);
        let (completion_tx, completion_rx) = chain::channel(DEFAULT_CHAIN_CAPACITY);
        let mut handlers = Inbox::default();
        build(&mut handlers);
        Fixture {
            cell: ActorCell::new(ActorId::from(1), inbox_rx, handlers),
            inbox_tx,
            outbox: Outbox::new(Arc::new(Shared::new()), send_tx),
            completion_tx,
            completion_rx,
        }
    }

    fn queue_one(fixture: &mut Fixture, messages: Vec<i32>) {
        let pool = BatchPool::<i32>::new();
        let mut recipients = vec![ActorId::from(1)];
        let mut messages = messages;
        // SAFETY: single-threaded test.
        let batch = unsafe { pool.acquire(ActorId::from(2), 0, &mut recipients, &mut messages) };
        fixture.inbox_tx.push(Delivery {
            dest: ActorId::from(1),
            batch,
        });
    }

    #[test]
    fn drains_deliveries_and_emits_completions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = Arc::clone(&seen);
        let mut fx = fixture(move |inbox| {
            inbox.on_all::<i32>(move |mail| {
                seen_in_handler
                    .lock()
                    .expect("lock poisoned")
                    .extend_from_slice(mail.messages);
            });
        });

        queue_one(&mut fx, vec![1, 2]);
        queue_one(&mut fx, vec![3]);
        let handled = fx
            .cell
            .run(&mut fx.outbox, &mut fx.completion_tx, usize::MAX);

        assert_eq!(handled, 2);
        assert_eq!(fx.cell.processed(), 2);
        assert_eq!(*seen.lock().expect("lock poisoned"), vec![1, 2, 3]);
        assert!(fx.completion_rx.pop().expect("receipt").error.is_none());
        assert!(fx.completion_rx.pop().expect("receipt").error.is_none());
        assert!(fx.completion_rx.pop().is_none());
    }

    #[test]
    fn limit_bounds_a_single_activation() {
        let mut fx = fixture(|inbox| {
            inbox.on_all::<i32>(|_| {});
        });
        for _ in 0..5 {
            queue_one(&mut fx, vec![0]);
        }

        assert_eq!(fx.cell.run(&mut fx.outbox, &mut fx.completion_tx, 2), 2);
        assert_eq!(fx.cell.run(&mut fx.outbox, &mut fx.completion_tx, 2), 2);
        assert_eq!(fx.cell.run(&mut fx.outbox, &mut fx.completion_tx, 2), 1);
    }

    #[test]
    fn held_ownership_flag_blocks_entry() {
        let mut fx = fixture(|inbox| {
            inbox.on_all::<i32>(|_| {});
        });
        queue_one(&mut fx, vec![0]);

        fx.cell.owner.store(RUNNING, Ordering::Release);
        assert_eq!(
            fx.cell.run(&mut fx.outbox, &mut fx.completion_tx, usize::MAX),
            0
        );

        fx.cell.owner.store(IDLE, Ordering::Release);
        assert_eq!(
            fx.cell.run(&mut fx.outbox, &mut fx.completion_tx, usize::MAX),
            1
        );
    }

    #[test]
    fn panicking_handler_attaches_context_and_processing_continues() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_handler = Arc::clone(&hits);
        let mut fx = fixture(move |inbox| {
            inbox.on_all::<i32>(move |mail| {
                if mail.messages.contains(&13) {
                    panic!("unlucky payload");
                }
                hits_in_handler.fetch_add(1, Ordering::Relaxed);
            });
        });

        queue_one(&mut fx, vec![13]);
        queue_one(&mut fx, vec![1]);
        let handled = fx
            .cell
            .run(&mut fx.outbox, &mut fx.completion_tx, usize::MAX);
        assert_eq!(handled, 2);

        let failed = fx.completion_rx.pop().expect("receipt");
        let error = failed.error.expect("error attached");
        assert_eq!(error.actor, ActorId::from(1));
        assert_eq!(error.source, ActorId::from(2));
        assert_eq!(error.message_count, 1);
        assert!(error.panic.contains("unlucky payload"));
        assert!(error.payload_type.contains("i32"));

        assert!(fx.completion_rx.pop().expect("receipt").error.is_none());
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn source_is_set_for_the_duration_of_the_run() {
        let mut fx = fixture(|inbox| {
            inbox.on_all::<i32>(|mail| {
                // Messages emitted by a handler are attributed to the
                // actor being dispatched.
                mail.send(7u32, 99i32);
            });
        });
        queue_one(&mut fx, vec![0]);

        let (send_tx, mut send_rx) = chain::channel(DEFAULT_CHAIN_CAPACITY);
        let mut outbox = Outbox::new(Arc::new(Shared::new()), send_tx);
        fx.cell.run(&mut outbox, &mut fx.completion_tx, usize::MAX);

        let request = send_rx.pop().expect("handler send queued");
        assert_eq!(request.dest, ActorId::from(7));
        assert_eq!(request.batch.source(), ActorId::from(1));
    }
}
