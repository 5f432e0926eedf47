//! Background worker threads.
//!
//! Each worker owns a disjoint set of background actors, assigned once at
//! creation and never migrated. The main thread hands new cells over
//! through an SPSC chain and wakes the worker whenever it has delivered
//! messages to any of the worker's actors. The worker loops over its
//! actors in strict round-robin passes (each actor bounded by the
//! configured process limit) until a full pass makes no progress, then
//! parks.
//!
//! All traffic out of a worker (send requests from its outbox, completion
//! receipts from its dispatch loop) flows through per-worker SPSC chains
//! drained by the main thread's pump.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::actor::{ActorCell, Completion};
use crate::chain::{self, ChainReceiver, ChainSender, DEFAULT_CHAIN_CAPACITY};
use crate::outbox::{Outbox, SendRequest};
use crate::system::Shared;

/// Park timeout: parked workers recheck the liveness flag at this
/// interval, bounding shutdown latency even if a wake is missed.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Wake primitive: a flag under a mutex plus a condvar. The flag makes a
/// wake that races with the worker's last empty pass stick until the next
/// park, so no wakeup is lost.
pub(crate) struct Parker {
    flagged: Mutex<bool>,
    cond: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            flagged: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn wake(&self) {
        let mut flagged = self
            .flagged
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *flagged = true;
        self.cond.notify_one();
    }

    fn park(&self, timeout: Duration) {
        let mut flagged = self
            .flagged
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !*flagged {
            flagged = self
                .cond
                .wait_timeout(flagged, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *flagged = false;
    }
}

/// Main-thread handle to a background worker: the consumer ends of its
/// outbound queues, the producer end of its actor-assignment queue, and
/// its wake handle.
pub(crate) struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    parker: Arc<Parker>,
    pub(crate) actor_tx: ChainSender<ActorCell>,
    pub(crate) send_rx: ChainReceiver<SendRequest>,
    pub(crate) completion_rx: ChainReceiver<Completion>,
}

impl WorkerHandle {
    /// Spawns worker thread `index` and returns its main-side handle.
    pub(crate) fn spawn(
        index: usize,
        shared: &Arc<Shared>,
        process_limit: usize,
    ) -> std::io::Result<Self> {
        let (actor_tx, actor_rx) = chain::channel(DEFAULT_CHAIN_CAPACITY);
        let (send_tx, send_rx) = chain::channel(DEFAULT_CHAIN_CAPACITY);
        let (completion_tx, completion_rx) = chain::channel(DEFAULT_CHAIN_CAPACITY);
        let parker = Arc::new(Parker::new());

        let core = WorkerCore {
            index,
            shared: Arc::clone(shared),
            actor_rx,
            owned: Vec::new(),
            outbox: Outbox::new(Arc::clone(shared), send_tx),
            completion_tx,
            parker: Arc::clone(&parker),
            process_limit,
        };
        let thread = thread::Builder::new()
            .name(format!("skein-worker-{index}"))
            .spawn(move || core.run())?;

        Ok(Self {
            thread: Some(thread),
            parker,
            actor_tx,
            send_rx,
            completion_rx,
        })
    }

    pub(crate) fn wake(&self) {
        self.parker.wake();
    }

    /// Joins the worker thread (the caller must have cleared the shared
    /// liveness flag and woken the worker first).
    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Thread-side state of a worker.
struct WorkerCore {
    index: usize,
    shared: Arc<Shared>,
    actor_rx: ChainReceiver<ActorCell>,
    owned: Vec<ActorCell>,
    outbox: Outbox,
    completion_tx: ChainSender<Completion>,
    parker: Arc<Parker>,
    process_limit: usize,
}

impl WorkerCore {
    fn run(mut self) {
        tracing::debug!(worker = self.index, "worker started");

        while self.shared.live.load(Ordering::Acquire) {
            self.adopt_assigned();

            // Round-robin passes until a full pass yields nothing. New
            // assignments are picked up between passes so a freshly placed
            // actor is served in the same wake cycle.
            loop {
                let mut pass = 0;
                for cell in &mut self.owned {
                    pass += cell.run(&mut self.outbox, &mut self.completion_tx, self.process_limit);
                }
                self.adopt_assigned();
                if pass == 0 {
                    break;
                }
            }

            if !self.shared.live.load(Ordering::Acquire) {
                break;
            }
            self.parker.park(PARK_TIMEOUT);
        }

        for cell in &self.owned {
            tracing::debug!(
                worker = self.index,
                actor = %cell.id(),
                processed = cell.processed(),
                "worker dropping actor at shutdown"
            );
        }
        tracing::debug!(worker = self.index, "worker exiting");
    }

    fn adopt_assigned(&mut self) {
        while let Some(cell) = self.actor_rx.pop() {
            tracing::debug!(worker = self.index, actor = %cell.id(), "actor assigned");
            self.owned.push(cell);
        }
    }
}
