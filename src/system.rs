//! Top-level orchestrator.
//!
//! A [`System`] owns the registry, the foreground actors, the background
//! worker handles, and the main thread's producer outbox. The main thread
//! drives everything through the pump cycle:
//!
//! 1. Drain every completion queue, releasing each batch (and surfacing
//!    any handler failure).
//! 2. Drain every send queue, resolving destinations through the registry
//!    (creating actors on demand) and pushing deliveries onto recipient
//!    inboxes; background recipients get their worker woken.
//! 3. Run the foreground actors for one bounded pass.
//!
//! [`run`](System::run) repeats the cycle until it makes no progress;
//! [`run_all`](System::run_all) additionally sleeps in 1 ms steps while
//! background work is still pending. Quiescence is tracked by two
//! monotonic counters: a delivery is *sent* when its writer closes and
//! *disposed* when its completion is drained (or when the pump drops it
//! for an undefined destination), so `sent == disposed` means nothing is
//! in flight anywhere.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::actor::{ActorCell, Completion, Delivery};
use crate::chain::{self, ChainReceiver, ChainSender, DEFAULT_CHAIN_CAPACITY};
use crate::error::HandlerError;
use crate::id::{ActorId, ChannelId};
use crate::outbox::{Outbox, SendRequest};
use crate::registry::{Endpoint, Execution, Placement, Registry, Rule};
use crate::worker::WorkerHandle;
use crate::writer::Writer;
use crate::Payload;

/// State shared between the pump thread, the workers, and every outbox.
pub(crate) struct Shared {
    /// Cleared by [`System::dispose`]; workers exit and outboxes discard
    /// new sends once this is false.
    pub(crate) live: AtomicBool,
    /// Deliveries submitted (one per batch recipient), monotonic.
    pub(crate) sent: AtomicU64,
    /// Deliveries completed or dropped, monotonic.
    pub(crate) disposed: AtomicU64,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            sent: AtomicU64::new(0),
            disposed: AtomicU64::new(0),
        }
    }
}

/// Construction options for a [`System`].
#[derive(Clone, Debug)]
pub struct SystemOptions {
    /// Number of background worker threads. `0` disables background
    /// execution entirely: every actor runs on the main thread.
    pub worker_threads: usize,
    /// Maximum deliveries one actor consumes per activation. Bounds the
    /// pump's service time and keeps siblings on the same worker from
    /// starving. `0` is treated as `1`.
    pub process_limit: u32,
}

impl Default for SystemOptions {
    fn default() -> Self {
        Self {
            worker_threads: thread::available_parallelism()
                .map_or(1, |n| n.get().saturating_sub(1).max(1)),
            process_limit: u32::MAX,
        }
    }
}

/// The actor messaging runtime.
///
/// Not `Send`: the system lives on the thread that pumps it. See the
/// crate docs for the full flow.
pub struct System {
    shared: Arc<Shared>,
    registry: Registry,
    foreground: Vec<ActorCell>,
    workers: Vec<WorkerHandle>,
    outbox: Outbox,
    send_rx: ChainReceiver<SendRequest>,
    completion_tx: ChainSender<Completion>,
    completion_rx: ChainReceiver<Completion>,
    process_limit: usize,
    next_worker: usize,
    disposed: bool,
}

impl System {
    /// Creates a system and spawns its background workers.
    #[must_use]
    pub fn new(options: SystemOptions) -> Self {
        let shared = Arc::new(Shared::new());
        let process_limit = usize::try_from(options.process_limit.max(1)).unwrap_or(usize::MAX);

        let mut workers = Vec::with_capacity(options.worker_threads);
        for index in 0..options.worker_threads {
            match WorkerHandle::spawn(index, &shared, process_limit) {
                Ok(handle) => workers.push(handle),
                Err(error) => {
                    tracing::warn!(worker = index, %error, "failed to spawn worker");
                }
            }
        }
        tracing::debug!(
            workers = workers.len(),
            process_limit,
            "message system started"
        );

        let (send_tx, send_rx) = chain::channel(DEFAULT_CHAIN_CAPACITY);
        let (completion_tx, completion_rx) = chain::channel(DEFAULT_CHAIN_CAPACITY);
        Self {
            outbox: Outbox::new(Arc::clone(&shared), send_tx),
            shared,
            registry: Registry::default(),
            foreground: Vec::new(),
            workers,
            send_rx,
            completion_tx,
            completion_rx,
            process_limit,
            next_worker: 0,
            disposed: false,
        }
    }

    /// Registers one rule. Rules should be in place before the first send
    /// reaches an id they claim; an actor already created is never
    /// rebuilt.
    pub fn register(&mut self, rule: Rule) {
        self.registry.register(rule);
    }

    /// Registers several rules in order.
    pub fn register_all(&mut self, rules: impl IntoIterator<Item = Rule>) {
        for rule in rules {
            self.register(rule);
        }
    }

    /// Opens a writer on the main-thread outbox.
    pub fn begin_send<T: Payload>(&mut self) -> Writer<'_, T> {
        self.outbox.begin_send()
    }

    /// Sends one message to `dest` from the main thread.
    pub fn send<T: Payload>(&mut self, dest: impl Into<ActorId>, message: T) {
        self.outbox.send(dest, message);
    }

    /// Sends a batch of messages to `dest` from the main thread.
    pub fn send_all<T: Payload>(
        &mut self,
        dest: impl Into<ActorId>,
        messages: impl IntoIterator<Item = T>,
    ) {
        self.outbox.send_all(dest, messages);
    }

    /// Sends one message with an explicit source and channel.
    pub fn send_from<T: Payload>(
        &mut self,
        dest: impl Into<ActorId>,
        message: T,
        source: ActorId,
        channel: ChannelId,
    ) {
        self.outbox.send_from(dest, message, source, channel);
    }

    /// Deliveries still in flight (sent minus disposed).
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.shared
            .sent
            .load(Ordering::Relaxed)
            .wrapping_sub(self.shared.disposed.load(Ordering::Relaxed))
    }

    /// Pumps until a full cycle makes no progress.
    ///
    /// Returns the first handler failure drained during the run (after
    /// finishing the cycle it surfaced in); further failures in the same
    /// run are logged. Background work may still be pending on return;
    /// use [`run_all`](System::run_all) to wait for quiescence.
    ///
    /// # Errors
    ///
    /// The first [`HandlerError`] drained during the run.
    pub fn run(&mut self) -> Result<(), HandlerError> {
        let mut first_error = None;
        loop {
            let mut work = 0;
            work += self.drain_completions(&mut first_error);
            work += self.route_sends(&mut first_error);
            work += self.run_foreground();
            if work == 0 {
                break;
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Runs until quiescence: pumps, then sleeps in 1 ms steps while
    /// background deliveries are pending, pumping again after each step.
    ///
    /// # Errors
    ///
    /// The first [`HandlerError`] drained, as for [`run`](System::run).
    pub fn run_all(&mut self) -> Result<(), HandlerError> {
        loop {
            self.run()?;
            if self.pending() == 0 {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Shuts down: new sends are discarded, workers are woken, joined,
    /// and every actor is dropped. Idempotent; also runs on drop.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        self.shared.live.store(false, Ordering::Release);
        for worker in &self.workers {
            worker.wake();
        }
        for worker in &mut self.workers {
            worker.join();
        }

        for cell in &self.foreground {
            tracing::debug!(
                actor = %cell.id(),
                processed = cell.processed(),
                "dropping foreground actor at dispose"
            );
        }
        self.foreground.clear();
        self.registry.live.clear();
        tracing::debug!("message system disposed");
    }

    /// Pump step 1: drain completion queues, releasing batches and
    /// counting disposals.
    fn drain_completions(&mut self, first_error: &mut Option<HandlerError>) -> usize {
        let mut drained = 0;
        for worker in &mut self.workers {
            while let Some(completion) = worker.completion_rx.pop() {
                Self::settle(&self.shared, completion, first_error);
                drained += 1;
            }
        }
        while let Some(completion) = self.completion_rx.pop() {
            Self::settle(&self.shared, completion, first_error);
            drained += 1;
        }
        drained
    }

    fn settle(shared: &Shared, completion: Completion, first_error: &mut Option<HandlerError>) {
        if let Some(error) = completion.error {
            metrics::counter!("skein_handler_failures").increment(1);
            if first_error.is_some() {
                tracing::error!(%error, "handler failure");
            } else {
                *first_error = Some(error);
            }
        }
        // SAFETY: This is the pump thread, the single producer of the
        // batch's pool shelf, and each completion releases exactly once.
        unsafe { completion.batch.release() };
        shared.disposed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("skein_messages_disposed").increment(1);
    }

    /// Pump step 2: drain send queues and route each request onto its
    /// recipient's inbox chain.
    fn route_sends(&mut self, first_error: &mut Option<HandlerError>) -> usize {
        let mut routed = 0;
        for index in 0..self.workers.len() {
            while let Some(request) = self.workers[index].send_rx.pop() {
                self.deliver(request, first_error);
                routed += 1;
            }
        }
        while let Some(request) = self.send_rx.pop() {
            self.deliver(request, first_error);
            routed += 1;
        }
        routed
    }

    fn deliver(&mut self, request: SendRequest, first_error: &mut Option<HandlerError>) {
        let resolved = self.registry.resolve(request.dest);
        if resolved.is_undefined() {
            tracing::trace!("delivery to undefined destination dropped");
            Self::settle(
                &self.shared,
                Completion {
                    batch: request.batch,
                    error: None,
                },
                first_error,
            );
            return;
        }

        if !self.registry.live.contains_key(&resolved) {
            self.create_actor(resolved);
        }
        let Some(endpoint) = self.registry.live.get_mut(&resolved) else {
            // Creation cannot fail today, but an unroutable delivery must
            // still dispose or quiescence would never be reached.
            Self::settle(
                &self.shared,
                Completion {
                    batch: request.batch,
                    error: None,
                },
                first_error,
            );
            return;
        };
        endpoint.inbox_tx.push(Delivery {
            dest: resolved,
            batch: request.batch,
        });
        if let Placement::Background(index) = endpoint.place {
            self.workers[index].wake();
        }
    }

    fn create_actor(&mut self, id: ActorId) {
        let (handlers, execution) = self.registry.plan(id);
        let (inbox_tx, inbox_rx) = chain::channel(DEFAULT_CHAIN_CAPACITY);
        let cell = ActorCell::new(id, inbox_rx, handlers);

        let place = if execution == Execution::Foreground || self.workers.is_empty() {
            tracing::debug!(actor = %id, "actor created on the foreground");
            self.foreground.push(cell);
            Placement::Foreground
        } else {
            let index = self.next_worker % self.workers.len();
            self.next_worker += 1;
            tracing::debug!(actor = %id, worker = index, "actor created on a worker");
            self.workers[index].actor_tx.push(cell);
            self.workers[index].wake();
            Placement::Background(index)
        };

        self.registry.live.insert(id, Endpoint { inbox_tx, place });
    }

    /// Pump step 3: one bounded pass over the foreground actors.
    fn run_foreground(&mut self) -> usize {
        let mut handled = 0;
        for cell in &mut self.foreground {
            handled += cell.run(&mut self.outbox, &mut self.completion_tx, self.process_limit);
        }
        handled
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.dispose();
    }
}
