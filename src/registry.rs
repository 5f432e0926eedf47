//! Declarative actor rules and the live-actor map.
//!
//! Actors are never spawned directly. The host registers [`Rule`]s up
//! front; when the pump first routes a message to an unknown id, the
//! registry resolves redirects, picks the winning factory rule, and the
//! system builds and places the actor. Rule selection: a foreground rule
//! beats a background rule regardless of registration order; among rules
//! of the same execution kind, the last registered wins. With no matching
//! rule the id gets a null actor with an empty handler table, so traffic
//! to it drops silently while the pending counters stay balanced.

use std::collections::HashMap;

use crate::actor::Delivery;
use crate::chain::ChainSender;
use crate::id::ActorId;
use crate::inbox::Inbox;

type Predicate = dyn Fn(ActorId) -> bool;
type Builder = dyn Fn(ActorId, &mut Inbox);

/// Where a matched rule's actors execute. Foreground outranks background
/// when several rules claim the same id; redirects rank below both and
/// are resolved before factory selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Execution {
    #[expect(dead_code, reason = "rank exists for rule ordering; redirects are rewritten before factory selection")]
    Route,
    Background,
    Foreground,
}

enum RuleKind {
    Redirect { from: ActorId, to: ActorId },
    Factory {
        predicate: Box<Predicate>,
        execution: Execution,
        build: Box<Builder>,
    },
}

/// A registration handed to [`System::register`](crate::System::register).
pub struct Rule(RuleKind);

impl Rule {
    /// Routes every message addressed to `from` on to `to` instead.
    /// Redirects apply in registration order, so chains compose.
    #[must_use]
    pub fn redirect(from: impl Into<ActorId>, to: impl Into<ActorId>) -> Self {
        Self(RuleKind::Redirect {
            from: from.into(),
            to: to.into(),
        })
    }

    /// Creates actors on a background worker for every id `predicate`
    /// claims; `build` registers the actor's handlers.
    #[must_use]
    pub fn background(
        predicate: impl Fn(ActorId) -> bool + 'static,
        build: impl Fn(ActorId, &mut Inbox) + 'static,
    ) -> Self {
        Self(RuleKind::Factory {
            predicate: Box::new(predicate),
            execution: Execution::Background,
            build: Box::new(build),
        })
    }

    /// Creates actors dispatched on the main thread for every id
    /// `predicate` claims; `build` registers the actor's handlers.
    #[must_use]
    pub fn foreground(
        predicate: impl Fn(ActorId) -> bool + 'static,
        build: impl Fn(ActorId, &mut Inbox) + 'static,
    ) -> Self {
        Self(RuleKind::Factory {
            predicate: Box::new(predicate),
            execution: Execution::Foreground,
            build: Box::new(build),
        })
    }
}

/// Where a live actor's cell was placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Runs on the main thread during the pump.
    Foreground,
    /// Owned by the background worker at this index.
    Background(usize),
}

/// Main-thread route to a live actor: the producer end of its delivery
/// chain plus its placement (for wake signalling).
pub(crate) struct Endpoint {
    pub(crate) inbox_tx: ChainSender<Delivery>,
    pub(crate) place: Placement,
}

/// Rule list plus the map of actors created so far. Touched only by the
/// pump thread.
#[derive(Default)]
pub(crate) struct Registry {
    rules: Vec<Rule>,
    pub(crate) live: HashMap<ActorId, Endpoint>,
}

impl Registry {
    pub(crate) fn register(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Applies every redirect in registration order; the result is the id
    /// the message is actually for.
    pub(crate) fn resolve(&self, id: ActorId) -> ActorId {
        let mut current = id;
        for rule in &self.rules {
            if let RuleKind::Redirect { from, to } = rule.0 {
                if current == from {
                    current = to;
                }
            }
        }
        current
    }

    /// Builds the handler table for `id` from the winning factory rule.
    /// Falls back to an empty table (a null actor) placed foreground when
    /// nothing matches.
    pub(crate) fn plan(&self, id: ActorId) -> (Inbox, Execution) {
        let mut chosen: Option<(Execution, &Builder)> = None;
        for rule in &self.rules {
            if let RuleKind::Factory {
                predicate,
                execution,
                build,
            } = &rule.0
            {
                if !predicate(id) {
                    continue;
                }
                // Higher execution kind dominates; equal kinds fall to the
                // later registration.
                if chosen
                    .as_ref()
                    .is_none_or(|(best, _)| *execution >= *best)
                {
                    chosen = Some((*execution, build.as_ref()));
                }
            }
        }

        let mut inbox = Inbox::default();
        match chosen {
            Some((execution, build)) => {
                build(id, &mut inbox);
                (inbox, execution)
            }
            None => {
                tracing::debug!(actor = %id, "no factory rule matched, using null actor");
                (inbox, Execution::Foreground)
            }
        }
    }
}
