//! Concurrency groups: a newer run supersedes the in-flight run of the
//! same group. Pushes group by branch, pull requests by number, so a pull
//! request never cancels a push to its head branch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use quayside_core::TriggerEvent;
use tokio::sync::watch;
use tracing::info;

struct Slot {
    generation: u64,
    cancel: watch::Sender<bool>,
}

/// Registry of in-flight runs keyed by group.
#[derive(Default)]
pub struct ConcurrencyGroups {
    slots: Mutex<HashMap<String, Slot>>,
    next_generation: AtomicU64,
}

impl ConcurrencyGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group key for a pipeline and trigger event.
    pub fn group_key(pipeline: &str, event: &TriggerEvent) -> String {
        match event {
            TriggerEvent::Push { branch } => format!("{pipeline}/push/{branch}"),
            TriggerEvent::PullRequest { number, .. } => format!("{pipeline}/pr/{number}"),
        }
    }

    /// Register a new run in `group`. With `cancel_in_progress`, the run
    /// currently holding the group is signalled to cancel.
    pub fn enter(
        self: &Arc<Self>,
        group: impl Into<String>,
        cancel_in_progress: bool,
    ) -> GroupGuard {
        let group = group.into();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = watch::channel(false);

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slots.insert(
            group.clone(),
            Slot {
                generation,
                cancel: tx,
            },
        ) {
            if cancel_in_progress {
                info!(group = %group, "superseding in-flight run");
                // The receiver may already be gone if that run just ended.
                let _ = previous.cancel.send(true);
            }
        }
        drop(slots);

        GroupGuard {
            groups: Arc::clone(self),
            group,
            generation,
            token: CancelToken { rx },
        }
    }

    /// Cancel whichever run holds `group`. Returns whether one did.
    pub fn cancel(&self, group: &str) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get(group) {
            Some(slot) => slot.cancel.send(true).is_ok(),
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn release(&self, group: &str, generation: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.get(group).map(|s| s.generation) == Some(generation) {
            slots.remove(group);
        }
    }
}

/// Membership of a run in its group; leaving scope releases the group.
pub struct GroupGuard {
    groups: Arc<ConcurrencyGroups>,
    group: String,
    generation: u64,
    token: CancelToken,
}

impl GroupGuard {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.groups.release(&self.group, self.generation);
    }
}

/// Cancellation signal observed by a running pipeline.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Token that is never cancelled.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Sender dropped: value stays false forever.
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is signalled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
