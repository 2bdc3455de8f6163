//! Pending-invocation table.
//!
//! Each outstanding `invoke` owns one entry keyed by its correlation id. The
//! entry holds the `oneshot` sender that settles the caller's future; settling
//! removes the entry and consumes the sender, so an invocation can settle only
//! once no matter whether a Completion, a timeout or a connection loss comes
//! first.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::HubError;

/// Single-assignment result slot of an invocation.
pub(crate) type ResultSlot = oneshot::Sender<Result<Value, HubError>>;

#[derive(Debug)]
struct PendingInvocation {
    target: String,
    deadline: Instant,
    slot: ResultSlot,
}

/// Outstanding invocations of one connection.
#[derive(Debug, Default)]
pub(crate) struct PendingInvocations {
    entries: HashMap<String, PendingInvocation>,
    /// Never reset, so ids stay unique for the connection's lifetime.
    next_id: u64,
}

impl PendingInvocations {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocate a correlation id not used by any pending entry.
    pub(crate) fn next_id(&mut self) -> String {
        loop {
            let id = self.next_id.to_string();
            self.next_id = self.next_id.wrapping_add(1);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    pub(crate) fn insert(&mut self, id: String, target: String, deadline: Instant, slot: ResultSlot) {
        self.entries.insert(
            id,
            PendingInvocation {
                target,
                deadline,
                slot,
            },
        );
    }

    /// Settle `id` with `outcome`. Returns `false` when `id` is not pending
    /// (already settled, or never issued).
    pub(crate) fn settle(&mut self, id: &str, outcome: Result<Value, HubError>) -> bool {
        let Some(pending) = self.entries.remove(id) else {
            return false;
        };
        // The caller may have stopped waiting; that is not an error here.
        let _ = pending.slot.send(outcome);
        true
    }

    /// Earliest deadline among pending entries.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|p| p.deadline).min()
    }

    /// Fail every entry whose deadline is at or before `now` with
    /// [`HubError::Timeout`]. Returns the targets of the expired calls.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut targets = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(pending) = self.entries.remove(&id) {
                targets.push(pending.target);
                let _ = pending.slot.send(Err(HubError::Timeout));
            }
        }
        targets
    }

    /// Fail every entry with `error`. Returns how many were failed.
    pub(crate) fn fail_all(&mut self, error: &HubError) -> usize {
        let count = self.entries.len();
        for (_, pending) in self.entries.drain() {
            let _ = pending.slot.send(Err(error.clone()));
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
