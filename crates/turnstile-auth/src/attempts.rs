//! Suspended attempt store
//!
//! Holds the token of every attempt awaiting its next round, keyed by
//! attempt id. A resumption checks the slot out exclusively; a second
//! resumption of the same attempt while the first is still running is
//! rejected instead of being merged.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use turnstile_common::AttemptId;

use crate::error::EngineError;

#[derive(Debug)]
struct Slot {
    token: String,
    expires_at: u64,
    checked_out: bool,
}

/// Attempt id → parked token
#[derive(Debug, Default)]
pub struct AttemptStore {
    slots: DashMap<AttemptId, Slot>,
}

impl AttemptStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a token for a newly suspended attempt
    pub fn insert(&self, id: AttemptId, token: String, expires_at: u64) {
        self.slots.insert(
            id,
            Slot {
                token,
                expires_at,
                checked_out: false,
            },
        );
    }

    /// Take exclusive ownership of a parked attempt.
    ///
    /// The slot stays reserved until the returned lease is committed,
    /// finished or dropped.
    pub fn checkout(&self, id: &AttemptId) -> Result<AttemptLease<'_>, EngineError> {
        let mut slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| EngineError::AttemptNotFound(id.to_string()))?;
        if slot.checked_out {
            return Err(EngineError::ConcurrentResumption(id.to_string()));
        }
        slot.checked_out = true;
        let token = slot.token.clone();
        drop(slot);

        Ok(AttemptLease {
            store: self,
            id: id.clone(),
            token,
            done: false,
        })
    }

    /// Ids of parked attempts whose deadline is at or before `now`.
    ///
    /// Attempts currently checked out are skipped; their holder sees the
    /// deadline when it decodes the state.
    pub fn expired(&self, now: u64) -> Vec<AttemptId> {
        self.slots
            .iter()
            .filter(|slot| !slot.checked_out && slot.expires_at <= now)
            .map(|slot| slot.key().clone())
            .collect()
    }

    pub fn remove(&self, id: &AttemptId) -> bool {
        self.slots.remove(id).is_some()
    }

    pub fn contains(&self, id: &AttemptId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn release(&self, id: &AttemptId) {
        if let Some(mut slot) = self.slots.get_mut(id) {
            slot.checked_out = false;
        }
    }

    fn store(&self, id: &AttemptId, token: String, expires_at: u64) {
        match self.slots.entry(id.clone()) {
            Entry::Occupied(mut e) => {
                let slot = e.get_mut();
                slot.token = token;
                slot.expires_at = expires_at;
                slot.checked_out = false;
            }
            Entry::Vacant(e) => {
                e.insert(Slot {
                    token,
                    expires_at,
                    checked_out: false,
                });
            }
        }
    }
}

/// Exclusive hold on one parked attempt. Releases the slot unchanged on drop.
#[derive(Debug)]
pub struct AttemptLease<'a> {
    store: &'a AttemptStore,
    id: AttemptId,
    token: String,
    done: bool,
}

impl AttemptLease<'_> {
    /// Token as it was when the lease was taken
    pub fn token(&self) -> &str {
        &self.token
    }

    pub const fn id(&self) -> &AttemptId {
        &self.id
    }

    /// Store the advanced state and release the slot
    pub fn commit(mut self, token: String, expires_at: u64) {
        self.store.store(&self.id, token, expires_at);
        self.done = true;
    }

    /// Drop the attempt entirely
    pub fn finish(mut self) {
        self.store.remove(&self.id);
        self.done = true;
    }
}

impl Drop for AttemptLease<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.store.release(&self.id);
        }
    }
}
