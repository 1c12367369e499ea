use std::{
    borrow::Borrow,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use dashmap::DashMap;

/// Work that can be folded into a later run of the same key.
pub trait Coalesce {
    fn coalesce(self, later: Self) -> Self;
}

#[derive(Debug)]
struct SlotState<W> {
    running: bool,
    pending: Option<W>,
}

#[derive(Debug)]
struct Slot<W>(Mutex<SlotState<W>>);

impl<W> Default for Slot<W> {
    fn default() -> Self {
        Self(Mutex::new(SlotState {
            running: false,
            pending: None,
        }))
    }
}

impl<W> Slot<W> {
    fn state(&self) -> MutexGuard<'_, SlotState<W>> {
        // A panic in another runner leaves nothing to repair.
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the slot if the runner unwinds.
struct Running<'a, W>(Option<&'a Slot<W>>);

impl<W> Drop for Running<'_, W> {
    fn drop(&mut self) {
        if let Some(slot) = self.0.take() {
            let mut state = slot.state();
            state.running = false;
            state.pending = None;
        }
    }
}

/// What happened to work handed to [`LockManager::run_coalesced`].
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The caller ran the work, plus everything deferred to it meanwhile.
    Ran(T),
    /// Another caller is running this key and will run the work after its pass.
    Deferred,
}

/// Per-key exclusive runs that never make a caller wait for another one.
///
/// Work arriving for a busy key is parked in the key's slot and merged with
/// anything already parked there; the current runner picks it up when it is done.
#[derive(Debug)]
pub struct LockManager<K, W>(DashMap<K, Arc<Slot<W>>>)
where
    K: Hash + Eq;

impl<K, W> LockManager<K, W>
where
    K: Hash + Eq,
    W: Coalesce,
{
    pub fn new() -> Self {
        Self(DashMap::new())
    }

    /// Runs `f` on `work` unless `key` is already running, in which case the
    /// work is left for the running caller. Returns the result of the last pass.
    pub fn run_coalesced<T, F>(&self, key: K, work: W, mut f: F) -> Outcome<T>
    where
        F: FnMut(W) -> T,
    {
        let slot = self.0.entry(key).or_default().clone();
        {
            let mut state = slot.state();
            if state.running {
                state.pending = Some(match state.pending.take() {
                    Some(parked) => parked.coalesce(work),
                    None => work,
                });
                return Outcome::Deferred;
            }
            state.running = true;
        }

        let mut running = Running(Some(&*slot));
        let mut work = work;
        loop {
            let result = f(work);
            let mut state = slot.state();
            match state.pending.take() {
                Some(next) => work = next,
                None => {
                    state.running = false;
                    drop(state);
                    running.0 = None;
                    return Outcome::Ran(result);
                }
            }
        }
    }

    /// Whether a caller is currently running `key`.
    pub fn is_running<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.0.get(key).map_or(false, |slot| slot.state().running)
    }
}
