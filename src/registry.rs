//! Shared map of running stream workers.
//!
//! The registry is the single structure written by both the discovery loop
//! and workers. Entry presence is the one-worker-per-container invariant:
//! registration is an atomic insert-if-vacant, and a worker's self-removal
//! is epoch-checked so a terminating worker can never evict a successor
//! registered for the same container id. No lock is held across I/O.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use crate::container::ContainerID;

/// Command broadcast to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    Run,
    /// Drain buffered records and terminate.
    Stop,
}

/// A registered worker's view of its registry slot.
#[derive(Debug)]
pub struct WorkerSlot {
    pub epoch: u64,
    pub commands: watch::Receiver<WorkerCommand>,
}

#[derive(Debug)]
struct RegistryEntry {
    epoch: u64,
    commands: watch::Sender<WorkerCommand>,
}

#[derive(Debug, Default)]
pub struct StreamRegistry {
    entries: DashMap<ContainerID, RegistryEntry>,
    next_epoch: AtomicU64,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot for `id`. Returns `None` if a worker is already
    /// registered, making duplicate start events a no-op.
    pub fn try_register(&self, id: ContainerID) -> Option<WorkerSlot> {
        match self.entries.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(WorkerCommand::Run);
                vacant.insert(RegistryEntry { epoch, commands: tx });
                Some(WorkerSlot {
                    epoch,
                    commands: rx,
                })
            }
        }
    }

    /// Signals the worker for `id` to drain and terminate. Entry removal is
    /// left to the worker itself.
    pub fn signal_stop(&self, id: &str) -> bool {
        match self.entries.get(id) {
            Some(entry) => {
                let _ = entry.commands.send(WorkerCommand::Stop);
                true
            }
            None => false,
        }
    }

    /// Force-removes the slot for a container that is gone, signalling its
    /// worker on the way out. Used for `destroy` events.
    pub fn evict(&self, id: &str) {
        if let Some((_, entry)) = self.entries.remove(id) {
            let _ = entry.commands.send(WorkerCommand::Stop);
        }
    }

    /// Worker self-removal on termination. Only removes the entry if it
    /// still belongs to the calling worker's epoch.
    pub fn deregister(&self, id: &str, epoch: u64) {
        self.entries
            .remove_if(id, |_, entry| entry.epoch == epoch);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Snapshot of currently registered container ids.
    pub fn ids(&self) -> Vec<ContainerID> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Broadcasts stop to every worker (global shutdown).
    pub fn stop_all(&self) {
        for entry in self.entries.iter() {
            let _ = entry.commands.send(WorkerCommand::Stop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> ContainerID {
        ContainerID::new(raw).unwrap()
    }

    #[test]
    fn second_registration_for_same_id_is_refused() {
        let registry = StreamRegistry::new();
        let slot = registry.try_register(id("abc"));
        assert!(slot.is_some());
        assert!(registry.try_register(id("abc")).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stop_signal_reaches_the_worker_slot() {
        let registry = StreamRegistry::new();
        let slot = registry.try_register(id("abc")).unwrap();
        assert!(registry.signal_stop("abc"));
        assert_eq!(*slot.commands.borrow(), WorkerCommand::Stop);
        assert!(registry.contains("abc"));
    }

    #[test]
    fn stale_deregister_does_not_evict_successor() {
        let registry = StreamRegistry::new();
        let old = registry.try_register(id("abc")).unwrap();
        registry.evict("abc");
        let new = registry.try_register(id("abc")).unwrap();
        assert_ne!(old.epoch, new.epoch);

        // The old worker terminates late and tries to clean up.
        registry.deregister("abc", old.epoch);
        assert!(registry.contains("abc"));

        registry.deregister("abc", new.epoch);
        assert!(!registry.contains("abc"));
    }

    #[test]
    fn evict_signals_and_removes() {
        let registry = StreamRegistry::new();
        let slot = registry.try_register(id("abc")).unwrap();
        registry.evict("abc");
        assert!(!registry.contains("abc"));
        assert_eq!(*slot.commands.borrow(), WorkerCommand::Stop);
    }

    #[test]
    fn stop_all_reaches_every_slot() {
        let registry = StreamRegistry::new();
        let a = registry.try_register(id("a")).unwrap();
        let b = registry.try_register(id("b")).unwrap();
        registry.stop_all();
        assert_eq!(*a.commands.borrow(), WorkerCommand::Stop);
        assert_eq!(*b.commands.borrow(), WorkerCommand::Stop);
    }
}
