//! Per-thread record of the most recent failure seen by a sender.
//!
//! Each sender owns a [`LastErrorSlot`]. The slot's value lives in thread
//! local storage keyed by the sender's id, so a thread only ever sees errors
//! from its own calls. Clearing "for all threads" bumps a generation counter
//! that invalidates every stored entry lazily.

use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::error::SenderError;

static NEXT_SLOT_ID: AtomicU64 = AtomicU64::new(1);

struct Entry {
    generation: u64,
    error: Arc<SenderError>,
}

thread_local! {
    static ENTRIES: RefCell<HashMap<u64, Entry>> = RefCell::new(HashMap::new());
}

/// Last-error storage for one sender.
pub struct LastErrorSlot {
    id: u64,
    generation: AtomicU64,
    // Errors seen by a background worker, visible to threads with no entry.
    shared: Mutex<Option<Entry>>,
}

impl LastErrorSlot {
    pub fn new() -> Self {
        Self {
            id: NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed),
            generation: AtomicU64::new(0),
            shared: Mutex::new(None),
        }
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Store `error` as the calling thread's last error.
    pub fn set(&self, error: SenderError) {
        self.set_shared(Arc::new(error));
    }

    fn set_shared(&self, error: Arc<SenderError>) {
        let entry = Entry {
            generation: self.current_generation(),
            error,
        };
        ENTRIES.with(|entries| {
            entries.borrow_mut().insert(self.id, entry);
        });
    }

    /// Store `error` for the calling thread and publish it to every thread
    /// that has no error of its own.
    pub fn publish(&self, error: SenderError) {
        let error = Arc::new(error);
        self.set_shared(Arc::clone(&error));
        *self.shared.lock() = Some(Entry {
            generation: self.current_generation(),
            error,
        });
    }

    /// The calling thread's last error, falling back to a published one.
    pub fn get(&self) -> Option<Arc<SenderError>> {
        let generation = self.current_generation();
        let own = ENTRIES.with(|entries| {
            let mut entries = entries.borrow_mut();
            match entries.get(&self.id) {
                Some(entry) if entry.generation == generation => Some(Arc::clone(&entry.error)),
                Some(_) => {
                    entries.remove(&self.id);
                    None
                }
                None => None,
            }
        });
        own.or_else(|| {
            self.shared
                .lock()
                .as_ref()
                .filter(|entry| entry.generation == generation)
                .map(|entry| Arc::clone(&entry.error))
        })
    }

    /// Forget the calling thread's error and any published one.
    pub fn clear(&self) {
        ENTRIES.with(|entries| {
            entries.borrow_mut().remove(&self.id);
        });
        *self.shared.lock() = None;
    }

    /// Invalidate the errors stored by every thread.
    pub fn clear_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.shared.lock() = None;
    }
}

impl Default for LastErrorSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LastErrorSlot {
    fn drop(&mut self) {
        // Entries on other threads are left behind; ids are never reused.
        let _ = ENTRIES.try_with(|entries| {
            entries.borrow_mut().remove(&self.id);
        });
    }
}

impl std::fmt::Debug for LastErrorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LastErrorSlot")
            .field("id", &self.id)
            .field("generation", &self.current_generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{io, thread};

    use super::*;

    fn broken_pipe() -> SenderError {
        io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into()
    }

    #[test]
    fn errors_are_scoped_to_the_recording_thread() {
        let slot = Arc::new(LastErrorSlot::new());
        slot.set(broken_pipe());
        assert!(slot.get().is_some());

        let other = Arc::clone(&slot);
        let seen = thread::spawn(move || other.get().is_some())
            .join()
            .unwrap();
        assert!(!seen);
    }

    #[test]
    fn slots_do_not_share_entries() {
        let first = LastErrorSlot::new();
        let second = LastErrorSlot::new();
        first.set(SenderError::Closed);
        assert!(first.get().is_some());
        assert!(second.get().is_none());
    }

    #[test]
    fn clear_removes_only_the_calling_thread_entry() {
        let slot = Arc::new(LastErrorSlot::new());
        slot.set(SenderError::Closed);
        let other = Arc::clone(&slot);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            other.set(broken_pipe());
            ready_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            other.get().is_some()
        });
        ready_rx.recv().unwrap();
        slot.clear();
        assert!(slot.get().is_none());
        done_tx.send(()).unwrap();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn clear_all_invalidates_other_threads() {
        let slot = Arc::new(LastErrorSlot::new());
        let other = Arc::clone(&slot);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            other.set(broken_pipe());
            ready_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            other.get().is_some()
        });
        ready_rx.recv().unwrap();
        slot.clear_all();
        done_tx.send(()).unwrap();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn published_errors_are_a_fallback() {
        let slot = Arc::new(LastErrorSlot::new());
        let worker = Arc::clone(&slot);
        thread::spawn(move || worker.publish(broken_pipe()))
            .join()
            .unwrap();
        let err = slot.get().expect("published error visible");
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);

        slot.set(SenderError::Closed);
        assert!(matches!(*slot.get().unwrap(), SenderError::Closed));
    }
}
