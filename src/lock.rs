//! The two lock families living inside the region.
//!
//! Both are built from bare u32 words so that a peer process attaching to
//! the region participates in the same protocol: a [`WordLock`] is one word
//! used as a mutex, the [`MapLock`] triple is the map-wide readers/writer
//! lock, and [`SlotLocks`] views the per-slot bitmap.
//!
//! Waiters spin on the word with exponential backoff and fall back to
//! yielding the thread; all lock state is in the shared word itself.

use std::sync::atomic::{AtomicU32, Ordering};

use lock_api::{GuardSend, RawMutex, RawRwLock};

use crate::error::Fault;

/// Pure CPU hints before a waiter starts yielding.
const SPIN_LIMIT: u32 = 7;

pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..1u32 << self.step {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

/// One u32 word used as a mutex: 0 = free, 1 = held.
///
/// `repr(transparent)` over the atomic so a word inside the region can be
/// reinterpreted as a `WordLock` directly.
#[repr(transparent)]
pub(crate) struct WordLock(AtomicU32);

impl WordLock {
    fn acquire(&self) {
        let mut backoff = Backoff::new();
        loop {
            // Test phase: spin on a relaxed load so the word stays in cache.
            while self.0.load(Ordering::Relaxed) != 0 {
                backoff.snooze();
            }
            if self.0.swap(1, Ordering::Acquire) == 0 {
                return;
            }
        }
    }
}

unsafe impl RawMutex for WordLock {
    const INIT: WordLock = WordLock(AtomicU32::new(0));

    type GuardMarker = GuardSend;

    fn lock(&self) {
        self.acquire();
    }

    fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.0.store(0, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed) != 0
    }
}

/// The map-wide readers/writer lock: the `SHARED` / `EXCLUSIVE` / `READERS`
/// word triple at the end of the region.
///
/// `SHARED` is a mutex guarding the reader count; the first reader in takes
/// `EXCLUSIVE` and the last reader out releases it, which is what blocks
/// writers while any reader is inside. Writers take `EXCLUSIVE` directly.
/// Readers are preferred; this is acceptable because the only writers are
/// deletes, clears and deadlock escalations.
#[repr(C)]
pub(crate) struct MapLock {
    shared: WordLock,
    exclusive: WordLock,
    readers: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<MapLock>() == crate::layout::MAP_LOCK_SIZE);
const _: () = assert!(std::mem::align_of::<MapLock>() == 4);

unsafe impl RawRwLock for MapLock {
    const INIT: MapLock = MapLock {
        shared: WordLock::INIT,
        exclusive: WordLock::INIT,
        readers: AtomicU32::new(0),
    };

    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        self.shared.lock();
        if self.readers.fetch_add(1, Ordering::AcqRel) == 0 {
            self.exclusive.lock();
        }
        unsafe { self.shared.unlock() };
    }

    fn try_lock_shared(&self) -> bool {
        if !self.shared.try_lock() {
            return false;
        }
        let acquired = if self.readers.fetch_add(1, Ordering::AcqRel) == 0 {
            let ok = self.exclusive.try_lock();
            if !ok {
                self.readers.fetch_sub(1, Ordering::AcqRel);
            }
            ok
        } else {
            true
        };
        unsafe { self.shared.unlock() };
        acquired
    }

    unsafe fn unlock_shared(&self) {
        self.shared.lock();
        if self.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.exclusive.unlock();
        }
        self.shared.unlock();
    }

    fn lock_exclusive(&self) {
        self.exclusive.lock();
    }

    fn try_lock_exclusive(&self) -> bool {
        self.exclusive.try_lock()
    }

    unsafe fn unlock_exclusive(&self) {
        self.exclusive.unlock();
    }

    fn is_locked(&self) -> bool {
        self.exclusive.is_locked()
    }
}

/// View over the slot-lock bitmap words.
///
/// Holding bit `i` grants exclusive access to slot `i`'s key cell, value
/// cell and chain word while the map lock is held shared. The exclusive map
/// lock grants all of that without any bits.
pub(crate) struct SlotLocks<'a> {
    words: &'a [AtomicU32],
}

impl<'a> SlotLocks<'a> {
    pub fn new(words: &'a [AtomicU32]) -> Self {
        Self { words }
    }

    fn word_and_bit(&self, slot: u32) -> (&AtomicU32, u32) {
        (&self.words[(slot / 32) as usize], 1 << (slot % 32))
    }

    pub fn acquire(&self, slot: u32) {
        let (word, bit) = self.word_and_bit(slot);
        let mut backoff = Backoff::new();
        loop {
            if word.fetch_or(bit, Ordering::Acquire) & bit == 0 {
                return;
            }
            while word.load(Ordering::Relaxed) & bit != 0 {
                backoff.snooze();
            }
        }
    }

    pub fn release(&self, slot: u32) {
        let (word, bit) = self.word_and_bit(slot);
        let previous = word.fetch_and(!bit, Ordering::Release);
        // Releasing a lock nobody holds means the engine lost track of its
        // own lock state; the region can no longer be trusted.
        assert!(
            previous & bit != 0,
            "slot {} lock released while not held",
            slot
        );
    }

    /// Moves the held lock from `from` to `to`.
    ///
    /// `to` is acquired before `from` is released, so the traversal never
    /// lets go of the chain. The acquisition order across one traversal is
    /// strictly increasing in slot index; a step that would go backwards
    /// (or stand still) is the deadlock signal, reported without acquiring
    /// anything.
    pub fn slide(&self, from: u32, to: u32) -> Result<(), Fault> {
        if to <= from {
            return Err(Fault::Deadlock);
        }
        self.acquire(to);
        self.release(from);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn word_lock_excludes() {
        let lock = Arc::new(WordLock::INIT);
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    lock.lock();
                    let seen = counter.load(Ordering::Relaxed);
                    counter.store(seen + 1, Ordering::Relaxed);
                    unsafe { lock.unlock() };
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = WordLock::INIT;
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        unsafe { lock.unlock() };
        assert!(lock.try_lock());
        unsafe { lock.unlock() };
    }

    #[test]
    fn readers_block_writer() {
        let lock = Arc::new(MapLock::INIT);
        lock.lock_shared();
        assert!(!lock.try_lock_exclusive());

        // A second reader gets in while the writer is blocked out.
        assert!(lock.try_lock_shared());
        unsafe { lock.unlock_shared() };

        unsafe { lock.unlock_shared() };
        assert!(lock.try_lock_exclusive());
        unsafe { lock.unlock_exclusive() };
    }

    #[test]
    fn writer_blocks_readers() {
        let lock = Arc::new(MapLock::INIT);
        lock.lock_exclusive();
        assert!(!lock.try_lock_shared());

        let peer = Arc::clone(&lock);
        let barrier = Arc::new(Barrier::new(2));
        let gate = Arc::clone(&barrier);
        let handle = thread::spawn(move || {
            gate.wait();
            peer.lock_shared();
            unsafe { peer.unlock_shared() };
        });

        barrier.wait();
        unsafe { lock.unlock_exclusive() };
        handle.join().unwrap();
    }

    #[test]
    fn slot_locks_are_independent() {
        let words = [AtomicU32::new(0), AtomicU32::new(0)];
        let locks = SlotLocks::new(&words);

        locks.acquire(0);
        locks.acquire(31);
        locks.acquire(32);
        assert_eq!(words[0].load(Ordering::Relaxed), 1 | (1 << 31));
        assert_eq!(words[1].load(Ordering::Relaxed), 1);

        locks.release(31);
        assert_eq!(words[0].load(Ordering::Relaxed), 1);
        locks.release(0);
        locks.release(32);
        assert_eq!(words[1].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn slide_rejects_backward_steps() {
        let words = [AtomicU32::new(0)];
        let locks = SlotLocks::new(&words);

        locks.acquire(5);
        assert_eq!(locks.slide(5, 3), Err(Fault::Deadlock));
        assert_eq!(locks.slide(5, 5), Err(Fault::Deadlock));
        // The held lock is untouched by a rejected slide.
        assert_eq!(words[0].load(Ordering::Relaxed), 1 << 5);

        locks.slide(5, 9).unwrap();
        assert_eq!(words[0].load(Ordering::Relaxed), 1 << 9);
        locks.release(9);
    }

    #[test]
    #[should_panic(expected = "released while not held")]
    fn release_of_unheld_lock_panics() {
        let words = [AtomicU32::new(0)];
        SlotLocks::new(&words).release(3);
    }
}
