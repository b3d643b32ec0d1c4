//! Lock-free single-writer/single-reader triple buffer.
//!
//! Three buffers rotate through three roles: one is locked by the reader,
//! one holds the most recently posted value, and one is being written. All
//! role bookkeeping lives in a single atomic byte (bits 0-1: index of the
//! most recent buffer, bit 2: a "new value available" flag), so neither side
//! ever blocks and the writer can never touch the reader's locked buffer.
//!
//! The writer and reader halves are separate owned handles; the type system
//! enforces the single-writer/single-reader discipline instead of a comment.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const INDEX_MASK: u8 = 0b011;
const DIRTY: u8 = 0b100;

struct Shared<T> {
    buffers: [UnsafeCell<T>; 3],
    state: AtomicU8,
}

// The role protocol guarantees the writer only mutates the write slot and
// the reader only dereferences the locked slot, and those are always
// distinct buffers.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

/// Writer half. Owned by the producing thread.
pub struct Writer<T> {
    shared: Arc<Shared<T>>,
    write_index: u8,
    last_posted: u8,
}

/// Reader half. Owned by the consuming thread.
pub struct Reader<T> {
    shared: Arc<Shared<T>>,
    locked_index: u8,
}

/// Creates a connected writer/reader pair with all three buffers set to
/// clones of `init`.
pub fn triple_buffer<T: Clone + Send>(init: T) -> (Writer<T>, Reader<T>) {
    let shared = Arc::new(Shared {
        buffers: [
            UnsafeCell::new(init.clone()),
            UnsafeCell::new(init.clone()),
            UnsafeCell::new(init),
        ],
        // Buffer 0 starts locked, 1 most recent, 2 writing; nothing dirty.
        state: AtomicU8::new(1),
    });
    (
        Writer {
            shared: Arc::clone(&shared),
            write_index: 2,
            last_posted: 1,
        },
        Reader {
            shared,
            locked_index: 0,
        },
    )
}

impl<T> Writer<T> {
    /// The buffer to fill with the next value.
    pub fn start_new_value(&mut self) -> &mut T {
        unsafe { &mut *self.shared.buffers[self.write_index as usize].get() }
    }

    /// The write slot and, read-only, the most recently posted value. The
    /// two are always distinct buffers.
    pub fn start_with_latest(&mut self) -> (&mut T, &T) {
        debug_assert_ne!(self.write_index, self.last_posted);
        unsafe {
            (
                &mut *self.shared.buffers[self.write_index as usize].get(),
                &*self.shared.buffers[self.last_posted as usize].get(),
            )
        }
    }

    /// The most recently posted value.
    pub fn latest(&self) -> &T {
        unsafe { &*self.shared.buffers[self.last_posted as usize].get() }
    }

    /// Publishes the write slot as the most recent value and takes over the
    /// previously most recent buffer for the next write.
    pub fn post_new_value(&mut self) {
        let old = self
            .shared
            .state
            .swap(self.write_index | DIRTY, Ordering::AcqRel);
        self.last_posted = self.write_index;
        self.write_index = old & INDEX_MASK;
    }
}

impl<T> Reader<T> {
    /// Locks the most recent value if it is newer than the currently locked
    /// one. Returns false, leaving the lock untouched, if nothing new was
    /// posted since the last call.
    pub fn lock_new_value(&mut self) -> bool {
        let mut state = self.shared.state.load(Ordering::Acquire);
        loop {
            if state & DIRTY == 0 {
                return false;
            }
            // Hand the stale locked buffer back as "most recent" (with the
            // flag cleared) and take the fresh one; the three roles stay
            // distinct.
            match self.shared.state.compare_exchange_weak(
                state,
                self.locked_index,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.locked_index = state & INDEX_MASK;
                    return true;
                }
                Err(current) => state = current,
            }
        }
    }

    /// The locked value. Stable until the next successful
    /// [`Self::lock_new_value`].
    pub fn get_locked_value(&self) -> &T {
        unsafe { &*self.shared.buffers[self.locked_index as usize].get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn reader_sees_latest_posted_value() {
        let (mut writer, mut reader) = triple_buffer(0u64);
        for v in 1..=5u64 {
            *writer.start_new_value() = v;
            writer.post_new_value();
        }
        assert!(reader.lock_new_value());
        assert_eq!(*reader.get_locked_value(), 5);
        assert!(!reader.lock_new_value());
        assert_eq!(*reader.get_locked_value(), 5);
    }

    #[test]
    fn latest_tracks_posts_for_the_writer() {
        let (mut writer, _reader) = triple_buffer(0u32);
        *writer.start_new_value() = 7;
        writer.post_new_value();
        assert_eq!(*writer.latest(), 7);
        let (next, latest) = writer.start_with_latest();
        assert_eq!(*latest, 7);
        *next = 8;
        writer.post_new_value();
        assert_eq!(*writer.latest(), 8);
    }

    #[test]
    fn concurrent_handoff_is_monotonic_and_torn_free() {
        const POSTS: u64 = 100_000;
        // Both halves of the payload must always agree; a torn read would
        // surface as a mismatch.
        let (mut writer, mut reader) = triple_buffer((0u64, 0u64));

        let producer = thread::spawn(move || {
            for v in 1..=POSTS {
                let slot = writer.start_new_value();
                *slot = (v, v);
                writer.post_new_value();
            }
        });

        let mut last = 0u64;
        loop {
            if reader.lock_new_value() {
                let (a, b) = *reader.get_locked_value();
                assert_eq!(a, b, "torn value observed");
                assert!(a >= last, "went backwards: {a} after {last}");
                last = a;
            }
            if last == POSTS {
                break;
            }
        }
        producer.join().unwrap();
    }
}
