//! Sequence Window
//!
//! Hands out strictly increasing sequence numbers for mirrored writes on a
//! buddy group and bounds how many of them are in flight at once. In-flight
//! numbers live in a min-heap whose root is the cumulative low watermark;
//! numbers that finish ahead of the root are kept in a ring of recently
//! finished numbers and reported as selective acknowledgments.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::state::GroupId;

/// What a secondary may discard along with a new request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckInfo {
    /// Every sequence number up to and including this one is finished
    Cumulative(u64),
    /// Exactly this sequence number is finished
    Selective(u64),
}

impl AckInfo {
    pub fn seq_no(&self) -> u64 {
        match self {
            AckInfo::Cumulative(seq) | AckInfo::Selective(seq) => *seq,
        }
    }

    pub fn is_selective(&self) -> bool {
        matches!(self, AckInfo::Selective(_))
    }
}

/// An in-flight sequence number
///
/// The number stays in flight until the handle is dropped, which happens
/// on every path out of a request including cancellation.
#[must_use = "dropping the handle immediately finishes its sequence number"]
pub struct SeqHandle {
    window: Arc<WindowShared>,
    slot: usize,
    generation: u64,
    seq_no: u64,
}

impl SeqHandle {
    pub fn seq_no(&self) -> u64 {
        self.seq_no
    }

    pub fn group_id(&self) -> GroupId {
        self.window.group_id
    }
}

impl std::fmt::Debug for SeqHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeqHandle")
            .field("group_id", &self.window.group_id)
            .field("slot", &self.slot)
            .field("seq_no", &self.seq_no)
            .finish()
    }
}

impl Drop for SeqHandle {
    fn drop(&mut self) {
        self.window.release(self.slot, self.generation, self.seq_no);
    }
}

/// Result of a successful acquire
#[derive(Debug)]
pub struct Acquired {
    pub seq_no: u64,
    pub handle: SeqHandle,
    pub ack: AckInfo,
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    seq: u64,
    slot: usize,
}

#[derive(Debug)]
struct Slot {
    seq: u64,
    /// Position of this slot's entry in the heap
    heap_pos: usize,
    generation: u64,
    in_use: bool,
}

#[derive(Debug, Default)]
struct WindowInner {
    /// Last issued sequence number, 0 until a base was set
    counter: u64,
    heap: Vec<HeapEntry>,
    slots: Vec<Slot>,
    free_slots: Vec<usize>,
    /// Recently finished sequence numbers, oldest first
    finished: VecDeque<u64>,
}

impl WindowInner {
    fn push(&mut self, window: &Arc<WindowShared>) -> Acquired {
        self.counter += 1;
        let seq = self.counter;

        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot {
                    seq: 0,
                    heap_pos: 0,
                    generation: 0,
                    in_use: false,
                });
                self.slots.len() - 1
            }
        };

        let entry = &mut self.slots[slot];
        entry.seq = seq;
        entry.generation += 1;
        entry.in_use = true;
        entry.heap_pos = self.heap.len();
        let generation = entry.generation;

        // the new number is the largest in flight, appending keeps the heap valid
        self.heap.push(HeapEntry { seq, slot });

        let ack = match self.finished.pop_front() {
            Some(done) => AckInfo::Selective(done),
            None => AckInfo::Cumulative(self.heap[0].seq - 1),
        };

        Acquired {
            seq_no: seq,
            handle: SeqHandle {
                window: Arc::clone(window),
                slot,
                generation,
                seq_no: seq,
            },
            ack,
        }
    }

    /// Remove an entry by decreasing its key below everything else,
    /// floating it to the root and popping the root
    fn remove_at(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            self.swap(pos, parent);
            pos = parent;
        }

        let last = self.heap.len() - 1;
        self.swap(0, last);
        self.heap.pop();
        self.sift_down(0);
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;

            if left < len && self.heap[left].seq < self.heap[smallest].seq {
                smallest = left;
            }
            if right < len && self.heap[right].seq < self.heap[smallest].seq {
                smallest = right;
            }
            if smallest == pos {
                return;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    /// Swap two heap entries and fix both slot back-references
    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        let (slot_a, slot_b) = (self.heap[a].slot, self.heap[b].slot);
        self.slots[slot_a].heap_pos = a;
        self.slots[slot_b].heap_pos = b;
    }
}

/// State shared between a window and its outstanding handles
///
/// The lock is never held across an await point.
struct WindowShared {
    group_id: GroupId,
    capacity: usize,
    inner: Mutex<WindowInner>,
    /// Signalled whenever a slot is released
    slot_freed: Notify,
}

impl WindowShared {
    fn lock(&self) -> MutexGuard<'_, WindowInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// # Panics
    ///
    /// Panics if the slot was already released; that means the window's
    /// bookkeeping is corrupt.
    fn release(&self, slot: usize, generation: u64, seq_no: u64) {
        {
            let mut inner = self.lock();

            let entry = inner.slots.get(slot).unwrap_or_else(|| {
                panic!("sequence handle slot {} out of bounds in group {}", slot, self.group_id)
            });
            assert!(
                entry.in_use && entry.generation == generation && entry.seq == seq_no,
                "stale sequence handle for seq {} in group {}",
                seq_no,
                self.group_id
            );
            let pos = entry.heap_pos;
            assert!(
                pos < inner.heap.len() && inner.heap[pos].slot == slot,
                "heap back-reference of seq {} in group {} is corrupt",
                seq_no,
                self.group_id
            );

            if inner.finished.len() == self.capacity {
                inner.finished.pop_front();
            }
            inner.finished.push_back(seq_no);

            inner.remove_at(pos);
            inner.slots[slot].in_use = false;
            inner.free_slots.push(slot);
        }

        self.slot_freed.notify_waiters();
    }
}

/// In-flight sequence numbers of one buddy group
pub struct SequenceWindow {
    shared: Arc<WindowShared>,
}

impl SequenceWindow {
    pub fn new(group_id: GroupId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(WindowShared {
                group_id,
                capacity,
                inner: Mutex::new(WindowInner {
                    heap: Vec::with_capacity(capacity),
                    slots: Vec::with_capacity(capacity),
                    finished: VecDeque::with_capacity(capacity),
                    ..Default::default()
                }),
                slot_freed: Notify::new(),
            }),
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.shared.group_id
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Take the next sequence number
    ///
    /// With a full window this fails with `Busy` unless `allow_wait` is set,
    /// in which case it waits for a release or for `shutdown`, the latter
    /// yielding `Interrupted`.
    pub async fn acquire(&self, allow_wait: bool, shutdown: &CancellationToken) -> Result<Acquired> {
        let group_id = self.shared.group_id;

        loop {
            let notified = self.shared.slot_freed.notified();
            tokio::pin!(notified);

            {
                let mut inner = self.shared.lock();

                if inner.counter == 0 {
                    return Err(Error::NotYetInitialized(group_id));
                }
                if inner.heap.len() < self.shared.capacity {
                    return Ok(inner.push(&self.shared));
                }
                if !allow_wait {
                    return Err(Error::Busy(group_id));
                }

                // registered under the lock so a release in between is not missed
                notified.as_mut().enable();
            }

            tracing::trace!("Sequence window of group {} is full, waiting", group_id);

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.cancelled() => return Err(Error::Interrupted),
            }
        }
    }

    /// Give back an in-flight sequence number
    ///
    /// Same as dropping the handle, but checks that it belongs here.
    ///
    /// # Panics
    ///
    /// Panics if the handle was issued by another window.
    pub fn release(&self, handle: SeqHandle) {
        assert!(
            Arc::ptr_eq(&handle.window, &self.shared),
            "sequence handle of group {} released into group {}",
            handle.window.group_id,
            self.shared.group_id
        );
        drop(handle);
    }

    /// Fast-forward the counter, never moving it backwards
    pub fn set_base(&self, base: u64) {
        let mut inner = self.shared.lock();
        if base > inner.counter {
            tracing::debug!(
                "Group {} sequence base raised from {} to {}",
                self.shared.group_id,
                inner.counter,
                base
            );
            inner.counter = base;
        }
    }

    /// Last issued sequence number
    pub fn current_sequence(&self) -> u64 {
        self.shared.lock().counter
    }

    pub fn in_flight(&self) -> usize {
        self.shared.lock().heap.len()
    }

    /// Smallest in-flight sequence number
    pub fn lowest_in_flight(&self) -> Option<u64> {
        self.shared.lock().heap.first().map(|e| e.seq)
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let inner = self.shared.lock();
        for (pos, entry) in inner.heap.iter().enumerate() {
            if pos > 0 {
                assert!(inner.heap[(pos - 1) / 2].seq < entry.seq, "heap order at {}", pos);
            }
            let slot = &inner.slots[entry.slot];
            assert!(slot.in_use);
            assert_eq!(slot.heap_pos, pos);
            assert_eq!(slot.seq, entry.seq);
        }
        if let Some(min) = inner.heap.iter().map(|e| e.seq).min() {
            assert_eq!(inner.heap[0].seq, min);
        }
        assert!(inner.finished.len() <= self.shared.capacity);
    }
}
