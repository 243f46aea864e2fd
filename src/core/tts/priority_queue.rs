//! Strict-priority audio queue between the TTS session and egress.
//!
//! Entries are ordered by `(priority, seq, timestamp)`; sequence numbers are
//! allocated under the queue lock, so equal priorities stay FIFO. Blocking
//! operations use a condition variable, async consumers a [`Notify`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tokio::sync::Notify;

use super::messages::{AudioPriority, TtsAudio};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full")]
    Full,
    #[error("Queue is closed")]
    Closed,
    #[error("Timed out waiting for queue space")]
    Timeout,
}

/// An item as handed out by the queue.
#[derive(Debug, Clone)]
pub struct QueuedAudio {
    pub priority: AudioPriority,
    pub seq: u64,
    pub enqueued_at: Instant,
    pub audio: TtsAudio,
}

struct Entry(QueuedAudio);

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap; reverse so the smallest key pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.0.priority, other.0.seq, other.0.enqueued_at).cmp(&(
            self.0.priority,
            self.0.seq,
            self.0.enqueued_at,
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    /// Items currently queued, indexed by priority
    pub queued: [usize; 5],
    pub total_put: u64,
    pub total_get: u64,
    pub total_removed: u64,
}

impl QueueStats {
    pub fn len(&self) -> usize {
        self.queued.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    stats: QueueStats,
    closed: bool,
}

pub struct AudioPriorityQueue {
    inner: Mutex<Inner>,
    capacity: Option<usize>,
    not_empty: Condvar,
    not_full: Condvar,
    readable: Notify,
    writable: Notify,
}

impl AudioPriorityQueue {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                stats: QueueStats::default(),
                closed: false,
            }),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn is_full(&self, inner: &Inner) -> bool {
        self.capacity.is_some_and(|cap| inner.heap.len() >= cap)
    }

    fn push_locked(&self, inner: &mut Inner, audio: TtsAudio) -> u64 {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let priority = audio.priority;
        inner.stats.queued[priority.as_index()] += 1;
        inner.stats.total_put += 1;
        inner.heap.push(Entry(QueuedAudio {
            priority,
            seq,
            enqueued_at: Instant::now(),
            audio,
        }));
        self.not_empty.notify_one();
        self.readable.notify_waiters();
        seq
    }

    fn pop_locked(&self, inner: &mut Inner) -> Option<QueuedAudio> {
        let Entry(item) = inner.heap.pop()?;
        inner.stats.queued[item.priority.as_index()] -= 1;
        inner.stats.total_get += 1;
        self.not_full.notify_one();
        self.writable.notify_waiters();
        Some(item)
    }

    /// Non-blocking put. Returns the allocated sequence number.
    pub fn try_put(&self, audio: TtsAudio) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if self.is_full(&inner) {
            return Err(QueueError::Full);
        }
        Ok(self.push_locked(&mut inner, audio))
    }

    /// Blocking put for synchronous producers; waits for space up to `timeout`.
    pub fn put_blocking(&self, audio: TtsAudio, timeout: Option<Duration>) -> Result<u64, QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(QueueError::Closed);
            }
            if !self.is_full(&inner) {
                return Ok(self.push_locked(&mut inner, audio));
            }
            match deadline {
                Some(deadline) => {
                    if self.not_full.wait_until(&mut inner, deadline).timed_out() {
                        return Err(QueueError::Timeout);
                    }
                }
                None => self.not_full.wait(&mut inner),
            }
        }
    }

    /// Async put; waits for space when the queue is bounded and full.
    pub async fn put(&self, audio: TtsAudio) -> Result<u64, QueueError> {
        let mut audio = Some(audio);
        loop {
            let writable = self.writable.notified();
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(QueueError::Closed);
                }
                if !self.is_full(&inner)
                    && let Some(audio) = audio.take()
                {
                    return Ok(self.push_locked(&mut inner, audio));
                }
            }
            writable.await;
        }
    }

    pub fn try_get(&self) -> Option<QueuedAudio> {
        let mut inner = self.inner.lock();
        self.pop_locked(&mut inner)
    }

    /// Blocking get; `None` on timeout or when closed and drained.
    pub fn get_blocking(&self, timeout: Option<Duration>) -> Option<QueuedAudio> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = self.pop_locked(&mut inner) {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                        return self.pop_locked(&mut inner);
                    }
                }
                None => self.not_empty.wait(&mut inner),
            }
        }
    }

    /// Async get; `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<QueuedAudio> {
        loop {
            let readable = self.readable.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(item) = self.pop_locked(&mut inner) {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            readable.await;
        }
    }

    /// Key of the next item without removing it.
    pub fn peek(&self) -> Option<(AudioPriority, u64, u64)> {
        self.inner
            .lock()
            .heap
            .peek()
            .map(|Entry(item)| (item.priority, item.seq, item.audio.sentence_id))
    }

    pub fn clear(&self) -> usize {
        self.retain(|_| false)
    }

    /// Remove every item with priority `>= min` (less urgent or equal).
    pub fn clear_by_priority(&self, min: AudioPriority) -> usize {
        self.retain(|item| item.priority < min)
    }

    pub fn remove_by_sentence_id(&self, sentence_id: u64) -> usize {
        self.retain(|item| item.audio.sentence_id != sentence_id)
    }

    fn retain(&self, keep: impl Fn(&QueuedAudio) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.heap.len();
        let entries = std::mem::take(&mut inner.heap).into_vec();
        let mut queued = [0usize; 5];
        let kept: BinaryHeap<Entry> = entries
            .into_iter()
            .filter(|Entry(item)| keep(item))
            .inspect(|Entry(item)| queued[item.priority.as_index()] += 1)
            .collect();
        inner.heap = kept;
        inner.stats.queued = queued;
        let removed = before - inner.heap.len();
        inner.stats.total_removed += removed as u64;
        if removed > 0 {
            self.not_full.notify_all();
            self.writable.notify_waiters();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats.clone()
    }

    /// Wake every waiter; further puts fail and gets drain what is left.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Default for AudioPriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}
