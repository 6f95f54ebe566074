//! Bounded in-memory log capture for the supervised backend.
//!
//! `RingBuffer` keeps the last `capacity` items in arrival order and evicts the
//! oldest once full. `LogStore` layers `[HH:MM:SS]` prefixes and live
//! subscribers on top of it.
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};

use time::macros::format_description;
use time::OffsetDateTime;

/// Fixed-capacity circular buffer. All operations take the same lock, so
/// readers observe either the state before an append or after it.
#[derive(Debug)]
pub struct RingBuffer<T> {
    inner: Mutex<Ring<T>>,
}

#[derive(Debug)]
struct Ring<T> {
    storage: Vec<Option<T>>,
    head: usize,
    tail: usize,
    count: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` items (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(1);
        let mut storage = Vec::with_capacity(cap);
        storage.resize_with(cap, || None);
        Self {
            inner: Mutex::new(Ring {
                storage,
                head: 0,
                tail: 0,
                count: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().storage.len()
    }

    pub fn len(&self) -> usize {
        self.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// O(1) append at the tail; evicts the oldest item when full.
    pub fn append(&self, item: T) {
        let mut ring = self.lock();
        let cap = ring.storage.len();
        let tail = ring.tail;
        ring.storage[tail] = Some(item);
        if ring.count == cap {
            ring.head = (ring.head + 1) % cap;
        } else {
            ring.count += 1;
        }
        ring.tail = (tail + 1) % cap;
    }

    /// Ordered copy of the current contents, oldest first.
    pub fn elements(&self) -> Vec<T> {
        let ring = self.lock();
        let cap = ring.storage.len();
        (0..ring.count)
            .filter_map(|i| ring.storage[(ring.head + i) % cap].clone())
            .collect()
    }
}

/// Timestamped log lines plus push-style subscribers.
#[derive(Debug)]
pub struct LogStore {
    lines: RingBuffer<String>,
    subscribers: Mutex<Vec<Sender<String>>>,
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: RingBuffer::new(capacity),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Prefix `message` with the current wall-clock time and append it.
    pub fn push(&self, message: &str) {
        let line = format!("[{}] {}", clock_stamp(), message);
        self.lines.append(line.clone());

        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subs.retain(|tx| tx.send(line.clone()).is_ok());
    }

    /// Receive every line appended from now on. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<String> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.elements()
    }

    pub fn capacity(&self) -> usize {
        self.lines.capacity()
    }
}

fn clock_stamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_else(|_| "--:--:--".to_string())
}
