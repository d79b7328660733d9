use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::entry::PooledEntry;

type Entry<T> = Arc<PooledEntry<T>>;

/// What a blocking wait on the deque resolved to.
pub(crate) enum Wake<T> {
    Entry(Entry<T>),
    /// The pool was closed while this thread was parked.
    Closed,
}

struct Inner<T> {
    entries: VecDeque<Entry<T>>,
    // Parked `pollFirst`/`takeFirst` callers, oldest first. A handed-off
    // entry is delivered directly to the head waiter's channel rather than
    // going through `entries`, which is what gives this deque its fairness
    // guarantee: the longest-waiting thread is always served first, with no
    // dependence on OS condvar wakeup order.
    waiters: VecDeque<SyncSender<Wake<T>>>,
    closed: bool,
}

/// A bounded, blocking, FIFO-fair double-ended queue of idle pool entries.
///
/// Unlike a `Mutex<VecDeque<T>> + Condvar`, enqueue hands an entry straight to
/// the oldest parked waiter (if any) instead of waking every parked thread to
/// re-race for it. This is the same handoff the teacher's async pool does
/// with a `VecDeque<oneshot::Sender<T>>` per key, translated to blocking
/// rendezvous channels.
pub(crate) struct IdleDeque<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> IdleDeque<T> {
    pub(crate) fn new() -> Self {
        IdleDeque {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Non-blocking remove from the head, or `None`.
    pub(crate) fn poll_first(&self) -> Option<Entry<T>> {
        self.inner.lock().unwrap().entries.pop_front()
    }

    /// Enqueue at the head. Wakes the longest-waiting parked thread if one
    /// exists instead of inserting.
    pub(crate) fn offer_first(&self, entry: Entry<T>) {
        self.offer(entry, true)
    }

    /// Enqueue at the tail. Wakes the longest-waiting parked thread if one
    /// exists instead of inserting.
    pub(crate) fn offer_last(&self, entry: Entry<T>) {
        self.offer(entry, false)
    }

    fn offer(&self, mut entry: Entry<T>, head: bool) {
        let mut inner = self.inner.lock().unwrap();
        while let Some(tx) = inner.waiters.pop_front() {
            match tx.try_send(Wake::Entry(entry)) {
                Ok(()) => return,
                Err(mpsc::TrySendError::Full(back)) | Err(mpsc::TrySendError::Disconnected(back)) => {
                    // Receiver either isn't ready yet (shouldn't happen: the
                    // channel has capacity 1 and the receiver is always
                    // already parked in recv) or timed out and went away.
                    // Either way, try the next waiter with the same entry.
                    entry = match back {
                        Wake::Entry(e) => e,
                        Wake::Closed => unreachable!("we only ever send Wake::Entry here"),
                    };
                }
            }
        }
        if head {
            inner.entries.push_front(entry);
        } else {
            inner.entries.push_back(entry);
        }
    }

    /// Block until an entry appears (no deadline), or the pool closes.
    pub(crate) fn take_first(&self) -> Wake<T> {
        match self.park() {
            Ok(rx) => rx.recv().expect("idle deque dropped while a waiter was parked"),
            Err(wake) => wake,
        }
    }

    /// Block up to `deadline` for an entry to appear. `None` means the
    /// deadline elapsed; a closed pool still yields `Some(Wake::Closed)`.
    pub(crate) fn poll_first_deadline(&self, deadline: Instant) -> Option<Wake<T>> {
        let rx = match self.park() {
            Ok(rx) => rx,
            Err(wake) => return Some(wake),
        };
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        match rx.recv_timeout(deadline - now) {
            Ok(wake) => Some(wake),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Registers a waiter, or resolves immediately if an entry is already
    /// idle or the deque has been closed. Closed-check and registration
    /// share one critical section so a `close()` can never race a parking
    /// thread into waiting forever.
    fn park(&self) -> Result<mpsc::Receiver<Wake<T>>, Wake<T>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(e) = inner.entries.pop_front() {
            return Err(Wake::Entry(e));
        }
        if inner.closed {
            return Err(Wake::Closed);
        }
        let (tx, rx) = mpsc::sync_channel(1);
        inner.waiters.push_back(tx);
        Ok(rx)
    }

    /// Remove a specific entry by identity. `O(n)`; only used by eviction and
    /// invalidate paths, never on the borrow hot path.
    pub(crate) fn remove(&self, entry: &Entry<T>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.entries.iter().position(|e| Arc::ptr_eq(e, entry)) {
            inner.entries.remove(pos);
            true
        } else {
            false
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of currently idle entries, head to tail. Tolerant to
    /// concurrent mutation: it's a point-in-time copy of the handles, not a
    /// live view.
    pub(crate) fn snapshot(&self) -> Vec<Entry<T>> {
        self.inner.lock().unwrap().entries.iter().cloned().collect()
    }

    /// Number of threads currently parked in `poll_first_deadline`/
    /// `take_first`. Exposed for the keyed pool's reuse-capacity heuristic.
    pub(crate) fn take_queue_length(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }

    /// Drain every idle entry, e.g. on `close()`.
    pub(crate) fn drain(&self) -> Vec<Entry<T>> {
        self.inner.lock().unwrap().entries.drain(..).collect()
    }

    /// Mark the deque closed and wake every currently parked waiter with
    /// [`Wake::Closed`]. Any thread that parks afterwards observes `closed`
    /// in `park()` and returns immediately instead.
    pub(crate) fn close_and_wake_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        for tx in inner.waiters.drain(..) {
            let _ = tx.try_send(Wake::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn entry(v: u32) -> Entry<u32> {
        Arc::new(PooledEntry::new(v))
    }

    fn unwrap_entry(w: Wake<u32>) -> Entry<u32> {
        match w {
            Wake::Entry(e) => e,
            Wake::Closed => panic!("expected an entry, got Closed"),
        }
    }

    #[test]
    fn poll_first_empty_is_none() {
        let d: IdleDeque<u32> = IdleDeque::new();
        assert!(d.poll_first().is_none());
    }

    #[test]
    fn offer_first_then_last_preserves_order() {
        let d = IdleDeque::new();
        d.offer_last(entry(1));
        d.offer_last(entry(2));
        d.offer_first(entry(0));
        assert_eq!(*d.poll_first().unwrap().object(), 0);
        assert_eq!(*d.poll_first().unwrap().object(), 1);
        assert_eq!(*d.poll_first().unwrap().object(), 2);
    }

    #[test]
    fn remove_by_identity() {
        let d = IdleDeque::new();
        let e1 = entry(1);
        let e2 = entry(2);
        d.offer_last(e1.clone());
        d.offer_last(e2.clone());
        assert!(d.remove(&e1));
        assert_eq!(d.len(), 1);
        assert!(!d.remove(&e1));
    }

    #[test]
    fn poll_first_deadline_times_out_on_empty() {
        let d: IdleDeque<u32> = IdleDeque::new();
        let start = Instant::now();
        let got = d.poll_first_deadline(start + Duration::from_millis(20));
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn close_wakes_parked_waiter() {
        let d = Arc::new(IdleDeque::<u32>::new());
        let d2 = d.clone();
        let h = thread::spawn(move || matches!(d2.take_first(), Wake::Closed));
        thread::sleep(Duration::from_millis(30));
        d.close_and_wake_all();
        assert!(h.join().unwrap());
    }

    #[test]
    fn park_after_close_resolves_immediately() {
        let d: IdleDeque<u32> = IdleDeque::new();
        d.close_and_wake_all();
        assert!(matches!(d.take_first(), Wake::Closed));
    }

    #[test]
    fn fairness_serves_longest_waiting_thread_first() {
        let d = Arc::new(IdleDeque::<u32>::new());
        let barrier = Arc::new(Barrier::new(3));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3u32 {
            let d = d.clone();
            let barrier = barrier.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                // Stagger arrival so queueing order is deterministic.
                thread::sleep(Duration::from_millis(10 * i as u64));
                let e = unwrap_entry(d.take_first());
                order.lock().unwrap().push((i, *e.object()));
            }));
        }

        // Give all three threads a chance to park before releasing entries.
        thread::sleep(Duration::from_millis(60));
        for v in [100, 101, 102] {
            d.offer_last(entry(v));
        }

        for h in handles {
            h.join().unwrap();
        }

        let order = order.lock().unwrap();
        let mut by_thread = order.clone();
        by_thread.sort_by_key(|(i, _)| *i);
        assert_eq!(
            by_thread.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
            vec![100, 101, 102],
            "thread 0 arrived first and must get the first entry, etc."
        );
    }
}
