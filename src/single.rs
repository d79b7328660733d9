//! The unkeyed pool (design doc component C4): borrow/return/invalidate, a
//! creation cap, evictor sweep, and minimum-idle maintenance.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::PoolConfig;
use crate::entry::PooledEntry;
use crate::error::{Error, Result};
use crate::evictor::{EvictionScheduler, TaskHandle};
use crate::factory::Factory;
use crate::idle_deque::{IdleDeque, Wake};

type EntryArc<T> = Arc<PooledEntry<T>>;

fn entry_id<T>(e: &EntryArc<T>) -> usize {
    Arc::as_ptr(e) as usize
}

#[derive(Default)]
struct Stats {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    borrowed: AtomicUsize,
    returned: AtomicUsize,
}

/// Point-in-time counters: how many objects this pool has created,
/// destroyed, lent out, and had returned over its lifetime. Not part of the
/// three hard concurrency concerns (§1); exposed because every real pool in
/// this corpus tracks at least this much.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub created: usize,
    pub destroyed: usize,
    pub borrowed: usize,
    pub returned: usize,
}

struct Inner<T, F> {
    factory: F,
    config: PoolConfig,
    idle: IdleDeque<T>,
    all_objects: Mutex<HashMap<usize, EntryArc<T>>>,
    // |allObjects| + in-flight creations; reserved before the factory call,
    // released on failure.
    create_permits: AtomicUsize,
    closed: AtomicBool,
    stats: Stats,
    evict_cursor: Mutex<Option<usize>>,
    scheduler: EvictionScheduler,
    evict_handle: Mutex<Option<TaskHandle>>,
}

/// An unkeyed object pool.
///
/// Cheap to clone (an `Arc` around the shared state), matching the teacher's
/// `Pool<T, K>` handle/inner split.
pub struct SinglePool<T, F> {
    inner: Arc<Inner<T, F>>,
}

impl<T, F> Clone for SinglePool<T, F> {
    fn clone(&self) -> Self {
        SinglePool {
            inner: self.inner.clone(),
        }
    }
}

impl<T, F> fmt::Debug for SinglePool<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinglePool")
            .field("num_idle", &self.num_idle())
            .field("num_active", &self.num_active())
            .finish()
    }
}

impl<T: Send + 'static, F: Factory<T> + 'static> SinglePool<T, F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self::with_scheduler(factory, config, EvictionScheduler::new())
    }

    pub fn with_scheduler(factory: F, config: PoolConfig, scheduler: EvictionScheduler) -> Self {
        let inner = Arc::new(Inner {
            factory,
            config,
            idle: IdleDeque::new(),
            all_objects: Mutex::new(HashMap::new()),
            create_permits: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            stats: Stats::default(),
            evict_cursor: Mutex::new(None),
            scheduler,
            evict_handle: Mutex::new(None),
        });
        let pool = SinglePool { inner };
        pool.start_evictor();
        pool
    }

    fn start_evictor(&self) {
        let config = self.inner.config;
        if !config.eviction_enabled() {
            return;
        }
        let period = config.time_between_eviction_runs.unwrap();
        let weak: Weak<Inner<T, F>> = Arc::downgrade(&self.inner);
        let handle = self.inner.scheduler.schedule(
            move || {
                if let Some(inner) = weak.upgrade() {
                    SinglePool { inner }.run_eviction_sweep();
                }
            },
            period,
            period,
        );
        *self.inner.evict_handle.lock().unwrap() = Some(handle);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.inner.stats.created.load(Ordering::Relaxed),
            destroyed: self.inner.stats.destroyed.load(Ordering::Relaxed),
            borrowed: self.inner.stats.borrowed.load(Ordering::Relaxed),
            returned: self.inner.stats.returned.load(Ordering::Relaxed),
        }
    }

    pub fn num_idle(&self) -> usize {
        self.inner.idle.len()
    }

    pub fn num_active(&self) -> usize {
        self.inner
            .all_objects
            .lock()
            .unwrap()
            .len()
            .saturating_sub(self.num_idle())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Borrow using the pool's configured `max_wait`.
    pub fn borrow(&self) -> Result<Pooled<T, F>> {
        self.borrow_timeout(self.inner.config.max_wait)
    }

    /// Borrow with an explicit deadline override. `None` means block
    /// indefinitely (Java's `maxWait < 0`).
    pub fn borrow_timeout(&self, max_wait: Option<Duration>) -> Result<Pooled<T, F>> {
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(Error::PoolClosed);
            }

            let mut entry = self.inner.idle.poll_first();
            let mut created_fresh = false;

            if entry.is_none() {
                if let Some(e) = self.try_create()? {
                    entry = Some(e);
                    created_fresh = true;
                }
            }

            let entry = match entry {
                Some(e) => e,
                None => {
                    if !self.inner.config.block_when_exhausted {
                        return Err(Error::PoolExhausted { timed_out: false });
                    }
                    match max_wait {
                        None => match self.inner.idle.take_first() {
                            Wake::Entry(e) => e,
                            Wake::Closed => return Err(Error::PoolClosed),
                        },
                        Some(d) => match self.inner.idle.poll_first_deadline(Instant::now() + d) {
                            Some(Wake::Entry(e)) => e,
                            Some(Wake::Closed) => return Err(Error::PoolClosed),
                            None => return Err(Error::PoolExhausted { timed_out: true }),
                        },
                    }
                }
            };

            // A freshly created entry (`try_create`) is already `Allocated`
            // by the time it gets here; only an entry drawn from idle needs
            // this transition, and only it can race the evictor.
            if !created_fresh && !entry.allocate() {
                trace!("borrow raced the evictor for an entry, retrying");
                continue;
            }

            // Outside any pool lock: `entry` is `Allocated`, so this thread
            // holds the only exclusive lease on its object.
            let activation = self.inner.factory.activate(entry.object_mut());
            if let Err(e) = activation {
                self.destroy_entry(entry);
                if created_fresh {
                    return Err(Error::activation_failed(e));
                }
                continue;
            }

            if self.inner.config.test_on_borrow {
                let valid = self.inner.factory.validate(entry.object());
                if !valid {
                    self.destroy_entry(entry);
                    if created_fresh {
                        return Err(Error::validation_failed("validate() returned false"));
                    }
                    continue;
                }
            }

            self.inner.stats.borrowed.fetch_add(1, Ordering::Relaxed);
            return Ok(Pooled {
                entry: Some(entry),
                pool: Arc::downgrade(&self.inner),
            });
        }
    }

    /// Reserve a creation permit and ask the factory for a new instance.
    /// Returns `Ok(None)` if the cap was hit (caller should block/fail
    /// instead, not an error); `Err` if the factory itself failed.
    fn try_create(&self) -> Result<Option<EntryArc<T>>> {
        if let Some(max_total) = self.inner.config.max_total {
            let reserved = self.inner.create_permits.fetch_add(1, Ordering::AcqRel) + 1;
            if reserved > max_total {
                self.inner.create_permits.fetch_sub(1, Ordering::AcqRel);
                return Ok(None);
            }
        } else {
            self.inner.create_permits.fetch_add(1, Ordering::AcqRel);
        }

        match self.inner.factory.create() {
            Ok(object) => {
                let entry = Arc::new(PooledEntry::new(object));
                // Mark allocated immediately: this entry is handed straight
                // to the borrower, never placed on the idle deque.
                let allocated = entry.allocate();
                debug_assert!(allocated, "a brand new entry always starts Idle");
                self.inner
                    .all_objects
                    .lock()
                    .unwrap()
                    .insert(entry_id(&entry), entry.clone());
                self.inner.stats.created.fetch_add(1, Ordering::Relaxed);
                trace!("created new pooled object");
                Ok(Some(entry))
            }
            Err(e) => {
                self.inner.create_permits.fetch_sub(1, Ordering::AcqRel);
                Err(Error::factory_failed(e))
            }
        }
    }

    /// Remove `entry` from every pool data structure and hand its object to
    /// `Factory::destroy`. Takes ownership since the factory hook consumes
    /// the object; every call site is expected to hold the last `Arc` once
    /// the idle deque and `all_objects` have released theirs, so
    /// `Arc::try_unwrap` should always succeed here. If some other clone
    /// outlives this call (a bug elsewhere), the entry is still unlinked and
    /// marked invalid, just without running `destroy`.
    fn destroy_entry(&self, entry: EntryArc<T>) {
        entry.invalidate();
        self.inner.idle.remove(&entry);
        let removed = self
            .inner
            .all_objects
            .lock()
            .unwrap()
            .remove(&entry_id(&entry))
            .is_some();
        if !removed {
            return;
        }
        self.inner.create_permits.fetch_sub(1, Ordering::AcqRel);
        self.inner.stats.destroyed.fetch_add(1, Ordering::Relaxed);
        match Arc::try_unwrap(entry) {
            Ok(entry) => self.inner.factory.destroy(entry.into_inner()),
            Err(entry) => debug!(
                refs = Arc::strong_count(&entry),
                "entry still referenced elsewhere at destroy time, skipping factory.destroy"
            ),
        }
    }

    fn return_entry(&self, entry: EntryArc<T>) {
        if self.inner.config.test_on_return {
            let valid = self.inner.factory.validate(entry.object());
            if !valid {
                self.destroy_entry(entry);
                return;
            }
        }

        let passivation = self.inner.factory.passivate(entry.object_mut());
        if passivation.is_err() {
            self.destroy_entry(entry);
            return;
        }

        if !entry.deallocate() {
            // Double return: the entry was not Allocated. Nothing sane to do
            // but surface it would require plumbing a Result back through
            // `Drop`, so this matches the teacher's drop impl: log and move
            // on, as spec's AlreadyReturned is only raised by the explicit
            // `return_object` API below.
            debug!("entry was not allocated at deallocate time");
            return;
        }

        self.inner.stats.returned.fetch_add(1, Ordering::Relaxed);

        let over_capacity = self
            .inner
            .config
            .max_idle
            .is_some_and(|max| self.inner.idle.len() >= max);

        if self.inner.closed.load(Ordering::Acquire) || over_capacity {
            self.destroy_entry(entry);
        } else if self.inner.config.lifo {
            self.inner.idle.offer_first(entry);
        } else {
            self.inner.idle.offer_last(entry);
        }
    }

    /// Explicit return, mirroring spec §4.4.2/§6.2's `return(obj)`. Most
    /// callers can just let the [`Pooled`] guard drop instead; this exists
    /// for the rare case of wanting the `NotFromThisPool`/`AlreadyReturned`
    /// errors explicitly rather than swallowing them.
    pub fn return_object(&self, mut pooled: Pooled<T, F>) -> Result<()> {
        if !Weak::ptr_eq(&pooled.pool, &Arc::downgrade(&self.inner)) {
            return Err(Error::NotFromThisPool);
        }
        let entry = pooled.entry.take().ok_or(Error::AlreadyReturned)?;
        if entry.state() != crate::entry::EntryState::Allocated {
            return Err(Error::AlreadyReturned);
        }
        self.return_entry(entry);
        Ok(())
    }

    /// Force removal of a live entry, per spec §4.4.3. The only way a caller
    /// removes an entry it holds without going through the normal return
    /// path.
    pub fn invalidate(&self, mut pooled: Pooled<T, F>) -> Result<()> {
        if !Weak::ptr_eq(&pooled.pool, &Arc::downgrade(&self.inner)) {
            return Err(Error::NotFromThisPool);
        }
        let entry = pooled.entry.take().ok_or(Error::NotFromThisPool)?;
        self.destroy_entry(entry);
        Ok(())
    }

    /// Preload a single idle entry.
    pub fn add_object(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }
        if let Some(entry) = self.try_create()? {
            // `try_create` hands back an Allocated entry (normally destined
            // for a borrower); deallocate it straight to idle instead.
            entry.deallocate();
            self.inner.idle.offer_last(entry);
        }
        Ok(())
    }

    /// Destroy every idle entry, keeping active ones untouched.
    pub fn clear(&self) {
        for entry in self.inner.idle.drain() {
            self.destroy_entry(entry);
        }
    }

    /// Close the pool: drain and destroy idle entries, cancel the evictor,
    /// and wake every parked borrower with [`Error::PoolClosed`] (resolves
    /// the design doc's liveness Open Question). Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing pool");
        if let Some(handle) = self.inner.evict_handle.lock().unwrap().take() {
            handle.cancel();
        }
        for entry in self.inner.idle.drain() {
            self.destroy_entry(entry);
        }
        self.inner.idle.close_and_wake_all();
    }

    /// Run one eviction sweep: oldest-first traversal with a persistent
    /// cursor, then `ensureMinIdle`. Normally driven by the scheduler; public
    /// so callers (and tests) can drive it deterministically.
    pub fn run_eviction_sweep(&self) {
        let config = self.inner.config;
        let idle_len = self.inner.idle.len();
        if idle_len == 0 {
            self.ensure_min_idle();
            return;
        }
        let tests = config.tests_for_sweep(idle_len);
        let mut snapshot: Vec<Option<EntryArc<T>>> =
            self.oldest_first_snapshot().into_iter().map(Some).collect();
        let len = snapshot.len();
        if len == 0 {
            self.ensure_min_idle();
            return;
        }
        let start = {
            let cursor = self.inner.evict_cursor.lock().unwrap();
            match *cursor {
                Some(id) => snapshot
                    .iter()
                    .position(|e| entry_id(e.as_ref().expect("not yet taken")) == id)
                    .map(|p| (p + 1) % len)
                    .unwrap_or(0),
                None => 0,
            }
        };

        let mut tested = 0usize;
        let mut visited = 0usize;
        let mut idx = start;
        let mut last_tested_id = None;
        // Bounded by `len`: a full cycle without reaching `tests` means
        // every entry is currently borrowed or mid-eviction-test elsewhere.
        while tested < tests && visited < len {
            let cur = idx;
            idx = (idx + 1) % len;
            visited += 1;

            let entry = snapshot[cur].as_ref().expect("not yet taken").clone();

            if !entry.start_eviction_test() {
                // Borrowed out from under us; doesn't count against `tests`.
                continue;
            }
            tested += 1;
            last_tested_id = Some(entry_id(&entry));

            let idle_for = entry.idle_duration();
            // A zero threshold means "this rule is off", the same convention
            // the design doc uses for `timeBetweenEvictionRuns`: otherwise
            // `minEvictableIdle = 0` would evict every idle entry on the
            // first sweep and the soft/minIdle interplay could never be
            // observed.
            let hard_expired = config
                .min_evictable_idle_time
                .is_some_and(|d| !d.is_zero() && idle_for > d);
            // Per spec, the soft threshold is ignored whenever a positive
            // hard threshold is configured.
            let hard_active = config.min_evictable_idle_time.is_some_and(|d| !d.is_zero());
            let soft_expired = !hard_active
                && config.soft_min_evictable_idle_time.is_some_and(|d| {
                    !d.is_zero() && idle_for > d && self.inner.idle.len() > config.min_idle
                });

            if hard_expired || soft_expired {
                trace!("evicting idle entry past threshold");
                entry.end_eviction_test();
                drop(entry);
                let owned = snapshot[cur].take().expect("just read above");
                self.destroy_entry(owned);
                continue;
            }

            if config.test_while_idle {
                let ok = self.inner.factory.activate(entry.object_mut()).is_ok()
                    && self.inner.factory.validate(entry.object())
                    && self.inner.factory.passivate(entry.object_mut()).is_ok();
                if !ok {
                    entry.end_eviction_test();
                    drop(entry);
                    let owned = snapshot[cur].take().expect("just read above");
                    self.destroy_entry(owned);
                    continue;
                }
            }

            if entry.end_eviction_test() {
                self.inner.idle.offer_first(entry);
            }
        }

        if let Some(id) = last_tested_id {
            *self.inner.evict_cursor.lock().unwrap() = Some(id);
        }

        self.ensure_min_idle();
    }

    /// Oldest-first snapshot of the idle deque: cursor persistence in
    /// `run_eviction_sweep` assumes this ordering stays stable in the
    /// absence of mutation.
    fn oldest_first_snapshot(&self) -> Vec<EntryArc<T>> {
        let mut v = self.inner.idle.snapshot();
        v.sort_by_key(|e| e.last_returned_at());
        v
    }

    fn ensure_min_idle(&self) {
        let min_idle = self.inner.config.min_idle;
        if min_idle == 0 {
            return;
        }
        while self.inner.idle.len() < min_idle {
            match self.try_create() {
                Ok(Some(entry)) => {
                    entry.deallocate();
                    self.inner.idle.offer_last(entry);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "ensureMinIdle creation failed, stopping");
                    break;
                }
            }
        }
    }
}

/// RAII handle for a borrowed object: returns itself to the pool on drop
/// (matching the teacher's `Pooled<T, K>`), or can be explicitly consumed via
/// [`SinglePool::return_object`]/[`SinglePool::invalidate`].
pub struct Pooled<T, F> {
    entry: Option<EntryArc<T>>,
    pool: Weak<Inner<T, F>>,
}

impl<T, F> Pooled<T, F> {
    fn as_ref(&self) -> &T {
        self.entry.as_ref().expect("not dropped").object()
    }

    fn as_mut(&mut self) -> &mut T {
        // Exclusive: the entry is `Allocated`, so only this guard's owner
        // can be touching it.
        self.entry.as_ref().expect("not dropped").object_mut()
    }
}

impl<T, F> Deref for Pooled<T, F> {
    type Target = T;
    fn deref(&self) -> &T {
        self.as_ref()
    }
}

impl<T, F> DerefMut for Pooled<T, F> {
    fn deref_mut(&mut self) -> &mut T {
        self.as_mut()
    }
}

impl<T, F: Factory<T>> Drop for Pooled<T, F> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            if let Some(inner) = self.pool.upgrade() {
                SinglePool { inner }.return_entry(entry);
            }
        }
    }
}

impl<T, F> fmt::Debug for Pooled<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc as StdArc;

    struct CountingFactory {
        next_id: AtomicU32,
        fail_activate_once: AtomicBool,
    }

    impl CountingFactory {
        fn new() -> Self {
            CountingFactory {
                next_id: AtomicU32::new(0),
                fail_activate_once: AtomicBool::new(false),
            }
        }
    }

    impl Factory<u32> for CountingFactory {
        fn create(&self) -> std::result::Result<u32, crate::error::BoxError> {
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }
        fn destroy(&self, _object: u32) {}
        fn activate(&self, _object: &mut u32) -> std::result::Result<(), crate::error::BoxError> {
            if self.fail_activate_once.swap(false, Ordering::SeqCst) {
                Err("nope".into())
            } else {
                Ok(())
            }
        }
    }

    fn test_pool(max_total: usize) -> SinglePool<u32, CountingFactory> {
        SinglePool::new(
            CountingFactory::new(),
            PoolConfig {
                max_total: Some(max_total),
                max_idle: Some(max_total),
                ..Default::default()
            },
        )
    }

    #[test]
    fn borrow_and_return_round_trip_lifo() {
        let pool = test_pool(2);
        let p = pool.borrow().unwrap();
        let v = *p;
        drop(p);
        let p2 = pool.borrow().unwrap();
        assert_eq!(*p2, v, "LIFO reuse must hand back the same object");
    }

    #[test]
    fn exhausted_without_blocking_fails_fast() {
        let pool = SinglePool::new(
            CountingFactory::new(),
            PoolConfig {
                max_total: Some(0),
                block_when_exhausted: true,
                max_wait: Some(Duration::from_millis(20)),
                ..Default::default()
            },
        );
        let err = pool.borrow().unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { timed_out: true }));
    }

    #[test]
    fn non_blocking_exhaustion_fails_immediately() {
        let pool = SinglePool::new(
            CountingFactory::new(),
            PoolConfig {
                max_total: Some(0),
                block_when_exhausted: false,
                ..Default::default()
            },
        );
        let err = pool.borrow().unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { timed_out: false }));
    }

    #[test]
    fn close_is_idempotent_and_drains_idle() {
        let pool = test_pool(2);
        let p = pool.borrow().unwrap();
        drop(p);
        assert_eq!(pool.num_idle(), 1);
        pool.close();
        pool.close();
        assert_eq!(pool.num_idle(), 0);
        assert!(matches!(pool.borrow().unwrap_err(), Error::PoolClosed));
    }

    #[test]
    fn close_wakes_blocked_borrower() {
        let pool = SinglePool::new(
            CountingFactory::new(),
            PoolConfig {
                max_total: Some(0),
                block_when_exhausted: true,
                max_wait: None,
                ..Default::default()
            },
        );
        let pool2 = pool.clone();
        let h = std::thread::spawn(move || pool2.borrow());
        std::thread::sleep(Duration::from_millis(30));
        pool.close();
        let err = h.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::PoolClosed));
    }

    #[test]
    fn invalidate_removes_the_entry_permanently() {
        let pool = test_pool(1);
        let p = pool.borrow().unwrap();
        pool.invalidate(p).unwrap();
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.num_active(), 0);
        // A new borrow must create a fresh entry since the old one is gone.
        let _p2 = pool.borrow().unwrap();
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[test]
    fn activation_failure_on_fresh_entry_surfaces_error() {
        let factory = CountingFactory::new();
        factory.fail_activate_once.store(true, Ordering::SeqCst);
        let pool = SinglePool::new(
            factory,
            PoolConfig {
                max_total: Some(1),
                ..Default::default()
            },
        );
        let err = pool.borrow().unwrap_err();
        assert!(matches!(err, Error::ActivationFailed(_)));
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[test]
    fn max_idle_destroys_excess_on_return() {
        let pool = SinglePool::new(
            CountingFactory::new(),
            PoolConfig {
                max_total: Some(4),
                max_idle: Some(1),
                ..Default::default()
            },
        );
        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[test]
    fn fairness_across_blocked_borrowers() {
        let pool = test_pool(1);
        let held = pool.borrow().unwrap();
        let order = StdArc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3u32 {
            let pool = pool.clone();
            let order = order.clone();
            handles.push(std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10 * i as u64));
                let _p = pool.borrow().unwrap();
                order.lock().unwrap().push(i);
                std::thread::sleep(Duration::from_millis(30));
            }));
        }
        std::thread::sleep(Duration::from_millis(60));
        drop(held);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn soft_eviction_honors_min_idle() {
        let pool = SinglePool::new(
            CountingFactory::new(),
            PoolConfig {
                max_total: Some(5),
                max_idle: Some(5),
                min_idle: 3,
                min_evictable_idle_time: Some(Duration::from_millis(0)),
                soft_min_evictable_idle_time: Some(Duration::from_millis(50)),
                num_tests_per_eviction_run: 10,
                time_between_eviction_runs: None,
                ..Default::default()
            },
        );
        for _ in 0..5 {
            pool.add_object().unwrap();
        }
        assert_eq!(pool.num_idle(), 5);
        std::thread::sleep(Duration::from_millis(80));
        pool.run_eviction_sweep();
        assert_eq!(pool.num_idle(), 3);
        assert_eq!(pool.stats().destroyed, 2);
    }
}
