//! The keyed pool (design doc component C5): a dynamic map of per-key
//! sub-pools sharing a global cap, with interest-counted sub-pool lifetime,
//! oldest-15% compaction under global pressure, reuse-capacity-on-return, and
//! a round-robin cross-key evictor.
//!
//! Mirrors [`crate::single::SinglePool`] closely enough that some logic is
//! genuinely duplicated rather than shared — this corpus's own keyed/unkeyed
//! pool pair does the same, since the two eviction loops diverge exactly
//! where the key dimension enters.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::{KeyedPoolConfig, PoolConfig};
use crate::entry::PooledEntry;
use crate::error::{Error, Result};
use crate::evictor::{EvictionScheduler, TaskHandle};
use crate::factory::KeyedFactory;
use crate::idle_deque::{IdleDeque, Wake};
use crate::single::PoolStats;

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

/// One key's idle deque, live-object index and per-key counters (design
/// doc's `SubPoolState`). Created lazily by [`KeyedPool::register`], removed
/// once both `interested` and `create_count` drop to zero.
struct SubPoolState<T> {
    idle: IdleDeque<T>,
    all_objects: Mutex<HashMap<usize, EntryArc<T>>>,
    create_count: AtomicUsize,
    interested: AtomicUsize,
    stats: Stats,
}

impl<T> SubPoolState<T> {
    fn new() -> Self {
        SubPoolState {
            idle: IdleDeque::new(),
            all_objects: Mutex::new(HashMap::new()),
            create_count: AtomicUsize::new(0),
            interested: AtomicUsize::new(0),
            stats: Stats::default(),
        }
    }
}

/// Persisted cross-key eviction position: the key to resume at, and the last
/// tested entry's identity within that key's deque (`None` to start the
/// key's deque fresh).
#[derive(Default)]
struct KeyCursor<K> {
    key: Option<K>,
    entry_id: Option<usize>,
}

struct Inner<K, T, F> {
    factory: F,
    config: KeyedPoolConfig,
    sub_pools: RwLock<HashMap<K, Arc<SubPoolState<T>>>>,
    // Insertion order, used for round-robin eviction (§4.5.5). A plain
    // `RwLock`-guarded structure, separate from `sub_pools`, matching the
    // design doc's `keyLock` covering sub-pool structure only.
    key_list: Mutex<VecDeque<K>>,
    num_total: AtomicUsize,
    closed: AtomicBool,
    evict_cursor: Mutex<KeyCursor<K>>,
    scheduler: EvictionScheduler,
    evict_handle: Mutex<Option<TaskHandle>>,
}

/// A keyed object pool: independently-capped sub-pools multiplexed over a
/// dynamic key set, sharing one global cap.
pub struct KeyedPool<K, T, F> {
    inner: Arc<Inner<K, T, F>>,
}

impl<K, T, F> Clone for KeyedPool<K, T, F> {
    fn clone(&self) -> Self {
        KeyedPool {
            inner: self.inner.clone(),
        }
    }
}

impl<K, T, F> fmt::Debug for KeyedPool<K, T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedPool")
            .field("num_total", &self.inner.num_total.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, T, F> KeyedPool<K, T, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + 'static,
    F: KeyedFactory<K, T> + 'static,
{
    pub fn new(factory: F, config: KeyedPoolConfig) -> Self {
        Self::with_scheduler(factory, config, EvictionScheduler::new())
    }

    pub fn with_scheduler(factory: F, config: KeyedPoolConfig, scheduler: EvictionScheduler) -> Self {
        let inner = Arc::new(Inner {
            factory,
            config,
            sub_pools: RwLock::new(HashMap::new()),
            key_list: Mutex::new(VecDeque::new()),
            num_total: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            evict_cursor: Mutex::new(KeyCursor::default()),
            scheduler,
            evict_handle: Mutex::new(None),
        });
        let pool = KeyedPool { inner };
        pool.start_evictor();
        pool
    }

    fn start_evictor(&self) {
        let config = self.inner.config.per_key;
        if !config.eviction_enabled() {
            return;
        }
        let period = config.time_between_eviction_runs.unwrap();
        let weak: Weak<Inner<K, T, F>> = Arc::downgrade(&self.inner);
        let handle = self.inner.scheduler.schedule(
            move || {
                if let Some(inner) = weak.upgrade() {
                    KeyedPool { inner }.run_eviction_sweep();
                }
            },
            period,
            period,
        );
        *self.inner.evict_handle.lock().unwrap() = Some(handle);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn num_total(&self) -> usize {
        self.inner.num_total.load(Ordering::Relaxed)
    }

    pub fn num_idle(&self, key: &K) -> usize {
        self.inner
            .sub_pools
            .read()
            .unwrap()
            .get(key)
            .map_or(0, |sp| sp.idle.len())
    }

    pub fn num_active(&self, key: &K) -> usize {
        self.inner.sub_pools.read().unwrap().get(key).map_or(0, |sp| {
            sp.all_objects
                .lock()
                .unwrap()
                .len()
                .saturating_sub(sp.idle.len())
        })
    }

    pub fn stats(&self, key: &K) -> PoolStats {
        match self.inner.sub_pools.read().unwrap().get(key) {
            Some(sp) => PoolStats {
                created: sp.stats.created.load(Ordering::Relaxed),
                destroyed: sp.stats.destroyed.load(Ordering::Relaxed),
                borrowed: sp.stats.borrowed.load(Ordering::Relaxed),
                returned: sp.stats.returned.load(Ordering::Relaxed),
            },
            None => PoolStats::default(),
        }
    }

    fn total_idle(&self) -> usize {
        self.inner
            .sub_pools
            .read()
            .unwrap()
            .values()
            .map(|sp| sp.idle.len())
            .sum()
    }

    /// Find or lazily create `key`'s sub-pool and mark this operation
    /// interested in it, so it cannot be torn down while the operation is
    /// still in flight (§4.5.1).
    fn register(&self, key: &K) -> Arc<SubPoolState<T>> {
        {
            let subs = self.inner.sub_pools.read().unwrap();
            if let Some(sp) = subs.get(key) {
                sp.interested.fetch_add(1, Ordering::AcqRel);
                return sp.clone();
            }
        }
        let mut subs = self.inner.sub_pools.write().unwrap();
        if let Some(sp) = subs.get(key) {
            sp.interested.fetch_add(1, Ordering::AcqRel);
            return sp.clone();
        }
        let sp = Arc::new(SubPoolState::new());
        sp.interested.fetch_add(1, Ordering::AcqRel);
        subs.insert(key.clone(), sp.clone());
        drop(subs);
        self.inner.key_list.lock().unwrap().push_back(key.clone());
        sp
    }

    fn deregister(&self, key: &K) {
        let sub = self.inner.sub_pools.read().unwrap().get(key).cloned();
        if let Some(sp) = sub {
            sp.interested.fetch_sub(1, Ordering::AcqRel);
        }
        self.remove_empty_subpool(key);
    }

    /// Brackets `f` with `register`/`deregister`, the pattern every keyed
    /// operation in §4.5 follows.
    fn with_subpool<R>(&self, key: &K, f: impl FnOnce(&Arc<SubPoolState<T>>) -> R) -> R {
        let sub = self.register(key);
        let result = f(&sub);
        self.deregister(key);
        result
    }

    fn remove_empty_subpool(&self, key: &K) {
        let should_remove = {
            let subs = self.inner.sub_pools.read().unwrap();
            match subs.get(key) {
                Some(sp) => {
                    sp.interested.load(Ordering::Acquire) == 0
                        && sp.create_count.load(Ordering::Acquire) == 0
                }
                None => false,
            }
        };
        if !should_remove {
            return;
        }
        let mut subs = self.inner.sub_pools.write().unwrap();
        if let Some(sp) = subs.get(key) {
            if sp.interested.load(Ordering::Acquire) == 0
                && sp.create_count.load(Ordering::Acquire) == 0
            {
                subs.remove(key);
                drop(subs);
                self.inner.key_list.lock().unwrap().retain(|k| k != key);
            }
        }
    }

    /// Borrow using the per-key config's `max_wait`.
    pub fn borrow(&self, key: &K) -> Result<Pooled<K, T, F>> {
        self.borrow_timeout(key, self.inner.config.per_key.max_wait)
    }

    pub fn borrow_timeout(&self, key: &K, max_wait: Option<Duration>) -> Result<Pooled<K, T, F>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }
        self.with_subpool(key, |sub| self.borrow_from(key, sub, max_wait))
    }

    fn borrow_from(
        &self,
        key: &K,
        sub: &Arc<SubPoolState<T>>,
        max_wait: Option<Duration>,
    ) -> Result<Pooled<K, T, F>> {
        let config = self.inner.config.per_key;
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(Error::PoolClosed);
            }

            let mut entry = sub.idle.poll_first();
            let mut created_fresh = false;

            if entry.is_none() {
                if let Some(e) = self.try_create(key, sub)? {
                    entry = Some(e);
                    created_fresh = true;
                }
            }

            let entry = match entry {
                Some(e) => e,
                None => {
                    if !config.block_when_exhausted {
                        return Err(Error::PoolExhausted { timed_out: false });
                    }
                    match max_wait {
                        None => match sub.idle.take_first() {
                            Wake::Entry(e) => e,
                            Wake::Closed => return Err(Error::PoolClosed),
                        },
                        Some(d) => match sub.idle.poll_first_deadline(Instant::now() + d) {
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
                trace!("keyed borrow raced the evictor for an entry, retrying");
                continue;
            }

            let activation = self.inner.factory.activate(key, entry.object_mut());
            if let Err(e) = activation {
                self.destroy_entry(key, sub, entry);
                if created_fresh {
                    return Err(Error::activation_failed(e));
                }
                continue;
            }

            if config.test_on_borrow {
                let valid = self.inner.factory.validate(key, entry.object());
                if !valid {
                    self.destroy_entry(key, sub, entry);
                    if created_fresh {
                        return Err(Error::validation_failed("validate() returned false"));
                    }
                    continue;
                }
            }

            sub.stats.borrowed.fetch_add(1, Ordering::Relaxed);
            return Ok(Pooled {
                entry: Some(entry),
                key: key.clone(),
                sub: sub.clone(),
                pool: Arc::downgrade(&self.inner),
            });
        }
    }

    /// §4.5.2: two-level capped creation with oldest-15% compaction retry.
    fn try_create(&self, key: &K, sub: &SubPoolState<T>) -> Result<Option<EntryArc<T>>> {
        loop {
            if let Some(max_total) = self.inner.config.max_total {
                let reserved = self.inner.num_total.fetch_add(1, Ordering::AcqRel) + 1;
                if reserved > max_total {
                    self.inner.num_total.fetch_sub(1, Ordering::AcqRel);
                    if self.total_idle() == 0 {
                        return Ok(None);
                    }
                    self.compact_oldest_15_percent();
                    continue;
                }
            } else {
                self.inner.num_total.fetch_add(1, Ordering::AcqRel);
            }

            let per_key_reserved = sub.create_count.fetch_add(1, Ordering::AcqRel) + 1;
            if let Some(max_per_key) = self.inner.config.per_key.max_total {
                if per_key_reserved > max_per_key {
                    sub.create_count.fetch_sub(1, Ordering::AcqRel);
                    self.inner.num_total.fetch_sub(1, Ordering::AcqRel);
                    return Ok(None);
                }
            }

            return match self.inner.factory.create(key) {
                Ok(object) => {
                    let entry = Arc::new(PooledEntry::new(object));
                    let allocated = entry.allocate();
                    debug_assert!(allocated, "a brand new entry always starts Idle");
                    sub.all_objects
                        .lock()
                        .unwrap()
                        .insert(entry_id(&entry), entry.clone());
                    sub.stats.created.fetch_add(1, Ordering::Relaxed);
                    trace!("created new keyed pooled object");
                    Ok(Some(entry))
                }
                Err(e) => {
                    sub.create_count.fetch_sub(1, Ordering::AcqRel);
                    self.inner.num_total.fetch_sub(1, Ordering::AcqRel);
                    Err(Error::factory_failed(e))
                }
            };
        }
    }

    /// §4.5.3: destroy the globally oldest `floor(0.15 * N) + 1` idle
    /// entries (across every key) to make room under a saturated global cap.
    fn compact_oldest_15_percent(&self) {
        let subs_snapshot: Vec<(K, Arc<SubPoolState<T>>)> = {
            let subs = self.inner.sub_pools.read().unwrap();
            subs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut idle_with_key: Vec<(K, Arc<SubPoolState<T>>, EntryArc<T>)> = Vec::new();
        for (key, sub) in &subs_snapshot {
            for e in sub.idle.snapshot() {
                idle_with_key.push((key.clone(), sub.clone(), e));
            }
        }
        let n = idle_with_key.len();
        if n == 0 {
            // Guards the N = 0 case: nothing to compact, so `borrow` should
            // fall through to blocking/failing rather than destroy a
            // nonexistent entry.
            return;
        }
        idle_with_key.sort_by_key(|(_, _, e)| e.last_returned_at());
        let destroy_count = (n * 15 / 100) + 1;
        for (key, sub, entry) in idle_with_key.into_iter().take(destroy_count) {
            if sub.idle.remove(&entry) {
                self.destroy_entry(&key, &sub, entry);
            }
        }
    }

    /// §4.5.4: best-effort, unsynchronized creation on whichever sub-pool is
    /// both most starved (longest take-queue) and has per-key headroom,
    /// called after a return frees global capacity. Swallows failures.
    fn attempt_reuse_capacity(&self) {
        let candidates: Vec<(K, Arc<SubPoolState<T>>)> = {
            let subs = self.inner.sub_pools.read().unwrap();
            subs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let per_key_cap = self.inner.config.per_key.max_total;
        let best = candidates
            .into_iter()
            .filter(|(_, sub)| sub.idle.take_queue_length() > 0)
            .filter(|(_, sub)| {
                per_key_cap.map_or(true, |cap| sub.create_count.load(Ordering::Acquire) < cap)
            })
            .max_by_key(|(_, sub)| sub.idle.take_queue_length());

        if let Some((key, sub)) = best {
            if let Ok(Some(entry)) = self.try_create(&key, &sub) {
                entry.deallocate();
                sub.idle.offer_last(entry);
            }
        }
    }

    /// Removes `entry` from every data structure for `key` and hands its
    /// object to `Factory::destroy`. See [`crate::single::SinglePool`]'s
    /// method of the same name for why this takes ownership.
    fn destroy_entry(&self, key: &K, sub: &SubPoolState<T>, entry: EntryArc<T>) {
        entry.invalidate();
        sub.idle.remove(&entry);
        let removed = sub
            .all_objects
            .lock()
            .unwrap()
            .remove(&entry_id(&entry))
            .is_some();
        if !removed {
            return;
        }
        sub.create_count.fetch_sub(1, Ordering::AcqRel);
        self.inner.num_total.fetch_sub(1, Ordering::AcqRel);
        sub.stats.destroyed.fetch_add(1, Ordering::Relaxed);
        if sub.interested.load(Ordering::Acquire) == 0
            && sub.create_count.load(Ordering::Acquire) == 0
        {
            self.remove_empty_subpool(key);
        }
        match Arc::try_unwrap(entry) {
            Ok(entry) => self.inner.factory.destroy(key, entry.into_inner()),
            Err(entry) => debug!(
                refs = Arc::strong_count(&entry),
                "keyed entry still referenced elsewhere at destroy time, skipping factory.destroy"
            ),
        }
    }

    fn return_entry(&self, key: &K, sub: &Arc<SubPoolState<T>>, entry: EntryArc<T>) {
        let config = self.inner.config.per_key;
        if config.test_on_return {
            let valid = self.inner.factory.validate(key, entry.object());
            if !valid {
                self.destroy_entry(key, sub, entry);
                return;
            }
        }

        let passivation = self.inner.factory.passivate(key, entry.object_mut());
        if passivation.is_err() {
            self.destroy_entry(key, sub, entry);
            return;
        }

        if !entry.deallocate() {
            debug!("keyed entry was not allocated at deallocate time");
            return;
        }
        sub.stats.returned.fetch_add(1, Ordering::Relaxed);

        let over_capacity = config.max_idle.is_some_and(|max| sub.idle.len() >= max);
        let closed = self.inner.closed.load(Ordering::Acquire);

        if closed || over_capacity {
            self.destroy_entry(key, sub, entry);
            return;
        }

        if config.lifo {
            sub.idle.offer_first(entry);
        } else {
            sub.idle.offer_last(entry);
        }
        self.attempt_reuse_capacity();
    }

    /// Explicit return; see [`crate::single::SinglePool::return_object`].
    pub fn return_object(&self, mut pooled: Pooled<K, T, F>) -> Result<()> {
        if !Weak::ptr_eq(&pooled.pool, &Arc::downgrade(&self.inner)) {
            return Err(Error::NotFromThisPool);
        }
        let entry = pooled.entry.take().ok_or(Error::AlreadyReturned)?;
        if entry.state() != crate::entry::EntryState::Allocated {
            return Err(Error::AlreadyReturned);
        }
        self.return_entry(&pooled.key, &pooled.sub, entry);
        Ok(())
    }

    /// Force removal of a live entry; see
    /// [`crate::single::SinglePool::invalidate`].
    pub fn invalidate(&self, mut pooled: Pooled<K, T, F>) -> Result<()> {
        if !Weak::ptr_eq(&pooled.pool, &Arc::downgrade(&self.inner)) {
            return Err(Error::NotFromThisPool);
        }
        let entry = pooled.entry.take().ok_or(Error::NotFromThisPool)?;
        self.destroy_entry(&pooled.key, &pooled.sub, entry);
        Ok(())
    }

    /// Preload a single idle entry under `key`.
    pub fn add_object(&self, key: &K) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }
        self.with_subpool(key, |sub| {
            if let Some(entry) = self.try_create(key, sub)? {
                entry.deallocate();
                sub.idle.offer_last(entry);
            }
            Ok(())
        })
    }

    /// Destroy every idle entry under `key`, keeping active ones untouched.
    pub fn clear(&self, key: &K) {
        let sub = self.inner.sub_pools.read().unwrap().get(key).cloned();
        if let Some(sub) = sub {
            for entry in sub.idle.drain() {
                self.destroy_entry(key, &sub, entry);
            }
        }
    }

    /// Close the whole pool across every key: drain and destroy idle
    /// entries, cancel the evictor, and wake every parked borrower on every
    /// key with [`Error::PoolClosed`]. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing keyed pool");
        if let Some(handle) = self.inner.evict_handle.lock().unwrap().take() {
            handle.cancel();
        }
        let subs: Vec<(K, Arc<SubPoolState<T>>)> = {
            let subs = self.inner.sub_pools.read().unwrap();
            subs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (key, sub) in subs {
            for entry in sub.idle.drain() {
                self.destroy_entry(&key, &sub, entry);
            }
            sub.idle.close_and_wake_all();
        }
    }

    /// §4.5.5: one cross-key round-robin eviction sweep. Resumes from a
    /// cursor that names a key and an entry identity within that key's
    /// deque, crossing to the next key once the current one's deque has been
    /// fully traversed this run.
    pub fn run_eviction_sweep(&self) {
        let config = self.inner.config.per_key;
        let total_idle = self.total_idle();
        if total_idle == 0 {
            self.ensure_min_idle_all();
            return;
        }
        let budget = config.tests_for_sweep(total_idle);

        let keys: Vec<K> = self.inner.key_list.lock().unwrap().iter().cloned().collect();
        if keys.is_empty() {
            self.ensure_min_idle_all();
            return;
        }
        let num_keys = keys.len();

        let (mut key_idx, mut entry_id_cursor) = {
            let cursor = self.inner.evict_cursor.lock().unwrap();
            match &cursor.key {
                Some(k) => match keys.iter().position(|x| x == k) {
                    Some(p) => (p, cursor.entry_id),
                    None => (0, None),
                },
                None => (0, None),
            }
        };

        let mut tested = 0usize;
        let mut global_visited = 0usize;
        let mut keys_without_progress = 0usize;

        while tested < budget && global_visited < total_idle && keys_without_progress < num_keys {
            let key = keys[key_idx].clone();
            let sub = {
                let subs = self.inner.sub_pools.read().unwrap();
                subs.get(&key).cloned()
            };
            let Some(sub) = sub else {
                key_idx = (key_idx + 1) % num_keys;
                entry_id_cursor = None;
                keys_without_progress += 1;
                continue;
            };

            let mut snapshot: Vec<Option<EntryArc<T>>> = {
                let mut v = sub.idle.snapshot();
                v.sort_by_key(|e| e.last_returned_at());
                v.into_iter().map(Some).collect()
            };
            let len = snapshot.len();
            if len == 0 {
                key_idx = (key_idx + 1) % num_keys;
                entry_id_cursor = None;
                keys_without_progress += 1;
                continue;
            }

            let start = match entry_id_cursor {
                Some(id) => snapshot
                    .iter()
                    .position(|e| entry_id(e.as_ref().expect("not yet taken")) == id)
                    .map(|p| (p + 1) % len)
                    .unwrap_or(0),
                None => 0,
            };

            let mut idx = start;
            let mut visited_this_key = 0usize;
            let mut did_anything = false;
            let mut last_tested_in_key = None;

            while visited_this_key < len && tested < budget && global_visited < total_idle {
                let cur = idx;
                idx = (idx + 1) % len;
                visited_this_key += 1;
                global_visited += 1;

                let entry = snapshot[cur].as_ref().expect("not yet taken").clone();
                if !entry.start_eviction_test() {
                    continue;
                }
                did_anything = true;
                tested += 1;
                last_tested_in_key = Some(entry_id(&entry));

                let idle_for = entry.idle_duration();
                let hard_expired = config
                    .min_evictable_idle_time
                    .is_some_and(|d| !d.is_zero() && idle_for > d);
                // Per spec, the soft threshold is ignored whenever a
                // positive hard threshold is configured.
                let hard_active = config.min_evictable_idle_time.is_some_and(|d| !d.is_zero());
                let soft_expired = !hard_active
                    && config.soft_min_evictable_idle_time.is_some_and(|d| {
                        !d.is_zero() && idle_for > d && sub.idle.len() > config.min_idle
                    });

                if hard_expired || soft_expired {
                    trace!("evicting keyed idle entry past threshold");
                    entry.end_eviction_test();
                    drop(entry);
                    let owned = snapshot[cur].take().expect("just read above");
                    self.destroy_entry(&key, &sub, owned);
                    continue;
                }

                if config.test_while_idle {
                    let ok = self.inner.factory.activate(&key, entry.object_mut()).is_ok()
                        && self.inner.factory.validate(&key, entry.object())
                        && self.inner.factory.passivate(&key, entry.object_mut()).is_ok();
                    if !ok {
                        entry.end_eviction_test();
                        drop(entry);
                        let owned = snapshot[cur].take().expect("just read above");
                        self.destroy_entry(&key, &sub, owned);
                        continue;
                    }
                }

                if entry.end_eviction_test() {
                    sub.idle.offer_first(entry);
                }
            }

            if visited_this_key >= len {
                key_idx = (key_idx + 1) % num_keys;
                entry_id_cursor = None;
            } else {
                entry_id_cursor = last_tested_in_key.or(entry_id_cursor);
            }

            keys_without_progress = if did_anything { 0 } else { keys_without_progress + 1 };
        }

        *self.inner.evict_cursor.lock().unwrap() = KeyCursor {
            key: Some(keys[key_idx].clone()),
            entry_id: entry_id_cursor,
        };

        self.ensure_min_idle_all();
    }

    fn ensure_min_idle_all(&self) {
        let min_idle = self.inner.config.per_key.min_idle;
        if min_idle == 0 {
            return;
        }
        let entries: Vec<(K, Arc<SubPoolState<T>>)> = {
            let subs = self.inner.sub_pools.read().unwrap();
            subs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (key, sub) in entries {
            while sub.idle.len() < min_idle {
                match self.try_create(&key, &sub) {
                    Ok(Some(entry)) => {
                        entry.deallocate();
                        sub.idle.offer_last(entry);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "keyed ensureMinIdle creation failed, stopping");
                        break;
                    }
                }
            }
        }
    }
}

/// RAII handle for a borrowed keyed object: returns itself to its key's
/// sub-pool on drop, matching [`crate::single::Pooled`].
pub struct Pooled<K, T, F> {
    entry: Option<EntryArc<T>>,
    key: K,
    sub: Arc<SubPoolState<T>>,
    pool: Weak<Inner<K, T, F>>,
}

impl<K, T, F> Pooled<K, T, F> {
    pub fn key(&self) -> &K {
        &self.key
    }

    fn as_ref(&self) -> &T {
        self.entry.as_ref().expect("not dropped").object()
    }

    fn as_mut(&mut self) -> &mut T {
        self.entry.as_ref().expect("not dropped").object_mut()
    }
}

impl<K, T, F> Deref for Pooled<K, T, F> {
    type Target = T;
    fn deref(&self) -> &T {
        self.as_ref()
    }
}

impl<K, T, F> DerefMut for Pooled<K, T, F> {
    fn deref_mut(&mut self) -> &mut T {
        self.as_mut()
    }
}

impl<K, T, F> fmt::Debug for Pooled<K, T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled").finish_non_exhaustive()
    }
}

impl<K, T, F> Drop for Pooled<K, T, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + 'static,
    F: KeyedFactory<K, T> + 'static,
{
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            if let Some(inner) = self.pool.upgrade() {
                KeyedPool { inner }.return_entry(&self.key, &self.sub, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    struct CountingFactory {
        next_id: AtomicU32,
    }

    impl CountingFactory {
        fn new() -> Self {
            CountingFactory {
                next_id: AtomicU32::new(0),
            }
        }
    }

    impl KeyedFactory<String, u32> for CountingFactory {
        fn create(&self, _key: &String) -> std::result::Result<u32, crate::error::BoxError> {
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }
        fn destroy(&self, _key: &String, _object: u32) {}
    }

    fn test_pool(max_total: usize, max_total_per_key: usize) -> KeyedPool<String, u32, CountingFactory> {
        KeyedPool::new(
            CountingFactory::new(),
            KeyedPoolConfig {
                max_total: Some(max_total),
                per_key: PoolConfig {
                    max_total: Some(max_total_per_key),
                    max_idle: Some(max_total_per_key),
                    ..Default::default()
                },
            },
        )
    }

    #[test]
    fn borrow_and_return_round_trip_lifo() {
        let pool = test_pool(10, 2);
        let k = "a".to_string();
        let p = pool.borrow(&k).unwrap();
        let v = *p;
        drop(p);
        let p2 = pool.borrow(&k).unwrap();
        assert_eq!(*p2, v);
    }

    #[test]
    fn per_key_cap_blocks_independent_of_other_keys() {
        let pool = test_pool(10, 1);
        let a = "a".to_string();
        let b = "b".to_string();
        let _held_a = pool.borrow(&a).unwrap();
        // key "b" has its own per-key cap untouched by "a"'s exhaustion.
        let held_b = pool.borrow(&b).unwrap();
        drop(held_b);

        let err = pool
            .borrow_timeout(&a, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { timed_out: true }));
    }

    #[test]
    fn subpool_is_cleaned_up_once_empty() {
        let pool = test_pool(10, 2);
        let k = "a".to_string();
        let p = pool.borrow(&k).unwrap();
        pool.invalidate(p).unwrap();
        assert_eq!(pool.num_idle(&k), 0);
        assert!(pool.inner.sub_pools.read().unwrap().get(&k).is_none());
    }

    #[test]
    fn global_cap_triggers_oldest_compaction() {
        let pool = test_pool(20, 100);
        let keys: Vec<String> = (0..4).map(|i| format!("k{i}")).collect();
        for k in &keys {
            for _ in 0..5 {
                pool.add_object(k).unwrap();
            }
        }
        assert_eq!(pool.num_total(), 20);

        let new_key = "new".to_string();
        let p = pool.borrow(&new_key).unwrap();
        drop(p);

        // floor(0.15 * 20) + 1 == 4 entries destroyed to make room, then one
        // created for `new_key`: 20 - 4 + 1 == 17.
        assert_eq!(pool.num_total(), 17);
    }

    #[test]
    fn close_wakes_blocked_borrower() {
        let pool = test_pool(0, 0);
        let k = "a".to_string();
        let pool2 = pool.clone();
        let k2 = k.clone();
        let h = std::thread::spawn(move || pool2.borrow(&k2));
        std::thread::sleep(Duration::from_millis(30));
        pool.close();
        let err = h.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::PoolClosed));
    }

    #[test]
    fn max_idle_destroys_excess_on_return_per_key() {
        let pool = test_pool(10, 1);
        let k = "a".to_string();
        let p = pool.borrow(&k).unwrap();
        drop(p);
        assert_eq!(pool.num_idle(&k), 1);
        assert_eq!(pool.stats(&k).destroyed, 0);
    }

    #[test]
    fn soft_eviction_honors_min_idle_per_key() {
        let pool = KeyedPool::new(
            CountingFactory::new(),
            KeyedPoolConfig {
                max_total: Some(20),
                per_key: PoolConfig {
                    max_total: Some(10),
                    max_idle: Some(10),
                    min_idle: 3,
                    min_evictable_idle_time: Some(Duration::from_millis(0)),
                    soft_min_evictable_idle_time: Some(Duration::from_millis(50)),
                    num_tests_per_eviction_run: 10,
                    time_between_eviction_runs: None,
                    ..Default::default()
                },
            },
        );
        let k = "a".to_string();
        for _ in 0..5 {
            pool.add_object(&k).unwrap();
        }
        assert_eq!(pool.num_idle(&k), 5);
        std::thread::sleep(Duration::from_millis(80));
        pool.run_eviction_sweep();
        assert_eq!(pool.num_idle(&k), 3);
    }

    #[test]
    fn eviction_sweep_crosses_key_boundaries() {
        let pool = KeyedPool::new(
            CountingFactory::new(),
            KeyedPoolConfig {
                max_total: Some(20),
                per_key: PoolConfig {
                    max_total: Some(10),
                    max_idle: Some(10),
                    min_evictable_idle_time: Some(Duration::from_millis(10)),
                    num_tests_per_eviction_run: 100,
                    time_between_eviction_runs: None,
                    ..Default::default()
                },
            },
        );
        let keys = ["a".to_string(), "b".to_string(), "c".to_string()];
        for k in &keys {
            pool.add_object(k).unwrap();
            pool.add_object(k).unwrap();
        }
        std::thread::sleep(Duration::from_millis(30));
        pool.run_eviction_sweep();
        for k in &keys {
            assert_eq!(pool.num_idle(k), 0, "key {k} should have been fully evicted");
        }
    }

    #[test]
    fn fairness_within_a_key() {
        let pool = test_pool(1, 1);
        let k = "a".to_string();
        let held = pool.borrow(&k).unwrap();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3u32 {
            let pool = pool.clone();
            let k = k.clone();
            let order = order.clone();
            handles.push(std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10 * i as u64));
                let _p = pool.borrow(&k).unwrap();
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
}
