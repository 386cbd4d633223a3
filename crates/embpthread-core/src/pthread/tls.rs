//! Thread-specific data.
//!
//! Each key owns an OSAL TLS slot holding one `usize` per thread. Keys with a
//! destructor also track which threads hold a non-zero value, and each thread
//! tracks which keys it holds values for; the association lives in both sets
//! and is always changed with the key lock held first, then the thread lock.
//! At thread exit the destructor pass walks the thread's set.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use embpthread_osal::{OsError, TlsSlot};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::oslock::OsLock;
use crate::pthread::reuse::ThreadSlot;
use crate::runtime::Runtime;

/// Called at thread exit with the thread's non-zero value for the key.
pub type Destructor = Arc<dyn Fn(usize) + Send + Sync>;

/// Handle for a thread-specific data key.
///
/// Stale after [`Runtime::key_delete`]; a later key reusing the same id has a
/// different generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    id: u32,
    generation: u32,
    slot: TlsSlot,
    has_destructor: bool,
}

impl Key {
    #[must_use]
    pub const fn id(self) -> u32 {
        self.id
    }
}

struct KeyThreads {
    threads: BTreeSet<u32>,
    deleted: bool,
}

struct KeyEntry {
    generation: u32,
    slot: TlsSlot,
    destructor: Option<Destructor>,
    /// The key lock. Absent for keys without a destructor.
    threads: Option<OsLock<KeyThreads>>,
}

pub(crate) struct KeyRegistry {
    entries: RwLock<Vec<Option<Arc<KeyEntry>>>>,
    next_generation: AtomicU32,
}

impl KeyRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_generation: AtomicU32::new(1),
        }
    }

    fn lookup(&self, key: Key) -> Option<Arc<KeyEntry>> {
        self.entries
            .read()
            .get(key.id as usize)?
            .as_ref()
            .filter(|entry| entry.generation == key.generation)
            .cloned()
    }

    fn live(&self) -> usize {
        self.entries.read().iter().flatten().count()
    }
}

impl Runtime {
    /// Allocate a key. Every thread's value starts at `0`.
    ///
    /// `ResourceExhausted` once `keys_max` keys are live or the OS runs out
    /// of TLS slots.
    pub fn key_create(&self, destructor: Option<Destructor>) -> Result<Key> {
        self.check_live()?;
        let registry = &self.ctx.keys;
        if registry.live() >= self.ctx.config.keys_max {
            return Err(Error::ResourceExhausted);
        }
        let osal = self.ctx.osal.as_ref();
        let slot = osal.tls_alloc().map_err(|_| Error::ResourceExhausted)?;
        let threads = match destructor {
            Some(_) => match OsLock::new(
                osal,
                KeyThreads {
                    threads: BTreeSet::new(),
                    deleted: false,
                },
            ) {
                Ok(lock) => Some(lock),
                Err(err) => {
                    let _ = osal.tls_free(slot);
                    return Err(err);
                }
            },
            None => None,
        };

        let generation = registry.next_generation.fetch_add(1, Ordering::Relaxed);
        let has_destructor = destructor.is_some();
        let entry = Arc::new(KeyEntry {
            generation,
            slot,
            destructor,
            threads,
        });
        let mut entries = registry.entries.write();
        let id = match entries.iter().position(Option::is_none) {
            Some(free) => {
                entries[free] = Some(entry);
                free
            }
            None => {
                entries.push(Some(entry));
                entries.len() - 1
            }
        };
        let id = u32::try_from(id).map_err(|_| Error::ResourceExhausted)?;
        debug!(key = id, generation, has_destructor, "key created");
        Ok(Key {
            id,
            generation,
            slot,
            has_destructor,
        })
    }

    /// Retire `key`. Values still held by threads are abandoned and no
    /// destructor runs for them.
    pub fn key_delete(&self, key: Key) -> Result<()> {
        let entry = {
            let mut entries = self.ctx.keys.entries.write();
            let held = entries.get_mut(key.id as usize).ok_or(Error::InvalidArgument)?;
            if held.as_ref().map(|entry| entry.generation) != Some(key.generation) {
                return Err(Error::InvalidArgument);
            }
            held.take().ok_or(Error::InvalidArgument)?
        };

        if let Some(lock) = &entry.threads {
            let mut assoc = lock.lock();
            assoc.deleted = true;
            for index in std::mem::take(&mut assoc.threads) {
                if let Some(slot) = self.ctx.threads.slot_by_index(index) {
                    slot.keys.lock().remove(&key);
                }
            }
        }
        if self.ctx.osal.tls_free(entry.slot).is_err() {
            warn!(key = key.id, "failed to release TLS slot of deleted key");
        }
        debug!(key = key.id, "key deleted");
        Ok(())
    }

    /// The calling thread's value for `key`; `0` when never set.
    #[must_use]
    pub fn get_specific(&self, key: Key) -> usize {
        self.ctx.osal.tls_get(key.slot)
    }

    /// Set the calling thread's value for `key`.
    ///
    /// A non-zero value under a key with a destructor registers the calling
    /// thread for the exit-time destructor pass.
    pub fn set_specific(&self, key: Key, value: usize) -> Result<()> {
        if key.has_destructor && value != 0 {
            let me = self.current()?;
            let entry = self.ctx.keys.lookup(key).ok_or(Error::InvalidArgument)?;
            if let Some(lock) = &entry.threads {
                let mut assoc = lock.lock();
                if assoc.deleted {
                    return Err(Error::InvalidArgument);
                }
                if me.keys.lock().insert(key) {
                    assoc.threads.insert(me.index);
                }
            }
        }
        self.ctx
            .osal
            .tls_set(key.slot, value)
            .map_err(|err| match err {
                OsError::InvalidParam => Error::InvalidArgument,
                _ => Error::ResourceExhausted,
            })
    }

    /// Run destructors for the keys `slot`'s thread holds values for.
    ///
    /// Must run on that thread. Destructors may set new values; the pass is
    /// repeated up to `destructor_iterations` times.
    pub(crate) fn run_key_destructors(&self, slot: &ThreadSlot) {
        let limit = self.ctx.config.destructor_iterations;
        let mut iteration = 0;
        loop {
            iteration += 1;
            let held: Vec<Key> = slot.keys.lock().iter().copied().collect();
            let mut ran = false;
            for key in held {
                if let Some((destructor, value)) =
                    self.take_for_destructor(slot, key, iteration <= limit)
                {
                    destructor(value);
                    ran = true;
                }
            }
            if !ran {
                break;
            }
        }
    }

    /// Clear this thread's value for `key`. Returns the destructor to call
    /// when the value was non-zero and another pass is allowed; otherwise the
    /// association is dropped.
    fn take_for_destructor(
        &self,
        slot: &ThreadSlot,
        key: Key,
        may_run: bool,
    ) -> Option<(Destructor, usize)> {
        let live = self.ctx.keys.lookup(key);
        let Some((entry, lock)) = live
            .as_ref()
            .and_then(|entry| entry.threads.as_ref().map(|lock| (entry, lock)))
        else {
            slot.keys.lock().remove(&key);
            return None;
        };

        let mut assoc = lock.lock();
        let mut mine = slot.keys.lock();
        if !mine.contains(&key) || !assoc.threads.contains(&slot.index) {
            mine.remove(&key);
            assoc.threads.remove(&slot.index);
            return None;
        }
        let value = self.ctx.osal.tls_get(key.slot);
        if value != 0 {
            let _ = self.ctx.osal.tls_set(key.slot, 0);
        }
        match &entry.destructor {
            Some(destructor) if value != 0 && may_run => Some((destructor.clone(), value)),
            _ => {
                if value != 0 && !may_run {
                    warn!(
                        thread = slot.index,
                        key = key.id,
                        "value still set after the last destructor pass"
                    );
                }
                mine.remove(&key);
                assoc.threads.remove(&slot.index);
                None
            }
        }
    }

    /// Number of live keys.
    #[must_use]
    pub fn live_keys(&self) -> usize {
        self.ctx.keys.live()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeConfig;
    use embpthread_osal::HostOsal;
    use std::sync::atomic::AtomicUsize;

    fn runtime(config: RuntimeConfig) -> Runtime {
        Runtime::init(Arc::new(HostOsal::new()), config).unwrap()
    }

    #[test]
    fn values_are_per_thread() {
        let rt = runtime(RuntimeConfig::default());
        let key = rt.key_create(None).unwrap();
        rt.set_specific(key, 5).unwrap();
        let worker = rt.clone();
        let t = rt
            .create(None, move || {
                let before = worker.get_specific(key);
                worker.set_specific(key, 9)?;
                Ok(before + worker.get_specific(key))
            })
            .unwrap();
        assert_eq!(rt.join(t).unwrap().value(), Some(9));
        assert_eq!(rt.get_specific(key), 5);
        rt.key_delete(key).unwrap();
    }

    #[test]
    fn deleted_key_is_stale() {
        let rt = runtime(RuntimeConfig::default());
        let key = rt.key_create(None).unwrap();
        rt.key_delete(key).unwrap();
        assert_eq!(rt.key_delete(key).unwrap_err(), Error::InvalidArgument);
        let reused = rt.key_create(None).unwrap();
        assert_eq!(reused.id(), key.id());
        assert_ne!(reused, key);
        assert_eq!(rt.get_specific(reused), 0);
    }

    #[test]
    fn key_limit_is_enforced() {
        let rt = runtime(RuntimeConfig::default().with_keys_max(2));
        let a = rt.key_create(None).unwrap();
        let _b = rt.key_create(None).unwrap();
        assert_eq!(rt.key_create(None).unwrap_err(), Error::ResourceExhausted);
        rt.key_delete(a).unwrap();
        rt.key_create(None).unwrap();
        assert_eq!(rt.live_keys(), 2);
    }

    #[test]
    fn destructor_runs_once_at_thread_exit() {
        let rt = runtime(RuntimeConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        let key = rt
            .key_create(Some(Arc::new(move |value| {
                sink.fetch_add(value, Ordering::SeqCst);
            })))
            .unwrap();
        let worker = rt.clone();
        let t = rt
            .create(None, move || {
                worker.set_specific(key, 40)?;
                Ok(0)
            })
            .unwrap();
        rt.join(t).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn resetting_value_in_destructor_is_bounded() {
        let rt = runtime(RuntimeConfig::default().with_destructor_iterations(3));
        let calls = Arc::new(AtomicUsize::new(0));
        let key_cell = Arc::new(parking_lot::Mutex::new(None::<Key>));
        let (counter, cell, inner) = (calls.clone(), key_cell.clone(), rt.clone());
        let key = rt
            .key_create(Some(Arc::new(move |value| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(key) = *cell.lock() {
                    let _ = inner.set_specific(key, value);
                }
            })))
            .unwrap();
        *key_cell.lock() = Some(key);
        let worker = rt.clone();
        let t = rt
            .create(None, move || {
                worker.set_specific(key, 1)?;
                Ok(0)
            })
            .unwrap();
        rt.join(t).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn deleted_key_destructor_never_runs() {
        let rt = runtime(RuntimeConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let key = rt
            .key_create(Some(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        let gate = Arc::new(crate::Semaphore::new());
        rt.sem_init(&gate, crate::ProcessShared::Private, 0).unwrap();
        let (worker, wait_on) = (rt.clone(), gate.clone());
        let t = rt
            .create(None, move || {
                worker.set_specific(key, 3)?;
                worker.sem_wait(&wait_on)?;
                Ok(0)
            })
            .unwrap();
        while rt.sem_getvalue(&gate).unwrap() >= 0 {
            std::thread::yield_now();
        }
        rt.key_delete(key).unwrap();
        rt.sem_post(&gate).unwrap();
        rt.join(t).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
