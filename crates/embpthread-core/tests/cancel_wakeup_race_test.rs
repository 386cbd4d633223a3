//! A waiter canceled while a post is already on its way must pass that post
//! on instead of swallowing it.
//!
//! [`LateWakeOsal`] stretches the window between a cancellable pend returning
//! and the waiter acting on it, so the post reliably lands inside it.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant, SystemTime};

use embpthread_core::{
    Cond, Error, ExitStatus, Mutex, ProcessShared, Runtime, RuntimeConfig, Semaphore,
};
use embpthread_osal::{
    HostOsal, OsError, OsMutex, OsResult, OsSemaphore, OsThreadId, Osal, PriorityRange,
    ThreadEntry, ThreadSpawn, TlsSlot,
};

const LATE_WAKE: Duration = Duration::from_millis(300);

struct LateWakeSemaphore {
    inner: Box<dyn OsSemaphore>,
}

impl OsSemaphore for LateWakeSemaphore {
    fn pend(&self, timeout_ms: Option<u32>) -> OsResult<()> {
        self.inner.pend(timeout_ms)
    }

    fn cancellable_pend(&self, timeout_ms: Option<u32>) -> OsResult<()> {
        let result = self.inner.cancellable_pend(timeout_ms);
        if matches!(result, Ok(()) | Err(OsError::Interrupted)) {
            std::thread::sleep(LATE_WAKE);
        }
        result
    }

    fn post(&self, count: u32) -> OsResult<()> {
        self.inner.post(count)
    }
}

/// Host layer whose cancellable pends return late.
struct LateWakeOsal {
    host: HostOsal,
}

impl Osal for LateWakeOsal {
    fn thread_create(&self, spawn: ThreadSpawn, entry: ThreadEntry) -> OsResult<OsThreadId> {
        self.host.thread_create(spawn, entry)
    }

    fn thread_start(&self, id: OsThreadId) -> OsResult<()> {
        self.host.thread_start(id)
    }

    fn thread_current(&self) -> OsThreadId {
        self.host.thread_current()
    }

    fn thread_wait_for_end(&self, id: OsThreadId, cancellable: bool) -> OsResult<()> {
        self.host.thread_wait_for_end(id, cancellable)
    }

    fn thread_delete(&self, id: OsThreadId) -> OsResult<()> {
        self.host.thread_delete(id)
    }

    fn thread_set_priority(&self, id: OsThreadId, priority: i32) -> OsResult<()> {
        self.host.thread_set_priority(id, priority)
    }

    fn thread_get_priority(&self, id: OsThreadId) -> OsResult<i32> {
        self.host.thread_get_priority(id)
    }

    fn thread_priority_range(&self) -> PriorityRange {
        self.host.thread_priority_range()
    }

    fn thread_sleep(&self, ms: u32) {
        self.host.thread_sleep(ms);
    }

    fn thread_cancel(&self, id: OsThreadId) -> OsResult<()> {
        self.host.thread_cancel(id)
    }

    fn thread_check_cancel(&self, id: OsThreadId) -> OsResult<()> {
        self.host.thread_check_cancel(id)
    }

    fn processor_count(&self) -> usize {
        self.host.processor_count()
    }

    fn semaphore_create(&self, initial: u32) -> OsResult<Box<dyn OsSemaphore>> {
        Ok(Box::new(LateWakeSemaphore {
            inner: self.host.semaphore_create(initial)?,
        }))
    }

    fn mutex_create(&self) -> OsResult<Box<dyn OsMutex>> {
        self.host.mutex_create()
    }

    fn tls_alloc(&self) -> OsResult<TlsSlot> {
        self.host.tls_alloc()
    }

    fn tls_free(&self, slot: TlsSlot) -> OsResult<()> {
        self.host.tls_free(slot)
    }

    fn tls_get(&self, slot: TlsSlot) -> usize {
        self.host.tls_get(slot)
    }

    fn tls_set(&self, slot: TlsSlot, value: usize) -> OsResult<()> {
        self.host.tls_set(slot, value)
    }
}

fn late_wake_runtime() -> Runtime {
    let osal = LateWakeOsal {
        host: HostOsal::new(),
    };
    Runtime::init(Arc::new(osal), RuntimeConfig::default()).unwrap()
}

fn wait_until(mut ready: impl FnMut() -> bool) {
    let give_up = Instant::now() + Duration::from_secs(5);
    while !ready() {
        assert!(Instant::now() < give_up, "condition never became true");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn canceled_sem_waiter_hands_raced_post_on() {
    let rt = late_wake_runtime();
    let sem = Arc::new(Semaphore::new());
    rt.sem_init(&sem, ProcessShared::Private, 0).unwrap();

    let (worker, s) = (rt.clone(), sem.clone());
    let waiter = rt
        .create(None, move || {
            worker.sem_wait(&s)?;
            Ok(1)
        })
        .unwrap();
    wait_until(|| rt.sem_getvalue(&sem).unwrap() == -1);

    rt.cancel(waiter).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    rt.sem_post(&sem).unwrap();

    assert!(matches!(rt.join(waiter).unwrap(), ExitStatus::Canceled));
    assert_eq!(rt.sem_getvalue(&sem).unwrap(), 1);
    rt.sem_trywait(&sem).unwrap();
    assert_eq!(rt.sem_trywait(&sem).unwrap_err(), Error::ResourceExhausted);
    rt.sem_destroy(&sem).unwrap();
}

#[test]
fn cond_stays_usable_after_waiter_canceled_at_the_gate() {
    let rt = late_wake_runtime();
    let cond = Arc::new(Cond::new());
    let mutex = Arc::new(Mutex::new());

    let (worker, cv, m) = (rt.clone(), cond.clone(), mutex.clone());
    let signaled = rt
        .create(None, move || {
            worker.mutex_lock(&m)?;
            let waited = worker.cond_wait(&cv, &m);
            worker.mutex_unlock(&m)?;
            waited?;
            Ok(1)
        })
        .unwrap();
    wait_until(|| rt.cond_counters(&cond).unwrap().blocked == 1);

    // The signal holds the gate until `signaled` has left.
    rt.cond_signal(&cond).unwrap();

    let (worker, cv, m) = (rt.clone(), cond.clone(), mutex.clone());
    let late = rt
        .create(None, move || {
            worker.mutex_lock(&m)?;
            let waited = worker.cond_wait(&cv, &m);
            worker.mutex_unlock(&m)?;
            waited?;
            Ok(2)
        })
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    rt.cancel(late).unwrap();

    assert_eq!(rt.join(signaled).unwrap().value(), Some(1));
    assert!(matches!(rt.join(late).unwrap(), ExitStatus::Canceled));

    let (tx, rx) = mpsc::channel();
    let (worker, cv, m) = (rt.clone(), cond.clone(), mutex.clone());
    let fresh = rt
        .create(None, move || {
            worker.mutex_lock(&m)?;
            let deadline = SystemTime::now() + Duration::from_millis(50);
            let waited = worker.cond_timedwait(&cv, &m, deadline);
            worker.mutex_unlock(&m)?;
            let _ = tx.send(waited);
            Ok(0)
        })
        .unwrap();
    let waited = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("timed waiter never returned");
    assert_eq!(waited.unwrap_err(), Error::TimedOut);
    rt.join(fresh).unwrap();

    rt.cond_signal(&cond).unwrap();
    rt.cond_broadcast(&cond).unwrap();
    rt.cond_destroy(&cond).unwrap();
    rt.mutex_destroy(&mutex).unwrap();
}
