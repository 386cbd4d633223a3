use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use embpthread_core::{
    Barrier, Cond, Error, Mutex, MutexKind, Once, Pthread, RwLock, Runtime, RuntimeConfig,
};
use embpthread_osal::HostOsal;

fn runtime() -> Runtime {
    Runtime::init(Arc::new(HostOsal::new()), RuntimeConfig::default()).unwrap()
}

fn join_all(rt: &Runtime, threads: Vec<Pthread>) -> Vec<usize> {
    threads
        .into_iter()
        .map(|t| rt.join(t).unwrap().value().unwrap())
        .collect()
}

#[test]
fn mutex_serializes_read_modify_write() {
    let rt = runtime();
    let mutex = Arc::new(Mutex::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let threads = (0..4)
        .map(|_| {
            let (worker, m, c) = (rt.clone(), mutex.clone(), counter.clone());
            rt.create(None, move || {
                for _ in 0..1000 {
                    worker.mutex_lock(&m)?;
                    let seen = c.load(Ordering::Relaxed);
                    std::hint::spin_loop();
                    c.store(seen + 1, Ordering::Relaxed);
                    worker.mutex_unlock(&m)?;
                }
                Ok(0)
            })
            .unwrap()
        })
        .collect();
    join_all(&rt, threads);
    assert_eq!(counter.load(Ordering::Relaxed), 4000);
    rt.mutex_destroy(&mutex).unwrap();
}

#[test]
fn recursive_mutex_needs_matching_unlocks() {
    let rt = runtime();
    let mutex = Arc::new(Mutex::new_static(MutexKind::Recursive));
    rt.mutex_lock(&mutex).unwrap();
    rt.mutex_lock(&mutex).unwrap();
    rt.mutex_unlock(&mutex).unwrap();

    let (worker, m) = (rt.clone(), mutex.clone());
    let probe = rt
        .create(None, move || match worker.mutex_trylock(&m) {
            Err(Error::Busy) => Ok(1),
            other => other.map(|()| 0),
        })
        .unwrap();
    assert_eq!(rt.join(probe).unwrap().value(), Some(1));
    rt.mutex_unlock(&mutex).unwrap();
    rt.mutex_destroy(&mutex).unwrap();
}

#[test]
fn cond_hands_every_item_to_a_consumer() {
    const ITEMS: usize = 200;
    let rt = runtime();
    let mutex = Arc::new(Mutex::new());
    let cond = Arc::new(Cond::new());
    let queue = Arc::new(parking_lot::Mutex::new(Vec::<usize>::new()));
    let consumed = Arc::new(AtomicUsize::new(0));

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let (worker, m, cv, q, total) =
                (rt.clone(), mutex.clone(), cond.clone(), queue.clone(), consumed.clone());
            rt.create(None, move || {
                let mut mine = 0;
                worker.mutex_lock(&m)?;
                loop {
                    if let Some(item) = q.lock().pop() {
                        if item == usize::MAX {
                            break;
                        }
                        mine += 1;
                        total.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                    worker.cond_wait(&cv, &m)?;
                }
                worker.mutex_unlock(&m)?;
                Ok(mine)
            })
            .unwrap()
        })
        .collect();

    for item in 0..ITEMS {
        rt.mutex_lock(&mutex).unwrap();
        queue.lock().insert(0, item);
        rt.cond_signal(&cond).unwrap();
        rt.mutex_unlock(&mutex).unwrap();
    }
    rt.mutex_lock(&mutex).unwrap();
    queue.lock().splice(0..0, [usize::MAX; 3]);
    rt.cond_broadcast(&cond).unwrap();
    rt.mutex_unlock(&mutex).unwrap();

    let per_consumer = join_all(&rt, consumers);
    assert_eq!(per_consumer.iter().sum::<usize>(), ITEMS);
    assert_eq!(consumed.load(Ordering::SeqCst), ITEMS);
    rt.cond_destroy(&cond).unwrap();
}

#[test]
fn timechange_handler_wakes_timed_waiters() {
    let rt = runtime();
    let mutex = Arc::new(Mutex::new());
    let cond = Arc::new(Cond::new());
    let (worker, m, cv) = (rt.clone(), mutex.clone(), cond.clone());
    let waiter = rt
        .create(None, move || {
            worker.mutex_lock(&m)?;
            let deadline = SystemTime::now() + Duration::from_secs(60);
            let woke = worker.cond_timedwait(&cv, &m, deadline);
            worker.mutex_unlock(&m)?;
            woke.map(|()| 1)
        })
        .unwrap();
    while rt.cond_counters(&cond).unwrap().blocked == 0 {
        std::thread::yield_now();
    }
    rt.timechange_handler_np().unwrap();
    assert_eq!(rt.join(waiter).unwrap().value(), Some(1));
}

#[test]
fn rwlock_writers_never_overlap_readers() {
    let rt = runtime();
    let lock = Arc::new(RwLock::new());
    let readers_inside = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));

    let threads = (0..6)
        .map(|i| {
            let (worker, l, inside, bad) =
                (rt.clone(), lock.clone(), readers_inside.clone(), violations.clone());
            rt.create(None, move || {
                for _ in 0..100 {
                    if i % 3 == 0 {
                        worker.rwlock_wrlock(&l)?;
                        if inside.load(Ordering::SeqCst) != 0 {
                            bad.fetch_add(1, Ordering::SeqCst);
                        }
                        worker.rwlock_unlock(&l)?;
                    } else {
                        worker.rwlock_rdlock(&l)?;
                        inside.fetch_add(1, Ordering::SeqCst);
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        worker.rwlock_unlock(&l)?;
                    }
                }
                Ok(0)
            })
            .unwrap()
        })
        .collect();
    join_all(&rt, threads);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    rt.rwlock_destroy(&lock).unwrap();
}

#[test]
fn barrier_elects_one_serial_thread_per_generation() {
    const PARTIES: usize = 4;
    const ROUNDS: usize = 25;
    let rt = runtime();
    let barrier = Arc::new(Barrier::new());
    rt.barrier_init(&barrier, None, PARTIES as u32).unwrap();
    let threads = (0..PARTIES)
        .map(|_| {
            let (worker, b) = (rt.clone(), barrier.clone());
            rt.create(None, move || {
                let mut serial = 0;
                for _ in 0..ROUNDS {
                    if worker.barrier_wait(&b)?.is_serial() {
                        serial += 1;
                    }
                }
                Ok(serial)
            })
            .unwrap()
        })
        .collect();
    let serial = join_all(&rt, threads);
    assert_eq!(serial.iter().sum::<usize>(), ROUNDS);
    rt.barrier_destroy(&barrier).unwrap();
}

#[test]
fn once_runs_a_single_routine_under_contention() {
    static INIT: Once = Once::new();
    let rt = runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let threads = (0..8)
        .map(|_| {
            let (worker, r) = (rt.clone(), runs.clone());
            rt.create(None, move || {
                worker.once(&INIT, || {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })?;
                Ok(r.load(Ordering::SeqCst))
            })
            .unwrap()
        })
        .collect();
    assert!(join_all(&rt, threads).into_iter().all(|seen| seen == 1));
    assert!(INIT.is_done());
}

#[test]
fn timed_operations_report_timeouts() {
    let rt = runtime();
    let lock = Arc::new(RwLock::new());
    rt.rwlock_wrlock(&lock).unwrap();
    let (worker, l) = (rt.clone(), lock.clone());
    let t = rt
        .create(None, move || {
            let deadline = SystemTime::now() + Duration::from_millis(20);
            match worker.rwlock_timedrdlock(&l, deadline) {
                Err(Error::TimedOut) => Ok(1),
                other => other.map(|()| 0),
            }
        })
        .unwrap();
    assert_eq!(rt.join(t).unwrap().value(), Some(1));
    rt.rwlock_unlock(&lock).unwrap();
}
