//! Stress scenarios.
//!
//! Each [`Scenario`] drives one family of primitives through a [`Runtime`]
//! from many threads and checks a property that must hold for every
//! interleaving. A scenario either returns [`ScenarioStats`] or explains the
//! violation it observed.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use embpthread_core::{
    Barrier, Cond, Error, ExitStatus, Mutex, MutexKind, Once, ProcessShared, Pthread, RwLock,
    Runtime, Semaphore, SpinLock,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a scenario did not pass.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// A primitive returned an error the scenario did not expect.
    #[error("unexpected runtime error: {0}")]
    Runtime(#[from] Error),
    /// The property under test was observed not to hold.
    #[error("property violated: {message}")]
    Violation {
        message: String,
        details: serde_json::Value,
    },
}

impl ScenarioError {
    fn violation(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::Violation {
            message: message.into(),
            details,
        }
    }
}

/// Load shape shared by every scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioParams {
    /// Worker threads (or barrier parties, or waiters).
    pub threads: usize,
    /// Per-thread iterations, or rounds for round-based scenarios.
    pub iterations: usize,
    /// Seed for scenarios that randomize timing.
    pub seed: u64,
}

impl Default for ScenarioParams {
    fn default() -> Self {
        Self {
            threads: 4,
            iterations: 1_000,
            seed: 0x5eed,
        }
    }
}

/// What a passing scenario measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioStats {
    pub operations: u64,
    pub details: serde_json::Value,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    MutexExclusion,
    RecursiveMutex,
    SpinExclusion,
    CondBroadcast,
    CondTimeout,
    HandleReuse,
    #[value(name = "rwlock-exclusion")]
    #[serde(rename = "rwlock-exclusion")]
    RwLockExclusion,
    BarrierRendezvous,
    TsdDestructors,
    OnceContention,
    EndToEnd,
}

impl Scenario {
    pub const ALL: [Self; 11] = [
        Self::MutexExclusion,
        Self::RecursiveMutex,
        Self::SpinExclusion,
        Self::CondBroadcast,
        Self::CondTimeout,
        Self::HandleReuse,
        Self::RwLockExclusion,
        Self::BarrierRendezvous,
        Self::TsdDestructors,
        Self::OnceContention,
        Self::EndToEnd,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MutexExclusion => "mutex-exclusion",
            Self::RecursiveMutex => "recursive-mutex",
            Self::SpinExclusion => "spin-exclusion",
            Self::CondBroadcast => "cond-broadcast",
            Self::CondTimeout => "cond-timeout",
            Self::HandleReuse => "handle-reuse",
            Self::RwLockExclusion => "rwlock-exclusion",
            Self::BarrierRendezvous => "barrier-rendezvous",
            Self::TsdDestructors => "tsd-destructors",
            Self::OnceContention => "once-contention",
            Self::EndToEnd => "end-to-end",
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::MutexExclusion => "N threads increment a shared counter under a mutex",
            Self::RecursiveMutex => "a recursive mutex stays held until every lock is unlocked",
            Self::SpinExclusion => "N threads increment a shared counter under a spin lock",
            Self::CondBroadcast => "every broadcast round wakes every waiter",
            Self::CondTimeout => "timed waits racing signals keep the waiter counts consistent",
            Self::HandleReuse => "recycled thread slots never repeat a handle",
            Self::RwLockExclusion => "writers never overlap readers or each other",
            Self::BarrierRendezvous => "nobody leaves a barrier early; one serial thread per round",
            Self::TsdDestructors => "each thread's destructor sees its own value exactly once",
            Self::OnceContention => "racing initializers run the routine exactly once",
            Self::EndToEnd => "two waiters and a broadcaster hand off a mutex-guarded flag",
        }
    }

    /// Parse a scenario name as printed by [`Scenario::name`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    pub fn run(self, rt: &Runtime, params: &ScenarioParams) -> Result<ScenarioStats, ScenarioError> {
        let params = ScenarioParams {
            threads: params.threads.max(1),
            iterations: params.iterations.max(1),
            seed: params.seed,
        };
        match self {
            Self::MutexExclusion => mutex_exclusion(rt, &params),
            Self::RecursiveMutex => recursive_mutex(rt, &params),
            Self::SpinExclusion => spin_exclusion(rt, &params),
            Self::CondBroadcast => cond_broadcast(rt, &params),
            Self::CondTimeout => cond_timeout(rt, &params),
            Self::HandleReuse => handle_reuse(rt, &params),
            Self::RwLockExclusion => rwlock_exclusion(rt, &params),
            Self::BarrierRendezvous => barrier_rendezvous(rt, &params),
            Self::TsdDestructors => tsd_destructors(rt, &params),
            Self::OnceContention => once_contention(rt, &params),
            Self::EndToEnd => end_to_end(rt, &params),
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// xorshift64; timing jitter only, not statistics.
struct Jitter(u64);

impl Jitter {
    fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    fn below(&mut self, bound: u64) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x % bound.max(1)
    }
}

fn spawn_workers<F>(
    rt: &Runtime,
    count: usize,
    mut make: impl FnMut(usize) -> F,
) -> Result<Vec<Pthread>, ScenarioError>
where
    F: FnOnce() -> embpthread_core::Result<usize> + Send + 'static,
{
    let mut threads = Vec::with_capacity(count);
    for i in 0..count {
        threads.push(rt.create(None, make(i))?);
    }
    Ok(threads)
}

fn join_workers(rt: &Runtime, threads: Vec<Pthread>) -> Result<Vec<usize>, ScenarioError> {
    threads
        .into_iter()
        .map(|thread| match rt.join(thread)? {
            ExitStatus::Value(value) => Ok(value),
            ExitStatus::Failed(err) => Err(ScenarioError::Runtime(err)),
            ExitStatus::Canceled => Err(ScenarioError::violation(
                "worker was canceled",
                serde_json::json!({ "thread": thread.index() }),
            )),
        })
        .collect()
}

fn expect_eq(what: &str, expected: u64, observed: u64) -> Result<(), ScenarioError> {
    if expected == observed {
        Ok(())
    } else {
        Err(ScenarioError::violation(
            format!("{what}: expected {expected}, observed {observed}"),
            serde_json::json!({ "expected": expected, "observed": observed }),
        ))
    }
}

fn as_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Tracks how many threads are inside a critical section at once.
#[derive(Default)]
struct Occupancy {
    inside: AtomicUsize,
    overlaps: AtomicUsize,
}

impl Occupancy {
    fn enter(&self) {
        if self.inside.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leave(&self) {
        self.inside.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Mutual exclusion
// ---------------------------------------------------------------------------

fn counter_under_lock<L, U>(
    rt: &Runtime,
    params: &ScenarioParams,
    lock: L,
    unlock: U,
) -> Result<ScenarioStats, ScenarioError>
where
    L: Fn(&Runtime) -> embpthread_core::Result<()> + Send + Sync + 'static,
    U: Fn(&Runtime) -> embpthread_core::Result<()> + Send + Sync + 'static,
{
    let counter = Arc::new(AtomicU64::new(0));
    let occupancy = Arc::new(Occupancy::default());
    let lock = Arc::new(lock);
    let unlock = Arc::new(unlock);
    let iterations = params.iterations;

    let threads = spawn_workers(rt, params.threads, |_| {
        let (worker, counter, occupancy) = (rt.clone(), counter.clone(), occupancy.clone());
        let (lock, unlock) = (lock.clone(), unlock.clone());
        move || {
            for _ in 0..iterations {
                lock(&worker)?;
                occupancy.enter();
                let seen = counter.load(Ordering::Relaxed);
                std::hint::spin_loop();
                counter.store(seen + 1, Ordering::Relaxed);
                occupancy.leave();
                unlock(&worker)?;
            }
            Ok(0)
        }
    })?;
    join_workers(rt, threads)?;

    let expected = as_u64(params.threads * params.iterations);
    let overlaps = occupancy.overlaps.load(Ordering::SeqCst);
    expect_eq("overlapping holders", 0, as_u64(overlaps))?;
    expect_eq("counter", expected, counter.load(Ordering::Relaxed))?;
    Ok(ScenarioStats {
        operations: expected,
        details: serde_json::json!({ "counter": expected }),
    })
}

fn mutex_exclusion(rt: &Runtime, params: &ScenarioParams) -> Result<ScenarioStats, ScenarioError> {
    let mutex = Arc::new(Mutex::new());
    rt.mutex_init(&mutex, None)?;
    let (m_lock, m_unlock) = (mutex.clone(), mutex.clone());
    let stats = counter_under_lock(
        rt,
        params,
        move |rt| rt.mutex_lock(&m_lock),
        move |rt| rt.mutex_unlock(&m_unlock),
    )?;
    rt.mutex_destroy(&mutex)?;
    Ok(stats)
}

fn spin_exclusion(rt: &Runtime, params: &ScenarioParams) -> Result<ScenarioStats, ScenarioError> {
    let spin = Arc::new(SpinLock::new());
    rt.spin_init(&spin, ProcessShared::Private)?;
    let uses_mutex = rt.spin_uses_mutex(&spin)?;
    let (s_lock, s_unlock) = (spin.clone(), spin.clone());
    let mut stats = counter_under_lock(
        rt,
        params,
        move |rt| rt.spin_lock(&s_lock),
        move |rt| rt.spin_unlock(&s_unlock),
    )?;
    rt.spin_destroy(&spin)?;
    stats.details["uses_mutex"] = serde_json::Value::Bool(uses_mutex);
    Ok(stats)
}

/// Whether another thread can take `mutex` right now.
fn probe_trylock(rt: &Runtime, mutex: &Arc<Mutex>) -> Result<bool, ScenarioError> {
    let (worker, m) = (rt.clone(), mutex.clone());
    let probe = rt.create(None, move || match worker.mutex_trylock(&m) {
        Ok(()) => worker.mutex_unlock(&m).map(|()| 1),
        Err(Error::Busy) => Ok(0),
        Err(err) => Err(err),
    })?;
    Ok(join_workers(rt, vec![probe])?[0] == 1)
}

fn recursive_mutex(rt: &Runtime, params: &ScenarioParams) -> Result<ScenarioStats, ScenarioError> {
    let rounds = params.iterations.clamp(1, 100);
    let mutex = Arc::new(Mutex::new_static(MutexKind::Recursive));
    let mut operations = 0;

    for round in 0..rounds {
        let depth = 2 + round % 7;
        for _ in 0..depth {
            rt.mutex_lock(&mutex)?;
        }
        for released in 0..depth {
            if probe_trylock(rt, &mutex)? {
                return Err(ScenarioError::violation(
                    "recursive mutex acquired by another thread while still held",
                    serde_json::json!({ "round": round, "depth": depth, "released": released }),
                ));
            }
            rt.mutex_unlock(&mutex)?;
        }
        if !probe_trylock(rt, &mutex)? {
            return Err(ScenarioError::violation(
                "recursive mutex still held after matching unlocks",
                serde_json::json!({ "round": round, "depth": depth }),
            ));
        }
        operations += as_u64(depth);
    }

    // Error-checking flavor reports misuse instead of deadlocking.
    let checked = Arc::new(Mutex::new_static(MutexKind::ErrorCheck));
    rt.mutex_lock(&checked)?;
    let relock = rt.mutex_lock(&checked);
    let (worker, m) = (rt.clone(), checked.clone());
    let foreign = rt.create(None, move || match worker.mutex_unlock(&m) {
        Err(Error::NotPermitted) => Ok(1),
        other => other.map(|()| 0),
    })?;
    let foreign_refused = join_workers(rt, vec![foreign])?[0] == 1;
    rt.mutex_unlock(&checked)?;
    if relock != Err(Error::WouldDeadlock) || !foreign_refused {
        return Err(ScenarioError::violation(
            "error-checking mutex accepted misuse",
            serde_json::json!({
                "relock": format!("{relock:?}"),
                "foreign_unlock_refused": foreign_refused,
            }),
        ));
    }
    rt.mutex_destroy(&mutex)?;
    rt.mutex_destroy(&checked)?;

    Ok(ScenarioStats {
        operations,
        details: serde_json::json!({ "rounds": rounds }),
    })
}

// ---------------------------------------------------------------------------
// Condition variables
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RoundState {
    generation: AtomicUsize,
    ready: AtomicUsize,
    woke: AtomicUsize,
}

fn cond_broadcast(rt: &Runtime, params: &ScenarioParams) -> Result<ScenarioStats, ScenarioError> {
    let rounds = params.iterations;
    let waiters = params.threads;
    let mutex = Arc::new(Mutex::new());
    let cond = Arc::new(Cond::new());
    rt.cond_init(&cond, None)?;
    let state = Arc::new(RoundState::default());

    let threads = spawn_workers(rt, waiters, |_| {
        let (worker, m, cv, st) = (rt.clone(), mutex.clone(), cond.clone(), state.clone());
        move || {
            for _ in 0..rounds {
                worker.mutex_lock(&m)?;
                st.ready.fetch_add(1, Ordering::Relaxed);
                let generation = st.generation.load(Ordering::Relaxed);
                while st.generation.load(Ordering::Relaxed) == generation {
                    worker.cond_wait(&cv, &m)?;
                }
                st.woke.fetch_add(1, Ordering::Relaxed);
                worker.mutex_unlock(&m)?;
            }
            Ok(0)
        }
    })?;

    for _ in 0..rounds {
        loop {
            rt.mutex_lock(&mutex)?;
            if state.ready.load(Ordering::Relaxed) == waiters {
                state.ready.store(0, Ordering::Relaxed);
                state.generation.fetch_add(1, Ordering::Relaxed);
                rt.cond_broadcast(&cond)?;
                rt.mutex_unlock(&mutex)?;
                break;
            }
            rt.mutex_unlock(&mutex)?;
            std::thread::yield_now();
        }
    }
    join_workers(rt, threads)?;

    let expected = as_u64(rounds * waiters);
    expect_eq("wakeups", expected, as_u64(state.woke.load(Ordering::Relaxed)))?;
    rt.cond_destroy(&cond)?;
    Ok(ScenarioStats {
        operations: expected,
        details: serde_json::json!({ "rounds": rounds, "waiters": waiters }),
    })
}

fn cond_timeout(rt: &Runtime, params: &ScenarioParams) -> Result<ScenarioStats, ScenarioError> {
    let mutex = Arc::new(Mutex::new_static(MutexKind::ErrorCheck));
    let cond = Arc::new(Cond::new());
    rt.cond_init(&cond, None)?;
    let stop = Arc::new(AtomicBool::new(false));

    let signaler = {
        let (worker, cv, stop) = (rt.clone(), cond.clone(), stop.clone());
        let mut jitter = Jitter::new(params.seed.rotate_left(17));
        rt.create(None, move || {
            let mut signals = 0;
            while !stop.load(Ordering::Relaxed) {
                worker.cond_signal(&cv)?;
                signals += 1;
                if jitter.below(4) == 0 {
                    worker.delay_np(Duration::from_millis(1))?;
                } else {
                    std::thread::yield_now();
                }
            }
            Ok(signals)
        })?
    };

    let mut jitter = Jitter::new(params.seed);
    let (mut signaled, mut timed_out) = (0u64, 0u64);
    let outcome = (|| -> Result<(), ScenarioError> {
        for iteration in 0..params.iterations {
            rt.mutex_lock(&mutex)?;
            let deadline = SystemTime::now() + Duration::from_micros(jitter.below(1_500));
            match rt.cond_timedwait(&cond, &mutex, deadline) {
                Ok(()) => signaled += 1,
                Err(Error::TimedOut) => timed_out += 1,
                Err(err) => return Err(err.into()),
            }
            let relock = rt.mutex_lock(&mutex);
            let counters = rt.cond_counters(&cond)?;
            rt.mutex_unlock(&mutex)?;
            if relock != Err(Error::WouldDeadlock) {
                return Err(ScenarioError::violation(
                    "wait returned without the mutex held",
                    serde_json::json!({ "iteration": iteration, "relock": format!("{relock:?}") }),
                ));
            }
            if counters.blocked < counters.gone || counters.to_unblock < 0 {
                return Err(ScenarioError::violation(
                    "waiter accounting went inconsistent",
                    serde_json::json!({
                        "iteration": iteration,
                        "blocked": counters.blocked,
                        "gone": counters.gone,
                        "to_unblock": counters.to_unblock,
                    }),
                ));
            }
        }
        Ok(())
    })();
    stop.store(true, Ordering::Relaxed);
    let signals = join_workers(rt, vec![signaler])?[0];
    outcome?;

    rt.cond_destroy(&cond)?;
    rt.mutex_destroy(&mutex)?;
    Ok(ScenarioStats {
        operations: as_u64(params.iterations),
        details: serde_json::json!({
            "signaled": signaled,
            "timed_out": timed_out,
            "signals_sent": signals,
        }),
    })
}

// ---------------------------------------------------------------------------
// Thread lifecycle
// ---------------------------------------------------------------------------

fn handle_reuse(rt: &Runtime, params: &ScenarioParams) -> Result<ScenarioStats, ScenarioError> {
    let mut seen = HashSet::with_capacity(params.iterations);
    let mut indices = HashSet::new();
    let mut first = None;

    for i in 0..params.iterations {
        let thread = rt.create(None, move || Ok(i))?;
        let value = join_workers(rt, vec![thread])?[0];
        expect_eq("exit value", as_u64(i), as_u64(value))?;
        if !seen.insert((thread.index(), thread.generation())) {
            return Err(ScenarioError::violation(
                "thread handle repeated after reuse",
                serde_json::json!({ "index": thread.index(), "generation": thread.generation() }),
            ));
        }
        indices.insert(thread.index());
        first.get_or_insert(thread);
    }

    if let Some(first) = first
        && params.iterations > 1
        && rt.join(first) != Err(Error::NotFound)
    {
        return Err(ScenarioError::violation(
            "stale handle still resolves",
            serde_json::json!({ "index": first.index(), "generation": first.generation() }),
        ));
    }

    Ok(ScenarioStats {
        operations: as_u64(params.iterations),
        details: serde_json::json!({
            "distinct_slots": indices.len(),
            "pooled": rt.pooled_threads(),
        }),
    })
}

// ---------------------------------------------------------------------------
// Read-write locks and barriers
// ---------------------------------------------------------------------------

fn rwlock_exclusion(rt: &Runtime, params: &ScenarioParams) -> Result<ScenarioStats, ScenarioError> {
    let lock = Arc::new(RwLock::new());
    rt.rwlock_init(&lock, None)?;
    let readers = Arc::new(AtomicUsize::new(0));
    let writers = Arc::new(Occupancy::default());
    let violations = Arc::new(AtomicUsize::new(0));
    let peak_readers = Arc::new(AtomicUsize::new(0));
    let iterations = params.iterations;
    // One writer for every three threads, and always at least one.
    let threads = params.threads.max(2);

    let workers = spawn_workers(rt, threads, |i| {
        let (worker, l) = (rt.clone(), lock.clone());
        let (readers, writers, bad, peak) = (
            readers.clone(),
            writers.clone(),
            violations.clone(),
            peak_readers.clone(),
        );
        move || {
            for _ in 0..iterations {
                if i % 3 == 0 {
                    worker.rwlock_wrlock(&l)?;
                    writers.enter();
                    if readers.load(Ordering::SeqCst) != 0 {
                        bad.fetch_add(1, Ordering::SeqCst);
                    }
                    std::hint::spin_loop();
                    writers.leave();
                    worker.rwlock_unlock(&l)?;
                } else {
                    worker.rwlock_rdlock(&l)?;
                    let now = readers.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::Relaxed);
                    if writers.inside.load(Ordering::SeqCst) != 0 {
                        bad.fetch_add(1, Ordering::SeqCst);
                    }
                    readers.fetch_sub(1, Ordering::SeqCst);
                    worker.rwlock_unlock(&l)?;
                }
            }
            Ok(0)
        }
    })?;
    join_workers(rt, workers)?;

    expect_eq(
        "reader/writer overlaps",
        0,
        as_u64(violations.load(Ordering::SeqCst)),
    )?;
    expect_eq(
        "writer/writer overlaps",
        0,
        as_u64(writers.overlaps.load(Ordering::SeqCst)),
    )?;
    rt.rwlock_destroy(&lock)?;
    Ok(ScenarioStats {
        operations: as_u64(threads * iterations),
        details: serde_json::json!({ "peak_readers": peak_readers.load(Ordering::Relaxed) }),
    })
}

fn barrier_rendezvous(
    rt: &Runtime,
    params: &ScenarioParams,
) -> Result<ScenarioStats, ScenarioError> {
    let parties = params.threads;
    let rounds = params.iterations;
    let barrier = Arc::new(Barrier::new());
    rt.barrier_init(&barrier, None, u32::try_from(parties).map_err(|_| Error::InvalidArgument)?)?;
    let arrivals = Arc::new(AtomicUsize::new(0));
    let early = Arc::new(AtomicUsize::new(0));

    let threads = spawn_workers(rt, parties, |_| {
        let (worker, b, arrivals, early) =
            (rt.clone(), barrier.clone(), arrivals.clone(), early.clone());
        move || {
            let mut serial = 0;
            for round in 0..rounds {
                arrivals.fetch_add(1, Ordering::SeqCst);
                if worker.barrier_wait(&b)?.is_serial() {
                    serial += 1;
                }
                if arrivals.load(Ordering::SeqCst) < parties * (round + 1) {
                    early.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(serial)
        }
    })?;
    let serial: usize = join_workers(rt, threads)?.into_iter().sum();

    expect_eq("early departures", 0, as_u64(early.load(Ordering::SeqCst)))?;
    expect_eq("serial threads", as_u64(rounds), as_u64(serial))?;
    rt.barrier_destroy(&barrier)?;
    Ok(ScenarioStats {
        operations: as_u64(parties * rounds),
        details: serde_json::json!({ "parties": parties, "rounds": rounds }),
    })
}

// ---------------------------------------------------------------------------
// Thread-specific data and once
// ---------------------------------------------------------------------------

fn tsd_destructors(rt: &Runtime, params: &ScenarioParams) -> Result<ScenarioStats, ScenarioError> {
    let rounds = params.iterations.clamp(1, 200);
    let mut operations = 0;

    for round in 0..rounds {
        let calls = Arc::new(AtomicUsize::new(0));
        let sum = Arc::new(AtomicUsize::new(0));
        let (c, s) = (calls.clone(), sum.clone());
        let key = rt.key_create(Some(Arc::new(move |value: usize| {
            c.fetch_add(1, Ordering::SeqCst);
            s.fetch_add(value, Ordering::SeqCst);
        })))?;

        let threads = spawn_workers(rt, params.threads, |i| {
            let worker = rt.clone();
            move || {
                worker.set_specific(key, i + 1)?;
                Ok(worker.get_specific(key))
            }
        })?;
        let echoed = join_workers(rt, threads)?;
        let expected_sum = params.threads * (params.threads + 1) / 2;
        if echoed.iter().enumerate().any(|(i, v)| *v != i + 1) {
            return Err(ScenarioError::violation(
                "thread read back another thread's value",
                serde_json::json!({ "round": round, "echoed": echoed }),
            ));
        }
        expect_eq("destructor calls", as_u64(params.threads), as_u64(calls.load(Ordering::SeqCst)))?;
        expect_eq("destructor values", as_u64(expected_sum), as_u64(sum.load(Ordering::SeqCst)))?;
        rt.key_delete(key)?;
        operations += as_u64(params.threads);
    }

    // A key deleted while a thread still holds a value never runs its destructor.
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let key = rt.key_create(Some(Arc::new(move |_: usize| {
        c.fetch_add(1, Ordering::SeqCst);
    })))?;
    let gate = Arc::new(Semaphore::new());
    rt.sem_init(&gate, ProcessShared::Private, 0)?;
    let (worker, wait_on) = (rt.clone(), gate.clone());
    let holder = rt.create(None, move || {
        worker.set_specific(key, 1)?;
        worker.sem_wait(&wait_on).map(|()| 0)
    })?;
    while rt.sem_getvalue(&gate)? >= 0 {
        std::thread::yield_now();
    }
    rt.key_delete(key)?;
    rt.sem_post(&gate)?;
    join_workers(rt, vec![holder])?;
    expect_eq("destructor calls after delete", 0, as_u64(calls.load(Ordering::SeqCst)))?;
    rt.sem_destroy(&gate)?;

    Ok(ScenarioStats {
        operations,
        details: serde_json::json!({ "rounds": rounds, "live_keys": rt.live_keys() }),
    })
}

fn once_contention(rt: &Runtime, params: &ScenarioParams) -> Result<ScenarioStats, ScenarioError> {
    let rounds = params.iterations.clamp(1, 500);
    for round in 0..rounds {
        let once = Arc::new(Once::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let threads = spawn_workers(rt, params.threads, |_| {
            let (worker, once, runs) = (rt.clone(), once.clone(), runs.clone());
            move || {
                worker.once(&once, || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    std::thread::yield_now();
                    Ok(())
                })?;
                Ok(runs.load(Ordering::SeqCst))
            }
        })?;
        let seen = join_workers(rt, threads)?;
        if runs.load(Ordering::SeqCst) != 1 || seen.iter().any(|&n| n != 1) || !once.is_done() {
            return Err(ScenarioError::violation(
                "initializer did not run exactly once before callers returned",
                serde_json::json!({ "round": round, "runs": runs.load(Ordering::SeqCst), "seen": seen }),
            ));
        }
    }
    Ok(ScenarioStats {
        operations: as_u64(rounds * params.threads),
        details: serde_json::json!({ "rounds": rounds }),
    })
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

fn end_to_end(rt: &Runtime, params: &ScenarioParams) -> Result<ScenarioStats, ScenarioError> {
    let rounds = params.iterations.clamp(1, 200);
    let mutex = Arc::new(Mutex::new());
    rt.mutex_init(&mutex, None)?;

    for round in 0..rounds {
        let cond = Arc::new(Cond::new());
        rt.cond_init(&cond, None)?;
        let flag = Arc::new(AtomicBool::new(false));
        let occupancy = Arc::new(Occupancy::default());

        let waiters = spawn_workers(rt, 2, |_| {
            let (worker, m, cv, flag, occ) =
                (rt.clone(), mutex.clone(), cond.clone(), flag.clone(), occupancy.clone());
            move || {
                worker.mutex_lock(&m)?;
                occ.enter();
                while !flag.load(Ordering::Relaxed) {
                    occ.leave();
                    worker.cond_wait(&cv, &m)?;
                    occ.enter();
                }
                occ.leave();
                worker.mutex_unlock(&m)?;
                Ok(1)
            }
        })?;

        let broadcaster = {
            let (worker, m, cv, flag) = (rt.clone(), mutex.clone(), cond.clone(), flag.clone());
            rt.create(None, move || {
                while worker.cond_counters(&cv)?.blocked < 2 {
                    worker.delay_np(Duration::ZERO)?;
                }
                worker.mutex_lock(&m)?;
                flag.store(true, Ordering::Relaxed);
                worker.cond_broadcast(&cv)?;
                worker.mutex_unlock(&m)?;
                Ok(0)
            })?
        };

        let woke: usize = join_workers(rt, waiters)?.into_iter().sum();
        join_workers(rt, vec![broadcaster])?;
        expect_eq("waiters released", 2, as_u64(woke))?;
        if occupancy.overlaps.load(Ordering::SeqCst) != 0 {
            return Err(ScenarioError::violation(
                "two waiters held the mutex at once",
                serde_json::json!({ "round": round }),
            ));
        }
        rt.cond_destroy(&cond)?;
    }
    rt.mutex_destroy(&mutex)?;

    Ok(ScenarioStats {
        operations: as_u64(rounds * 3),
        details: serde_json::json!({ "rounds": rounds, "live_conds": rt.live_conds() }),
    })
}
