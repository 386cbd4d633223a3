//! POSIX mutex operations.
//!
//! The lock word is `0` (free), `1` (locked, no waiters) or `-1` (locked,
//! possibly contended). Acquisition exchanges in `1`; on contention the
//! locker loops exchanging `-1` and pends on the mutex's OSAL semaphore until
//! an exchange observes `0`. Release exchanges in `0` and posts once when the
//! old value was negative. Error-checking and recursive mutexes add an owner
//! and a recursion count, written only by the owner.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::SystemTime;

use embpthread_osal::{OsError, OsSemaphore, Osal};

use crate::errno;
use crate::error::{Error, Result};
use crate::object::ObjectCell;
use crate::pthread::attr::MutexAttr;
use crate::runtime::Runtime;
use crate::time::relative_millis;

// ---------------------------------------------------------------------------
// Mutex kinds
// ---------------------------------------------------------------------------

pub const PTHREAD_MUTEX_NORMAL: i32 = 0;
pub const PTHREAD_MUTEX_RECURSIVE: i32 = 1;
pub const PTHREAD_MUTEX_ERRORCHECK: i32 = 2;
pub const PTHREAD_MUTEX_DEFAULT: i32 = PTHREAD_MUTEX_NORMAL;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutexKind {
    /// No ownership tracking; relocking by the holder deadlocks.
    #[default]
    Normal,
    /// The holder may relock; each lock needs a matching unlock.
    Recursive,
    /// Relocking by the holder reports `WouldDeadlock`.
    ErrorCheck,
}

impl MutexKind {
    /// Maps a `PTHREAD_MUTEX_*` constant.
    #[must_use]
    pub const fn from_raw(kind: i32) -> Option<Self> {
        match kind {
            PTHREAD_MUTEX_NORMAL => Some(Self::Normal),
            PTHREAD_MUTEX_RECURSIVE => Some(Self::Recursive),
            PTHREAD_MUTEX_ERRORCHECK => Some(Self::ErrorCheck),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Normal => PTHREAD_MUTEX_NORMAL,
            Self::Recursive => PTHREAD_MUTEX_RECURSIVE,
            Self::ErrorCheck => PTHREAD_MUTEX_ERRORCHECK,
        }
    }

    const fn tracks_owner(self) -> bool {
        !matches!(self, Self::Normal)
    }
}

/// Returns true if `kind` is a recognized mutex type.
#[must_use]
pub const fn valid_mutex_type(kind: i32) -> bool {
    MutexKind::from_raw(kind).is_some()
}

// ---------------------------------------------------------------------------
// Semantics contract
// ---------------------------------------------------------------------------

/// Abstract mutex state for the transition contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexContractState {
    /// Declared with a static initializer, not used yet.
    StaticInitialized,
    Unlocked,
    LockedBySelf,
    LockedByOther,
    /// Must be re-initialized before reuse.
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexContractOp {
    Init,
    Lock,
    TryLock,
    Unlock,
    Destroy,
}

/// Result of applying one operation to one abstract state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexContractOutcome {
    pub next: MutexContractState,
    /// errno-style result, `0` on success.
    pub errno: i32,
    /// The operation waits for another thread to make progress.
    pub blocks: bool,
}

const fn outcome(next: MutexContractState, errno: i32, blocks: bool) -> MutexContractOutcome {
    MutexContractOutcome {
        next,
        errno,
        blocks,
    }
}

/// Expected behavior of each mutex operation from each state.
#[must_use]
pub const fn mutex_contract_transition(
    kind: MutexKind,
    state: MutexContractState,
    op: MutexContractOp,
) -> MutexContractOutcome {
    use MutexContractOp as Op;
    use MutexContractState as State;

    match state {
        State::StaticInitialized => match op {
            Op::Init => outcome(State::Unlocked, 0, false),
            Op::Lock | Op::TryLock => outcome(State::LockedBySelf, 0, false),
            Op::Unlock => outcome(State::StaticInitialized, errno::EINVAL, false),
            Op::Destroy => outcome(State::Destroyed, 0, false),
        },
        State::Destroyed => match op {
            Op::Init => outcome(State::Unlocked, 0, false),
            _ => outcome(State::Destroyed, errno::EINVAL, false),
        },
        State::Unlocked => match op {
            Op::Init => outcome(State::Unlocked, errno::EBUSY, false),
            Op::Lock | Op::TryLock => outcome(State::LockedBySelf, 0, false),
            Op::Unlock => outcome(State::Unlocked, errno::EPERM, false),
            Op::Destroy => outcome(State::Destroyed, 0, false),
        },
        State::LockedByOther => match op {
            Op::Init | Op::TryLock | Op::Destroy => {
                outcome(State::LockedByOther, errno::EBUSY, false)
            }
            Op::Lock => outcome(State::LockedByOther, 0, true),
            Op::Unlock => {
                if kind.tracks_owner() {
                    outcome(State::LockedByOther, errno::EPERM, false)
                } else {
                    outcome(State::Unlocked, 0, false)
                }
            }
        },
        State::LockedBySelf => match op {
            Op::Init | Op::Destroy => outcome(State::LockedBySelf, errno::EBUSY, false),
            Op::Unlock => outcome(State::Unlocked, 0, false),
            Op::TryLock => match kind {
                MutexKind::Recursive => outcome(State::LockedBySelf, 0, false),
                _ => outcome(State::LockedBySelf, errno::EBUSY, false),
            },
            Op::Lock => match kind {
                MutexKind::Recursive => outcome(State::LockedBySelf, 0, false),
                MutexKind::ErrorCheck => outcome(State::LockedBySelf, errno::EDEADLK, false),
                MutexKind::Normal => outcome(State::LockedBySelf, 0, true),
            },
        },
    }
}

// ---------------------------------------------------------------------------
// Raw mutex
// ---------------------------------------------------------------------------

const NO_OWNER: u64 = u64::MAX;

/// How an acquisition waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Blocking,
    Try,
    Until(SystemTime),
}

pub(crate) struct RawMutex {
    kind: MutexKind,
    word: AtomicI32,
    recursion: AtomicU32,
    owner: AtomicU64,
    handoff: Box<dyn OsSemaphore>,
}

impl RawMutex {
    pub(crate) fn new(osal: &dyn Osal, kind: MutexKind) -> Result<Self> {
        Ok(Self {
            kind,
            word: AtomicI32::new(0),
            recursion: AtomicU32::new(0),
            owner: AtomicU64::new(NO_OWNER),
            handoff: osal.semaphore_create(0)?,
        })
    }

    pub(crate) fn lock(&self, rt: &Runtime) -> Result<()> {
        self.acquire(rt, LockMode::Blocking)
    }

    pub(crate) fn try_lock(&self, rt: &Runtime) -> Result<()> {
        self.acquire(rt, LockMode::Try)
    }

    pub(crate) fn acquire(&self, rt: &Runtime, mode: LockMode) -> Result<()> {
        if mode == LockMode::Try {
            return self.acquire_now(rt);
        }
        if !self.kind.tracks_owner() {
            if self.word.swap(1, Ordering::AcqRel) != 0 {
                self.park(mode)?;
            }
            return Ok(());
        }

        let me = rt.self_id()?.to_bits();
        if self
            .word
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.take_ownership(me);
            return Ok(());
        }
        if self.owner.load(Ordering::Relaxed) == me {
            return match self.kind {
                MutexKind::Recursive => {
                    self.recursion.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                _ => Err(Error::WouldDeadlock),
            };
        }
        self.park(mode)?;
        self.take_ownership(me);
        Ok(())
    }

    fn acquire_now(&self, rt: &Runtime) -> Result<()> {
        let me = if self.kind.tracks_owner() {
            rt.self_id()?.to_bits()
        } else {
            NO_OWNER
        };
        if self
            .word
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            if self.kind.tracks_owner() {
                self.take_ownership(me);
            }
            return Ok(());
        }
        if self.kind == MutexKind::Recursive && self.owner.load(Ordering::Relaxed) == me {
            self.recursion.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        Err(Error::Busy)
    }

    fn take_ownership(&self, me: u64) {
        self.recursion.store(1, Ordering::Relaxed);
        self.owner.store(me, Ordering::Relaxed);
    }

    /// Mark the word contended and sleep until it is handed over.
    fn park(&self, mode: LockMode) -> Result<()> {
        while self.word.swap(-1, Ordering::AcqRel) != 0 {
            let timeout = match mode {
                LockMode::Until(deadline) => Some(relative_millis(deadline)),
                LockMode::Blocking | LockMode::Try => None,
            };
            match self.handoff.pend(timeout) {
                Ok(()) => {}
                Err(OsError::Timeout) => return Err(Error::TimedOut),
                Err(_) => return Err(Error::InvalidArgument),
            }
        }
        Ok(())
    }

    pub(crate) fn unlock(&self, rt: &Runtime) -> Result<()> {
        if !self.kind.tracks_owner() {
            return match self.word.swap(0, Ordering::AcqRel) {
                0 => Err(Error::NotPermitted),
                previous if previous < 0 => self.wake_one(),
                _ => Ok(()),
            };
        }

        let me = rt.self_id()?.to_bits();
        if self.owner.load(Ordering::Relaxed) != me {
            return Err(Error::NotPermitted);
        }
        if self.kind != MutexKind::Recursive || self.recursion.fetch_sub(1, Ordering::Relaxed) == 1
        {
            self.owner.store(NO_OWNER, Ordering::Relaxed);
            if self.word.swap(0, Ordering::AcqRel) < 0 {
                return self.wake_one();
            }
        }
        Ok(())
    }

    fn wake_one(&self) -> Result<()> {
        self.handoff.post(1).map_err(|_| Error::InvalidArgument)
    }

    /// Succeeds only when nobody holds the mutex, including the caller.
    pub(crate) fn check_destroyable(&self, rt: &Runtime) -> Result<()> {
        self.try_lock(rt)?;
        if self.kind == MutexKind::Recursive && self.recursion.load(Ordering::Relaxed) > 1 {
            self.recursion.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::Busy);
        }
        self.unlock(rt)
    }
}

// ---------------------------------------------------------------------------
// User-visible mutex
// ---------------------------------------------------------------------------

/// A mutex. [`Mutex::new`] and [`Mutex::new_static`] are static
/// initializers: the mutex is set up on first lock.
pub struct Mutex {
    pub(crate) cell: ObjectCell<RawMutex, MutexKind>,
}

impl Mutex {
    /// Statically initialized normal mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self::new_static(MutexKind::Normal)
    }

    #[must_use]
    pub const fn new_static(kind: MutexKind) -> Self {
        Self {
            cell: ObjectCell::with_static(kind),
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub(crate) fn resolve_mutex(&self, mutex: &Mutex) -> Result<Arc<RawMutex>> {
        mutex.cell.resolve(&self.ctx.guards.mutex, |kind| {
            Ok(Arc::new(RawMutex::new(self.ctx.osal.as_ref(), kind)?))
        })
    }

    /// Explicit initialization. `Busy` if `mutex` is already initialized.
    pub fn mutex_init(&self, mutex: &Mutex, attr: Option<&MutexAttr>) -> Result<()> {
        let attr = attr.copied().unwrap_or_default();
        attr.pshared().require_private()?;
        self.check_live()?;
        mutex
            .cell
            .install(|| Ok(Arc::new(RawMutex::new(self.ctx.osal.as_ref(), attr.kind())?)))
    }

    /// `Busy` while anyone, the caller included, holds the mutex.
    pub fn mutex_destroy(&self, mutex: &Mutex) -> Result<()> {
        mutex
            .cell
            .destroy(Some(&self.ctx.guards.mutex), |raw| raw.check_destroyable(self))
    }

    pub fn mutex_lock(&self, mutex: &Mutex) -> Result<()> {
        self.resolve_mutex(mutex)?.lock(self)
    }

    pub fn mutex_trylock(&self, mutex: &Mutex) -> Result<()> {
        self.resolve_mutex(mutex)?.try_lock(self)
    }

    /// `TimedOut` if the mutex could not be acquired by `deadline`.
    pub fn mutex_timedlock(&self, mutex: &Mutex, deadline: SystemTime) -> Result<()> {
        self.resolve_mutex(mutex)?
            .acquire(self, LockMode::Until(deadline))
    }

    /// `InvalidArgument` for a mutex never locked; `NotPermitted` when the
    /// caller does not hold it.
    pub fn mutex_unlock(&self, mutex: &Mutex) -> Result<()> {
        mutex.cell.ready()?.unlock(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeConfig;
    use embpthread_osal::HostOsal;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::init(Arc::new(HostOsal::new()), RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn mutex_type_constants() {
        assert_eq!(PTHREAD_MUTEX_DEFAULT, PTHREAD_MUTEX_NORMAL);
        assert!(valid_mutex_type(PTHREAD_MUTEX_ERRORCHECK));
        assert!(!valid_mutex_type(3));
        assert_eq!(MutexKind::from_raw(1), Some(MutexKind::Recursive));
        assert_eq!(MutexKind::Recursive.as_raw(), PTHREAD_MUTEX_RECURSIVE);
    }

    #[test]
    fn contract_normal_relock_blocks() {
        let outcome = mutex_contract_transition(
            MutexKind::Normal,
            MutexContractState::LockedBySelf,
            MutexContractOp::Lock,
        );
        assert_eq!(outcome.next, MutexContractState::LockedBySelf);
        assert_eq!(outcome.errno, 0);
        assert!(outcome.blocks);
    }

    #[test]
    fn contract_errorcheck_relock_is_edeadlk() {
        let outcome = mutex_contract_transition(
            MutexKind::ErrorCheck,
            MutexContractState::LockedBySelf,
            MutexContractOp::Lock,
        );
        assert_eq!(outcome.errno, errno::EDEADLK);
        assert!(!outcome.blocks);
    }

    #[test]
    fn static_mutex_initializes_on_first_lock() {
        let rt = runtime();
        static M: Mutex = Mutex::new_static(MutexKind::ErrorCheck);
        rt.mutex_lock(&M).unwrap();
        assert_eq!(rt.mutex_lock(&M).unwrap_err(), Error::WouldDeadlock);
        rt.mutex_unlock(&M).unwrap();
    }

    #[test]
    fn recursive_mutex_counts_locks() {
        let rt = runtime();
        let m = Mutex::new_static(MutexKind::Recursive);
        for _ in 0..3 {
            rt.mutex_lock(&m).unwrap();
        }
        rt.mutex_trylock(&m).unwrap();
        assert_eq!(rt.mutex_destroy(&m).unwrap_err(), Error::Busy);
        for _ in 0..4 {
            rt.mutex_unlock(&m).unwrap();
        }
        assert_eq!(rt.mutex_unlock(&m).unwrap_err(), Error::NotPermitted);
        rt.mutex_destroy(&m).unwrap();
    }

    #[test]
    fn unlock_of_unused_static_mutex_is_invalid() {
        let rt = runtime();
        let m = Mutex::new();
        assert_eq!(rt.mutex_unlock(&m).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn timedlock_times_out_while_held_elsewhere() {
        let rt = runtime();
        let m = Arc::new(Mutex::new());
        rt.mutex_lock(&m).unwrap();
        let worker = rt.clone();
        let contended = m.clone();
        let t = rt
            .create(None, move || {
                let deadline = SystemTime::now() + Duration::from_millis(20);
                match worker.mutex_timedlock(&contended, deadline) {
                    Err(Error::TimedOut) => Ok(1),
                    _ => Ok(0),
                }
            })
            .unwrap();
        assert_eq!(rt.join(t).unwrap().value(), Some(1));
        rt.mutex_unlock(&m).unwrap();
        rt.mutex_trylock(&m).unwrap();
        rt.mutex_unlock(&m).unwrap();
    }

    #[test]
    fn destroyed_mutex_rejects_use_until_reinit() {
        let rt = runtime();
        let m = Mutex::new();
        rt.mutex_init(&m, None).unwrap();
        assert_eq!(rt.mutex_init(&m, None).unwrap_err(), Error::Busy);
        rt.mutex_destroy(&m).unwrap();
        assert_eq!(rt.mutex_lock(&m).unwrap_err(), Error::InvalidArgument);
        rt.mutex_init(&m, Some(&MutexAttr::with_kind(MutexKind::Recursive)))
            .unwrap();
        rt.mutex_lock(&m).unwrap();
        rt.mutex_lock(&m).unwrap();
        rt.mutex_unlock(&m).unwrap();
        rt.mutex_unlock(&m).unwrap();
    }
}
