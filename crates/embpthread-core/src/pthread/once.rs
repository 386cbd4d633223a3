//! One-time initialization.
//!
//! The first caller to move the state from `INIT` to `STARTED` runs the
//! routine. Later callers register as users and sleep on a semaphore created
//! lazily by the first of them; the last user to leave discards it. A routine
//! that fails, unwinds or panics returns the state to `INIT` and wakes one
//! sleeper to retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use embpthread_osal::OsSemaphore;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::runtime::Runtime;

const INIT: u8 = 0;
const STARTED: u8 = 1;
const DONE: u8 = 2;

/// One-time initialization control. Statically initializable.
pub struct Once {
    state: AtomicU8,
    users: AtomicI32,
    sem: Mutex<Option<Arc<dyn OsSemaphore>>>,
}

impl Once {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(INIT),
            users: AtomicI32::new(0),
            sem: parking_lot::const_mutex(None),
        }
    }

    /// Whether the routine has completed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns an unfinished `Once` to `INIT` unless disarmed.
struct ResetOnFailure<'a> {
    once: &'a Once,
    armed: bool,
}

impl Drop for ResetOnFailure<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.once.state.store(INIT, Ordering::SeqCst);
        if let Some(sem) = self.once.sem.lock().as_ref() {
            let _ = sem.post(1);
        }
    }
}

impl Runtime {
    /// Run `routine` exactly once across all callers sharing `once`.
    ///
    /// Callers arriving while it runs block until it finishes. If it fails,
    /// its error is returned to its caller and a blocked caller retries.
    pub fn once<F>(&self, once: &Once, routine: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut routine = Some(routine);
        loop {
            match once
                .state
                .compare_exchange(INIT, STARTED, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    let run = routine.take().ok_or(Error::InvalidArgument)?;
                    return Self::run_once(once, run);
                }
                Err(DONE) => return Ok(()),
                Err(_) => self.wait_for_once(once)?,
            }
        }
    }

    fn run_once(once: &Once, routine: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut reset = ResetOnFailure { once, armed: true };
        routine()?;
        reset.armed = false;
        once.state.store(DONE, Ordering::SeqCst);
        if let Some(sem) = once.sem.lock().as_ref() {
            let users = once.users.load(Ordering::SeqCst);
            if users > 0 {
                let _ = sem.post(users.unsigned_abs());
            }
        }
        Ok(())
    }

    fn wait_for_once(&self, once: &Once) -> Result<()> {
        once.users.fetch_add(1, Ordering::SeqCst);
        let sem = {
            let mut held = once.sem.lock();
            match held.as_ref() {
                Some(sem) => Some(sem.clone()),
                None => match self.ctx.osal.semaphore_create(0) {
                    Ok(created) => {
                        let sem: Arc<dyn OsSemaphore> = Arc::from(created);
                        *held = Some(sem.clone());
                        Some(sem)
                    }
                    Err(err) => {
                        drop(held);
                        once.users.fetch_sub(1, Ordering::SeqCst);
                        return Err(err.into());
                    }
                },
            }
        };
        let waited = match sem {
            Some(sem) if once.state.load(Ordering::SeqCst) == STARTED => {
                sem.pend(None).map_err(Error::from)
            }
            _ => Ok(()),
        };
        if once.users.fetch_sub(1, Ordering::SeqCst) == 1 {
            once.sem.lock().take();
        }
        waited
    }
}
