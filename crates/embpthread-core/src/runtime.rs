//! Process-wide context.
//!
//! [`Runtime::init`] allocates the self-lookup TLS slot, the reuse pool, the
//! TSD key registry, the condition-variable registry and the per-kind
//! static-initializer guards. [`Runtime::terminate`] releases the TLS slot and
//! drains the reuse pool.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use embpthread_osal::{Osal, TlsSlot};
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::oslock::OsLock;
use crate::pthread::cond::RawCond;
use crate::pthread::reuse::ThreadArena;
use crate::pthread::tls::KeyRegistry;

/// Handle to the threading runtime. Cloning is cheap and shares the context.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) ctx: Arc<Context>,
}

pub(crate) struct Context {
    pub(crate) osal: Arc<dyn Osal>,
    pub(crate) config: RuntimeConfig,
    pub(crate) processors: usize,
    pub(crate) threads: ThreadArena,
    /// Holds `index + 1` of the calling thread's slot, `0` when unregistered.
    pub(crate) self_slot: TlsSlot,
    pub(crate) keys: KeyRegistry,
    pub(crate) conds: OsLock<Vec<Arc<RawCond>>>,
    pub(crate) guards: InitGuards,
    live: AtomicBool,
}

/// Global locks serializing lazy initialization of static objects, one per kind.
pub(crate) struct InitGuards {
    pub(crate) mutex: OsLock<()>,
    pub(crate) cond: OsLock<()>,
    pub(crate) rwlock: OsLock<()>,
    pub(crate) spin: OsLock<()>,
}

impl InitGuards {
    fn new(osal: &dyn Osal) -> Result<Self> {
        Ok(Self {
            mutex: OsLock::new(osal, ())?,
            cond: OsLock::new(osal, ())?,
            rwlock: OsLock::new(osal, ())?,
            spin: OsLock::new(osal, ())?,
        })
    }
}

impl Runtime {
    /// Initialize the runtime on top of `osal`.
    pub fn init(osal: Arc<dyn Osal>, config: RuntimeConfig) -> Result<Self> {
        let self_slot = osal.tls_alloc().map_err(|_| Error::ResourceExhausted)?;
        let build = || -> Result<Context> {
            let os: &dyn Osal = osal.as_ref();
            Ok(Context {
                processors: os.processor_count().max(1),
                threads: ThreadArena::new(os)?,
                keys: KeyRegistry::new(),
                conds: OsLock::new(os, Vec::new())?,
                guards: InitGuards::new(os)?,
                self_slot,
                config: config.clone(),
                osal: osal.clone(),
                live: AtomicBool::new(true),
            })
        };
        match build() {
            Ok(ctx) => {
                debug!(
                    processors = ctx.processors,
                    spin_policy = ?ctx.config.spin_policy,
                    keys_max = ctx.config.keys_max,
                    "runtime initialized"
                );
                Ok(Self { ctx: Arc::new(ctx) })
            }
            Err(err) => {
                if osal.tls_free(self_slot).is_err() {
                    warn!("failed to release self-lookup TLS slot after init failure");
                }
                Err(err)
            }
        }
    }

    /// Release the self-lookup TLS slot and drain the reuse pool.
    ///
    /// Idempotent. Threads still running keep working with their existing
    /// handles, but no new threads, implicit handles, objects or keys can be
    /// created afterwards.
    pub fn terminate(&self) -> Result<()> {
        if !self.ctx.live.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let drained = self.ctx.threads.drain();
        if self.ctx.osal.tls_free(self.ctx.self_slot).is_err() {
            warn!("failed to release self-lookup TLS slot");
        }
        debug!(drained, "runtime terminated");
        Ok(())
    }

    /// False once [`Runtime::terminate`] ran.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.ctx.live.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.ctx.config
    }

    #[must_use]
    pub fn osal(&self) -> &Arc<dyn Osal> {
        &self.ctx.osal
    }

    /// Number of recycled thread handles waiting in the reuse pool.
    #[must_use]
    pub fn pooled_threads(&self) -> usize {
        self.ctx.threads.pooled()
    }

    pub(crate) fn check_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("live", &self.is_live())
            .field("processors", &self.ctx.processors)
            .field("config", &self.ctx.config)
            .finish_non_exhaustive()
    }
}
