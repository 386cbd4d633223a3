//! Runtime configuration.
//!
//! A [`RuntimeConfig`] is passed to [`crate::Runtime::init`]. Defaults follow
//! POSIX minimums. [`RuntimeConfig::from_env`] layers environment overrides on
//! top:
//! - `EMBPTHREAD_SPIN`: spinlock strategy, `auto` (default), `spin`, or `block`.
//!   `auto` spins on multi-core and blocks on a single core.
//! - `EMBPTHREAD_STACK_SIZE`: default thread stack size in bytes.

use std::sync::atomic::{AtomicU8, Ordering};

/// Default stack size for threads created without an explicit attribute.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest stack size accepted by thread attributes.
pub const PTHREAD_STACK_MIN: usize = 16 * 1024;

/// POSIX minimum number of TSD destructor passes at thread exit.
pub const PTHREAD_DESTRUCTOR_ITERATIONS: usize = 4;

/// POSIX minimum number of TSD keys per process.
pub const PTHREAD_KEYS_MAX: usize = 128;

/// Spinlock strategy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpinPolicy {
    /// Spin when more than one processor is available, otherwise block.
    #[default]
    Auto,
    /// Always busy-wait.
    AlwaysSpin,
    /// Always delegate to a blocking mutex.
    AlwaysBlock,
}

impl SpinPolicy {
    /// Parse from string (case-insensitive). Unknown values select `Auto`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "spin" | "always-spin" | "busy" => Self::AlwaysSpin,
            "block" | "mutex" | "always-block" => Self::AlwaysBlock,
            _ => Self::Auto,
        }
    }

    /// Whether a spinlock should use a nested mutex given the processor count.
    #[must_use]
    pub const fn uses_mutex(self, processors: usize) -> bool {
        match self {
            Self::Auto => processors <= 1,
            Self::AlwaysSpin => false,
            Self::AlwaysBlock => true,
        }
    }
}

// Atomic cache: 0=unresolved, 1=Auto, 2=AlwaysSpin, 3=AlwaysBlock.
static CACHED_SPIN: AtomicU8 = AtomicU8::new(0);

const SPIN_UNRESOLVED: u8 = 0;
const SPIN_AUTO: u8 = 1;
const SPIN_ALWAYS: u8 = 2;
const SPIN_BLOCK: u8 = 3;

fn spin_to_u8(policy: SpinPolicy) -> u8 {
    match policy {
        SpinPolicy::Auto => SPIN_AUTO,
        SpinPolicy::AlwaysSpin => SPIN_ALWAYS,
        SpinPolicy::AlwaysBlock => SPIN_BLOCK,
    }
}

fn u8_to_spin(v: u8) -> SpinPolicy {
    match v {
        SPIN_ALWAYS => SpinPolicy::AlwaysSpin,
        SPIN_BLOCK => SpinPolicy::AlwaysBlock,
        _ => SpinPolicy::Auto,
    }
}

/// Spin policy from `EMBPTHREAD_SPIN`, read once per process and cached.
#[must_use]
pub fn env_spin_policy() -> SpinPolicy {
    let cached = CACHED_SPIN.load(Ordering::Acquire);
    if cached != SPIN_UNRESOLVED {
        return u8_to_spin(cached);
    }
    let policy = std::env::var("EMBPTHREAD_SPIN")
        .map(|v| SpinPolicy::from_str_loose(&v))
        .unwrap_or_default();
    // Racing resolvers read the same environment; first store wins.
    let _ = CACHED_SPIN.compare_exchange(
        SPIN_UNRESOLVED,
        spin_to_u8(policy),
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    u8_to_spin(CACHED_SPIN.load(Ordering::Acquire))
}

/// Parameters fixed at [`crate::Runtime::init`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Stack size used when a thread attribute does not request one.
    pub default_stack_size: usize,
    /// Maximum TSD destructor passes run at thread exit.
    pub destructor_iterations: usize,
    /// Maximum simultaneously live TSD keys.
    pub keys_max: usize,
    /// Spinlock strategy.
    pub spin_policy: SpinPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_stack_size: DEFAULT_STACK_SIZE,
            destructor_iterations: PTHREAD_DESTRUCTOR_ITERATIONS,
            keys_max: PTHREAD_KEYS_MAX,
            spin_policy: SpinPolicy::Auto,
        }
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self {
            spin_policy: env_spin_policy(),
            ..Self::default()
        };
        if let Some(size) = std::env::var("EMBPTHREAD_STACK_SIZE")
            .ok()
            .and_then(|raw| parse_size(&raw))
        {
            config.default_stack_size = size.max(PTHREAD_STACK_MIN);
        }
        config
    }

    #[must_use]
    pub fn with_spin_policy(mut self, policy: SpinPolicy) -> Self {
        self.spin_policy = policy;
        self
    }

    #[must_use]
    pub fn with_keys_max(mut self, keys_max: usize) -> Self {
        self.keys_max = keys_max;
        self
    }

    #[must_use]
    pub fn with_destructor_iterations(mut self, iterations: usize) -> Self {
        self.destructor_iterations = iterations.max(1);
        self
    }
}

/// Parses decimal or `0x` hex sizes with an optional `k`/`m` suffix.
fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim().to_ascii_lowercase();
    let (digits, scale) = if let Some(stripped) = raw.strip_suffix('k') {
        (stripped, 1024)
    } else if let Some(stripped) = raw.strip_suffix('m') {
        (stripped, 1024 * 1024)
    } else {
        (raw.as_str(), 1)
    };
    let value = if let Some(hex) = digits.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<usize>().ok()?
    };
    value.checked_mul(scale)
}
