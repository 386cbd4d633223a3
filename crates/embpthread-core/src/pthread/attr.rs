//! Attribute objects for threads and synchronization objects.
//!
//! Only process-private objects exist; requesting `ProcessShared::Shared`
//! reports [`Error::NotSupported`].

use crate::config::PTHREAD_STACK_MIN;
use crate::error::{Error, Result};
use crate::pthread::mutex::MutexKind;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetachState {
    #[default]
    Joinable,
    Detached,
}

/// Scheduling policy. Only [`SchedPolicy::Other`] is supported.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedPolicy {
    #[default]
    Other,
    Fifo,
    RoundRobin,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchedParam {
    pub priority: i32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InheritSched {
    /// Take the creating thread's priority.
    #[default]
    Inherit,
    /// Use the attribute's [`SchedParam`].
    Explicit,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentionScope {
    #[default]
    System,
    Process,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessShared {
    #[default]
    Private,
    Shared,
}

impl ProcessShared {
    pub(crate) const fn require_private(self) -> Result<()> {
        match self {
            Self::Private => Ok(()),
            Self::Shared => Err(Error::NotSupported),
        }
    }
}

/// Thread creation attributes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ThreadAttr {
    detach_state: DetachState,
    stack_size: usize,
    sched_param: SchedParam,
    sched_policy: SchedPolicy,
    inherit_sched: InheritSched,
    scope: ContentionScope,
}

impl ThreadAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_detach_state(&mut self, state: DetachState) -> &mut Self {
        self.detach_state = state;
        self
    }

    #[must_use]
    pub const fn detach_state(&self) -> DetachState {
        self.detach_state
    }

    /// Requested stack size; values below [`PTHREAD_STACK_MIN`] are rejected.
    pub fn set_stack_size(&mut self, size: usize) -> Result<&mut Self> {
        if size < PTHREAD_STACK_MIN {
            return Err(Error::InvalidArgument);
        }
        self.stack_size = size;
        Ok(self)
    }

    /// `0` means the runtime default.
    #[must_use]
    pub const fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Caller-provided stacks are not supported.
    pub fn set_stack_addr(&mut self, _addr: usize) -> Result<&mut Self> {
        Err(Error::NotSupported)
    }

    /// The priority is validated against the OS range at thread creation.
    pub fn set_sched_param(&mut self, param: SchedParam) -> &mut Self {
        self.sched_param = param;
        self
    }

    #[must_use]
    pub const fn sched_param(&self) -> SchedParam {
        self.sched_param
    }

    pub fn set_sched_policy(&mut self, policy: SchedPolicy) -> Result<&mut Self> {
        if policy != SchedPolicy::Other {
            return Err(Error::NotSupported);
        }
        self.sched_policy = policy;
        Ok(self)
    }

    #[must_use]
    pub const fn sched_policy(&self) -> SchedPolicy {
        self.sched_policy
    }

    pub fn set_inherit_sched(&mut self, inherit: InheritSched) -> &mut Self {
        self.inherit_sched = inherit;
        self
    }

    #[must_use]
    pub const fn inherit_sched(&self) -> InheritSched {
        self.inherit_sched
    }

    /// Only system contention scope exists.
    pub fn set_scope(&mut self, scope: ContentionScope) -> Result<&mut Self> {
        if scope != ContentionScope::System {
            return Err(Error::NotSupported);
        }
        self.scope = scope;
        Ok(self)
    }

    #[must_use]
    pub const fn scope(&self) -> ContentionScope {
        self.scope
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MutexAttr {
    kind: MutexKind,
    pshared: ProcessShared,
}

impl MutexAttr {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kind: MutexKind::Normal,
            pshared: ProcessShared::Private,
        }
    }

    #[must_use]
    pub const fn with_kind(kind: MutexKind) -> Self {
        Self {
            kind,
            pshared: ProcessShared::Private,
        }
    }

    pub fn set_kind(&mut self, kind: MutexKind) -> &mut Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub const fn kind(&self) -> MutexKind {
        self.kind
    }

    pub fn set_pshared(&mut self, pshared: ProcessShared) -> Result<&mut Self> {
        pshared.require_private()?;
        self.pshared = pshared;
        Ok(self)
    }

    #[must_use]
    pub const fn pshared(&self) -> ProcessShared {
        self.pshared
    }
}

macro_rules! pshared_attr {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pshared: ProcessShared,
        }

        impl $name {
            #[must_use]
            pub const fn new() -> Self {
                Self {
                    pshared: ProcessShared::Private,
                }
            }

            pub fn set_pshared(&mut self, pshared: ProcessShared) -> Result<&mut Self> {
                pshared.require_private()?;
                self.pshared = pshared;
                Ok(self)
            }

            #[must_use]
            pub const fn pshared(&self) -> ProcessShared {
                self.pshared
            }
        }
    };
}

pshared_attr!(
    /// Condition variable attributes.
    CondAttr
);
pshared_attr!(
    /// Read-write lock attributes.
    RwLockAttr
);
pshared_attr!(
    /// Barrier attributes.
    BarrierAttr
);
