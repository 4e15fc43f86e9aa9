//! Which device user this process runs as.

/// Uids are partitioned into ranges of this size, one range per device user.
pub const PER_USER_RANGE: u32 = 100_000;

pub trait UserContext: Send + Sync {
    fn uid(&self) -> u32;

    fn user_id(&self) -> u32 {
        self.uid() / PER_USER_RANGE
    }

    /// Boot-time activation only runs for the primary device user.
    fn is_primary_user(&self) -> bool {
        self.user_id() == 0
    }
}

/// The real uid of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessUserContext;

impl UserContext for ProcessUserContext {
    #[cfg(unix)]
    fn uid(&self) -> u32 {
        unsafe { libc::getuid() }
    }

    #[cfg(not(unix))]
    fn uid(&self) -> u32 {
        0
    }
}

/// A fixed uid, for callers that already know which user they act for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedUserContext(pub u32);

impl UserContext for FixedUserContext {
    fn uid(&self) -> u32 {
        self.0
    }
}
