//! Quota engine constants.

/// Reserved quota group for system daemons. Its spec is fixed at startup and
/// cannot be overridden by remote updates.
pub const SYSTEM_QUOTA_NAME: &str = "system-quota";

/// Parent name used by top-level quota groups (no explicit parent).
pub const ROOT_QUOTA_NAME: &str = "root-quota";

/// Default period between two runtime recalculation passes, in seconds.
pub const DEFAULT_RECALCULATE_INTERVAL_SECS: u64 = 1;

/// Maximum length of a quota group name.
pub const MAX_QUOTA_NAME_LEN: usize = 63;
