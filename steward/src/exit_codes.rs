//! Stable exit codes for steward CLI commands.

/// Command succeeded; every item reached a terminal state cleanly.
pub const OK: i32 = 0;
/// Command failed: invalid config/store/key, unreachable feed, or
/// unreachable checkpoint store.
pub const INVALID: i32 = 1;
/// Run finished but one or more items failed or await recovery.
pub const ITEM_ERRORS: i32 = 2;
