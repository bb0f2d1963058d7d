//! Stable exit codes for the flowgate CLI.

/// Command succeeded.
pub const OK: i32 = 0;
/// Any error: invalid manifest, failed gate, failed verification, etc.
pub const ERROR: i32 = 1;
