//! Stable exit codes for pipeline CLI commands.

/// Command succeeded (tests passed, gate passed).
pub const OK: i32 = 0;
/// Invalid input, configuration or any other error.
pub const INVALID: i32 = 1;
/// `verify` ran the tests and they failed.
pub const TESTS_FAILED: i32 = 2;
/// `gate` rejected the edit set.
pub const GATE_FAILED: i32 = 2;
/// `verify` found no test strategy or could not start the command.
pub const NOT_EXECUTED: i32 = 3;
