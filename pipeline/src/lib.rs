//! Ticket-to-change pipeline with a human approval gate.
//!
//! A run fetches a ticket, scans the target repository, asks a reasoning
//! service for a proposal and an edit set, verifies the edits against the
//! repository's own tests, and waits for a reviewer. Approval applies,
//! commits, pushes and publishes the change; rejection records feedback.
//!
//! - **[`core`]**: Pure logic (run state machine, response interpretation,
//!   unit-test gate, coverage parsing). No I/O.
//! - **[`io`]**: Side-effecting collaborators (git, trackers, the reasoning
//!   service, subprocesses, the verification engine).
//!
//! [`orchestrator`], [`start`], [`finalize`] and [`drafting`] sequence the
//! two together; [`service`] is the entry point used by the CLI and server.

pub mod core;
pub mod drafting;
pub mod exit_codes;
pub mod finalize;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod service;
pub mod stages;
pub mod start;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
