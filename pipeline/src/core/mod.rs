//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod coverage;
pub mod errors;
pub mod response;
pub mod run;
pub mod schema;
pub mod types;
pub mod unit_test_gate;
