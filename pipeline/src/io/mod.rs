//! Side-effecting collaborators: subprocesses, git, trackers, the reasoning
//! service, on-disk state and the verification engine.

pub mod config;
pub mod edits;
pub mod feedback;
pub mod git;
pub mod process;
pub mod prompt;
pub mod reasoner;
pub mod run_store;
pub mod scanner;
pub mod strategy;
pub mod tracker;
pub mod verification;
