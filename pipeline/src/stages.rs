//! Fixed stage lists interpreted in order over an accumulator.

use anyhow::Result;
use tracing::{debug, info_span, warn};

/// Whether the sequence continues after a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// One named step. `run` reads what earlier stages accumulated and adds its
/// own contribution.
pub struct Stage<C, S> {
    pub name: &'static str,
    pub run: fn(&C, &mut S) -> Result<Flow>,
}

/// Run `stages` in order until one stops the sequence or fails.
///
/// The failing stage's name is returned alongside the error; the error
/// itself is passed through untouched.
pub fn run_stages<C, S>(
    ctx: &C,
    stages: &[Stage<C, S>],
    state: &mut S,
) -> Result<(), (&'static str, anyhow::Error)> {
    for stage in stages {
        let span = info_span!("stage", name = stage.name);
        let _enter = span.enter();
        debug!("stage started");
        match (stage.run)(ctx, state) {
            Ok(Flow::Continue) => debug!("stage finished"),
            Ok(Flow::Stop) => {
                debug!("sequence stopped");
                return Ok(());
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "stage failed");
                return Err((stage.name, err));
            }
        }
    }
    Ok(())
}

/// Borrow a field an earlier stage must have filled.
pub fn require<'a, T>(value: &'a Option<T>, what: &str) -> Result<&'a T> {
    value
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("{what} missing from run state"))
}
