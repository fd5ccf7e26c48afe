//! Reasoning-service abstraction.
//!
//! The [`Reasoner`] trait decouples the orchestrator from the actual backend
//! (by default a CLI such as `codex exec -`). Tests use scripted reasoners
//! that return predetermined text without spawning processes.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::errors::{TransportError, preview};
use crate::io::config::ReasonerConfig;
use crate::io::process::run_command_with_timeout;

const STDERR_PREVIEW: usize = 500;

pub trait Reasoner: Send + Sync {
    /// Free-form completion for `prompt`. `fast` selects the cheaper model.
    fn generate_text(&self, prompt: &str, fast: bool) -> Result<String>;
}

/// Reasoner that spawns the configured CLI with the prompt on stdin.
pub struct CommandReasoner {
    config: ReasonerConfig,
}

impl CommandReasoner {
    pub fn new(config: ReasonerConfig) -> Self {
        Self { config }
    }

    fn model(&self, fast: bool) -> Option<&str> {
        let model = if fast && !self.config.fast_model.trim().is_empty() {
            &self.config.fast_model
        } else {
            &self.config.model
        };
        Some(model.trim()).filter(|m| !m.is_empty())
    }

    /// Program and arguments for one invocation; the model flag goes right
    /// after the program's own arguments but before a trailing `-`.
    pub fn command_line(&self, fast: bool) -> Vec<String> {
        let mut args = self.config.command.clone();
        if let Some(model) = self.model(fast) {
            let at = if args.last().is_some_and(|a| a == "-") {
                args.len() - 1
            } else {
                args.len()
            };
            args.splice(at..at, [self.config.model_flag.clone(), model.to_string()]);
        }
        args
    }
}

impl Reasoner for CommandReasoner {
    #[instrument(skip_all, fields(fast, prompt_bytes = prompt.len()))]
    fn generate_text(&self, prompt: &str, fast: bool) -> Result<String> {
        let args = self.command_line(fast);
        let Some((program, rest)) = args.split_first() else {
            return Err(anyhow::anyhow!("reasoner.command is empty"));
        };
        info!(program = %program, "invoking reasoning service");
        let mut cmd = Command::new(program);
        cmd.args(rest);

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            timeout,
            self.config.output_limit_bytes,
        )
        .map_err(|err| TransportError {
            service: "reasoner".to_string(),
            message: format!("{err:#}"),
        })
        .context("run reasoning service")?;

        let failure = if output.timed_out {
            Some(format!("timed out after {}s", timeout.as_secs()))
        } else if output.output_limit_exceeded {
            Some(format!(
                "response exceeded {} bytes",
                self.config.output_limit_bytes
            ))
        } else if !output.status.success() {
            Some(format!(
                "exited with {:?}: {}",
                output.status.code(),
                preview(output.stderr_text().trim(), STDERR_PREVIEW)
            ))
        } else {
            None
        };
        if let Some(message) = failure {
            warn!(%message, "reasoning service failed");
            return Err(TransportError {
                service: "reasoner".to_string(),
                message,
            }
            .into());
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(response_bytes = text.len(), "reasoning service answered");
        Ok(text)
    }
}
