//! Drafting with the unit-test gate: ask for an edit set, retry with a
//! corrective instruction while it is unusable.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::errors::{GateExhaustedError, ResponseFormatError, preview};
use crate::core::response::{PREVIEW_LIMIT, interpret};
use crate::core::schema::decode_draft;
use crate::core::types::{DesignProposal, DraftEdit, RepoSnapshot, TaskDetails};
use crate::core::unit_test_gate::{CORRECTIVE_INSTRUCTION, GateVerdict, evaluate_gate};
use crate::io::edits::validate_edit_paths;
use crate::io::prompt::{DraftInputs, PromptBuilder};
use crate::io::reasoner::Reasoner;

/// Appended to the feedback after a response that could not be read.
pub const FORMAT_INSTRUCTION: &str = "The previous response could not be read as the requested \
JSON object. Reply with exactly one JSON object matching the output format and nothing else.";

/// Everything one drafting loop needs besides its collaborators.
#[derive(Debug, Clone, Copy)]
pub struct DraftRequest<'a> {
    pub task: &'a TaskDetails,
    pub snapshot: &'a RepoSnapshot,
    pub proposal: &'a DesignProposal,
    /// Reviewer notes so far, oldest first.
    pub feedback: &'a [String],
    pub previous_paths: &'a [String],
    pub max_attempts: u32,
}

enum Rejection {
    Gate(Vec<String>),
    Format(ResponseFormatError),
}

/// Draft until an edit set passes the gate or attempts run out.
///
/// Transport failures end the loop at once. On exhaustion the last failing
/// set is discarded and the error says why it failed.
#[instrument(skip_all, fields(task = %request.task.id, max_attempts = request.max_attempts))]
pub fn draft_edits(
    reasoner: &dyn Reasoner,
    prompts: &PromptBuilder,
    request: DraftRequest<'_>,
) -> Result<Vec<DraftEdit>> {
    let attempts = request.max_attempts.max(1);
    let mut feedback: Vec<String> = request.feedback.to_vec();
    let mut last = None;

    for attempt in 1..=attempts {
        let prompt = prompts.draft(DraftInputs {
            task: request.task,
            snapshot: request.snapshot,
            proposal: request.proposal,
            feedback: &feedback,
            previous_paths: request.previous_paths,
        })?;
        let text = reasoner.generate_text(&prompt, false)?;

        let edits = match read_edit_set(&text) {
            Ok(edits) => edits,
            Err(err) => {
                let format_err = match err.downcast::<ResponseFormatError>() {
                    Ok(format_err) => format_err,
                    Err(other) => return Err(other),
                };
                warn!(attempt, reason = %format_err.reason, "draft response unreadable");
                feedback.push(FORMAT_INSTRUCTION.to_string());
                last = Some(Rejection::Format(format_err));
                continue;
            }
        };

        match evaluate_gate(&edits, &request.snapshot.language_summary) {
            GateVerdict::Pass => {
                info!(attempt, edits = edits.len(), "draft passed unit-test gate");
                return Ok(edits);
            }
            GateVerdict::Fail { reason } => {
                warn!(attempt, %reason, "draft failed unit-test gate");
                feedback.push(CORRECTIVE_INSTRUCTION.to_string());
                last = Some(Rejection::Gate(
                    edits.into_iter().map(|edit| edit.path).collect(),
                ));
            }
        }
    }

    Err(match last {
        Some(Rejection::Format(err)) => err.into(),
        Some(Rejection::Gate(last_paths)) => GateExhaustedError {
            attempts,
            last_paths,
        }
        .into(),
        None => anyhow::anyhow!("drafting made no attempts"),
    })
}

/// Interpret, schema-check and path-check one response.
fn read_edit_set(text: &str) -> Result<Vec<DraftEdit>> {
    let value = interpret(text).into_result()?;
    let draft = decode_draft(value)?;
    validate_edit_paths(&draft.edits).map_err(|err| ResponseFormatError {
        reason: format!("{err:#}"),
        preview: preview(text, PREVIEW_LIMIT),
    })?;
    Ok(draft.edits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::TransportError;
    use crate::test_support::ScriptedReasoner;
    use std::collections::BTreeMap;

    fn task() -> TaskDetails {
        TaskDetails {
            id: "PROJ-7".to_string(),
            title: "Add slug helper".to_string(),
            description: String::new(),
            labels: Vec::new(),
            priority: None,
            url: None,
        }
    }

    fn ts_repo() -> RepoSnapshot {
        RepoSnapshot {
            language_summary: BTreeMap::from([("TypeScript".to_string(), 12)]),
            ..RepoSnapshot::default()
        }
    }

    const SOURCE_ONLY: &str =
        r#"{"edits":[{"path":"src/a.ts","content":"export const a = 1;\n"}]}"#;
    const WITH_TEST: &str = r#"Here you go:
```json
{"edits":[{"path":"src/a.ts","content":"export const a = 1;\n"},{"path":"src/a.test.ts","content":"test('a', () => {});\n"}]}
```"#;

    fn run(reasoner: &ScriptedReasoner, attempts: u32) -> Result<Vec<DraftEdit>> {
        let prompts = PromptBuilder::new(60_000).expect("prompts");
        draft_edits(
            reasoner,
            &prompts,
            DraftRequest {
                task: &task(),
                snapshot: &ts_repo(),
                proposal: &DesignProposal::default(),
                feedback: &[],
                previous_paths: &[],
                max_attempts: attempts,
            },
        )
    }

    #[test]
    fn retry_adds_the_missing_test() {
        let reasoner = ScriptedReasoner::new([SOURCE_ONLY, WITH_TEST]);
        let edits = run(&reasoner, 2).expect("draft");
        let paths: Vec<&str> = edits.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["src/a.ts", "src/a.test.ts"]);

        let prompts = reasoner.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains(CORRECTIVE_INSTRUCTION));
        assert!(prompts[1].contains(CORRECTIVE_INSTRUCTION));
    }

    #[test]
    fn exhaustion_reports_the_last_failing_set() {
        let reasoner = ScriptedReasoner::new([SOURCE_ONLY, SOURCE_ONLY]);
        let err = run(&reasoner, 2).unwrap_err();
        let gate = err.downcast_ref::<GateExhaustedError>().expect("gate error");
        assert_eq!(gate.attempts, 2);
        assert_eq!(gate.last_paths, ["src/a.ts"]);
    }

    #[test]
    fn unreadable_final_attempt_is_a_format_error() {
        let reasoner = ScriptedReasoner::new([SOURCE_ONLY, "I cannot help with that."]);
        let err = run(&reasoner, 2).unwrap_err();
        assert!(err.downcast_ref::<ResponseFormatError>().is_some());
        assert!(reasoner.prompts()[1].contains(CORRECTIVE_INSTRUCTION));
    }

    #[test]
    fn format_failure_then_success() {
        let reasoner = ScriptedReasoner::new(["{\"edits\": [", WITH_TEST]);
        let edits = run(&reasoner, 2).expect("draft");
        assert_eq!(edits.len(), 2);
        assert!(reasoner.prompts()[1].contains(FORMAT_INSTRUCTION));
    }

    #[test]
    fn escaping_paths_are_rejected_as_format_errors() {
        let reasoner = ScriptedReasoner::new([
            r#"{"edits":[{"path":"../outside.ts","content":"x"}]}"#,
        ]);
        let err = run(&reasoner, 1).unwrap_err();
        let format_err = err.downcast_ref::<ResponseFormatError>().expect("format error");
        assert!(format_err.reason.contains("inside the repository"));
    }

    #[test]
    fn transport_errors_stop_the_loop() {
        let reasoner = ScriptedReasoner::failing("reasoner", "connection refused");
        let err = run(&reasoner, 3).unwrap_err();
        assert!(err.downcast_ref::<TransportError>().is_some());
        assert_eq!(reasoner.prompts().len(), 1);
    }
}
