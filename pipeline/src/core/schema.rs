//! JSON Schema contracts for interpreted reasoning-service responses.

use anyhow::{Context, Result};
use jsonschema::Draft;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::errors::{ResponseFormatError, preview};
use crate::core::response::PREVIEW_LIMIT;
use crate::core::types::{DesignProposal, DraftEdit};

const PROPOSAL_SCHEMA: &str = include_str!("../../schemas/proposal.schema.json");
const DRAFT_SCHEMA: &str = include_str!("../../schemas/draft.schema.json");

/// Shape a response is expected to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSchema {
    Proposal,
    Draft,
}

impl ResponseSchema {
    fn source(&self) -> &'static str {
        match self {
            ResponseSchema::Proposal => PROPOSAL_SCHEMA,
            ResponseSchema::Draft => DRAFT_SCHEMA,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ResponseSchema::Proposal => "proposal",
            ResponseSchema::Draft => "draft",
        }
    }
}

/// Draft response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct DraftResponse {
    pub edits: Vec<DraftEdit>,
    #[serde(default)]
    pub summary: String,
}

/// Validate `value` against `schema` and deserialize it.
///
/// Schema violations and shape mismatches surface as [`ResponseFormatError`].
pub fn decode<T: DeserializeOwned>(value: Value, schema: ResponseSchema) -> Result<T> {
    let schema_json: Value = serde_json::from_str(schema.source())
        .with_context(|| format!("parse {} schema", schema.name()))?;
    let validator = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema_json)
        .with_context(|| format!("compile {} schema", schema.name()))?;
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(format_error(&value, schema, messages.join("; ")).into());
    }
    let rendered = value.to_string();
    serde_json::from_value(value)
        .map_err(|err| format_error_text(&rendered, schema, err.to_string()).into())
}

pub fn decode_proposal(value: Value) -> Result<DesignProposal> {
    decode(value, ResponseSchema::Proposal)
}

pub fn decode_draft(value: Value) -> Result<DraftResponse> {
    decode(value, ResponseSchema::Draft)
}

fn format_error(value: &Value, schema: ResponseSchema, detail: String) -> ResponseFormatError {
    format_error_text(&value.to_string(), schema, detail)
}

fn format_error_text(rendered: &str, schema: ResponseSchema, detail: String) -> ResponseFormatError {
    ResponseFormatError {
        reason: format!("{} response does not match schema: {detail}", schema.name()),
        preview: preview(rendered, PREVIEW_LIMIT),
    }
}
