//! Shared glue between a demo concept's own typed input/output and the
//! kernel's keyed-value `ActionInvocation`/`ActionCompletion`: the core only
//! ever treats these as keyed values, so this conversion is where typed
//! structs live.

use crate::model::{ActionCompletion, ActionInvocation, Fields};
use crate::transport::stamp_completion;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub fn input_from_fields<T: DeserializeOwned>(fields: &Fields) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(
        fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    ))
}

/// Serializes a `#[serde(tag = "variant")]` output enum into a completion,
/// lifting every sibling field into `output` and the tag into `variant`.
pub fn completion_from_output(
    invocation: &ActionInvocation,
    output: impl Serialize,
) -> Result<ActionCompletion, serde_json::Error> {
    let value = serde_json::to_value(output)?;
    let mut fields: Fields = value
        .as_object()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .collect();
    let variant = fields
        .remove("variant")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "ok".to_string());
    Ok(stamp_completion(invocation, variant, fields))
}
