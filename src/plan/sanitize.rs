//! Plan sanitizer: turns untrusted step records into a bounded plan.
//!
//! Only allow-listed fields survive. Entries without a runnable identifier
//! (a well-formed `tool` or a known legacy `action`) are dropped, and
//! `dependsOn` positions are remapped onto the surviving steps. The output of
//! [`sanitize_plan`], serialized back to JSON, sanitizes to itself.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::model::{LegacyAction, MAX_STEP_ERROR_CHARS, Step, StepStatus, truncate_chars};

/// Maximum number of steps kept from a submitted plan.
pub const MAX_PLAN_STEPS: usize = 50;

/// Maximum number of argument keys per step.
pub const MAX_ARGS: usize = 16;

/// Maximum length of a string argument value.
pub const MAX_ARG_CHARS: usize = 512;

const MAX_IDENT_CHARS: usize = 64;

/// Sanitize a raw plan. Pure and idempotent.
///
/// `dependsOn` entries are positions in `raw`.
pub fn sanitize_plan(raw: &[Value]) -> Vec<Step> {
    let mut kept: Vec<&Map<String, Value>> = Vec::new();
    let mut positions: HashMap<usize, usize> = HashMap::new();

    for (raw_index, value) in raw.iter().enumerate() {
        if kept.len() == MAX_PLAN_STEPS {
            break;
        }
        let Some(obj) = value.as_object() else {
            continue;
        };
        if tool_id(obj).is_none() && legacy_action(obj).is_none() {
            continue;
        }
        positions.insert(raw_index, kept.len());
        kept.push(obj);
    }

    kept.into_iter()
        .enumerate()
        .map(|(index, obj)| sanitize_step(index, obj, &positions))
        .collect()
}

/// Serialize a plan into the JSON form [`sanitize_plan`] accepts.
pub fn plan_to_json(plan: &[Step]) -> Vec<Value> {
    plan.iter()
        .map(|step| serde_json::to_value(step).unwrap_or(Value::Null))
        .collect()
}

fn sanitize_step(index: usize, obj: &Map<String, Value>, positions: &HashMap<usize, usize>) -> Step {
    let mut step = Step::blank(index);
    step.tool = tool_id(obj);
    step.action = legacy_action(obj);
    step.args = sanitize_args(obj.get("args"));
    step.depends_on = sanitize_depends_on(obj.get("dependsOn"), positions);
    step.status = obj
        .get("status")
        .and_then(Value::as_str)
        .and_then(StepStatus::parse)
        .unwrap_or(StepStatus::Pending);
    step.agent = obj.get("agent").and_then(ident_string);
    step.scan_ref = obj
        .get("scanRef")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok());
    step.started_at = timestamp(obj.get("startedAt"));
    step.completed_at = timestamp(obj.get("completedAt"));
    step.first_seen_pending_at = timestamp(obj.get("firstSeenPendingAt"));
    step.error = obj
        .get("error")
        .and_then(Value::as_str)
        .map(|s| truncate_chars(s, MAX_STEP_ERROR_CHARS));
    step.result = obj.get("result").filter(|v| !v.is_null()).cloned();
    step
}

fn tool_id(obj: &Map<String, Value>) -> Option<String> {
    let raw = obj.get("tool")?.as_str()?.trim().to_ascii_lowercase();
    let valid = !raw.is_empty()
        && raw.len() <= MAX_IDENT_CHARS
        && raw.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    valid.then_some(raw)
}

fn legacy_action(obj: &Map<String, Value>) -> Option<LegacyAction> {
    obj.get("action")?.as_str().map(str::trim).and_then(LegacyAction::parse)
}

fn ident_string(value: &Value) -> Option<String> {
    let s = value.as_str()?.trim();
    (!s.is_empty() && s.chars().count() <= MAX_IDENT_CHARS).then(|| s.to_string())
}

fn sanitize_args(value: Option<&Value>) -> Map<String, Value> {
    let Some(Value::Object(args)) = value else {
        return Map::new();
    };

    args.iter()
        .filter(|(key, _)| !key.is_empty() && key.chars().count() <= MAX_IDENT_CHARS)
        .filter_map(|(key, value)| {
            let clean = match value {
                Value::String(s) => Value::String(truncate_chars(s, MAX_ARG_CHARS)),
                Value::Number(_) | Value::Bool(_) => value.clone(),
                _ => return None,
            };
            Some((key.clone(), clean))
        })
        .take(MAX_ARGS)
        .collect()
}

fn sanitize_depends_on(value: Option<&Value>, positions: &HashMap<usize, usize>) -> Vec<usize> {
    let Some(Value::Array(entries)) = value else {
        return Vec::new();
    };

    let mut deps: Vec<usize> = entries
        .iter()
        .filter_map(Value::as_u64)
        .filter_map(|raw| positions.get(&(raw as usize)).copied())
        .collect();
    deps.sort_unstable();
    deps.dedup();
    deps
}

fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .filter(|v| v.is_string())
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}
