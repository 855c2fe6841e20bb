//! Turns submitted wire events into a typed [`Batch`].
//!
//! Validation happens before anything is scheduled: a batch is accepted whole
//! or rejected whole.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::api::WireEvent;
use crate::model::{
    Action, Batch, Change, ConnectionState, InterfaceChange, TargetKind, WorkloadChange,
};

/// Why a submission was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch contains no actions")]
    Empty,
    #[error("event {index}: missing field `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("event {index}: invalid `{field}`: {reason}")]
    InvalidField {
        index: usize,
        field: &'static str,
        reason: String,
    },
    #[error("action {index} is not a {expected} action")]
    KindMismatch { index: usize, expected: TargetKind },
}

/// Parses every event of a submission into a batch of `kind` actions.
pub fn parse_batch(kind: TargetKind, events: &[WireEvent]) -> Result<Batch, BatchError> {
    let actions = events
        .iter()
        .enumerate()
        .map(|(index, ev)| parse_action(kind, index, ev))
        .collect::<Result<Vec<_>, _>>()?;
    Batch::new(kind, actions)
}

/// Parses one event. `index` is only used for error reporting.
pub fn parse_action(kind: TargetKind, index: usize, ev: &WireEvent) -> Result<Action, BatchError> {
    let timestamp = ev
        .timestamp
        .as_ref()
        .filter(|v| !v.is_null())
        .ok_or(BatchError::MissingField {
            index,
            field: "timestamp",
        })?;
    let scheduled_at_ms = parse_timestamp(timestamp).ok_or_else(|| BatchError::InvalidField {
        index,
        field: "timestamp",
        reason: format!("expected ms epoch in 0..={MAX_TIMESTAMP_MS}, got {timestamp}"),
    })?;

    let data = ev.data.as_ref().ok_or(BatchError::MissingField {
        index,
        field: "data",
    })?;

    let (target, change) = match kind {
        TargetKind::Workload => {
            let name = required_name(data, index, "name")?;
            (name, Change::Workload(parse_workload(data, index)?))
        }
        TargetKind::Interface => {
            let id = required_name(data, index, "id")?;
            (id, Change::Interface(parse_interface(data, index)?))
        }
    };

    Ok(Action {
        scheduled_at_ms,
        target,
        change,
    })
}

fn parse_workload(data: &Map<String, Value>, index: usize) -> Result<WorkloadChange, BatchError> {
    let cpu_shares = match present(data, "cpu") {
        None => None,
        Some(v) => Some(parse_u64(v).ok_or_else(|| BatchError::InvalidField {
            index,
            field: "cpu",
            reason: format!("expected non-negative integer, got {v}"),
        })?),
    };
    let memory_limit = optional_text(data, index, "memory")?;

    let mut networks = std::collections::BTreeMap::new();
    if let Some(v) = present(data, "networks") {
        let obj = v.as_object().ok_or_else(|| BatchError::InvalidField {
            index,
            field: "networks",
            reason: "expected object of network -> state".into(),
        })?;
        for (network, state) in obj {
            let state = match state.as_str() {
                Some("connected") => ConnectionState::Connected,
                Some("disconnected") => ConnectionState::Disconnected,
                _ => {
                    return Err(BatchError::InvalidField {
                        index,
                        field: "networks",
                        reason: format!("{network}: expected \"connected\" or \"disconnected\""),
                    })
                }
            };
            networks.insert(network.clone(), state);
        }
    }

    Ok(WorkloadChange {
        cpu_shares,
        memory_limit,
        networks,
    })
}

fn parse_interface(data: &Map<String, Value>, index: usize) -> Result<InterfaceChange, BatchError> {
    let active = match present(data, "active") {
        None => None,
        Some(v) => Some(parse_active(v).ok_or_else(|| BatchError::InvalidField {
            index,
            field: "active",
            reason: format!("expected \"true\" or \"false\", got {v}"),
        })?),
    };

    Ok(InterfaceChange {
        bandwidth: optional_text(data, index, "bandwidth")?,
        delay: optional_text(data, index, "delay")?,
        loss: optional_text(data, index, "loss")?,
        active,
    })
}

/// `null` counts as absent.
fn present<'a>(data: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    data.get(key).filter(|v| !v.is_null())
}

fn required_name(
    data: &Map<String, Value>,
    index: usize,
    field: &'static str,
) -> Result<String, BatchError> {
    let v = present(data, field).ok_or(BatchError::MissingField { index, field })?;
    match v.as_str().map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(BatchError::InvalidField {
            index,
            field,
            reason: "expected non-empty string".into(),
        }),
    }
}

fn optional_text(
    data: &Map<String, Value>,
    index: usize,
    field: &'static str,
) -> Result<Option<String>, BatchError> {
    let Some(v) = present(data, field) else {
        return Ok(None);
    };
    match v {
        Value::String(s) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(BatchError::InvalidField {
            index,
            field,
            reason: format!("expected string or number, got {v}"),
        }),
    }
}

/// 9999-12-31T23:59:59.999Z.
const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

fn parse_timestamp(v: &Value) -> Option<i64> {
    let ms = match v {
        Value::Number(n) => match n.as_i64() {
            Some(ms) => ms,
            None => {
                let f = n.as_f64()?;
                if !(0.0..=MAX_TIMESTAMP_MS as f64).contains(&f) {
                    return None;
                }
                f as i64
            }
        },
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (0..=MAX_TIMESTAMP_MS).contains(&ms).then_some(ms)
}

fn parse_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts exactly the `"true"`/`"false"` tokens (and JSON booleans).
fn parse_active(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s == "true" => Some(true),
        Value::String(s) if s == "false" => Some(false),
        _ => None,
    }
}
