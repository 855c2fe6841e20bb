use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::TargetKind;

/// One element of a submitted JSON array.
///
/// Fields are kept loosely typed so that validation can report exactly which
/// event and field was wrong instead of a generic decode error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireEvent {
    /// Fire time, ms epoch (number or numeric string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    /// Kind-specific attributes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

/// Submission accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub batch_id: String,
    pub kind: TargetKind,
    pub actions: usize,
    /// When the batch's snapshot becomes due (ms epoch).
    pub horizon_ms: i64,
}

/// Number of stages appended so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportIndex {
    pub stages: u64,
}

/// Error body returned by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
