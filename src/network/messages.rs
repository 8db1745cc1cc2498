//! Client records.
//!
//! One JSON object per line, discriminated by `op`. Field names are
//! camelCase on the wire.

use crate::error::{ControlError, ErrorCode, ErrorInfo};
use crate::protocol::MeasurementData;
use crate::scheduler::task::{Mode, TaskId, TaskStatus};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Request from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Request {
    /// Queue a task; answered with an ack.
    Submit(SubmitRequest),
    /// Current lifecycle state of a task.
    Status(TaskRef),
    /// Stored outcome of a task.
    Result(TaskRef),
    /// Abort a queued or running task.
    Cancel(TaskRef),
    /// Liveness check.
    Ping,
}

/// Queue a measurement on `channel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Switch output to measure.
    pub channel: u32,
    /// Parsed case-insensitively at admission.
    pub mode: String,
    /// Mode parameters; numbers and booleans are accepted and kept as text.
    #[serde(default, deserialize_with = "params_as_text")]
    pub params: HashMap<String, String>,
}

impl SubmitRequest {
    /// Request without parameters.
    pub fn new(channel: u32, mode: impl Into<String>) -> Self {
        Self {
            channel,
            mode: mode.into(),
            params: HashMap::new(),
        }
    }

    /// Add one mode parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Request addressing one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    /// Id returned in the ack.
    pub task_id: TaskId,
}

fn params_as_text<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw = Option::<HashMap<String, serde_json::Value>>::deserialize(deserializer)?;
    raw.unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                other => {
                    return Err(D::Error::custom(format!(
                        "parameter '{key}' must be a string or number, got {other}"
                    )))
                }
            };
            Ok((key, text))
        })
        .collect()
}

/// Reply to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Response {
    /// Task admitted.
    Ack(AckMessage),
    /// Lifecycle snapshot.
    Status(StatusMessage),
    /// Task outcome, sent on request and pushed when the task ends.
    Result(ResultMessage),
    /// Request rejected.
    Error(ErrorMessage),
    /// Answer to `ping`.
    Pong,
}

/// Task admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckMessage {
    /// Id to poll with.
    pub task_id: TaskId,
    /// Channel the task will route.
    pub channel: u32,
    /// Normalized mode.
    pub mode: Mode,
}

/// Lifecycle snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    /// Task the snapshot is for.
    pub task_id: TaskId,
    /// Current state.
    pub status: TaskStatus,
    /// Failure cause once `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Outcome of a task, or a pending marker while it is still running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    /// Task the outcome is for.
    pub task_id: TaskId,
    /// State when the message was built.
    pub status: TaskStatus,
    /// True only for `done`.
    pub success: bool,
    /// Measurement payload of a successful task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<MeasurementData>,
    /// Failure cause of a failed task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ResultMessage {
    /// Successful measurement.
    pub fn done(task_id: TaskId, data: MeasurementData) -> Self {
        Self {
            task_id,
            status: TaskStatus::Done,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed task.
    pub fn failed(task_id: TaskId, error: ErrorInfo) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failed,
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Task not finished yet.
    pub fn pending(task_id: TaskId, status: TaskStatus) -> Self {
        Self {
            task_id,
            status,
            success: false,
            data: None,
            error: None,
        }
    }
}

/// Rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    /// Error category.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
    /// Task the request referred to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

impl ErrorMessage {
    /// Error reply for `error`.
    pub fn from_error(error: &ControlError, task_id: Option<TaskId>) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            task_id,
        }
    }
}

impl From<AckMessage> for Response {
    fn from(value: AckMessage) -> Self {
        Response::Ack(value)
    }
}

impl From<StatusMessage> for Response {
    fn from(value: StatusMessage) -> Self {
        Response::Status(value)
    }
}

impl From<ResultMessage> for Response {
    fn from(value: ResultMessage) -> Self {
        Response::Result(value)
    }
}

impl From<ErrorMessage> for Response {
    fn from(value: ErrorMessage) -> Self {
        Response::Error(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MeasurementResult, Peak};
    use serde_json::json;

    #[test]
    fn submit_request_parses() {
        let line = r#"{"op":"submit","channel":3,"mode":"AutoPeak","params":{"start":"0.0","end":30,"thr":-80}}"#;
        let request: Request = serde_json::from_str(line).unwrap();
        let Request::Submit(submit) = request else {
            panic!("expected submit");
        };
        assert_eq!(submit.channel, 3);
        assert_eq!(submit.mode, "AutoPeak");
        assert_eq!(submit.params["end"], "30");
        assert_eq!(submit.params["thr"], "-80");
    }

    #[test]
    fn params_are_optional() {
        let request: Request =
            serde_json::from_str(r#"{"op":"submit","channel":1,"mode":"scan"}"#).unwrap();
        assert_eq!(request, Request::Submit(SubmitRequest::new(1, "scan")));

        let request: Request =
            serde_json::from_str(r#"{"op":"submit","channel":1,"mode":"scan","params":null}"#)
                .unwrap();
        assert_eq!(request, Request::Submit(SubmitRequest::new(1, "scan")));
    }

    #[test]
    fn nested_params_are_rejected() {
        let line = r#"{"op":"submit","channel":1,"mode":"scan","params":{"gain":[1]}}"#;
        assert!(serde_json::from_str::<Request>(line).is_err());
    }

    #[test]
    fn task_requests_use_camel_case() {
        let request: Request =
            serde_json::from_str(r#"{"op":"status","taskId":"T1-abc"}"#).unwrap();
        assert_eq!(
            request,
            Request::Status(TaskRef {
                task_id: TaskId::from("T1-abc")
            })
        );
        assert_eq!(
            serde_json::from_str::<Request>(r#"{"op":"ping"}"#).unwrap(),
            Request::Ping
        );
        assert!(serde_json::from_str::<Request>(r#"{"op":"reboot"}"#).is_err());
    }

    #[test]
    fn result_message_wire_shape() {
        let result = MeasurementResult {
            peaks: vec![Peak {
                position: 1.5,
                amplitude: Some(-70.0),
            }],
            peak_count: 1,
            serial: "SN9II1".into(),
            scalar: 72.0,
        };
        let message = ResultMessage::done(TaskId::from("T1-abc"), result.into());
        let value = serde_json::to_value(Response::from(message)).unwrap();

        assert_eq!(value["op"], "result");
        assert_eq!(value["taskId"], "T1-abc");
        assert_eq!(value["status"], "done");
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["kind"], "peaks");
        assert_eq!(value["data"]["peakCount"], 1);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn error_and_pending_shapes() {
        let error = ControlError::NotFound("no task T9".into());
        let value = serde_json::to_value(Response::from(ErrorMessage::from_error(&error, None)))
            .unwrap();
        assert_eq!(value["op"], "error");
        assert_eq!(value["code"], "NotFound");

        let pending = ResultMessage::pending(TaskId::from("T2-x"), TaskStatus::Scanning);
        assert_eq!(
            serde_json::to_value(Response::from(pending)).unwrap(),
            json!({"op":"result","taskId":"T2-x","status":"scanning","success":false})
        );
    }

    #[test]
    fn ack_round_trips() {
        let ack = Response::Ack(AckMessage {
            task_id: TaskId::from("T3-y"),
            channel: 2,
            mode: Mode::AutoPeak,
        });
        let line = serde_json::to_string(&ack).unwrap();
        assert!(line.contains(r#""mode":"autopeak""#));
        assert_eq!(serde_json::from_str::<Response>(&line).unwrap(), ack);
    }
}
