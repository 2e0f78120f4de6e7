//! Wire types shared by the HTTP API and WebSocket subscribers.
//!
//! Every frame a subscriber receives is a single JSON object tagged by
//! `type`. Output, status and error frames carry their text in `data`;
//! the completion frame carries the final report in `result`.

use serde::{Deserialize, Serialize};

/// An event published on a session's broadcaster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// One line of job output (primary or tagged diagnostic).
    Output { data: String },
    /// Progress message that is not part of the output log.
    Status { data: String },
    /// Terminal: the job finished successfully.
    Completed { result: String },
    /// Terminal: the job failed.
    Error { data: String },
}

impl SessionEvent {
    pub fn output(line: impl Into<String>) -> Self {
        Self::Output { data: line.into() }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::Status { data: message.into() }
    }

    pub fn completed(result: impl Into<String>) -> Self {
        Self::Completed {
            result: result.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            data: message.into(),
        }
    }

    /// Whether this event ends the session. No event follows a terminal one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }
}

/// Body of `POST /api/analyze`.
///
/// All three fields are free-form text and required; the job decides what
/// they mean.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub company_name: String,
    pub stock_code: String,
    pub market: String,
}

/// Response of `POST /api/analyze`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAnalysisResponse {
    pub session_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_event_serializes_with_data() {
        let json = serde_json::to_value(SessionEvent::output("line1")).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "output", "data": "line1" }));
    }

    #[test]
    fn status_event_serializes_with_data() {
        let json = serde_json::to_value(SessionEvent::status("starting")).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["data"], "starting");
    }

    #[test]
    fn completed_event_carries_result_not_data() {
        let json = serde_json::to_value(SessionEvent::completed("a\nb\n")).unwrap();
        assert_eq!(json["type"], "completed");
        assert_eq!(json["result"], "a\nb\n");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn error_event_serializes_with_data() {
        let json = serde_json::to_value(SessionEvent::error("boom")).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "error", "data": "boom" }));
    }

    #[test]
    fn only_completed_and_error_are_terminal() {
        assert!(!SessionEvent::output("x").is_terminal());
        assert!(!SessionEvent::status("x").is_terminal());
        assert!(SessionEvent::completed("x").is_terminal());
        assert!(SessionEvent::error("x").is_terminal());
    }

    #[test]
    fn analysis_request_requires_all_fields() {
        let ok: Result<AnalysisRequest, _> = serde_json::from_str(
            r#"{"company_name":"Test Co","stock_code":"000001.SZ","market":"SZ"}"#,
        );
        assert!(ok.is_ok());

        let missing: Result<AnalysisRequest, _> =
            serde_json::from_str(r#"{"company_name":"Test Co"}"#);
        assert!(missing.is_err());
    }
}
