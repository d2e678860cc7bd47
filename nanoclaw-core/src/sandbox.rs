//! Sandbox wire protocol.
//!
//! The host writes one JSON payload to the sandbox's stdin and then closes
//! it; everything after that travels over filesystem IPC. The sandbox's
//! stdout is a free text stream with JSON records framed between literal
//! marker lines. Anything between a marker pair that fails to parse as JSON
//! is a fatal output error for the run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sentinel markers for framed stdout records. Must match the agent runner
/// inside the sandbox image byte for byte.
pub const OUTPUT_START_MARKER: &str = "---NANOCLAW_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---NANOCLAW_OUTPUT_END---";

/// Input payload written to sandbox stdin as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub folder: String,
    pub chat_id: String,
    pub is_main: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_scheduled_task: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
    /// Secrets travel only on stdin, never in the environment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<HashMap<String, String>>,
}

/// Output record extracted from stdout between marker lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxOutput {
    pub status: SandboxStatus,
    /// Null result on a `success` record is a session-update marker only.
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Success,
    Error,
}

/// Volume mount specification for sandbox launch.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

/// Extracts complete marker-framed records from a stdout buffer.
///
/// Returns the raw payload strings and the number of bytes consumed.
/// A start marker without its end marker is left in the buffer for the
/// next read.
pub fn extract_framed_records(buf: &str) -> (Vec<String>, usize) {
    let mut records = Vec::new();
    let mut consumed = 0;

    let mut search_from = 0;
    loop {
        let start = match buf[search_from..].find(OUTPUT_START_MARKER) {
            Some(pos) => search_from + pos,
            None => break,
        };

        let after_start = start + OUTPUT_START_MARKER.len();
        let end = match buf[after_start..].find(OUTPUT_END_MARKER) {
            Some(pos) => after_start + pos,
            None => break,
        };

        records.push(buf[after_start..end].trim().to_string());

        consumed = end + OUTPUT_END_MARKER.len();
        search_from = consumed;
    }

    (records, consumed)
}

/// Strip `<internal>…</internal>` spans from agent output before delivery.
pub fn strip_internal_spans(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("<internal>") {
        result.push_str(&rest[..start]);
        if let Some(end) = rest[start..].find("</internal>") {
            rest = &rest[start + end + "</internal>".len()..];
        } else {
            rest = "";
            break;
        }
    }
    result.push_str(rest);
    result.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_serializes_camel_case() {
        let input = SandboxInput {
            prompt: "hello".to_string(),
            session_id: Some("sess-123".to_string()),
            folder: "main".to_string(),
            chat_id: "tg:123".to_string(),
            is_main: true,
            is_scheduled_task: None,
            assistant_name: Some("Andy".to_string()),
            secrets: None,
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("\"chatId\""));
        assert!(json.contains("\"isMain\""));
        assert!(json.contains("\"sessionId\""));
        assert!(!json.contains("\"secrets\""));
        assert!(!json.contains("\"isScheduledTask\""));
    }

    #[test]
    fn output_deserializes_success_record() {
        let json = r#"{"status":"success","result":"Hello!","newSessionId":"sess-456"}"#;
        let output: SandboxOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.status, SandboxStatus::Success);
        assert_eq!(output.result.as_deref(), Some("Hello!"));
        assert_eq!(output.new_session_id.as_deref(), Some("sess-456"));
    }

    #[test]
    fn output_deserializes_error_record() {
        let json = r#"{"status":"error","result":null,"error":"sandbox exited with code 1"}"#;
        let output: SandboxOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.status, SandboxStatus::Error);
        assert!(output.result.is_none());
        assert!(output.error.is_some());
    }

    #[test]
    fn extract_single_record() {
        let buf = format!(
            "noise {}{{\"status\":\"success\",\"result\":\"hi\"}}{}trailing",
            OUTPUT_START_MARKER, OUTPUT_END_MARKER
        );
        let (records, consumed) = extract_framed_records(&buf);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], r#"{"status":"success","result":"hi"}"#);
        assert_eq!(&buf[consumed..], "trailing");
    }

    #[test]
    fn extract_multiple_records() {
        let buf = format!(
            "{s}{{\"status\":\"success\",\"result\":null}}{e}\n{s}{{\"status\":\"success\",\"result\":\"done\"}}{e}",
            s = OUTPUT_START_MARKER,
            e = OUTPUT_END_MARKER,
        );
        let (records, consumed) = extract_framed_records(&buf);
        assert_eq!(records.len(), 2);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn extract_incomplete_pair_consumes_nothing() {
        let buf = format!("{}{{\"status\":\"success\"}}", OUTPUT_START_MARKER);
        let (records, consumed) = extract_framed_records(&buf);
        assert!(records.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn extract_empty_buffer() {
        let (records, consumed) = extract_framed_records("");
        assert!(records.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn strip_internal_basic() {
        assert_eq!(
            strip_internal_spans("Hello <internal>reasoning</internal> World"),
            "Hello  World"
        );
    }

    #[test]
    fn strip_internal_multiple_and_unclosed() {
        assert_eq!(
            strip_internal_spans("A <internal>x</internal> B <internal>y</internal> C"),
            "A  B  C"
        );
        assert_eq!(strip_internal_spans("Hello <internal>never closed"), "Hello");
    }

    #[test]
    fn strip_internal_passthrough() {
        assert_eq!(strip_internal_spans("plain text"), "plain text");
    }
}
