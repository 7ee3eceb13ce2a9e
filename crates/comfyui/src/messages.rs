//! Wire format of the ComfyUI event feed.
//!
//! Every text frame is `{"type": "<kind>", "data": {...}}`. Frames of a
//! kind not listed in [`ServerMessage`] (custom-node extensions, newer
//! server releases) fail to parse and are dropped by the caller.

use serde::Deserialize;

/// One decoded event-feed frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Queue depth broadcast, sent on connect and whenever the queue changes.
    Status { status: ServerStatus },

    ExecutionStart { prompt_id: String },

    /// Nodes whose outputs were reused from cache.
    ExecutionCached {
        prompt_id: String,
        #[serde(default)]
        nodes: Vec<String>,
    },

    /// `node == None` marks the end of the prompt's execution.
    Executing {
        node: Option<String>,
        prompt_id: String,
    },

    /// Step-level progress. Older servers omit the prompt and node.
    Progress {
        value: u32,
        max: u32,
        #[serde(default)]
        prompt_id: Option<String>,
        #[serde(default)]
        node: Option<String>,
    },

    Executed {
        node: String,
        prompt_id: String,
        output: serde_json::Value,
    },

    ExecutionError {
        prompt_id: String,
        node_id: String,
        exception_type: String,
        exception_message: String,
    },

    /// The prompt was cancelled on the server (e.g. `/interrupt`).
    ExecutionInterrupted {
        prompt_id: String,
        #[serde(default)]
        node_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecInfo {
    /// Running plus pending prompts across every client of the server.
    pub queue_remaining: u32,
}

/// Decode one text frame.
pub fn parse_message(text: &str) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn status_ignores_session_id() {
        let msg = parse_message(
            r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":3}},"sid":"abc"}}"#,
        )
        .unwrap();
        assert_matches!(msg, ServerMessage::Status { status } if status.exec_info.queue_remaining == 3);
    }

    #[test]
    fn execution_start_tolerates_extra_fields() {
        let msg = parse_message(
            r#"{"type":"execution_start","data":{"prompt_id":"abc-123","timestamp":1700000000}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::ExecutionStart {
                prompt_id: "abc-123".into()
            }
        );
    }

    #[test]
    fn cached_nodes_default_to_empty() {
        let msg = parse_message(r#"{"type":"execution_cached","data":{"prompt_id":"abc"}}"#).unwrap();
        assert_matches!(msg, ServerMessage::ExecutionCached { nodes, .. } if nodes.is_empty());
    }

    #[test]
    fn executing_null_node_is_end_of_prompt() {
        let running = parse_message(r#"{"type":"executing","data":{"node":"42","prompt_id":"xyz"}}"#).unwrap();
        assert_matches!(running, ServerMessage::Executing { node: Some(n), .. } if n == "42");

        let done = parse_message(r#"{"type":"executing","data":{"node":null,"prompt_id":"xyz"}}"#).unwrap();
        assert_matches!(done, ServerMessage::Executing { node: None, prompt_id } if prompt_id == "xyz");
    }

    #[test]
    fn progress_with_and_without_attribution() {
        let bare = parse_message(r#"{"type":"progress","data":{"value":5,"max":20}}"#).unwrap();
        assert_eq!(
            bare,
            ServerMessage::Progress {
                value: 5,
                max: 20,
                prompt_id: None,
                node: None
            }
        );

        let attributed =
            parse_message(r#"{"type":"progress","data":{"value":1,"max":4,"prompt_id":"p1","node":"3"}}"#)
                .unwrap();
        assert_matches!(
            attributed,
            ServerMessage::Progress { prompt_id: Some(p), node: Some(n), .. } if p == "p1" && n == "3"
        );
    }

    #[test]
    fn executed_keeps_raw_output() {
        let msg = parse_message(
            r#"{"type":"executed","data":{"node":"9","output":{"images":[{"filename":"out.png"}]},"prompt_id":"abc"}}"#,
        )
        .unwrap();
        assert_matches!(msg, ServerMessage::Executed { node, output, .. } if node == "9" && output["images"].is_array());
    }

    #[test]
    fn execution_error_fields() {
        let msg = parse_message(
            r#"{"type":"execution_error","data":{"prompt_id":"abc","node_id":"5","node_type":"KSampler","exception_message":"out of memory","exception_type":"RuntimeError","traceback":[]}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::ExecutionError {
                prompt_id: "abc".into(),
                node_id: "5".into(),
                exception_type: "RuntimeError".into(),
                exception_message: "out of memory".into(),
            }
        );
    }

    #[test]
    fn interrupted_node_is_optional() {
        let msg = parse_message(r#"{"type":"execution_interrupted","data":{"prompt_id":"abc"}}"#).unwrap();
        assert_matches!(msg, ServerMessage::ExecutionInterrupted { node_id: None, .. });
    }

    #[test]
    fn unknown_or_malformed_frames_are_errors() {
        assert!(parse_message(r#"{"type":"crystools.monitor","data":{"cpu_utilization":3}}"#).is_err());
        assert!(parse_message(r#"{"type":"execution_start","data":{}}"#).is_err());
        assert!(parse_message("not json at all").is_err());
    }
}
