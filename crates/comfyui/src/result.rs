//! Job results read from the ComfyUI `/history` endpoint.
//!
//! `GET /history/{prompt_id}` answers `{}` while the prompt is queued or
//! running and `{ "<prompt_id>": { "outputs": {...}, "status": {...} } }`
//! once it has finished. [`JobResult::from_history`] maps the first
//! shape to `None` and the second to a [`JobResult`].

use serde::Deserialize;

/// Outputs of one finished prompt, keyed by node id.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub job_id: String,
    pub outputs: serde_json::Map<String, serde_json::Value>,
    pub status: Option<HistoryStatus>,
}

/// Execution status recorded in a history entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    /// `[event_name, payload]` pairs logged by the server during execution.
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

/// An image written by a `SaveImage`-style node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_image_kind")]
    pub kind: String,
}

fn default_image_kind() -> String {
    "output".to_string()
}

#[derive(Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    outputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    status: Option<HistoryStatus>,
}

impl JobResult {
    /// Interpret a decoded `/history/{job_id}` body.
    ///
    /// Returns `Ok(None)` when the body holds no entry for `job_id`, and
    /// `Err` with a description when the body or entry has the wrong shape.
    pub fn from_history(job_id: &str, body: serde_json::Value) -> Result<Option<Self>, String> {
        let mut entries = match body {
            serde_json::Value::Object(entries) => entries,
            other => return Err(format!("history body is not an object: {other}")),
        };

        let Some(entry) = entries.remove(job_id) else {
            return Ok(None);
        };

        let entry: HistoryEntry = serde_json::from_value(entry)
            .map_err(|e| format!("malformed history entry for {job_id}: {e}"))?;

        Ok(Some(Self {
            job_id: job_id.to_string(),
            outputs: entry.outputs,
            status: entry.status,
        }))
    }

    /// Whether the server recorded this prompt as failed.
    pub fn is_error(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.status_str == "error")
    }

    /// The failing node and exception message, if the history logged one.
    pub fn error_details(&self) -> Option<(String, String)> {
        let status = self.status.as_ref()?;
        status.messages.iter().find_map(|m| {
            let pair = m.as_array()?;
            if pair.first()?.as_str()? != "execution_error" {
                return None;
            }
            let data = pair.get(1)?;
            let node_id = data.get("node_id").and_then(|v| v.as_str()).unwrap_or_default();
            let message = data
                .get("exception_message")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            Some((node_id.to_string(), message.to_string()))
        })
    }

    /// All images listed under `images` in any node output.
    pub fn images(&self) -> Vec<OutputImage> {
        self.outputs
            .values()
            .filter_map(|output| output.get("images")?.as_array())
            .flatten()
            .filter_map(|img| serde_json::from_value::<OutputImage>(img.clone()).ok())
            .collect()
    }

    /// Mesh files (`.obj` / `.glb`) named in node `result` outputs.
    ///
    /// Paths are relative to the server's output directory.
    pub fn mesh_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for output in self.outputs.values() {
            match output.get("result") {
                Some(serde_json::Value::Array(items)) => {
                    files.extend(
                        items
                            .iter()
                            .filter_map(|i| i.as_str())
                            .filter(|s| is_mesh(s))
                            .map(String::from),
                    );
                }
                Some(serde_json::Value::String(s)) if is_mesh(s) => files.push(s.clone()),
                _ => {}
            }
        }
        files
    }
}

fn is_mesh(path: &str) -> bool {
    path.ends_with(".obj") || path.ends_with(".glb")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_history_is_not_ready() {
        assert_eq!(JobResult::from_history("p1", json!({})).unwrap(), None);
    }

    #[test]
    fn history_for_other_prompt_is_not_ready() {
        let body = json!({"other": {"outputs": {}}});
        assert_eq!(JobResult::from_history("p1", body).unwrap(), None);
    }

    #[test]
    fn non_object_history_is_rejected() {
        assert!(JobResult::from_history("p1", json!([1, 2])).is_err());
    }

    #[test]
    fn finished_history_yields_outputs() {
        let body = json!({
            "p1": {
                "outputs": {
                    "9": {"images": [{"filename": "img_00001_.png", "subfolder": "ImageGen", "type": "output"}]}
                },
                "status": {"status_str": "success", "completed": true, "messages": []}
            }
        });
        let result = JobResult::from_history("p1", body).unwrap().unwrap();
        assert_eq!(result.job_id, "p1");
        assert!(!result.is_error());
        assert_eq!(
            result.images(),
            vec![OutputImage {
                filename: "img_00001_.png".into(),
                subfolder: "ImageGen".into(),
                kind: "output".into(),
            }]
        );
    }

    #[test]
    fn image_defaults_apply() {
        let body = json!({"p1": {"outputs": {"3": {"images": [{"filename": "a.png"}, {"nope": 1}]}}}});
        let result = JobResult::from_history("p1", body).unwrap().unwrap();
        let images = result.images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].subfolder, "");
        assert_eq!(images[0].kind, "output");
    }

    #[test]
    fn mesh_files_from_list_and_string_results() {
        let body = json!({
            "p1": {
                "outputs": {
                    "20": {"result": ["MeshGen/textured_mesh.obj", "MeshGen/preview.png"]},
                    "21": {"result": "MeshGen/mesh.glb"},
                    "22": {"result": "notes.txt"}
                }
            }
        });
        let result = JobResult::from_history("p1", body).unwrap().unwrap();
        let mut meshes = result.mesh_files();
        meshes.sort();
        assert_eq!(meshes, vec!["MeshGen/mesh.glb", "MeshGen/textured_mesh.obj"]);
    }

    #[test]
    fn error_status_exposes_details() {
        let body = json!({
            "p1": {
                "outputs": {},
                "status": {
                    "status_str": "error",
                    "completed": false,
                    "messages": [
                        ["execution_start", {"prompt_id": "p1"}],
                        ["execution_error", {"prompt_id": "p1", "node_id": "7", "exception_message": "CUDA out of memory"}]
                    ]
                }
            }
        });
        let result = JobResult::from_history("p1", body).unwrap().unwrap();
        assert!(result.is_error());
        assert_eq!(
            result.error_details(),
            Some(("7".to_string(), "CUDA out of memory".to_string()))
        );
    }
}
