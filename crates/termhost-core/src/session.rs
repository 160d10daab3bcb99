//! Session request and metadata shapes shared by the registry and the wire.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Parameters for creating a session.
///
/// Everything except `execution_id` and `working_dir` is optional; missing
/// values fall back to the registry's configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactivity_timeout_ms: Option<u64>,
}

impl SpawnRequest {
    pub fn new(execution_id: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            execution_id: execution_id.into(),
            working_dir: working_dir.into(),
            ..Self::default()
        }
    }

    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = Some(cols);
        self.rows = Some(rows);
        self
    }

    pub fn inactivity_timeout_ms(mut self, ms: u64) -> Self {
        self.inactivity_timeout_ms = Some(ms);
        self
    }
}

/// Read-only projection of a managed session. Never carries the process handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub execution_id: String,
    /// OS process id of the spawned shell, when the platform reports one.
    pub pid: Option<u32>,
    pub command: String,
    pub working_dir: PathBuf,
    pub cols: u16,
    pub rows: u16,
    /// Copy of the buffered output lines at the time of the call.
    pub buffer: Vec<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_request_minimal_json() {
        let req: SpawnRequest =
            serde_json::from_str(r#"{"execution_id":"s1","working_dir":"/tmp"}"#).unwrap();
        assert_eq!(req.execution_id, "s1");
        assert_eq!(req.working_dir, PathBuf::from("/tmp"));
        assert!(req.shell.is_none());
        assert!(req.args.is_empty());
        assert!(req.cols.is_none() && req.rows.is_none());
    }

    #[test]
    fn test_spawn_request_builder() {
        let req = SpawnRequest::new("s2", "/")
            .shell("/bin/sh")
            .args(["-c", "exit 0"])
            .env("FOO", "bar")
            .size(120, 40)
            .inactivity_timeout_ms(500);
        assert_eq!(req.shell.as_deref(), Some("/bin/sh"));
        assert_eq!(req.args, vec!["-c", "exit 0"]);
        assert_eq!(req.env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!((req.cols, req.rows), (Some(120), Some(40)));
        assert_eq!(req.inactivity_timeout_ms, Some(500));
    }
}
