//! JSON replay scripts.
//!
//! A script is an array of steps applied in order:
//!
//! ```json
//! [
//!   { "op": "acquire", "id": "T1", "write": [["db", "table1"]] },
//!   { "op": "acquire", "id": "T2", "mode": "scheduled", "write": [["db"]] },
//!   { "op": "run", "id": "T2", "millis": 20 },
//!   { "op": "release", "id": "T1" },
//!   { "op": "check", "read": [["db"]] }
//! ]
//! ```

use arbiter_core::{AccessRequest, Right};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquireMode {
    #[default]
    Try,
    Scheduled,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Step {
    /// Request rights under `id`.
    Acquire {
        id: String,
        #[serde(default)]
        mode: AcquireMode,
        #[serde(default)]
        read: Vec<Right>,
        #[serde(default)]
        write: Vec<Right>,
    },
    /// Graceful release of the access held under `id`.
    Release { id: String },
    /// Release and cancel running tasks of `id`.
    Cancel { id: String },
    /// Report whether the rights could be granted right now.
    Check {
        #[serde(default)]
        read: Vec<Right>,
        #[serde(default)]
        write: Vec<Right>,
    },
    /// Run a task of `millis` under the access held by `id`.
    Run {
        id: String,
        #[serde(default)]
        millis: u64,
        /// Block the replay until the task finished.
        #[serde(default)]
        wait: bool,
    },
}

pub fn request(id: &str, read: &[Right], write: &[Right]) -> AccessRequest<String> {
    AccessRequest::new(id.to_string(), read.iter().cloned(), write.iter().cloned())
}

pub fn parse(text: &str) -> serde_json::Result<Vec<Step>> {
    serde_json::from_str(text)
}

pub fn load(path: &Path) -> Result<Vec<Step>, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_step_kinds() {
        let steps = parse(
            r#"[
                { "op": "acquire", "id": "T1", "write": [["db", "table1"]] },
                { "op": "acquire", "id": "T2", "mode": "scheduled", "read": [["db", 3]] },
                { "op": "run", "id": "T2", "millis": 5, "wait": true },
                { "op": "check", "write": [[]] },
                { "op": "release", "id": "T1" },
                { "op": "cancel", "id": "T2" }
            ]"#,
        )
        .unwrap();
        assert_eq!(steps.len(), 6);

        match &steps[0] {
            Step::Acquire { id, mode, read, write } => {
                assert_eq!(id, "T1");
                assert_eq!(*mode, AcquireMode::Try);
                assert!(read.is_empty());
                assert_eq!(write[0], Right::new(["db", "table1"]));
            }
            other => panic!("unexpected step {other:?}"),
        }
        match &steps[1] {
            Step::Acquire { mode, read, .. } => {
                assert_eq!(*mode, AcquireMode::Scheduled);
                assert_eq!(read[0], Right::new(["db"]).child(3u64));
            }
            other => panic!("unexpected step {other:?}"),
        }
        match &steps[3] {
            Step::Check { write, .. } => assert!(write[0].is_universal()),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_ops() {
        assert!(parse(r#"[{ "op": "steal", "id": "x" }]"#).is_err());
    }
}
