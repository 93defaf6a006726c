//! Reads a pre-planned task list from disk, in place of the planning agent
//! that would otherwise turn the user's free-text request into tasks (out of
//! scope for this crate, see the task source boundary in `kugutsu-agents`).

use std::path::Path;

use kugutsu_agents::TaskSourceOutput;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskFileError {
    #[error("could not read task file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse task file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn load(path: &Path) -> Result<TaskSourceOutput, TaskFileError> {
    let raw = std::fs::read_to_string(path).map_err(|source| TaskFileError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| TaskFileError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_well_formed_task_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"{
                "tasks": [
                    {"id": "550e8400-e29b-41d4-a716-446655440000", "title": "add login", "description": "", "kind": "feature", "priority": "high", "dependencies": []}
                ],
                "summary": "one task",
                "project_id": "demo"
            }"#,
        )
        .unwrap();

        let output = load(&path).unwrap();
        assert_eq!(output.tasks.len(), 1);
        assert_eq!(output.tasks[0].title, "add login");
        assert_eq!(output.summary, "one task");
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, TaskFileError::Read { .. }));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, "not json").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, TaskFileError::Parse { .. }));
    }
}
