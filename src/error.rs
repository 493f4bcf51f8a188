use thiserror::Error;

/// Failures that abort a scoring run before any report is produced.
///
/// Per-sample problems (missing predictions, unparseable answers, judge
/// errors) are never represented here; they become verdicts instead.
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("duplicate sample id {id:?} in reference set")]
    DuplicateSample { id: String },

    #[error("malformed sample id at record {index}: {reason}")]
    MalformedSampleId { index: usize, reason: String },

    #[error("invalid reference data in {source_name}: {reason}")]
    InvalidReference { source_name: String, reason: String },

    #[error("unknown task {task:?}: no comparison rule configured")]
    UnknownTask { task: String },

    #[error("task {task:?} uses external_judge but no judge is configured")]
    MissingJudge { task: String },

    #[error("invalid task table: {0}")]
    InvalidTaskTable(String),

    #[error("malformed predictions: {0}")]
    MalformedPredictions(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DataIntegrity,
    Configuration,
}

impl ScoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScoreError::DuplicateSample { .. }
            | ScoreError::MalformedSampleId { .. }
            | ScoreError::InvalidReference { .. } => ErrorKind::DataIntegrity,
            ScoreError::UnknownTask { .. }
            | ScoreError::MissingJudge { .. }
            | ScoreError::InvalidTaskTable(_)
            | ScoreError::MalformedPredictions(_) => ErrorKind::Configuration,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Configuration => 2,
            ErrorKind::DataIntegrity => 3,
        }
    }
}

/// Exit code for command-line usage errors (`EX_USAGE`).
pub const USAGE_EXIT_CODE: u8 = 64;

/// Exit code for any error reaching `main`; untyped failures map to 1.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ScoreError>())
        .map(ScoreError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_error_kinds() {
        let dup = ScoreError::DuplicateSample { id: "q1".into() };
        assert_eq!(dup.kind(), ErrorKind::DataIntegrity);
        assert_eq!(dup.exit_code(), 3);

        let unknown = ScoreError::UnknownTask { task: "vqa".into() };
        assert_eq!(unknown.kind(), ErrorKind::Configuration);
        assert_eq!(unknown.exit_code(), 2);
    }

    #[test]
    fn test_unknown_task_message_names_task() {
        let err = ScoreError::UnknownTask {
            task: "spot_diff".into(),
        };
        assert!(err.to_string().contains("spot_diff"));
    }

    #[test]
    fn test_exit_code_through_context_chain() {
        let result: anyhow::Result<()> = Err(ScoreError::DuplicateSample { id: "7".into() })
            .context("Failed to load references");
        let err = result.unwrap_err();
        assert_eq!(exit_code_for(&err), 3);
    }

    #[test]
    fn test_exit_code_untyped() {
        let err = anyhow::anyhow!("disk on fire");
        assert_eq!(exit_code_for(&err), 1);
    }
}
