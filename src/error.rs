use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoachError {
    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rule store error: {0}")]
    RuleStore(String),

    #[error("refusing to write through symlink: {0}")]
    SymlinkRefused(String),

    #[error("LLM judge error: {0}")]
    Judge(String),

    #[error("LLM judge timed out after {0} ms")]
    JudgeTimeout(u64),

    #[error("worker pool error: {0}")]
    WorkerPool(String),

    #[error("worker task timed out after {0} ms")]
    WorkerTimeout(u64),

    #[error("alert not found: {0}")]
    AlertNotFound(String),

    #[error("engine shut down")]
    ShutDown,

    #[error("SIEM dispatch error: {0}")]
    Siem(String),
}

pub type Result<T> = std::result::Result<T, CoachError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let cases: Vec<(CoachError, &str)> = vec![
            (CoachError::Config("bad range".into()), "config error: bad range"),
            (CoachError::RuleStore("save failed".into()), "rule store error: save failed"),
            (
                CoachError::SymlinkRefused("/tmp/rules.json".into()),
                "refusing to write through symlink: /tmp/rules.json",
            ),
            (CoachError::Judge("bad schema".into()), "LLM judge error: bad schema"),
            (CoachError::JudgeTimeout(1500), "LLM judge timed out after 1500 ms"),
            (CoachError::WorkerPool("worker gone".into()), "worker pool error: worker gone"),
            (CoachError::WorkerTimeout(5000), "worker task timed out after 5000 ms"),
            (CoachError::AlertNotFound("abc".into()), "alert not found: abc"),
            (CoachError::ShutDown, "engine shut down"),
            (CoachError::Siem("endpoint 500".into()), "SIEM dispatch error: endpoint 500"),
        ];
        for (err, expected) in cases {
            assert_eq!(err.to_string(), expected);
        }
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CoachError = io_err.into();
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{{bad").unwrap_err();
        let err: CoachError = json_err.into();
        assert!(err.to_string().starts_with("JSON error:"));
    }

    #[test]
    fn result_type_alias_works() {
        let ok: Result<i32> = Ok(42);
        assert_eq!(ok.unwrap(), 42);
        let err: Result<i32> = Err(CoachError::ShutDown);
        assert!(err.is_err());
    }
}
