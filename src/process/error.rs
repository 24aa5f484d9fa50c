use std::time::Duration;

use super::ProcessId;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Process pool exhausted: {limit} slots in use")]
    PoolExhausted { limit: usize },

    #[error("Unknown process: {0}")]
    UnknownProcess(ProcessId),

    #[error("Process manager is shut down")]
    ShutDown,

    #[error("Process timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to spawn process: {command}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process {pid}: {source}")]
    SignalFailed {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Render a child exit as a human-readable error string.
///
/// A non-null signal takes precedence over the exit code. Exit code 0
/// without a signal still counts as an error at this call site: the caller
/// only reaches for this function when the child ended before doing its job.
pub fn format_process_error(exit_code: Option<i32>, signal: Option<i32>) -> String {
    match (exit_code, signal) {
        (_, Some(sig)) => format!("process terminated by signal {sig}"),
        (Some(0), None) | (None, None) => "process exited unexpectedly".to_string(),
        (Some(code), None) => format!("process exited with code {code}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_takes_precedence_over_exit_code() {
        assert_eq!(
            format_process_error(Some(1), Some(15)),
            "process terminated by signal 15"
        );
    }

    #[test]
    fn clean_exit_is_reported_as_unexpected() {
        assert_eq!(
            format_process_error(Some(0), None),
            "process exited unexpectedly"
        );
        assert_eq!(format_process_error(None, None), "process exited unexpectedly");
    }

    #[test]
    fn exit_code_is_reported() {
        assert_eq!(
            format_process_error(Some(2), None),
            "process exited with code 2"
        );
    }
}
