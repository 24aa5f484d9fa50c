use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the child's stdio is expected to behave.
///
/// `Structured` children emit machine-parseable output (JSON lines),
/// `Interactive` children speak a bidirectional protocol over stdio, and
/// `Hybrid` children mix free text with discoverable side channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    Structured,
    Interactive,
    Hybrid,
}

/// Everything needed to spawn one agent child process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub mode: ProcessMode,
    pub timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    /// Payload written to the child's stdin right after spawn, after which
    /// stdin is closed. Agents that keep a stdio conversation open pass no
    /// payload and take the stdin handle themselves.
    pub stdin: Option<String>,
}

pub struct ProcessConfigBuilder {
    config: ProcessConfig,
}

impl ProcessConfigBuilder {
    pub fn new(program: &str) -> Self {
        Self {
            config: ProcessConfig {
                program: program.to_string(),
                args: Vec::new(),
                working_dir: None,
                env: HashMap::new(),
                mode: ProcessMode::Structured,
                timeout: None,
                idle_timeout: None,
                stdin: None,
            },
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.config.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.config
            .args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.config.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            self.config
                .env
                .insert(key.as_ref().to_string(), value.as_ref().to_string());
        }
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.config.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn mode(mut self, mode: ProcessMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, input: String) -> Self {
        self.config.stdin = Some(input);
        self
    }

    pub fn build(self) -> ProcessConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_args_and_env() {
        let config = ProcessConfigBuilder::new("claude")
            .arg("-p")
            .args(["--output-format", "stream-json"])
            .env("NO_COLOR", "1")
            .mode(ProcessMode::Structured)
            .timeout(Duration::from_secs(30))
            .build();

        assert_eq!(config.program, "claude");
        assert_eq!(config.args, vec!["-p", "--output-format", "stream-json"]);
        assert_eq!(config.env.get("NO_COLOR").map(String::as_str), Some("1"));
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert!(config.stdin.is_none());
    }
}
