//! Session-id discovery through the agent's debug log directory.
//!
//! The copilot child writes `<uuid>.log` (or `session-<uuid>.log`) into the
//! directory passed via `--log-dir` shortly after start. We poll for it and
//! inject a marker line into the stdout stream once found.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(600);

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
});

/// Extract a session id from a log file name, if it carries one.
pub fn session_id_from_filename(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".log")?;
    let stem = stem.strip_prefix("session-").unwrap_or(stem);
    UUID_RE.is_match(stem).then(|| stem.to_string())
}

/// Create a unique log directory for one task:
/// `<tmp>/<agent>_logs/<workdir-basename>/<timestamp>-<rand>/`.
pub fn create_log_dir(agent: &str, work_dir: &Path) -> std::io::Result<PathBuf> {
    let base = work_dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string());
    let suffix: u32 = rand::rng().random_range(0..1_000_000);
    let dir = std::env::temp_dir()
        .join(format!("{agent}_logs"))
        .join(base)
        .join(format!(
            "{}-{suffix:06}",
            chrono::Utc::now().timestamp_millis()
        ));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Poll `dir` until a session log appears or the timeout elapses.
pub async fn discover_session_id(
    dir: &Path,
    poll_interval: Duration,
    timeout: Duration,
) -> Option<String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(id) = scan_dir(dir).await {
            return Some(id);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn scan_dir(dir: &Path) -> Option<String> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        if let Some(id) = session_id_from_filename(&name.to_string_lossy()) {
            return Some(id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_matching() {
        assert_eq!(
            session_id_from_filename("550e8400-e29b-41d4-a716-446655440000.log"),
            Some("550e8400-e29b-41d4-a716-446655440000".to_string())
        );
        assert_eq!(
            session_id_from_filename("session-550e8400-e29b-41d4-a716-446655440000.log"),
            Some("550e8400-e29b-41d4-a716-446655440000".to_string())
        );
        assert_eq!(session_id_from_filename("debug.log"), None);
        assert_eq!(session_id_from_filename("550e8400-e29b-41d4-a716-446655440000"), None);
        // Uppercase hex is not the wire form.
        assert_eq!(
            session_id_from_filename("550E8400-E29B-41D4-A716-446655440000.log"),
            None
        );
    }

    #[tokio::test]
    async fn discovery_finds_late_appearing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("session-550e8400-e29b-41d4-a716-446655440000.log");
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            std::fs::write(path, "debug").unwrap();
        });

        let found = discover_session_id(
            dir.path(),
            Duration::from_millis(20),
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(
            found.as_deref(),
            Some("550e8400-e29b-41d4-a716-446655440000")
        );
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn discovery_times_out_without_log() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("other.log"), "x").unwrap();
        let found = discover_session_id(
            dir.path(),
            Duration::from_millis(10),
            Duration::from_millis(60),
        )
        .await;
        assert_eq!(found, None);
    }

    #[test]
    fn log_dir_layout_contains_agent_and_workdir() {
        let dir = create_log_dir("copilot", Path::new("/home/user/myproject")).unwrap();
        let rendered = dir.to_string_lossy();
        assert!(rendered.contains("copilot_logs"));
        assert!(rendered.contains("myproject"));
        assert!(dir.is_dir());
        std::fs::remove_dir_all(dir.parent().unwrap().parent().unwrap()).ok();
    }
}
