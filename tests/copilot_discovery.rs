//! Plain-text executor end to end against a fake copilot binary: the
//! session id appears in the log directory mid-run and gets injected into
//! the normalized stream as a system message.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use conductor::agents::{AgentConfig, AgentExecutor, CopilotExecutor};
use conductor::engine::Task;
use conductor::events::{apply_patch, EntryType, NormalizedEntry};
use conductor::process::ProcessManager;

const SESSION_UUID: &str = "550e8400-e29b-41d4-a716-446655440000";

/// A fake copilot: consumes the prompt on stdin, emits some text, writes
/// `session-<uuid>.log` into the `--log-dir` after 300 ms, emits more text.
fn fake_copilot_script(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("fake-copilot.sh");
    let script = format!(
        r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "fake-copilot 0.0.1"
  exit 0
fi
logdir=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--log-dir" ]; then
    logdir="$arg"
  fi
  prev="$arg"
done
cat > /dev/null
echo "Working on your request"
sleep 0.3
touch "$logdir/session-{SESSION_UUID}.log"
sleep 0.3
echo "All done"
exit 0
"#
    );
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

#[tokio::test]
async fn session_id_is_discovered_and_injected() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_copilot_script(dir.path());

    let executor = CopilotExecutor::new(AgentConfig {
        program: Some(script.to_string_lossy().to_string()),
        ..AgentConfig::default()
    })
    .with_discovery_timing(Duration::from_millis(50), Duration::from_secs(10));

    let manager = Arc::new(ProcessManager::new(1));
    let task = Task::new("copilot-1", "custom", "say hello", dir.path());

    let mut child = executor.execute_task(&task, &manager).await.unwrap();
    let mut normalizer = executor.normalizer(dir.path());

    let mut entries: Vec<NormalizedEntry> = Vec::new();
    while let Some(line) = child.lines.recv().await {
        for patch in normalizer.process_line(&line) {
            apply_patch(&mut entries, patch);
        }
    }
    for patch in normalizer.flush() {
        apply_patch(&mut entries, patch);
    }

    let outcome = child.exit.await.unwrap();
    assert!(outcome.success());
    manager.release(child.process_id).await.unwrap();

    // The marker surfaced as a system message carrying the session id.
    let marker = entries
        .iter()
        .find(|entry| entry.entry_type == EntryType::SystemMessage)
        .expect("expected a session marker entry");
    assert!(marker.content.contains(SESSION_UUID));
    assert_eq!(marker.metadata.session_id.as_deref(), Some(SESSION_UUID));

    // The surrounding text came through as assistant paragraphs.
    let texts: Vec<&str> = entries
        .iter()
        .filter(|entry| entry.entry_type == EntryType::AssistantMessage)
        .map(|entry| entry.content.as_str())
        .collect();
    assert!(texts.iter().any(|text| text.contains("Working on your request")));
    assert!(texts.iter().any(|text| text.contains("All done")));

    // Indices never repeat.
    let mut indices: Vec<u64> = entries.iter().map(|entry| entry.index).collect();
    let before = indices.len();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices.len(), before);
}

#[tokio::test]
async fn discovery_timeout_does_not_fail_the_task() {
    let dir = tempfile::tempdir().unwrap();
    // This fake never writes a session log.
    let path = dir.path().join("fake-quiet.sh");
    std::fs::write(
        &path,
        "#!/bin/sh\ncat > /dev/null\necho \"quiet output\"\nexit 0\n",
    )
    .unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();

    let executor = CopilotExecutor::new(AgentConfig {
        program: Some(path.to_string_lossy().to_string()),
        ..AgentConfig::default()
    })
    .with_discovery_timing(Duration::from_millis(20), Duration::from_millis(200));

    let manager = Arc::new(ProcessManager::new(1));
    let task = Task::new("copilot-2", "custom", "hello", dir.path());

    let mut child = executor.execute_task(&task, &manager).await.unwrap();
    let mut lines = Vec::new();
    while let Some(line) = child.lines.recv().await {
        lines.push(line);
    }
    let outcome = child.exit.await.unwrap();

    assert!(outcome.success());
    assert!(lines.iter().any(|line| line.contains("quiet output")));
    assert!(!lines.iter().any(|line| line.starts_with("[copilot-session]")));
    manager.release(child.process_id).await.unwrap();
}
