use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1_048_576;
pub const DEFAULT_OSASCRIPT_PATH: &str = "osascript";

/// Limits for one interpreter invocation. Owned by the adapter at
/// construction rather than read from ambient state, so tests can tighten
/// the timeout and output cap per instance.
#[derive(Clone, Debug)]
pub struct ExecConfig {
	pub osascript_path: String,
	pub timeout_ms: u64,
	pub max_output_bytes: usize,
}

impl Default for ExecConfig {
	fn default() -> Self {
		Self {
			osascript_path: DEFAULT_OSASCRIPT_PATH.to_string(),
			timeout_ms: DEFAULT_TIMEOUT_MS,
			max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES
		}
	}
}

#[derive(Debug, Error)]
pub enum ExecError {
	#[error("failed to launch {0}: {1}")]
	Spawn(String, std::io::Error),
	#[error("script timed out after {0} ms")]
	Timeout(u64),
	#[error("script output exceeded {0} bytes")]
	OutputTooLarge(usize),
	#[error("script failed: {0}")]
	ExecutionFailed(String),
}

#[async_trait]
pub trait ScriptRunner: Send + Sync {
	async fn run(&self, script: &str) -> Result<String, ExecError>;
}

/// Runs one AppleScript per call via `osascript -e`. The script travels as
/// a single argv element; no shell ever re-parses it.
pub struct OsaScript {
	config: ExecConfig,
}

impl OsaScript {
	pub fn new(config: ExecConfig) -> Self {
		Self {
			config
		}
	}
}

#[async_trait]
impl ScriptRunner for OsaScript {
	async fn run(&self, script: &str) -> Result<String, ExecError> {
		let child = tokio::process::Command::new(&self.config.osascript_path)
			.arg("-e")
			.arg(script)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.map_err(|err| ExecError::Spawn(self.config.osascript_path.clone(), err))?;
		let deadline = Duration::from_millis(self.config.timeout_ms);
		// On timeout the future is dropped and kill_on_drop reaps the child.
		let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
			Ok(result) => result.map_err(|err| ExecError::Spawn(self.config.osascript_path.clone(), err))?,
			Err(_) => return Err(ExecError::Timeout(self.config.timeout_ms)),
		};
		if output.stdout.len() > self.config.max_output_bytes {
			return Err(ExecError::OutputTooLarge(self.config.max_output_bytes));
		}
		let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
		if !output.status.success() {
			let detail = if stderr.is_empty() {
				format!("exit status {}", output.status)
			}
			else {
				stderr
			};
			return Err(ExecError::ExecutionFailed(detail));
		}
		if !stderr.is_empty() {
			warn!("osascript diagnostics: {}", stderr);
		}
		Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
	}
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
	use super::*;
	use std::os::unix::fs::PermissionsExt;
	use std::path::Path;

	fn write_stub(dir: &Path, body: &str) -> String {
		let path = dir.join("fake-osascript");
		std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write stub");
		let mut perms = std::fs::metadata(&path).expect("stub metadata").permissions();
		perms.set_mode(0o755);
		std::fs::set_permissions(&path, perms).expect("chmod stub");
		path.to_string_lossy().to_string()
	}

	fn runner(path: String, timeout_ms: u64, max_output_bytes: usize) -> OsaScript {
		OsaScript::new(ExecConfig {
			osascript_path: path,
			timeout_ms,
			max_output_bytes
		})
	}

	#[tokio::test]
	async fn returns_trimmed_stdout() {
		let dir = tempfile::tempdir().expect("tempdir");
		let stub = write_stub(dir.path(), "printf '  playing  \\n'");
		let result = runner(stub, 5_000, 4_096).run("ignored").await.expect("run stub");
		assert_eq!(result, "playing");
	}

	#[tokio::test]
	async fn passes_script_as_single_argument() {
		let dir = tempfile::tempdir().expect("tempdir");
		let stub = write_stub(dir.path(), "shift\nprintf '%s' \"$1\"");
		let script = "tell application \"Spotify\" to play track \"spotify:track:abc1\"";
		let result = runner(stub, 5_000, 4_096).run(script).await.expect("run stub");
		assert_eq!(result, script);
	}

	#[tokio::test]
	async fn nonzero_exit_surfaces_stderr() {
		let dir = tempfile::tempdir().expect("tempdir");
		let stub = write_stub(dir.path(), "echo 'Spotify got an error' >&2\nexit 1");
		let err = runner(stub, 5_000, 4_096).run("ignored").await.unwrap_err();
		match err {
			ExecError::ExecutionFailed(detail) => assert!(detail.contains("Spotify got an error")),
			other => panic!("expected ExecutionFailed, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn stalled_interpreter_times_out() {
		let dir = tempfile::tempdir().expect("tempdir");
		let stub = write_stub(dir.path(), "sleep 5");
		let err = runner(stub, 200, 4_096).run("ignored").await.unwrap_err();
		assert!(matches!(err, ExecError::Timeout(200)));
	}

	#[tokio::test]
	async fn oversized_output_is_rejected() {
		let dir = tempfile::tempdir().expect("tempdir");
		let stub = write_stub(dir.path(), "head -c 2048 /dev/zero | tr '\\0' 'x'");
		let err = runner(stub, 5_000, 1_024).run("ignored").await.unwrap_err();
		assert!(matches!(err, ExecError::OutputTooLarge(1_024)));
	}

	#[tokio::test]
	async fn missing_interpreter_fails_to_spawn() {
		let err = runner("/nonexistent/osascript".to_string(), 1_000, 4_096)
			.run("ignored")
			.await
			.unwrap_err();
		assert!(matches!(err, ExecError::Spawn(_, _)));
	}
}
