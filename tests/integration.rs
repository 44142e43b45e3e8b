#![cfg(unix)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

struct RpcClient {
	child: Child,
	stdin: ChildStdin,
	stdout: BufReader<ChildStdout>,
	next_id: u64,
}

impl RpcClient {
	fn spawn(osascript: &str, extra_args: &[&str]) -> Self {
		let bin = env!("CARGO_BIN_EXE_spotify-mcp");
		let mut command = Command::new(bin);
		command.arg("--osascript")
			.arg(osascript)
			.arg("--otel-enabled")
			.arg("false");
		for arg in extra_args {
			command.arg(arg);
		}
		let mut child = command.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.spawn()
			.expect("spawn spotify-mcp");
		let stdin = child.stdin
			.take()
			.expect("stdin");
		let stdout = child.stdout
			.take()
			.expect("stdout");
		Self {
			child,
			stdin,
			stdout: BufReader::new(stdout),
			next_id: 1
		}
	}
	fn send(&mut self, method: &str, params: Value) -> Value {
		let id = self.next_id;
		self.next_id += 1;
		let req = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params
		});
		let line = serde_json::to_string(&req).expect("serialize request");
		writeln!(self.stdin, "{}", line).expect("write request");
		self.stdin
			.flush()
			.expect("flush request");
		let mut resp_line = String::new();
		loop {
			resp_line.clear();
			let bytes = self.stdout
				.read_line(&mut resp_line)
				.expect("read response");
			if bytes == 0 {
				panic!("spotify-mcp exited unexpectedly");
			}
			let trimmed = resp_line.trim();
			if trimmed.is_empty() {
				continue;
			}
			let parsed: Value = match serde_json::from_str(trimmed) {
				Ok(value) => value,
				Err(_) => continue,
			};
			if parsed.get("id").and_then(Value::as_u64) == Some(id) {
				return parsed;
			}
		}
	}
}

impl Drop for RpcClient {
	fn drop(&mut self) {
		let _ = self.child.kill();
	}
}

/// Stand-in for osascript: a shell script that receives ["-e", script].
fn write_stub(dir: &Path, body: &str) -> String {
	let path = dir.join("fake-osascript");
	std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write stub");
	let mut perms = std::fs::metadata(&path).expect("stub metadata").permissions();
	perms.set_mode(0o755);
	std::fs::set_permissions(&path, perms).expect("chmod stub");
	path.to_string_lossy().to_string()
}

fn echo_stub(dir: &Path) -> String {
	write_stub(dir, "shift\nprintf '%s' \"$1\"")
}

fn envelope_text(result: &Value) -> &str {
	result.get("content")
		.and_then(Value::as_array)
		.and_then(|items| items.first())
		.and_then(|item| item.get("text"))
		.and_then(Value::as_str)
		.unwrap_or("")
}

#[test]
fn initialize_reports_server_info() {
	let dir = tempfile::tempdir().expect("tempdir");
	let stub = echo_stub(dir.path());
	let mut client = RpcClient::spawn(&stub, &[]);
	let resp = client.send("initialize", json!({}));
	let result = resp.get("result").expect("result");
	assert_eq!(
		result.get("serverInfo").and_then(|info| info.get("name")).and_then(Value::as_str),
		Some("spotify-mcp")
	);
	assert!(result.get("configSchema").is_some());
}

#[test]
fn tools_list_advertises_the_full_catalogue() {
	let dir = tempfile::tempdir().expect("tempdir");
	let stub = echo_stub(dir.path());
	let mut client = RpcClient::spawn(&stub, &[]);
	let resp = client.send("tools/list", json!({}));
	let tools = resp.get("result")
		.and_then(|result| result.get("tools"))
		.and_then(Value::as_array)
		.expect("tools");
	assert_eq!(tools.len(), 16);
	let set_volume = tools.iter()
		.find(|tool| tool.get("name").and_then(Value::as_str) == Some("set_volume"))
		.expect("set_volume");
	let volume = set_volume.get("inputSchema")
		.and_then(|schema| schema.get("properties"))
		.and_then(|props| props.get("volume"))
		.expect("volume schema");
	assert_eq!(volume.get("minimum"), Some(&json!(0)));
	assert_eq!(volume.get("maximum"), Some(&json!(100)));
}

#[test]
fn play_track_builds_an_escaped_player_command() {
	let dir = tempfile::tempdir().expect("tempdir");
	let stub = echo_stub(dir.path());
	let mut client = RpcClient::spawn(&stub, &[]);
	let resp = client.send("tools/call", json!({
		"name": "play_track",
		"arguments": { "uri": "spotify:track:4uLU6hMCjMI75M1A2tKUQC" }
	}));
	let result = resp.get("result").expect("result");
	assert!(result.get("isError").is_none());
	assert_eq!(
		envelope_text(result),
		"tell application \"Spotify\" to play track \"spotify:track:4uLU6hMCjMI75M1A2tKUQC\""
	);
}

#[test]
fn invalid_volume_is_rejected_before_execution() {
	let dir = tempfile::tempdir().expect("tempdir");
	// A stub that would leave a marker file if it ever ran.
	let marker = dir.path().join("executed");
	let stub = write_stub(
		dir.path(),
		&format!("touch {}\nshift\nprintf '%s' \"$1\"", marker.display())
	);
	let mut client = RpcClient::spawn(&stub, &[]);
	let resp = client.send("tools/call", json!({
		"name": "set_volume",
		"arguments": { "volume": 150 }
	}));
	let result = resp.get("result").expect("result");
	assert_eq!(result.get("isError").and_then(Value::as_bool), Some(true));
	assert!(envelope_text(result).starts_with("Error: invalid volume"));
	assert!(!marker.exists());
}

#[test]
fn unknown_tool_returns_a_uniform_envelope() {
	let dir = tempfile::tempdir().expect("tempdir");
	let stub = echo_stub(dir.path());
	let mut client = RpcClient::spawn(&stub, &[]);
	let resp = client.send("tools/call", json!({
		"name": "spotify_frobnicate",
		"arguments": {}
	}));
	let result = resp.get("result").expect("result");
	assert_eq!(result.get("isError").and_then(Value::as_bool), Some(true));
	assert_eq!(envelope_text(result), "Error: Unknown tool: spotify_frobnicate");
}

#[test]
fn missing_tool_name_is_a_protocol_error() {
	let dir = tempfile::tempdir().expect("tempdir");
	let stub = echo_stub(dir.path());
	let mut client = RpcClient::spawn(&stub, &[]);
	let resp = client.send("tools/call", json!({
		"arguments": {}
	}));
	let error = resp.get("error").expect("error");
	assert_eq!(error.get("code").and_then(Value::as_i64), Some(-32602));
	assert_eq!(error.get("message").and_then(Value::as_str), Some("name is required"));
}

#[test]
fn interpreter_failure_surfaces_as_error_envelope() {
	let dir = tempfile::tempdir().expect("tempdir");
	let stub = write_stub(dir.path(), "echo 'Spotify got an error: not running' >&2\nexit 1");
	let mut client = RpcClient::spawn(&stub, &[]);
	let resp = client.send("tools/call", json!({
		"name": "get_player_state",
		"arguments": {}
	}));
	let result = resp.get("result").expect("result");
	assert_eq!(result.get("isError").and_then(Value::as_bool), Some(true));
	assert!(envelope_text(result).contains("Spotify got an error"));
}

#[test]
fn stalled_interpreter_times_out_instead_of_hanging() {
	let dir = tempfile::tempdir().expect("tempdir");
	let stub = write_stub(dir.path(), "sleep 5");
	let mut client = RpcClient::spawn(&stub, &["--timeout-ms", "300"]);
	let resp = client.send("tools/call", json!({
		"name": "pause",
		"arguments": {}
	}));
	let result = resp.get("result").expect("result");
	assert_eq!(result.get("isError").and_then(Value::as_bool), Some(true));
	assert_eq!(envelope_text(result), "Error: script timed out after 300 ms");
}

#[test]
fn set_shuffle_twice_returns_identical_envelopes() {
	let dir = tempfile::tempdir().expect("tempdir");
	let stub = write_stub(dir.path(), "exit 0");
	let mut client = RpcClient::spawn(&stub, &[]);
	let params = json!({
		"name": "set_shuffle",
		"arguments": { "enabled": true }
	});
	let first = client.send("tools/call", params.clone());
	let second = client.send("tools/call", params);
	assert_eq!(first.get("result"), second.get("result"));
	assert_eq!(
		envelope_text(first.get("result").expect("result")),
		"Shuffle updated."
	);
}

#[test]
fn initialize_can_tighten_the_timeout() {
	let dir = tempfile::tempdir().expect("tempdir");
	let stub = write_stub(dir.path(), "sleep 5");
	let mut client = RpcClient::spawn(&stub, &[]);
	let _ = client.send("initialize", json!({
		"capabilities": {
			"experimental": {
				"configuration": { "timeout_ms": 250 }
			}
		}
	}));
	let resp = client.send("tools/call", json!({
		"name": "play",
		"arguments": {}
	}));
	let result = resp.get("result").expect("result");
	assert_eq!(envelope_text(result), "Error: script timed out after 250 ms");
}

#[test]
fn boolean_strings_are_rejected() {
	let dir = tempfile::tempdir().expect("tempdir");
	let stub = echo_stub(dir.path());
	let mut client = RpcClient::spawn(&stub, &[]);
	let resp = client.send("tools/call", json!({
		"name": "set_repeat",
		"arguments": { "enabled": "true" }
	}));
	let result = resp.get("result").expect("result");
	assert_eq!(result.get("isError").and_then(Value::as_bool), Some(true));
	assert!(envelope_text(result).starts_with("Error: invalid enabled"));
}
