use crate::exec::{self, ExecConfig, ScriptRunner};
use crate::protocol::{Request, Response};
use crate::script;
use anyhow::{anyhow, Result};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions::resource as semconv;
use serde_json::{json, Value};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info_span, Span};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug)]
struct ProtocolError {
	code: i64,
	message: String,
}

impl ProtocolError {
	fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into()
		}
	}
}

impl std::fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for ProtocolError {}

#[derive(Clone, Debug)]
pub struct Config {
	pub timeout_ms: u64,
	pub max_output_bytes: usize,
	pub osascript_path: String,
	pub otel_enabled: bool,
	pub otel_endpoint: String,
	pub otel_service_name: String,
	pub session_id: String,
}

impl Config {
	fn exec_config(&self) -> ExecConfig {
		ExecConfig {
			osascript_path: self.osascript_path.clone(),
			timeout_ms: self.timeout_ms,
			max_output_bytes: self.max_output_bytes
		}
	}
}

pub fn load_config() -> Result<Config> {
	let mut timeout_ms = exec::DEFAULT_TIMEOUT_MS;
	let mut max_output_bytes = exec::DEFAULT_MAX_OUTPUT_BYTES;
	let mut osascript_path = String::from(exec::DEFAULT_OSASCRIPT_PATH);
	let mut otel_enabled = true;
	let mut otel_endpoint = String::from("http://127.0.0.1:4317");
	let mut otel_service_name = String::from("spotify-mcp");
	let mut config_path: Option<String> = None;
	let mut print_schema = false;
	let mut args = std::env::args().skip(1);
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--timeout-ms" => {
				let value = args.next().ok_or_else(|| anyhow!("--timeout-ms requires a value"))?;
				timeout_ms = parse_positive_u64(&value, "--timeout-ms")?;
			}
			"--max-output-bytes" => {
				let value = args.next().ok_or_else(|| anyhow!("--max-output-bytes requires a value"))?;
				max_output_bytes = parse_positive_usize(&value, "--max-output-bytes")?;
			}
			"--osascript" => {
				let value = args.next().ok_or_else(|| anyhow!("--osascript requires a value"))?;
				osascript_path = value;
			}
			"--config" => {
				let value = args.next().ok_or_else(|| anyhow!("--config requires a value"))?;
				config_path = Some(value);
			}
			"--print-config-schema" => {
				print_schema = true;
			}
			"--otel-enabled" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-enabled requires a value"))?;
				otel_enabled = parse_bool(&value, "--otel-enabled")?;
			}
			"--otel-endpoint" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-endpoint requires a value"))?;
				otel_endpoint = value;
			}
			"--otel-service-name" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-service-name requires a value"))?;
				otel_service_name = value;
			}
			_ => return Err(anyhow!("unknown argument: {}", arg)),
		}
	}
	if let Ok(env_timeout) = std::env::var("SPOTIFY_MCP_TIMEOUT_MS") {
		if !env_timeout.trim().is_empty() {
			timeout_ms = parse_positive_u64(&env_timeout, "SPOTIFY_MCP_TIMEOUT_MS")?;
		}
	}
	if let Ok(env_bytes) = std::env::var("SPOTIFY_MCP_MAX_OUTPUT_BYTES") {
		if !env_bytes.trim().is_empty() {
			max_output_bytes = parse_positive_usize(&env_bytes, "SPOTIFY_MCP_MAX_OUTPUT_BYTES")?;
		}
	}
	if let Ok(env_path) = std::env::var("SPOTIFY_MCP_OSASCRIPT") {
		if !env_path.trim().is_empty() {
			osascript_path = env_path;
		}
	}
	if config_path.is_none() {
		if let Ok(env_config) = std::env::var("SPOTIFY_MCP_CONFIG") {
			if !env_config.trim().is_empty() {
				config_path = Some(env_config);
			}
		}
	}
	if let Ok(env_enabled) = std::env::var("SPOTIFY_MCP_OTEL_ENABLED") {
		if !env_enabled.trim().is_empty() {
			otel_enabled = parse_bool(&env_enabled, "SPOTIFY_MCP_OTEL_ENABLED")?;
		}
	}
	if let Ok(env_endpoint) = std::env::var("SPOTIFY_MCP_OTEL_ENDPOINT") {
		if !env_endpoint.trim().is_empty() {
			otel_endpoint = env_endpoint;
		}
	}
	if let Ok(env_service) = std::env::var("SPOTIFY_MCP_OTEL_SERVICE_NAME") {
		if !env_service.trim().is_empty() {
			otel_service_name = env_service;
		}
	}
	if print_schema {
		let schema = config_schema();
		let payload = serde_json::to_string_pretty(&schema)?;
		println!("{}", payload);
		std::process::exit(0);
	}
	let base = Config {
		timeout_ms,
		max_output_bytes,
		osascript_path,
		otel_enabled,
		otel_endpoint,
		otel_service_name,
		session_id: uuid::Uuid::new_v4().to_string(),
	};
	if let Some(path) = config_path {
		let override_value = load_config_value(&path)?;
		return apply_config_override(base, &override_value);
	}
	Ok(base)
}

fn parse_positive_u64(value: &str, label: &str) -> Result<u64> {
	let number: u64 = value.parse().map_err(|_| anyhow!("{} must be a positive integer", label))?;
	if number == 0 {
		return Err(anyhow!("{} must be a positive integer", label));
	}
	Ok(number)
}

fn parse_positive_usize(value: &str, label: &str) -> Result<usize> {
	Ok(parse_positive_u64(value, label)? as usize)
}

fn parse_bool(value: &str, label: &str) -> Result<bool> {
	match value.to_lowercase().as_str() {
		"1" | "true" | "yes" => Ok(true),
		"0" | "false" | "no" => Ok(false),
		_ => Err(anyhow!("{} must be a boolean", label)),
	}
}

fn config_schema() -> Value {
	json!({
		"$schema": "http://json-schema.org/draft-07/schema#",
		"title": "spotify-mcp configuration",
		"type": "object",
		"additionalProperties": false,
		"properties": {
			"timeout_ms": {
				"type": "integer",
				"minimum": 1,
				"description": "Wall-clock limit for one osascript invocation, in milliseconds."
			},
			"max_output_bytes": {
				"type": "integer",
				"minimum": 1,
				"description": "Maximum captured stdout size for one invocation."
			},
			"osascript": {
				"type": "string",
				"description": "Path to the AppleScript interpreter binary."
			},
			"otel_enabled": {
				"type": "boolean",
				"description": "Enable tracing export.",
				"scope": "configuration"
			},
			"otel_endpoint": {
				"type": "string",
				"description": "OTLP endpoint.",
				"scope": "configuration"
			},
			"otel_service_name": {
				"type": "string",
				"description": "OTEL service.name.",
				"scope": "configuration"
			}
		}
	})
}

fn load_config_value(path: &str) -> Result<Value> {
	let content = std::fs::read_to_string(path)
		.map_err(|err| anyhow!("failed to read config {}: {}", path, err))?;
	let value: Value = serde_json::from_str(&content)
		.map_err(|err| anyhow!("failed to parse config {}: {}", path, err))?;
	Ok(value)
}

fn apply_config_override(base: Config, value: &Value) -> Result<Config> {
	let obj = value.as_object().ok_or_else(|| anyhow!("config must be an object"))?;
	let mut next = base;
	for (key, value) in obj {
		match key.as_str() {
			"timeout_ms" => {
				if !value.is_null() {
					let number = value.as_u64()
						.filter(|number| *number > 0)
						.ok_or_else(|| anyhow!("timeout_ms must be a positive integer"))?;
					next.timeout_ms = number;
				}
			}
			"max_output_bytes" => {
				if !value.is_null() {
					let number = value.as_u64()
						.filter(|number| *number > 0)
						.ok_or_else(|| anyhow!("max_output_bytes must be a positive integer"))?;
					next.max_output_bytes = number as usize;
				}
			}
			"osascript" => {
				if !value.is_null() {
					next.osascript_path = value.as_str()
						.ok_or_else(|| anyhow!("osascript must be a string"))?
						.to_string();
				}
			}
			"otel_enabled" => {
				if !value.is_null() {
					next.otel_enabled = value.as_bool().ok_or_else(|| anyhow!("otel_enabled must be a boolean"))?;
				}
			}
			"otel_endpoint" => {
				if !value.is_null() {
					next.otel_endpoint = value.as_str()
						.ok_or_else(|| anyhow!("otel_endpoint must be a string"))?
						.to_string();
				}
			}
			"otel_service_name" => {
				if !value.is_null() {
					next.otel_service_name = value.as_str()
						.ok_or_else(|| anyhow!("otel_service_name must be a string"))?
						.to_string();
				}
			}
			_ => return Err(anyhow!("unknown config key: {}", key)),
		}
	}
	Ok(next)
}

pub fn init_tracing(config: &Config) {
	let _ = global::set_error_handler(|_| {});
	let resource = Resource::new(
		vec![
		opentelemetry::KeyValue::new(semconv::SERVICE_NAME, config.otel_service_name.clone()),
		opentelemetry::KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
		opentelemetry::KeyValue::new("mcp.session_id", config.session_id.clone()),
		]
	);
	let tracing_layer = if config.otel_enabled {
		let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(config.otel_endpoint.clone());
		let provider = opentelemetry_otlp::new_pipeline()
			.tracing()
			.with_exporter(exporter)
			.with_trace_config(sdktrace::Config::default().with_resource(resource))
			.install_batch(opentelemetry_sdk::runtime::Tokio)
			.ok()
			.and_then(|tracer| tracer.provider());
		if let Some(provider) = provider {
			let tracer = provider.tracer(config.otel_service_name.clone());
			global::set_tracer_provider(provider);
			Some(OpenTelemetryLayer::new(tracer))
		}
		else {
			None
		}
	}
	else {
		None
	};
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(false)
		.with_writer(std::io::stderr);
	let subscriber = tracing_subscriber::registry().with(fmt_layer);
	if let Some(layer) = tracing_layer {
		subscriber.with(layer).init();
	}
	else {
		subscriber.init();
	}
}

pub async fn run(config: Config) -> Result<()> {
	let stdin = io::stdin();
	let stdout = io::stdout();
	let mut reader = BufReader::new(stdin).lines();
	let mut writer = io::BufWriter::new(stdout);
	let mut config = config;
	while let Some(line) = reader.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let req: Request = match serde_json::from_str(&line) {
			Ok(req) => req,
			Err(err) => {
				let resp = Response::err(Value::Null, -32700, err.to_string());
				write_response(&mut writer, resp).await?;
				continue;
			}
		};
		if req.method == "initialize" {
			if let Err(err) = apply_initialize_config(&mut config, &req) {
				let resp = if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
					Response::err(req.id.clone(), protocol.code, protocol.message.clone())
				}
				else {
					Response::err(req.id.clone(), -32000, err.to_string())
				};
				write_response(&mut writer, resp).await?;
				continue;
			}
		}
		let resp = handle_request(&config, req).await;
		write_response(&mut writer, resp).await?;
	}
	Ok(())
}

fn apply_initialize_config(config: &mut Config, req: &Request) -> Result<()> {
	let Some(value) = req.params
		.get("capabilities")
		.and_then(|caps| caps.get("experimental"))
		.and_then(|exp| exp.get("configuration")) else {
		return Ok(());
	};
	let updated = apply_config_override(config.clone(), value)
		.map_err(|err| ProtocolError::new(-32602, err.to_string()))?;
	*config = updated;
	Ok(())
}

async fn handle_request(config: &Config, req: Request) -> Response {
	let method = req.method.clone();
	let tool_name = if method == "tools/call" {
		req.params
			.get("name")
			.and_then(Value::as_str)
			.map(|name| name.to_string())
	}
	else {
		None
	};
	let span = info_span!(
		"mcp.request",
		"mcp.session_id" = %config.session_id,
		"mcp.method" = %method,
		"mcp.tool_name" = tool_name.as_deref().unwrap_or(""),
		"mcp.is_error" = tracing::field::Empty,
	);
	let _guard = span.enter();
	match route(config, &req).await {
		Ok(value) => {
			record_result(&span, &value);
			Response::ok(req.id, value)
		}
		Err(err) => {
			span.record("mcp.is_error", true);
			if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
				Response::err(req.id, protocol.code, protocol.message.clone())
			}
			else {
				Response::err(req.id, -32000, err.to_string())
			}
		}
	}
}

fn record_result(span: &Span, value: &Value) {
	let is_error = value.get("isError")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	span.record("mcp.is_error", is_error);
}

async fn route(config: &Config, req: &Request) -> Result<Value> {
	match req.method.as_str() {
		"initialize" => Ok(
			json!({
				"serverInfo": {
                "name": "spotify-mcp",
                "version": env!("CARGO_PKG_VERSION")
            },
				"configSchema": config_schema(),
				"capabilities": {
                "tools": {
                    "list": true,
                    "call": true
                }
            }
			})
		),
		"tools/list" => Ok(json!({
			"tools": tool_definitions(),
		})),
		"tools/call" => {
			let name = req.params
				.get("name")
				.and_then(Value::as_str)
				.ok_or_else(|| ProtocolError::new(-32602, "name is required"))?;
			let arguments = req.params
				.get("arguments")
				.cloned()
				.unwrap_or_else(|| json!({}));
			if !arguments.is_object() {
				return Err(ProtocolError::new(-32602, "arguments must be an object").into());
			}
			let runner = exec::OsaScript::new(config.exec_config());
			Ok(execute_tool(&runner, name, &arguments).await)
		}
		_ => Err(ProtocolError::new(-32601, "method not found").into()),
	}
}

/// One call, one envelope. Lookup, validation and script construction all
/// happen before the interpreter is touched; any failure short-circuits
/// into an error envelope and the subprocess is never spawned.
async fn execute_tool(runner: &dyn ScriptRunner, name: &str, arguments: &Value) -> Value {
	let Some(tool) = script::find_tool(name) else {
		return error_envelope(&format!("Unknown tool: {}", name));
	};
	let command = match (tool.build)(arguments) {
		Ok(command) => command,
		Err(err) => return error_envelope(&err.to_string()),
	};
	match runner.run(&command).await {
		Ok(output) => success_envelope(&tool_message(name, &output)),
		Err(err) => error_envelope(&err.to_string()),
	}
}

fn success_envelope(text: &str) -> Value {
	json!({
		"content": [
            {
                "type": "text",
                "text": text
            }
        ]
	})
}

fn error_envelope(message: &str) -> Value {
	json!({
		"isError": true,
		"content": [
            {
                "type": "text",
                "text": format!("Error: {}", message)
            }
        ]
	})
}

/// Player commands produce no stdout; substitute a confirmation so the
/// caller always gets a non-empty text block. Queries pass through as-is.
fn tool_message(name: &str, output: &str) -> String {
	if !output.is_empty() {
		return output.to_string();
	}
	match name {
		"play" => "Playback resumed.".to_string(),
		"pause" => "Playback paused.".to_string(),
		"playpause" => "Toggled playback.".to_string(),
		"next_track" => "Skipped to the next track.".to_string(),
		"previous_track" => "Returned to the previous track.".to_string(),
		"play_track" => "Playback started.".to_string(),
		"set_volume" => "Volume updated.".to_string(),
		"set_position" => "Position updated.".to_string(),
		"set_repeat" => "Repeat updated.".to_string(),
		"set_shuffle" => "Shuffle updated.".to_string(),
		_ => "Done.".to_string(),
	}
}

fn tool_definitions() -> Vec<Value> {
	script::TOOLS.iter().map(tool_definition).collect()
}

fn tool_definition(tool: &script::ToolSpec) -> Value {
	let mut properties = serde_json::Map::new();
	let mut required = Vec::new();
	for param in tool.params {
		properties.insert(param.name.to_string(), param_schema(param));
		if param.required {
			required.push(Value::String(param.name.to_string()));
		}
	}
	json!({
		"name": tool.name,
		"description": tool.description,
		"inputSchema": {
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false
        },
		"annotations": {
            "readOnlyHint": tool.read_only,
            "idempotentHint": tool.idempotent
        }
	})
}

fn param_schema(param: &script::ParamSpec) -> Value {
	match param.kind {
		script::ParamKind::Integer { min, max } => json!({
			"type": "integer",
			"minimum": min,
			"maximum": max,
			"description": param.description
		}),
		script::ParamKind::Number { min, max } => {
			let mut schema = json!({
				"type": "number",
				"minimum": min,
				"description": param.description
			});
			if max.is_finite() {
				schema["maximum"] = json!(max);
			}
			schema
		}
		script::ParamKind::Boolean => json!({
			"type": "boolean",
			"description": param.description
		}),
		script::ParamKind::SpotifyUri => json!({
			"type": "string",
			"pattern": script::SPOTIFY_URI_PATTERN,
			"description": param.description
		}),
	}
}

async fn write_response(writer: &mut io::BufWriter<io::Stdout>, resp: Response) -> Result<()> {
	let line = serde_json::to_string(&resp)?;
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	Ok(())
}
