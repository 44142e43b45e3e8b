use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Lexical grammar for Spotify URIs: `spotify:<type>:<segment>(:<segment>)*`.
/// Purely syntactic; it does not check that the entity exists.
pub const SPOTIFY_URI_PATTERN: &str =
	r"^spotify:(track|album|artist|playlist|show|episode|user|collection):[A-Za-z0-9]+(:[A-Za-z0-9]+)*$";

static SPOTIFY_URI: Lazy<Regex> = Lazy::new(|| Regex::new(SPOTIFY_URI_PATTERN).expect("spotify uri regex"));

#[derive(Debug, Error)]
pub enum ToolError {
	#[error("{0} is required")]
	MissingArgument(&'static str),
	#[error("invalid {name}: {reason}")]
	InvalidArgument {
		name: &'static str,
		reason: String,
	},
}

/// Escape arbitrary text for embedding inside a double-quoted AppleScript
/// string literal. Non-text values collapse to the empty string so that
/// nothing untyped ever reaches a script.
pub fn escape_text(value: &Value) -> String {
	match value.as_str() {
		Some(text) => escape_str(text),
		None => String::new(),
	}
}

/// AppleScript literals define escapes for backslash, quote, newline,
/// carriage return and tab. Other control bytes cannot terminate a literal
/// and pass through unchanged.
pub fn escape_str(text: &str) -> String {
	let mut out = String::with_capacity(text.len());
	for ch in text.chars() {
		match ch {
			'\\' => out.push_str("\\\\"),
			'"' => out.push_str("\\\""),
			'\n' => out.push_str("\\n"),
			'\r' => out.push_str("\\r"),
			'\t' => out.push_str("\\t"),
			_ => out.push(ch),
		}
	}
	out
}

pub fn int_in_range(args: &Value, name: &'static str, min: i64, max: i64) -> Result<i64, ToolError> {
	let value = args.get(name).ok_or(ToolError::MissingArgument(name))?;
	let number = value.as_i64().ok_or_else(|| ToolError::InvalidArgument {
		name,
		reason: "must be an integer".to_string(),
	})?;
	if number < min || number > max {
		return Err(ToolError::InvalidArgument {
			name,
			reason: format!("must be between {} and {}", min, max),
		});
	}
	Ok(number)
}

pub fn number_in_range(args: &Value, name: &'static str, min: f64, max: f64) -> Result<f64, ToolError> {
	let value = args.get(name).ok_or(ToolError::MissingArgument(name))?;
	let number = value.as_f64()
		.filter(|number| number.is_finite())
		.ok_or_else(|| ToolError::InvalidArgument {
			name,
			reason: "must be a finite number".to_string(),
		})?;
	if number < min || number > max {
		let reason = if max.is_finite() {
			format!("must be between {} and {}", min, max)
		}
		else {
			format!("must be at least {}", min)
		};
		return Err(ToolError::InvalidArgument {
			name,
			reason
		});
	}
	Ok(number)
}

/// Declared-type booleans only; the strings "true"/"false" are rejected.
pub fn boolean(args: &Value, name: &'static str) -> Result<bool, ToolError> {
	let value = args.get(name).ok_or(ToolError::MissingArgument(name))?;
	value.as_bool().ok_or_else(|| ToolError::InvalidArgument {
		name,
		reason: "must be a boolean".to_string(),
	})
}

pub fn spotify_uri(args: &Value, name: &'static str) -> Result<String, ToolError> {
	let value = args.get(name).ok_or(ToolError::MissingArgument(name))?;
	check_uri(value, name)
}

pub fn optional_spotify_uri(args: &Value, name: &'static str) -> Result<Option<String>, ToolError> {
	match args.get(name) {
		None | Some(Value::Null) => Ok(None),
		Some(value) => check_uri(value, name).map(Some),
	}
}

fn check_uri(value: &Value, name: &'static str) -> Result<String, ToolError> {
	let text = value.as_str().ok_or_else(|| ToolError::InvalidArgument {
		name,
		reason: "must be a string".to_string(),
	})?;
	if !SPOTIFY_URI.is_match(text) {
		return Err(ToolError::InvalidArgument {
			name,
			reason: format!("not a valid Spotify URI: {}", text),
		});
	}
	Ok(text.to_string())
}

fn tell(command: &str) -> String {
	format!("tell application \"Spotify\" to {}", command)
}

/// The `play track` player command. URIs are validated against the grammar
/// before this point and escaped here regardless, so a relaxed grammar can
/// never reopen an injection path.
pub fn play_track_command(uri: &Value, context: Option<&Value>) -> String {
	match context {
		Some(context) => format!("play track \"{}\" in context \"{}\"", escape_text(uri), escape_text(context)),
		None => format!("play track \"{}\"", escape_text(uri)),
	}
}

const CURRENT_TRACK_SCRIPT: &str = r#"tell application "Spotify"
	if player state is stopped then
		return "No track is currently playing"
	end if
	set trackName to name of current track
	set trackArtist to artist of current track
	set trackAlbum to album of current track
	set trackDuration to duration of current track
	set trackPopularity to popularity of current track
	set trackId to id of current track
	set trackUrl to spotify url of current track
	return "Track: " & trackName & "\nArtist: " & trackArtist & "\nAlbum: " & trackAlbum & "\nDuration: " & (trackDuration / 1000) & "s\nPopularity: " & trackPopularity & "\nID: " & trackId & "\nURL: " & trackUrl
end tell"#;

fn build_play(_args: &Value) -> Result<String, ToolError> {
	Ok(tell("play"))
}

fn build_pause(_args: &Value) -> Result<String, ToolError> {
	Ok(tell("pause"))
}

fn build_playpause(_args: &Value) -> Result<String, ToolError> {
	Ok(tell("playpause"))
}

fn build_next_track(_args: &Value) -> Result<String, ToolError> {
	Ok(tell("next track"))
}

fn build_previous_track(_args: &Value) -> Result<String, ToolError> {
	Ok(tell("previous track"))
}

fn build_play_track(args: &Value) -> Result<String, ToolError> {
	spotify_uri(args, "uri")?;
	let context = optional_spotify_uri(args, "context")?;
	let command = match context {
		Some(_) => play_track_command(&args["uri"], Some(&args["context"])),
		None => play_track_command(&args["uri"], None),
	};
	Ok(tell(&command))
}

fn build_get_current_track(_args: &Value) -> Result<String, ToolError> {
	Ok(CURRENT_TRACK_SCRIPT.to_string())
}

fn build_get_player_state(_args: &Value) -> Result<String, ToolError> {
	Ok(tell("return player state as string"))
}

fn build_set_volume(args: &Value) -> Result<String, ToolError> {
	let volume = int_in_range(args, "volume", 0, 100)?;
	Ok(tell(&format!("set sound volume to {}", volume)))
}

fn build_get_volume(_args: &Value) -> Result<String, ToolError> {
	Ok(tell("return sound volume"))
}

fn build_set_position(args: &Value) -> Result<String, ToolError> {
	let position = number_in_range(args, "position", 0.0, f64::INFINITY)?;
	Ok(tell(&format!("set player position to {}", position)))
}

fn build_get_position(_args: &Value) -> Result<String, ToolError> {
	Ok(tell("return player position"))
}

fn build_set_repeat(args: &Value) -> Result<String, ToolError> {
	let enabled = boolean(args, "enabled")?;
	Ok(tell(&format!("set repeating to {}", enabled)))
}

fn build_get_repeat(_args: &Value) -> Result<String, ToolError> {
	Ok(tell("return repeating"))
}

fn build_set_shuffle(args: &Value) -> Result<String, ToolError> {
	let enabled = boolean(args, "enabled")?;
	Ok(tell(&format!("set shuffling to {}", enabled)))
}

fn build_get_shuffle(_args: &Value) -> Result<String, ToolError> {
	Ok(tell("return shuffling"))
}

#[derive(Clone, Copy, Debug)]
pub enum ParamKind {
	Integer { min: i64, max: i64 },
	Number { min: f64, max: f64 },
	Boolean,
	SpotifyUri,
}

pub struct ParamSpec {
	pub name: &'static str,
	pub kind: ParamKind,
	pub required: bool,
	pub description: &'static str,
}

/// One catalogue entry: schema, advisory annotations and the builder that
/// validates arguments and produces the AppleScript to run. Adding a tool
/// is a data addition here, not a control-flow edit in the dispatcher.
pub struct ToolSpec {
	pub name: &'static str,
	pub description: &'static str,
	pub params: &'static [ParamSpec],
	pub read_only: bool,
	pub idempotent: bool,
	pub build: fn(&Value) -> Result<String, ToolError>,
}

pub static TOOLS: &[ToolSpec] = &[
	ToolSpec {
		name: "play",
		description: "Resume playback in Spotify",
		params: &[],
		read_only: false,
		idempotent: true,
		build: build_play,
	},
	ToolSpec {
		name: "pause",
		description: "Pause playback in Spotify",
		params: &[],
		read_only: false,
		idempotent: true,
		build: build_pause,
	},
	ToolSpec {
		name: "playpause",
		description: "Toggle between playing and paused",
		params: &[],
		read_only: false,
		idempotent: false,
		build: build_playpause,
	},
	ToolSpec {
		name: "next_track",
		description: "Skip to the next track",
		params: &[],
		read_only: false,
		idempotent: false,
		build: build_next_track,
	},
	ToolSpec {
		name: "previous_track",
		description: "Go back to the previous track",
		params: &[],
		read_only: false,
		idempotent: false,
		build: build_previous_track,
	},
	ToolSpec {
		name: "play_track",
		description: "Play a specific track, album, playlist or other Spotify entity by URI",
		params: &[
			ParamSpec {
				name: "uri",
				kind: ParamKind::SpotifyUri,
				required: true,
				description: "Spotify URI of the entity to play, e.g. spotify:track:4uLU6hMCjMI75M1A2tKUQC.",
			},
			ParamSpec {
				name: "context",
				kind: ParamKind::SpotifyUri,
				required: false,
				description: "Optional context URI (album or playlist) to play the track within.",
			},
		],
		read_only: false,
		idempotent: false,
		build: build_play_track,
	},
	ToolSpec {
		name: "get_current_track",
		description: "Get name, artist, album, duration, popularity, id and url of the current track",
		params: &[],
		read_only: true,
		idempotent: true,
		build: build_get_current_track,
	},
	ToolSpec {
		name: "get_player_state",
		description: "Get the player state (playing, paused or stopped)",
		params: &[],
		read_only: true,
		idempotent: true,
		build: build_get_player_state,
	},
	ToolSpec {
		name: "set_volume",
		description: "Set the playback volume",
		params: &[
			ParamSpec {
				name: "volume",
				kind: ParamKind::Integer {
					min: 0,
					max: 100
				},
				required: true,
				description: "Volume between 0 and 100.",
			},
		],
		read_only: false,
		idempotent: true,
		build: build_set_volume,
	},
	ToolSpec {
		name: "get_volume",
		description: "Get the playback volume",
		params: &[],
		read_only: true,
		idempotent: true,
		build: build_get_volume,
	},
	ToolSpec {
		name: "set_position",
		description: "Seek to a position in the current track",
		params: &[
			ParamSpec {
				name: "position",
				kind: ParamKind::Number {
					min: 0.0,
					max: f64::INFINITY
				},
				required: true,
				description: "Position in seconds from the start of the track.",
			},
		],
		read_only: false,
		idempotent: true,
		build: build_set_position,
	},
	ToolSpec {
		name: "get_position",
		description: "Get the playback position in the current track",
		params: &[],
		read_only: true,
		idempotent: true,
		build: build_get_position,
	},
	ToolSpec {
		name: "set_repeat",
		description: "Enable or disable repeat",
		params: &[
			ParamSpec {
				name: "enabled",
				kind: ParamKind::Boolean,
				required: true,
				description: "True to enable repeat, false to disable it.",
			},
		],
		read_only: false,
		idempotent: true,
		build: build_set_repeat,
	},
	ToolSpec {
		name: "get_repeat",
		description: "Get whether repeat is enabled",
		params: &[],
		read_only: true,
		idempotent: true,
		build: build_get_repeat,
	},
	ToolSpec {
		name: "set_shuffle",
		description: "Enable or disable shuffle",
		params: &[
			ParamSpec {
				name: "enabled",
				kind: ParamKind::Boolean,
				required: true,
				description: "True to enable shuffle, false to disable it.",
			},
		],
		read_only: false,
		idempotent: true,
		build: build_set_shuffle,
	},
	ToolSpec {
		name: "get_shuffle",
		description: "Get whether shuffle is enabled",
		params: &[],
		read_only: true,
		idempotent: true,
		build: build_get_shuffle,
	},
];

pub fn find_tool(name: &str) -> Option<&'static ToolSpec> {
	TOOLS.iter().find(|tool| tool.name == name)
}
