//! Line classifier: turns raw process output into lifecycle signals.
//!
//! Markers are plain substrings so each server distribution can supply its
//! own. An optional regex with a named `level` group flags error lines,
//! e.g. Minecraft: `/(?P<level>INFO|WARN|ERROR|DEBUG|FATAL)\]`.

use regex::Regex;
use serde::Serialize;

/// Level pattern used by vanilla, Paper and Spigot servers.
pub const MINECRAFT_LOG_PATTERN: &str = r"/(?P<level>INFO|WARN|ERROR|DEBUG|FATAL)\]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    RawLine,
    StartedMarker,
    ReadyMarker,
    StoppedMarker,
    ConnectedMarker,
    ErrorMarker,
}

/// A classified line. Not retained after processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputEvent {
    pub kind: OutputKind,
    pub text: String,
}

impl OutputEvent {
    pub fn new(kind: OutputKind, text: impl Into<String>) -> Self {
        Self { kind, text: text.into() }
    }

    pub fn raw(text: impl Into<String>) -> Self {
        Self::new(OutputKind::RawLine, text)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutputClassifier {
    /// Any one of these marks the process as launched.
    started: Vec<String>,
    /// All of these must appear on the same line.
    ready: Vec<String>,
    stopped: Vec<String>,
    connected: Vec<String>,
    errors: Vec<String>,
    level_pattern: Option<Regex>,
}

impl OutputClassifier {
    /// A classifier that reports every line as raw output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for a vanilla/Paper server.
    pub fn minecraft() -> Self {
        Self::new()
            .with_ready_markers(["Done (", "For help, type \"help\""])
            .with_stopped_markers(["All dimensions are saved"])
            .with_level_pattern(Some(MINECRAFT_LOG_PATTERN))
    }

    /// Defaults for an OpenSSH reverse tunnel. ssh prints nothing on success,
    /// so only failures are recognised.
    pub fn ssh_tunnel() -> Self {
        Self::new().with_error_markers([
            "Connection refused",
            "Permission denied",
            "Could not resolve hostname",
            "remote port forwarding failed",
            "Connection timed out",
        ])
    }

    pub fn with_started_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.started = collect_markers(markers);
        self
    }

    pub fn with_ready_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ready = collect_markers(markers);
        self
    }

    pub fn with_stopped_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stopped = collect_markers(markers);
        self
    }

    pub fn with_connected_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.connected = collect_markers(markers);
        self
    }

    pub fn with_error_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.errors = collect_markers(markers);
        self
    }

    /// Compile the level pattern. An invalid pattern is logged and ignored.
    pub fn with_level_pattern(mut self, pattern: Option<&str>) -> Self {
        self.level_pattern = pattern.and_then(|pat| match Regex::new(pat) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!("Invalid log_pattern '{}': {}, error lines will not be flagged", pat, e);
                None
            }
        });
        self
    }

    pub fn classify(&self, line: &str) -> OutputEvent {
        OutputEvent::new(self.kind_of(line), line)
    }

    fn kind_of(&self, line: &str) -> OutputKind {
        if !self.ready.is_empty() && self.ready.iter().all(|m| line.contains(m.as_str())) {
            return OutputKind::ReadyMarker;
        }
        if contains_any(line, &self.stopped) {
            return OutputKind::StoppedMarker;
        }
        if contains_any(line, &self.started) {
            return OutputKind::StartedMarker;
        }
        if contains_any(line, &self.connected) {
            return OutputKind::ConnectedMarker;
        }
        if contains_any(line, &self.errors) || is_error_level(line, self.level_pattern.as_ref()) {
            return OutputKind::ErrorMarker;
        }
        OutputKind::RawLine
    }
}

fn collect_markers<I, S>(markers: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    markers
        .into_iter()
        .map(Into::into)
        .filter(|m: &String| !m.is_empty())
        .collect()
}

fn contains_any(line: &str, markers: &[String]) -> bool {
    markers.iter().any(|m| line.contains(m.as_str()))
}

fn is_error_level(line: &str, pattern: Option<&Regex>) -> bool {
    let Some(re) = pattern else {
        return false;
    };
    re.captures(line)
        .and_then(|caps| caps.name("level"))
        .map(|level| matches!(level.as_str().to_uppercase().as_str(), "ERROR" | "FATAL"))
        .unwrap_or(false)
}
