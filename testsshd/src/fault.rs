//! Synthetic failure injection for scp sessions.
//!
//! A [`FaultController`] owns the immutable [`FailConfig`] and the connection
//! counter shared by every session of one server instance. Each session takes
//! exactly one ordinal when it is delivered and asks the controller, at each
//! [`Stage`] of the scp path, whether it should be failed there.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Stage of the scp path at which a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Before any subprocess is prepared.
    Session,
    /// After the subprocess is prepared, before it is started.
    Pipe,
    /// After the subprocess is started, before any byte is forwarded.
    Start,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Session => "session",
            Stage::Pipe => "pipe",
            Stage::Start => "start",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured fault mode. The empty string maps to [`FailMode::None`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FailMode {
    #[default]
    None,
    Session,
    Pipe,
    Start,
}

impl FailMode {
    /// The stage this mode fails at, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            FailMode::None => None,
            FailMode::Session => Some(Stage::Session),
            FailMode::Pipe => Some(Stage::Pipe),
            FailMode::Start => Some(Stage::Start),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self.stage() {
            Some(stage) => stage.as_str(),
            None => "",
        }
    }
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailMode::None => f.write_str("none"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown fail mode {0:?} (expected \"\", \"none\", \"session\", \"pipe\" or \"start\")")]
pub struct FailModeParseError(pub String);

impl FromStr for FailMode {
    type Err = FailModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(FailMode::None),
            "session" => Ok(FailMode::Session),
            "pipe" => Ok(FailMode::Pipe),
            "start" => Ok(FailMode::Start),
            _ => Err(FailModeParseError(s.to_string())),
        }
    }
}

impl TryFrom<String> for FailMode {
    type Error = FailModeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FailMode> for String {
    fn from(mode: FailMode) -> Self {
        mode.as_str().to_string()
    }
}

/// Immutable fault configuration, fixed at bootstrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailConfig {
    pub mode: FailMode,
    /// Connections with an ordinal strictly greater than this are failed.
    /// Zero or negative disables injection.
    pub fail_after: i64,
}

impl FailConfig {
    pub fn new(mode: FailMode, fail_after: i64) -> Self {
        Self { mode, fail_after }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != FailMode::None && self.fail_after > 0
    }

    /// Pure decision: should the connection with `ordinal` fail at `stage`?
    pub fn should_fail(&self, stage: Stage, ordinal: u64) -> bool {
        if !self.is_enabled() || self.mode.stage() != Some(stage) {
            return false;
        }
        // fail_after > 0 here, so the cast is lossless
        ordinal > self.fail_after as u64
    }
}

/// Monotonic, 1-based connection ordinal generator.
#[derive(Debug, Default)]
pub struct ConnectionCounter {
    accepted: AtomicU64,
}

impl ConnectionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next ordinal. Each call returns a distinct value.
    pub fn next(&self) -> u64 {
        self.accepted.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Number of ordinals handed out so far.
    pub fn count(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Fault configuration plus the per-server connection counter.
///
/// Shared behind an `Arc` by all connection handlers of one server; separate
/// servers in the same process never share a counter.
#[derive(Debug, Default)]
pub struct FaultController {
    config: FailConfig,
    connections: ConnectionCounter,
}

impl FaultController {
    pub fn new(config: FailConfig) -> Self {
        Self {
            config,
            connections: ConnectionCounter::new(),
        }
    }

    pub fn config(&self) -> FailConfig {
        self.config
    }

    /// Admit a delivered session and return its ordinal.
    pub fn admit(&self) -> u64 {
        self.connections.next()
    }

    pub fn admitted(&self) -> u64 {
        self.connections.count()
    }

    pub fn should_fail(&self, stage: Stage, ordinal: u64) -> bool {
        self.config.should_fail(stage, ordinal)
    }
}
