//! Out-of-band control commands sent up a chain of stages.

use serde::{Deserialize, Serialize};

use crate::selector::Selection;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeekCommand {
    /// Seconds, or ticks of the target time base with `stream_timebase`.
    pub time: f64,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub stream: Option<usize>,
    #[serde(default)]
    pub stream_timebase: bool,
}

impl SeekCommand {
    pub fn to_seconds(time: f64) -> Self {
        Self {
            time,
            min: None,
            max: None,
            stream: None,
            stream_timebase: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "c", rename_all = "kebab-case")]
pub enum Command {
    Seek(SeekCommand),
    Reselect {
        selection: Selection,
    },
    /// A command no stage of this crate knows; it comes back with `ran == false`.
    #[serde(skip)]
    Other(String),
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::Seek(_) => "seek",
            Command::Reselect { .. } => "reselect",
            Command::Other(name) => name,
        }
    }

    /// Decodes `{"c": <name>, ...}`; unknown names become [`Command::Other`].
    pub fn from_value(value: serde_json::Value) -> anyhow::Result<Self> {
        let name = value
            .get("c")
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("command without a \"c\" name"))?
            .to_string();
        match name.as_str() {
            "seek" | "reselect" => Ok(serde_json::from_value(value)?),
            _ => Ok(Command::Other(name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub ran: bool,
    pub success: bool,
    pub diagnostic: Vec<String>,
}

impl Default for CommandResult {
    fn default() -> Self {
        Self {
            ran: false,
            success: true,
            diagnostic: Vec::new(),
        }
    }
}

impl CommandResult {
    pub fn ok(&mut self) {
        self.ran = true;
        self.success = true;
    }

    pub fn fail(&mut self, diagnostic: impl std::fmt::Display) {
        self.ran = true;
        self.success = false;
        self.diagnostic.push(diagnostic.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_command_keeps_name() {
        let cmd = Command::from_value(serde_json::json!({"c": "pause", "at": 3})).unwrap();
        assert_eq!(cmd, Command::Other("pause".to_string()));
    }

    #[test]
    fn seek_defaults() {
        let cmd = Command::from_value(serde_json::json!({"c": "seek", "time": 1.5})).unwrap();
        match cmd {
            Command::Seek(seek) => {
                assert_eq!(seek.time, 1.5);
                assert!(seek.min.is_none() && seek.max.is_none() && seek.stream.is_none());
                assert!(!seek.stream_timebase);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn result_starts_unran() {
        let result = CommandResult::default();
        assert!(!result.ran && result.success && result.diagnostic.is_empty());
    }
}
