//! Wire types for Tower's HTTP control plane.
//!
//! Shared between Tower (serving) and Station (polling `/tower/buffer` for
//! adaptive pacing), so both sides agree on field names.

use serde::{Deserialize, Serialize};

/// Fallback source selector, as carried in `/control/source` and `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Tone,
    Silence,
    File,
}

impl SourceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceMode::Tone => "tone",
            SourceMode::Silence => "silence",
            SourceMode::File => "file",
        }
    }
}

impl std::str::FromStr for SourceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tone" => Ok(SourceMode::Tone),
            "silence" => Ok(SourceMode::Silence),
            "file" => Ok(SourceMode::File),
            other => Err(format!(
                "invalid source mode: {other} (must be 'tone', 'silence', or 'file')"
            )),
        }
    }
}

/// `GET /tower/buffer` response: fill level of the PCM input ring.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BufferStatus {
    pub fill: usize,
    pub capacity: usize,
}

/// `GET /status` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TowerStatus {
    pub source_mode: SourceMode,
    pub file_path: Option<String>,
    pub num_clients: usize,
    pub encoder_running: bool,
    pub uptime_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_queue: Option<BufferStatus>,
}

/// `POST /control/source` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceCommand {
    pub mode: SourceMode,
    #[serde(default)]
    pub file_path: Option<String>,
}
