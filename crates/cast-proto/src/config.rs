//! Station and Tower configuration.
//!
//! Both processes load a TOML file; a missing file is created with defaults
//! so a fresh install has something to edit. Invalid values are fatal at
//! startup and nowhere else.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::wire::SourceMode;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn load_or_init<T>(path: &Path, default: impl FnOnce() -> T) -> Result<T, ConfigError>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    if !path.exists() {
        let config = default();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(content) = toml::to_string_pretty(&config) {
            let _ = std::fs::write(path, content);
        }
        return Ok(config);
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cast")
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cast")
}

// ── Station ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// PCM egress: unix socket path Tower listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Directory scanned by the rotation for songs.
    #[serde(default = "default_music_dir")]
    pub music_dir: PathBuf,
    /// Directory holding DJ assets (intros/, outros/, ids/, announcements/).
    #[serde(default = "default_dj_asset_dir")]
    pub dj_asset_dir: PathBuf,
    /// Rotation history persisted here as JSON.
    #[serde(default = "default_rotation_state_file")]
    pub rotation_state_file: PathBuf,
    /// Base URL of Tower's control plane, e.g. "http://127.0.0.1:8005".
    /// None disables adaptive pacing (exact nominal frame period).
    #[serde(default)]
    pub tower_control_url: Option<String>,
    /// Run the full tail-match assertion after each DO enqueue.
    #[serde(default)]
    pub strict_queue_asserts: bool,
    #[serde(default)]
    pub dj: DjPolicy,
}

/// Break-composition policy windows, all in seconds unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DjPolicy {
    /// A legal ID is mandatory once this much time has passed since the last.
    #[serde(default = "default_legal_id_interval")]
    pub legal_id_interval_secs: u64,
    /// Minimum spacing between generic IDs.
    #[serde(default = "default_generic_id_min")]
    pub generic_id_min_secs: u64,
    /// Talk never happens closer together than this.
    #[serde(default = "default_min_talk_spacing")]
    pub min_talk_spacing_secs: u64,
    /// Talk becomes mandatory after this much silence.
    #[serde(default = "default_max_talk_silence")]
    pub max_talk_silence_secs: u64,
    /// Intros/outros may not repeat within their last N uses.
    #[serde(default = "default_cooldown_len")]
    pub cooldown_len: usize,
    /// Probability of a talk inside the randomised-allow band.
    #[serde(default = "default_talk_allow_probability")]
    pub talk_allow_probability: f64,
    /// Probability of attaching an intro to the next song.
    #[serde(default = "default_intro_probability")]
    pub intro_probability: f64,
}

impl Default for DjPolicy {
    fn default() -> Self {
        Self {
            legal_id_interval_secs: default_legal_id_interval(),
            generic_id_min_secs: default_generic_id_min(),
            min_talk_spacing_secs: default_min_talk_spacing(),
            max_talk_silence_secs: default_max_talk_silence(),
            cooldown_len: default_cooldown_len(),
            talk_allow_probability: default_talk_allow_probability(),
            intro_probability: default_intro_probability(),
        }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            music_dir: default_music_dir(),
            dj_asset_dir: default_dj_asset_dir(),
            rotation_state_file: default_rotation_state_file(),
            tower_control_url: None,
            strict_queue_asserts: false,
            dj: DjPolicy::default(),
        }
    }
}

impl StationConfig {
    pub fn config_path() -> PathBuf {
        config_dir().join("station.toml")
    }

    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);
        let config: Self = load_or_init(&path, Self::default)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dj.cooldown_len == 0 {
            return Err(ConfigError::Invalid("dj.cooldown_len must be > 0".into()));
        }
        for (name, p) in [
            ("dj.talk_allow_probability", self.dj.talk_allow_probability),
            ("dj.intro_probability", self.dj.intro_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::Invalid(format!("{name} must be in 0..=1")));
            }
        }
        if self.dj.min_talk_spacing_secs >= self.dj.max_talk_silence_secs {
            return Err(ConfigError::Invalid(
                "dj.min_talk_spacing_secs must be below dj.max_talk_silence_secs".into(),
            ));
        }
        Ok(())
    }
}

// ── Tower ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TowerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// PCM ingress: unix socket path the router listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// MP3 encoder bitrate, e.g. "128k".
    #[serde(default = "default_bitrate")]
    pub bitrate: String,
    /// Fallback tone frequency in Hz.
    #[serde(default = "default_tone_frequency")]
    pub tone_frequency: f32,
    #[serde(default = "default_source_mode")]
    pub default_source: SourceMode,
    #[serde(default)]
    pub default_file_path: Option<PathBuf>,
    /// Watchdog marks the router dead after this much PCM silence.
    #[serde(default = "default_router_idle_timeout")]
    pub router_idle_timeout_sec: u64,
    /// Short gaps inside this window get digital silence instead of tone.
    #[serde(default = "default_pcm_grace")]
    pub pcm_grace_sec: u64,
    /// Slow-client eviction: how long a full client buffer may persist.
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,
    /// Slow-client eviction: per-client pending byte cap.
    #[serde(default = "default_client_buffer_bytes")]
    pub client_buffer_bytes: usize,
    /// Restart backoff schedule in ms; the last value repeats.
    #[serde(default = "default_encoder_backoff_ms")]
    pub encoder_backoff_ms: Vec<u64>,
    /// Consecutive failed starts before giving up (FAILED state).
    #[serde(default = "default_encoder_max_restarts")]
    pub encoder_max_restarts: u32,
    /// Drain-side stall threshold.
    #[serde(default = "default_encoder_stall_threshold_ms")]
    pub encoder_stall_threshold_ms: u64,
    /// Monitor-side coarse stall bound.
    #[serde(default = "default_encoder_stall_ms")]
    pub encoder_stall_ms: u64,
    #[serde(default = "default_jitter_min_chunks")]
    pub encoder_jitter_min_chunks: usize,
    #[serde(default = "default_jitter_recover_chunks")]
    pub encoder_jitter_recover_chunks: usize,
    #[serde(default = "default_jitter_read_interval_ms")]
    pub encoder_jitter_read_interval_ms: u64,
    #[serde(default = "default_target_chunk_rate")]
    pub encoder_target_chunk_rate: usize,
    #[serde(default = "default_pcm_ring_capacity")]
    pub pcm_ring_capacity: usize,
    #[serde(default = "default_mp3_ring_capacity")]
    pub mp3_ring_capacity: usize,
}

impl Default for TowerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            socket_path: default_socket_path(),
            bitrate: default_bitrate(),
            tone_frequency: default_tone_frequency(),
            default_source: default_source_mode(),
            default_file_path: None,
            router_idle_timeout_sec: default_router_idle_timeout(),
            pcm_grace_sec: default_pcm_grace(),
            client_timeout_ms: default_client_timeout_ms(),
            client_buffer_bytes: default_client_buffer_bytes(),
            encoder_backoff_ms: default_encoder_backoff_ms(),
            encoder_max_restarts: default_encoder_max_restarts(),
            encoder_stall_threshold_ms: default_encoder_stall_threshold_ms(),
            encoder_stall_ms: default_encoder_stall_ms(),
            encoder_jitter_min_chunks: default_jitter_min_chunks(),
            encoder_jitter_recover_chunks: default_jitter_recover_chunks(),
            encoder_jitter_read_interval_ms: default_jitter_read_interval_ms(),
            encoder_target_chunk_rate: default_target_chunk_rate(),
            pcm_ring_capacity: default_pcm_ring_capacity(),
            mp3_ring_capacity: default_mp3_ring_capacity(),
        }
    }
}

impl TowerConfig {
    pub fn config_path() -> PathBuf {
        config_dir().join("tower.toml")
    }

    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);
        let config: Self = load_or_init(&path, Self::default)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be 1-65535".into()));
        }
        match self.bitrate.strip_suffix('k') {
            Some(value) => match value.parse::<u32>() {
                Ok(v) if v > 0 => {}
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "invalid bitrate: {}",
                        self.bitrate
                    )))
                }
            },
            None => {
                return Err(ConfigError::Invalid(format!(
                    "invalid bitrate format: {} (must end with 'k', e.g. \"128k\")",
                    self.bitrate
                )))
            }
        }
        if self.tone_frequency <= 0.0 || self.tone_frequency > 20_000.0 {
            return Err(ConfigError::Invalid(format!(
                "invalid tone frequency: {} (must be 0-20000 Hz)",
                self.tone_frequency
            )));
        }
        if self.encoder_backoff_ms.is_empty() {
            return Err(ConfigError::Invalid(
                "encoder_backoff_ms cannot be empty".into(),
            ));
        }
        if self.encoder_backoff_ms.iter().any(|&d| d == 0) {
            return Err(ConfigError::Invalid(
                "all encoder backoff delays must be positive".into(),
            ));
        }
        if self.client_timeout_ms == 0 {
            return Err(ConfigError::Invalid("client_timeout_ms must be > 0".into()));
        }
        if self.client_buffer_bytes == 0 {
            return Err(ConfigError::Invalid(
                "client_buffer_bytes must be > 0".into(),
            ));
        }
        if self.encoder_jitter_recover_chunks > self.encoder_jitter_min_chunks {
            return Err(ConfigError::Invalid(
                "encoder_jitter_recover_chunks must not exceed encoder_jitter_min_chunks".into(),
            ));
        }
        if self.encoder_target_chunk_rate == 0 {
            return Err(ConfigError::Invalid(
                "encoder_target_chunk_rate must be > 0".into(),
            ));
        }
        if self.pcm_ring_capacity == 0 || self.mp3_ring_capacity == 0 {
            return Err(ConfigError::Invalid("ring capacities must be > 0".into()));
        }
        if self.default_source == SourceMode::File {
            match &self.default_file_path {
                Some(path) if path.exists() => {}
                Some(path) => {
                    return Err(ConfigError::Invalid(format!(
                        "default_file_path does not exist: {}",
                        path.display()
                    )))
                }
                None => {
                    return Err(ConfigError::Invalid(
                        "default_file_path is required when default_source is \"file\"".into(),
                    ))
                }
            }
        }
        Ok(())
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/cast-pcm.sock")
}

fn default_music_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cast/music")
}

fn default_dj_asset_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cast/dj")
}

fn default_rotation_state_file() -> PathBuf {
    data_dir().join("rotation.json")
}

fn default_legal_id_interval() -> u64 {
    3600
}

fn default_generic_id_min() -> u64 {
    180
}

fn default_min_talk_spacing() -> u64 {
    300
}

fn default_max_talk_silence() -> u64 {
    1800
}

fn default_cooldown_len() -> usize {
    5
}

fn default_talk_allow_probability() -> f64 {
    0.25
}

fn default_intro_probability() -> f64 {
    0.5
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8005
}

fn default_bitrate() -> String {
    "128k".to_string()
}

fn default_tone_frequency() -> f32 {
    440.0
}

fn default_source_mode() -> SourceMode {
    SourceMode::Tone
}

fn default_router_idle_timeout() -> u64 {
    30
}

fn default_pcm_grace() -> u64 {
    5
}

fn default_client_timeout_ms() -> u64 {
    250
}

fn default_client_buffer_bytes() -> usize {
    65536
}

fn default_encoder_backoff_ms() -> Vec<u64> {
    vec![1000, 2000, 4000, 8000, 10000]
}

fn default_encoder_max_restarts() -> u32 {
    5
}

fn default_encoder_stall_threshold_ms() -> u64 {
    400
}

fn default_encoder_stall_ms() -> u64 {
    5000
}

fn default_jitter_min_chunks() -> usize {
    16
}

fn default_jitter_recover_chunks() -> usize {
    8
}

fn default_jitter_read_interval_ms() -> u64 {
    15
}

fn default_target_chunk_rate() -> usize {
    1024
}

fn default_pcm_ring_capacity() -> usize {
    50
}

fn default_mp3_ring_capacity() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tower_config() {
        let config = TowerConfig::default();
        assert_eq!(config.port, 8005);
        assert_eq!(config.bitrate, "128k");
        assert_eq!(config.default_source, SourceMode::Tone);
        assert_eq!(config.encoder_backoff_ms, vec![1000, 2000, 4000, 8000, 10000]);
        assert_eq!(config.encoder_jitter_min_chunks, 16);
        config.validate().unwrap();
    }

    #[test]
    fn test_default_station_config() {
        let config = StationConfig::default();
        assert_eq!(config.dj.legal_id_interval_secs, 3600);
        assert_eq!(config.dj.cooldown_len, 5);
        assert!(!config.strict_queue_asserts);
        config.validate().unwrap();
    }

    #[test]
    fn bitrate_must_end_with_k() {
        let mut config = TowerConfig::default();
        config.bitrate = "128".to_string();
        assert!(config.validate().is_err());
        config.bitrate = "xk".to_string();
        assert!(config.validate().is_err());
        config.bitrate = "192k".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn file_source_requires_existing_path() {
        let mut config = TowerConfig::default();
        config.default_source = SourceMode::File;
        assert!(config.validate().is_err());
        config.default_file_path = Some(PathBuf::from("/does/not/exist.wav"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_backoff_schedule_rejected() {
        let mut config = TowerConfig::default();
        config.encoder_backoff_ms = vec![];
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_writes_default_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tower.toml");
        let config = TowerConfig::load(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(config.port, 8005);

        // Second load parses the file written by the first.
        let config = TowerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.port, 8005);
    }
}
