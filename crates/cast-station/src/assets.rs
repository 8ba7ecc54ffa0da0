//! DJ asset discovery.
//!
//! Layout under the asset dir:
//!
//! ```text
//!   intros/generic/*.mp3          intros/<song-stem>/*.mp3
//!   outros/generic/*.mp3          outros/<song-stem>/*.mp3
//!   ids/legal/*.mp3               ids/generic/*.mp3
//!   announcements/startup/*.mp3   announcements/shutdown/*.mp3
//! ```
//!
//! Rescans are rate-limited to once an hour so THINK never pays more than a
//! directory listing.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::rotation::scan_audio_files;

const RESCAN_FLOOR: Duration = Duration::from_secs(3600);

pub struct AssetLibrary {
    asset_dir: PathBuf,
    pub generic_intros: Vec<PathBuf>,
    pub generic_outros: Vec<PathBuf>,
    pub legal_ids: Vec<PathBuf>,
    pub generic_ids: Vec<PathBuf>,
    pub startup_announcements: Vec<PathBuf>,
    pub shutdown_announcements: Vec<PathBuf>,
    last_scan: Option<Instant>,
}

impl AssetLibrary {
    pub fn new(asset_dir: impl Into<PathBuf>) -> Self {
        let mut library = Self {
            asset_dir: asset_dir.into(),
            generic_intros: Vec::new(),
            generic_outros: Vec::new(),
            legal_ids: Vec::new(),
            generic_ids: Vec::new(),
            startup_announcements: Vec::new(),
            shutdown_announcements: Vec::new(),
            last_scan: None,
        };
        library.rescan();
        library
    }

    pub fn rescan(&mut self) {
        self.generic_intros = scan_audio_files(&self.asset_dir.join("intros/generic"));
        self.generic_outros = scan_audio_files(&self.asset_dir.join("outros/generic"));
        self.rescan_ids();
        self.startup_announcements = scan_audio_files(&self.asset_dir.join("announcements/startup"));
        self.shutdown_announcements =
            scan_audio_files(&self.asset_dir.join("announcements/shutdown"));
        self.last_scan = Some(Instant::now());
        debug!(
            intros = self.generic_intros.len(),
            outros = self.generic_outros.len(),
            legal_ids = self.legal_ids.len(),
            generic_ids = self.generic_ids.len(),
            "asset library scanned"
        );
    }

    pub fn rescan_ids(&mut self) {
        self.legal_ids = scan_audio_files(&self.asset_dir.join("ids/legal"));
        self.generic_ids = scan_audio_files(&self.asset_dir.join("ids/generic"));
    }

    /// Rescan at most once per hour.
    pub fn maybe_rescan(&mut self) {
        match self.last_scan {
            Some(at) if at.elapsed() < RESCAN_FLOOR => {}
            _ => self.rescan(),
        }
    }

    /// Per-song intros live under `intros/<song-stem>/`.
    pub fn intros_for_song(&self, song: &Path) -> Vec<PathBuf> {
        self.per_song("intros", song)
    }

    pub fn outros_for_song(&self, song: &Path) -> Vec<PathBuf> {
        self.per_song("outros", song)
    }

    fn per_song(&self, kind: &str, song: &Path) -> Vec<PathBuf> {
        match song.file_stem() {
            Some(stem) => scan_audio_files(&self.asset_dir.join(kind).join(stem)),
            None => Vec::new(),
        }
    }

    pub fn generic_id_pool_low(&self) -> bool {
        self.generic_ids.len() < 3
    }
}
