//! Song rotation.
//!
//! The DJ only depends on the `Rotation` trait; `LibraryRotation` is the
//! provided implementation. Selection weights toward tracks played least
//! recently and least often, and history survives restarts in a small JSON
//! document. A corrupt or missing state file degrades to an empty history.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub trait Rotation: Send {
    /// Pick the next song, excluding the currently playing one when possible.
    fn select_next(&mut self, exclude: Option<&Path>) -> Option<PathBuf>;

    /// Record a completed play. Called from DO with THINK-time metadata only.
    fn record_played(&mut self, path: &Path);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RotationState {
    #[serde(default)]
    play_counts: HashMap<String, u64>,
    /// Recently played paths, oldest first, capped.
    #[serde(default)]
    history: Vec<String>,
}

const HISTORY_CAP: usize = 20;

pub struct LibraryRotation {
    music_dir: PathBuf,
    state_file: PathBuf,
    tracks: Vec<PathBuf>,
    state: RotationState,
}

impl LibraryRotation {
    pub fn new(music_dir: impl Into<PathBuf>, state_file: impl Into<PathBuf>) -> Self {
        let music_dir = music_dir.into();
        let state_file = state_file.into();
        let state = Self::load_state(&state_file);
        let mut rotation = Self {
            music_dir,
            state_file,
            tracks: Vec::new(),
            state,
        };
        rotation.rescan();
        rotation
    }

    pub fn rescan(&mut self) {
        self.tracks = scan_audio_files(&self.music_dir);
        debug!(
            dir = %self.music_dir.display(),
            tracks = self.tracks.len(),
            "rotation library scanned"
        );
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn load_state(path: &Path) -> RotationState {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!("rotation state unreadable, starting fresh: {e}");
                    RotationState::default()
                }
            },
            Err(_) => RotationState::default(),
        }
    }

    fn save_state(&self) {
        if let Some(parent) = self.state_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&self.state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.state_file, json) {
                    warn!("failed to persist rotation state: {e}");
                }
            }
            Err(e) => warn!("failed to serialize rotation state: {e}"),
        }
    }

    /// Selection weight: unplayed tracks are strongly preferred, then fewer
    /// plays, then not-recently-played.
    fn weight(&self, track: &Path) -> u64 {
        let key = track.to_string_lossy();
        let plays = self.state.play_counts.get(key.as_ref()).copied().unwrap_or(0);
        let recency_penalty = self
            .state
            .history
            .iter()
            .rev()
            .position(|p| p.as_str() == key)
            .map(|idx| (HISTORY_CAP - idx.min(HISTORY_CAP)) as u64)
            .unwrap_or(0);
        let base = 100u64.saturating_sub(plays.min(90));
        base.saturating_sub(recency_penalty * 4).max(1)
    }
}

impl Rotation for LibraryRotation {
    fn select_next(&mut self, exclude: Option<&Path>) -> Option<PathBuf> {
        if self.tracks.is_empty() {
            self.rescan();
        }
        let candidates: Vec<&PathBuf> = self
            .tracks
            .iter()
            .filter(|t| Some(t.as_path()) != exclude)
            .collect();
        let candidates = if candidates.is_empty() {
            self.tracks.iter().collect()
        } else {
            candidates
        };
        if candidates.is_empty() {
            return None;
        }

        let mut rng = rand::thread_rng();
        let total: u64 = candidates.iter().map(|t| self.weight(t)).sum();
        if total == 0 {
            return candidates.choose(&mut rng).map(|t| (*t).clone());
        }
        let mut pick = rng.gen_range(0..total);
        for track in &candidates {
            let w = self.weight(track);
            if pick < w {
                return Some((*track).clone());
            }
            pick -= w;
        }
        candidates.last().map(|t| (*t).clone())
    }

    fn record_played(&mut self, path: &Path) {
        let key = path.to_string_lossy().into_owned();
        *self.state.play_counts.entry(key.clone()).or_insert(0) += 1;
        self.state.history.push(key);
        if self.state.history.len() > HISTORY_CAP {
            let overflow = self.state.history.len() - HISTORY_CAP;
            self.state.history.drain(..overflow);
        }
        self.save_state();
    }
}

/// Non-hidden regular files with an audio-looking extension.
pub fn scan_audio_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("mp3" | "flac" | "ogg" | "wav" | "m4a")
                )
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_library(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), b"x").unwrap();
        }
    }

    #[test]
    fn excludes_current_song() {
        let dir = tempfile::tempdir().unwrap();
        make_library(dir.path(), &["a.mp3", "b.mp3"]);
        let state = dir.path().join("rotation.json");
        let mut rotation = LibraryRotation::new(dir.path(), &state);

        let current = dir.path().join("a.mp3");
        for _ in 0..20 {
            let pick = rotation.select_next(Some(&current)).unwrap();
            assert_eq!(pick, dir.path().join("b.mp3"));
        }
    }

    #[test]
    fn single_track_library_still_selects() {
        let dir = tempfile::tempdir().unwrap();
        make_library(dir.path(), &["only.mp3"]);
        let state = dir.path().join("rotation.json");
        let mut rotation = LibraryRotation::new(dir.path(), &state);

        let only = dir.path().join("only.mp3");
        // Excluding the sole candidate falls back to the full library.
        assert_eq!(rotation.select_next(Some(&only)), Some(only));
    }

    #[test]
    fn empty_library_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("rotation.json");
        let mut rotation = LibraryRotation::new(dir.path().join("missing"), &state);
        assert_eq!(rotation.select_next(None), None);
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        make_library(dir.path(), &["a.mp3", "b.mp3"]);
        let state = dir.path().join("rotation.json");

        let played = dir.path().join("a.mp3");
        {
            let mut rotation = LibraryRotation::new(dir.path(), &state);
            rotation.record_played(&played);
            rotation.record_played(&played);
        }

        let rotation = LibraryRotation::new(dir.path(), &state);
        let key = played.to_string_lossy().into_owned();
        assert_eq!(rotation.state.play_counts.get(&key), Some(&2));
        assert_eq!(rotation.state.history.len(), 2);
    }

    #[test]
    fn corrupt_state_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        make_library(dir.path(), &["a.mp3"]);
        let state = dir.path().join("rotation.json");
        std::fs::write(&state, b"{not json").unwrap();

        let mut rotation = LibraryRotation::new(dir.path(), &state);
        assert!(rotation.state.history.is_empty());
        assert!(rotation.select_next(None).is_some());
    }

    #[test]
    fn played_tracks_are_deprioritised() {
        let dir = tempfile::tempdir().unwrap();
        make_library(dir.path(), &["hot.mp3", "cold.mp3"]);
        let state = dir.path().join("rotation.json");
        let mut rotation = LibraryRotation::new(dir.path(), &state);

        let hot = dir.path().join("hot.mp3");
        for _ in 0..50 {
            rotation.record_played(&hot);
        }
        let cold = dir.path().join("cold.mp3");
        let picks = (0..100)
            .filter(|_| rotation.select_next(None) == Some(cold.clone()))
            .count();
        // Heavily-played track should lose most draws.
        assert!(picks > 50, "cold picked only {picks}/100 times");
    }
}
