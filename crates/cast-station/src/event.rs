//! Playable units and the DJ's single-use break plan.

use std::path::{Path, PathBuf};

pub type IntentId = uuid::Uuid;

/// What an audio segment is, for policy purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEventKind {
    Song,
    Intro,
    Outro,
    Talk,
    Id,
    Announcement,
    Fallback,
}

impl AudioEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEventKind::Song => "song",
            AudioEventKind::Intro => "intro",
            AudioEventKind::Outro => "outro",
            AudioEventKind::Talk => "talk",
            AudioEventKind::Id => "id",
            AudioEventKind::Announcement => "announcement",
            AudioEventKind::Fallback => "fallback",
        }
    }
}

/// Metadata recorded at THINK time so later phases never probe files.
#[derive(Debug, Clone, Default)]
pub struct EventMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_secs: Option<f64>,
}

/// An atomic playable unit. Events are values: cheaply cloneable, never
/// mutated after creation.
#[derive(Debug, Clone)]
pub struct AudioEvent {
    pub path: PathBuf,
    pub kind: AudioEventKind,
    pub gain: f32,
    pub metadata: Option<EventMetadata>,
    /// True only for the final shutdown announcement.
    pub is_terminal: bool,
    /// Identifier of the intent that produced this event. Only the startup
    /// announcement is permitted to carry none.
    pub intent_id: Option<IntentId>,
}

impl AudioEvent {
    pub fn new(path: impl Into<PathBuf>, kind: AudioEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
            gain: 1.0,
            metadata: None,
            is_terminal: false,
            intent_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn terminal(mut self) -> Self {
        self.is_terminal = true;
        self
    }

    pub fn is_song(&self) -> bool {
        self.kind == AudioEventKind::Song
    }
}

/// Cheap THINK-time metadata: title from the file stem. Anything richer
/// (tags, duration) belongs to an external probe and stays optional.
pub fn probe_metadata(path: &Path) -> EventMetadata {
    EventMetadata {
        title: path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned()),
        artist: None,
        duration_secs: None,
    }
}

/// The immutable, single-consumption plan for exactly one break.
///
/// Built by THINK, executed by DO, consumed at most once. A terminal intent
/// carries no next song and at most a shutdown announcement.
#[derive(Debug, Clone)]
pub struct DjIntent {
    pub intent_id: IntentId,
    pub next_song: Option<AudioEvent>,
    pub outro: Option<AudioEvent>,
    pub station_ids: Vec<AudioEvent>,
    pub intro: Option<AudioEvent>,
    pub announcement: Option<AudioEvent>,
    pub has_legal_id: bool,
    pub is_terminal: bool,
}

impl DjIntent {
    pub fn new_break(
        next_song: AudioEvent,
        outro: Option<AudioEvent>,
        station_ids: Vec<AudioEvent>,
        intro: Option<AudioEvent>,
        has_legal_id: bool,
    ) -> Self {
        let mut intent = Self {
            intent_id: IntentId::new_v4(),
            next_song: Some(next_song),
            outro,
            station_ids,
            intro,
            announcement: None,
            has_legal_id,
            is_terminal: false,
        };
        intent.tag_events();
        intent
    }

    pub fn new_terminal(announcement: Option<AudioEvent>) -> Self {
        let mut intent = Self {
            intent_id: IntentId::new_v4(),
            next_song: None,
            outro: None,
            station_ids: Vec::new(),
            intro: None,
            announcement: announcement.map(AudioEvent::terminal),
            has_legal_id: false,
            is_terminal: true,
        };
        intent.tag_events();
        intent
    }

    /// Propagate this intent's id onto every contained event.
    fn tag_events(&mut self) {
        let id = self.intent_id;
        for event in [
            self.next_song.as_mut(),
            self.outro.as_mut(),
            self.intro.as_mut(),
            self.announcement.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            event.intent_id = Some(id);
        }
        for event in &mut self.station_ids {
            event.intent_id = Some(id);
        }
    }

    /// Playout order: `[outro?, ids…, intro?, next_song]`, or for a terminal
    /// intent `[announcement?]`.
    pub fn expand(&self) -> Vec<AudioEvent> {
        if self.is_terminal {
            return self.announcement.iter().cloned().collect();
        }
        let mut events = Vec::with_capacity(3 + self.station_ids.len());
        events.extend(self.outro.iter().cloned());
        events.extend(self.station_ids.iter().cloned());
        events.extend(self.intro.iter().cloned());
        events.extend(self.next_song.iter().cloned());
        events
    }
}
