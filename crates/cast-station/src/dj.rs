//! The DJ: THINK/DO break composition.
//!
//! THINK runs when a segment starts and makes every decision for the next
//! break, committing the result as a [`DjIntent`]. DO runs when the segment
//! finishes and only executes the pre-formed intent: it enqueues the events,
//! updates history from metadata recorded at THINK time, and schedules
//! deferred prep. DO never decides anything.
//!
//! The DJ holds a queue-writing handle, not the engine, so the
//! engine→listener→DJ→queue chain has no cycle.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use cast_proto::config::DjPolicy;

use crate::assets::AssetLibrary;
use crate::engine::SegmentListener;
use crate::event::{probe_metadata, AudioEvent, AudioEventKind, DjIntent, IntentId};
use crate::queue::{PlayoutQueue, QueueError};
use crate::rotation::Rotation;

#[derive(Debug, thiserror::Error)]
pub enum DjError {
    #[error("cross-intent leakage at queue head: head={head}, executing={executing}")]
    CrossIntentLeakage { head: IntentId, executing: IntentId },
    #[error("queue must be empty at the startup DO boundary, found {queued} events")]
    QueueNotEmptyAtStartup { queued: usize },
    #[error("non-terminal enqueue attempted during draining")]
    EnqueueDuringDraining,
    #[error("queue tail does not match the executed intent")]
    TailMismatch,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Queue-writing capability handed to the DJ. Deliberately not the engine.
#[derive(Clone)]
pub struct QueueHandle {
    queue: Arc<PlayoutQueue>,
}

impl QueueHandle {
    pub fn new(queue: Arc<PlayoutQueue>) -> Self {
        Self { queue }
    }

    pub fn enqueue_all(&self, events: Vec<AudioEvent>) -> Result<(), QueueError> {
        self.queue.enqueue_all(events)
    }

    pub fn peek_intent_id(&self) -> Option<IntentId> {
        self.queue.peek_intent_id()
    }

    pub fn all_intent_ids(&self) -> Vec<IntentId> {
        self.queue.all_intent_ids()
    }

    pub fn get_tail(&self, n: usize) -> Vec<AudioEvent> {
        self.queue.get_tail(n)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Deferred prep scheduled during DO and drained at the next THINK. Each
/// variant carries exactly its inputs and only refreshes caches for future
/// segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tickler {
    GenerateIntro { song: PathBuf },
    GenerateOutro { song: PathBuf },
    RefillGenericIds,
}

/// Mutable DJ history, updated only from intent metadata during DO.
#[derive(Debug, Default)]
pub struct DjState {
    pub last_legal_id: Option<DateTime<Utc>>,
    pub last_generic_id: Option<DateTime<Utc>>,
    pub last_talk: Option<DateTime<Utc>>,
    pub intro_history: Vec<PathBuf>,
    pub outro_history: Vec<PathBuf>,
    pub played_songs: Vec<PathBuf>,
}

const PLAYED_HISTORY_CAP: usize = 10;

impl DjState {
    fn record_song(&mut self, path: &Path) {
        self.played_songs.push(path.to_path_buf());
        if self.played_songs.len() > PLAYED_HISTORY_CAP {
            self.played_songs.remove(0);
        }
    }
}

pub struct DjCore {
    policy: DjPolicy,
    rotation: Box<dyn Rotation>,
    assets: AssetLibrary,
    queue: QueueHandle,
    state: DjState,
    current_intent: Option<DjIntent>,
    ticklers: Vec<Tickler>,
    draining: bool,
    terminal_enqueued: bool,
    strict: bool,
}

impl DjCore {
    pub fn new(
        policy: DjPolicy,
        rotation: Box<dyn Rotation>,
        assets: AssetLibrary,
        queue: QueueHandle,
        strict: bool,
    ) -> Self {
        Self {
            policy,
            rotation,
            assets,
            queue,
            state: DjState::default(),
            current_intent: None,
            ticklers: Vec::new(),
            draining: false,
            terminal_enqueued: false,
            strict,
        }
    }

    /// Lifecycle-scoped latch; only a restart clears it.
    pub fn set_draining(&mut self) {
        self.draining = true;
    }

    pub fn terminal_enqueued(&self) -> bool {
        self.terminal_enqueued
    }

    pub fn current_intent(&self) -> Option<&DjIntent> {
        self.current_intent.as_ref()
    }

    /// Pick the startup announcement, if any. It is injected directly as the
    /// active segment by the lifecycle controller and carries no intent_id.
    pub fn take_startup_announcement(&mut self) -> Option<AudioEvent> {
        let pool: Vec<&PathBuf> = self
            .assets
            .startup_announcements
            .iter()
            .filter(|p| p.exists())
            .collect();
        let path = pool.choose(&mut rand::thread_rng()).map(|p| (*p).clone())?;
        info!(path = %path.display(), "startup announcement selected");
        Some(
            AudioEvent::new(path.clone(), AudioEventKind::Announcement)
                .with_metadata(probe_metadata(&path)),
        )
    }

    /// First break when no startup announcement is configured: THINK and DO
    /// back to back against an empty queue.
    pub fn bootstrap_first_break(&mut self) -> Result<(), DjError> {
        if !self.queue.is_empty() {
            return self.violation(DjError::QueueNotEmptyAtStartup {
                queued: self.queue.len(),
            });
        }
        let intent = self.compose_break(None);
        self.execute_intent(intent)
    }

    // ── THINK ─────────────────────────────────────────────────────────────────

    pub fn on_segment_started(&mut self, segment: &AudioEvent) -> Result<(), DjError> {
        if self.draining {
            if self.terminal_enqueued {
                debug!("terminal intent already queued, skipping shutdown think");
                return Ok(());
            }
            if matches!(&self.current_intent, Some(intent) if intent.is_terminal) {
                debug!("terminal intent already prepared");
                return Ok(());
            }
            info!("draining: preparing terminal intent");
            self.current_intent = Some(self.build_terminal_intent());
            return Ok(());
        }

        // Breaks are song-triggered. The startup announcement also triggers
        // one so the first song is ready when it ends, and a fallback segment
        // must keep the programme moving.
        let triggers_break = segment.is_song()
            || matches!(
                segment.kind,
                AudioEventKind::Announcement | AudioEventKind::Fallback
            );
        if !triggers_break {
            debug!(kind = segment.kind.as_str(), "segment does not trigger a break");
            return Ok(());
        }

        self.run_ticklers();
        self.assets.maybe_rescan();

        let current_song = segment.is_song().then(|| segment.path.clone());
        let intent = self.compose_break(current_song.as_deref());
        info!(
            intent_id = %intent.intent_id,
            outro = intent.outro.is_some(),
            ids = intent.station_ids.len(),
            intro = intent.intro.is_some(),
            song = ?intent.next_song.as_ref().map(|s| s.path.display().to_string()),
            "intent committed"
        );
        self.current_intent = Some(intent);
        Ok(())
    }

    fn compose_break(&mut self, current_song: Option<&Path>) -> DjIntent {
        let now = Utc::now();

        let needs_legal_id = self.needs_legal_id(now);
        // A mandatory legal ID displaces talk for this break.
        let should_talk = !needs_legal_id && self.should_talk(now);
        let needs_generic_id = !needs_legal_id && !should_talk && self.can_play_generic_id(now);
        let use_intro = rand::thread_rng().gen_bool(self.policy.intro_probability);

        debug!(
            legal_id = needs_legal_id,
            talk = should_talk,
            generic_id = needs_generic_id,
            intro = use_intro,
            "break plan"
        );

        let next_song = match self.rotation.select_next(current_song) {
            Some(path) => {
                let metadata = probe_metadata(&path);
                AudioEvent::new(path, AudioEventKind::Song).with_metadata(metadata)
            }
            None => self.fallback_event(),
        };

        let outro = should_talk
            .then(|| self.select_outro(current_song))
            .flatten()
            .map(|path| AudioEvent::new(path, AudioEventKind::Outro));

        let mut has_legal_id = false;
        let station_ids: Vec<AudioEvent> = if needs_legal_id {
            let picked = self.select_id(true);
            has_legal_id = picked.is_some();
            picked
                .into_iter()
                .map(|path| AudioEvent::new(path, AudioEventKind::Id))
                .collect()
        } else if needs_generic_id {
            self.select_id(false)
                .into_iter()
                .map(|path| AudioEvent::new(path, AudioEventKind::Id))
                .collect()
        } else {
            Vec::new()
        };

        let intro = use_intro
            .then(|| self.select_intro(&next_song.path))
            .flatten()
            .map(|path| AudioEvent::new(path, AudioEventKind::Intro));

        DjIntent::new_break(next_song, outro, station_ids, intro, has_legal_id)
    }

    /// THINK must still yield a playable intent when rotation comes up empty.
    fn fallback_event(&self) -> AudioEvent {
        error!("no song available from rotation, emitting fallback event");
        let stand_in = self
            .assets
            .generic_ids
            .first()
            .or_else(|| self.assets.generic_intros.first())
            .or_else(|| self.assets.shutdown_announcements.first())
            .cloned()
            .unwrap_or_default();
        AudioEvent::new(stand_in, AudioEventKind::Fallback)
    }

    fn build_terminal_intent(&mut self) -> DjIntent {
        let pool: Vec<&PathBuf> = self
            .assets
            .shutdown_announcements
            .iter()
            .filter(|p| p.exists())
            .collect();
        let announcement = pool.choose(&mut rand::thread_rng()).map(|path| {
            info!(path = %path.display(), "shutdown announcement selected");
            AudioEvent::new((*path).clone(), AudioEventKind::Announcement)
                .with_metadata(probe_metadata(path))
        });
        if announcement.is_none() {
            info!("shutdown announcement skipped (pool empty)");
        }
        DjIntent::new_terminal(announcement)
    }

    // ── Decision rules ────────────────────────────────────────────────────────

    fn needs_legal_id(&self, now: DateTime<Utc>) -> bool {
        match self.state.last_legal_id {
            None => true,
            Some(last) => {
                (now - last).num_seconds() >= self.policy.legal_id_interval_secs as i64
            }
        }
    }

    fn can_play_generic_id(&self, now: DateTime<Utc>) -> bool {
        match self.state.last_generic_id {
            None => true,
            Some(last) => (now - last).num_seconds() >= self.policy.generic_id_min_secs as i64,
        }
    }

    fn should_talk(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.state.last_talk else {
            return true;
        };
        let since = (now - last).num_seconds();
        if since >= self.policy.max_talk_silence_secs as i64 {
            return true;
        }
        if since < self.policy.min_talk_spacing_secs as i64 {
            return false;
        }
        rand::thread_rng().gen_bool(self.policy.talk_allow_probability)
    }

    fn cooldown_ok(&self, path: &Path, history: &[PathBuf]) -> bool {
        let window = history.len().saturating_sub(self.policy.cooldown_len);
        !history[window..].iter().any(|used| used == path)
    }

    fn select_intro(&self, next_song: &Path) -> Option<PathBuf> {
        let mut candidates = self.assets.intros_for_song(next_song);
        if candidates.is_empty() {
            candidates = self.assets.generic_intros.clone();
        }
        self.pick_with_cooldown(candidates, &self.state.intro_history)
    }

    fn select_outro(&self, current_song: Option<&Path>) -> Option<PathBuf> {
        let mut candidates = current_song
            .map(|song| self.assets.outros_for_song(song))
            .unwrap_or_default();
        if candidates.is_empty() {
            candidates = self.assets.generic_outros.clone();
        }
        self.pick_with_cooldown(candidates, &self.state.outro_history)
    }

    fn pick_with_cooldown(&self, candidates: Vec<PathBuf>, history: &[PathBuf]) -> Option<PathBuf> {
        let candidates: Vec<PathBuf> = candidates.into_iter().filter(|p| p.exists()).collect();
        if candidates.is_empty() {
            return None;
        }
        let fresh: Vec<&PathBuf> = candidates
            .iter()
            .filter(|p| self.cooldown_ok(p, history))
            .collect();
        let pool = if fresh.is_empty() {
            debug!("all candidates in cooldown, using any");
            candidates.iter().collect()
        } else {
            fresh
        };
        pool.choose(&mut rand::thread_rng()).map(|p| (*p).clone())
    }

    fn select_id(&self, legal: bool) -> Option<PathBuf> {
        let pool = if legal {
            &self.assets.legal_ids
        } else {
            &self.assets.generic_ids
        };
        let existing: Vec<&PathBuf> = pool.iter().filter(|p| p.exists()).collect();
        if existing.is_empty() {
            warn!(legal, "no station ID files available");
            return None;
        }
        existing.choose(&mut rand::thread_rng()).map(|p| (*p).clone())
    }

    // ── DO ────────────────────────────────────────────────────────────────────

    pub fn on_segment_finished(&mut self, segment: &AudioEvent) -> Result<(), DjError> {
        let mut is_terminal = matches!(&self.current_intent, Some(i) if i.is_terminal);

        // Only songs (plus announcements and fallback segments) close a
        // break; terminal intents may be triggered by any segment.
        let closes_break = segment.is_song()
            || matches!(
                segment.kind,
                AudioEventKind::Announcement | AudioEventKind::Fallback
            );
        if !is_terminal && !closes_break {
            debug!(kind = segment.kind.as_str(), "segment does not close a break");
            return Ok(());
        }

        // A finishing startup announcement (the only event without an
        // intent_id) must leave the queue untouched behind it.
        if !is_terminal
            && segment.kind == AudioEventKind::Announcement
            && segment.intent_id.is_none()
            && !self.queue.is_empty()
        {
            self.violation(DjError::QueueNotEmptyAtStartup {
                queued: self.queue.len(),
            })?;
        }

        if self.draining {
            if self.terminal_enqueued {
                debug!("terminal intent already queued, skipping DO");
                return Ok(());
            }
            if !is_terminal {
                // Last chance to form the terminal intent; any pending normal
                // intent is discarded rather than leaked into the queue.
                if self.current_intent.take().is_some() {
                    warn!("discarding non-terminal intent during draining");
                }
                self.current_intent = Some(self.build_terminal_intent());
                is_terminal = true;
            }
        }

        if !is_terminal && segment.is_song() {
            self.state.record_song(&segment.path);
            self.rotation.record_played(&segment.path);
        }

        let Some(intent) = self.current_intent.take() else {
            error!("DO with no committed intent; THINK should always precede");
            return Ok(());
        };

        self.execute_intent(intent)
    }

    /// Enqueue a taken intent and apply its state delta. Shared by DO and the
    /// no-announcement bootstrap path.
    fn execute_intent(&mut self, intent: DjIntent) -> Result<(), DjError> {
        if self.draining && !intent.is_terminal {
            return self.violation(DjError::EnqueueDuringDraining);
        }

        let events = intent.expand();
        if intent.is_terminal {
            if self.terminal_enqueued {
                // Latched; duplicate attempts are ignored.
                return Ok(());
            }
            self.terminal_enqueued = true;
        }

        // Atomic intent enforcement: the head may only belong to the intent
        // being executed.
        if let Some(head) = self.queue.peek_intent_id() {
            if head != intent.intent_id {
                error!(
                    head = %head,
                    executing = %intent.intent_id,
                    queued = ?self.queue.all_intent_ids(),
                    "cross-intent leakage detected at queue head"
                );
                return self.violation(DjError::CrossIntentLeakage {
                    head,
                    executing: intent.intent_id,
                });
            }
        }

        let count = events.len();
        self.queue.enqueue_all(events.clone())?;
        info!(intent_id = %intent.intent_id, segments = count, "intent executed");

        if self.strict {
            self.assert_tail_matches(&events)?;
        }

        if intent.is_terminal {
            info!("terminal intent executed, no further breaks");
            return Ok(());
        }

        // History updates come strictly from metadata recorded in THINK.
        let now = Utc::now();
        if !intent.station_ids.is_empty() {
            if intent.has_legal_id {
                self.state.last_legal_id = Some(now);
            } else {
                self.state.last_generic_id = Some(now);
            }
        }
        if let Some(outro) = &intent.outro {
            self.state.last_talk = Some(now);
            push_capped(&mut self.state.outro_history, outro.path.clone(), self.policy.cooldown_len);
        }
        if let Some(intro) = &intent.intro {
            push_capped(&mut self.state.intro_history, intro.path.clone(), self.policy.cooldown_len);
        }

        self.schedule_ticklers(&intent);
        Ok(())
    }

    fn assert_tail_matches(&mut self, events: &[AudioEvent]) -> Result<(), DjError> {
        if events.is_empty() {
            return Ok(());
        }
        let tail = self.queue.get_tail(events.len());
        let matches = tail.len() == events.len()
            && tail
                .iter()
                .zip(events)
                .all(|(a, b)| a.path == b.path && a.intent_id == b.intent_id);
        if matches {
            Ok(())
        } else {
            error!(
                expected = events.len(),
                found = tail.len(),
                "queue tail mismatch after enqueue"
            );
            self.violation(DjError::TailMismatch)
        }
    }

    // ── Ticklers ──────────────────────────────────────────────────────────────

    fn schedule_ticklers(&mut self, intent: &DjIntent) {
        if let (Some(_), Some(song)) = (&intent.intro, &intent.next_song) {
            self.push_tickler(Tickler::GenerateIntro {
                song: song.path.clone(),
            });
        }
        if let (Some(_), Some(song)) = (&intent.outro, &intent.next_song) {
            self.push_tickler(Tickler::GenerateOutro {
                song: song.path.clone(),
            });
        }
        if self.assets.generic_id_pool_low() {
            self.push_tickler(Tickler::RefillGenericIds);
        }
    }

    fn push_tickler(&mut self, tickler: Tickler) {
        debug!(?tickler, "tickler scheduled");
        self.ticklers.push(tickler);
    }

    fn run_ticklers(&mut self) {
        if self.ticklers.is_empty() {
            return;
        }
        let ticklers = std::mem::take(&mut self.ticklers);
        debug!(count = ticklers.len(), "running ticklers");
        for tickler in ticklers {
            match tickler {
                Tickler::GenerateIntro { song } => {
                    // Hook for an external generation pipeline; cache-only.
                    debug!(song = %song.display(), "intro prep requested");
                }
                Tickler::GenerateOutro { song } => {
                    debug!(song = %song.display(), "outro prep requested");
                }
                Tickler::RefillGenericIds => {
                    self.assets.rescan_ids();
                }
            }
        }
    }

    /// Strict mode raises; production logs and continues.
    fn violation(&self, err: DjError) -> Result<(), DjError> {
        if self.strict {
            Err(err)
        } else {
            error!("contract violation: {err}");
            Ok(())
        }
    }
}

fn push_capped(history: &mut Vec<PathBuf>, path: PathBuf, cap: usize) {
    history.push(path);
    if history.len() > cap {
        let overflow = history.len() - cap;
        history.drain(..overflow);
    }
}

/// Adapter exposing the DJ as a segment listener.
pub struct DjListener {
    core: Arc<Mutex<DjCore>>,
}

impl DjListener {
    pub fn new(core: Arc<Mutex<DjCore>>) -> Self {
        Self { core }
    }
}

impl SegmentListener for DjListener {
    fn on_segment_started(&self, segment: &AudioEvent) -> anyhow::Result<()> {
        self.core
            .lock()
            .unwrap()
            .on_segment_started(segment)
            .map_err(Into::into)
    }

    fn on_segment_finished(&self, segment: &AudioEvent) -> anyhow::Result<()> {
        self.core
            .lock()
            .unwrap()
            .on_segment_finished(segment)
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::collections::VecDeque;

    struct ScriptedRotation {
        songs: VecDeque<PathBuf>,
        played: Vec<PathBuf>,
    }

    impl ScriptedRotation {
        fn new(songs: &[PathBuf]) -> Self {
            Self {
                songs: songs.iter().cloned().collect(),
                played: Vec::new(),
            }
        }
    }

    impl Rotation for ScriptedRotation {
        fn select_next(&mut self, _exclude: Option<&Path>) -> Option<PathBuf> {
            let next = self.songs.pop_front()?;
            self.songs.push_back(next.clone());
            Some(next)
        }

        fn record_played(&mut self, path: &Path) {
            self.played.push(path.to_path_buf());
        }
    }

    struct Fixture {
        dj: DjCore,
        queue: Arc<PlayoutQueue>,
        songs: Vec<PathBuf>,
        _dir: tempfile::TempDir,
    }

    fn seed(dir: &Path, rel: &str) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"x").unwrap();
        path
    }

    fn fixture(policy: DjPolicy, strict: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let songs = vec![
            seed(dir.path(), "music/a.mp3"),
            seed(dir.path(), "music/b.mp3"),
        ];
        seed(dir.path(), "dj/intros/generic/in1.mp3");
        seed(dir.path(), "dj/intros/generic/in2.mp3");
        seed(dir.path(), "dj/outros/generic/out1.mp3");
        seed(dir.path(), "dj/ids/legal/legal1.mp3");
        seed(dir.path(), "dj/ids/generic/gen1.mp3");
        seed(dir.path(), "dj/announcements/startup/hello.mp3");
        seed(dir.path(), "dj/announcements/shutdown/bye.mp3");

        let assets = AssetLibrary::new(dir.path().join("dj"));
        let rotation = Box::new(ScriptedRotation::new(&songs));
        let queue = Arc::new(PlayoutQueue::new());
        let dj = DjCore::new(policy, rotation, assets, QueueHandle::new(queue.clone()), strict);
        Fixture {
            dj,
            queue,
            songs,
            _dir: dir,
        }
    }

    fn quiet_policy() -> DjPolicy {
        // No talk, no intro, no randomness.
        DjPolicy {
            talk_allow_probability: 0.0,
            intro_probability: 0.0,
            ..DjPolicy::default()
        }
    }

    fn song_event(path: &Path) -> AudioEvent {
        let mut event = AudioEvent::new(path, AudioEventKind::Song);
        event.intent_id = Some(IntentId::new_v4());
        event
    }

    #[test]
    fn think_commits_intent_do_enqueues_one_id_group() {
        let mut fx = fixture(quiet_policy(), true);
        // Fresh state: legal ID mandatory, no talk, no intro.
        let playing = song_event(&fx.songs[0]);
        fx.dj.on_segment_started(&playing).unwrap();
        let intent = fx.dj.current_intent().unwrap();
        assert!(intent.has_legal_id);
        assert!(intent.outro.is_none());
        assert!(intent.intro.is_none());
        let id = intent.intent_id;

        fx.dj.on_segment_finished(&playing).unwrap();
        let ids = fx.queue.all_intent_ids();
        assert_eq!(ids.len(), 2); // legal id + next song
        assert!(ids.iter().all(|&i| i == id));
        assert_eq!(fx.queue.peek_intent_id(), Some(id));
    }

    #[test]
    fn legal_id_displaces_talk() {
        let mut fx = fixture(
            DjPolicy {
                talk_allow_probability: 1.0,
                intro_probability: 0.0,
                ..DjPolicy::default()
            },
            true,
        );
        // Talk is long overdue and a legal ID is due: the ID wins.
        fx.dj.state.last_talk = Some(Utc::now() - ChronoDuration::hours(2));
        fx.dj.state.last_legal_id = Some(Utc::now() - ChronoDuration::hours(2));

        let playing = song_event(&fx.songs[0]);
        fx.dj.on_segment_started(&playing).unwrap();
        let intent = fx.dj.current_intent().unwrap();
        assert!(intent.has_legal_id);
        assert!(intent.outro.is_none());
    }

    #[test]
    fn talk_respects_min_spacing() {
        let mut fx = fixture(
            DjPolicy {
                talk_allow_probability: 1.0,
                intro_probability: 0.0,
                ..DjPolicy::default()
            },
            true,
        );
        fx.dj.state.last_legal_id = Some(Utc::now());
        fx.dj.state.last_talk = Some(Utc::now() - ChronoDuration::seconds(120));

        let playing = song_event(&fx.songs[0]);
        fx.dj.on_segment_started(&playing).unwrap();
        assert!(fx.dj.current_intent().unwrap().outro.is_none());
    }

    #[test]
    fn talk_mandatory_after_max_silence() {
        let mut fx = fixture(
            DjPolicy {
                talk_allow_probability: 0.0,
                intro_probability: 0.0,
                ..DjPolicy::default()
            },
            true,
        );
        fx.dj.state.last_legal_id = Some(Utc::now());
        fx.dj.state.last_talk = Some(Utc::now() - ChronoDuration::hours(1));

        let playing = song_event(&fx.songs[0]);
        fx.dj.on_segment_started(&playing).unwrap();
        assert!(fx.dj.current_intent().unwrap().outro.is_some());
    }

    #[test]
    fn generic_id_respects_spacing() {
        let mut fx = fixture(quiet_policy(), true);
        fx.dj.state.last_legal_id = Some(Utc::now());
        fx.dj.state.last_talk = Some(Utc::now());
        fx.dj.state.last_generic_id = Some(Utc::now() - ChronoDuration::seconds(60));

        let playing = song_event(&fx.songs[0]);
        fx.dj.on_segment_started(&playing).unwrap();
        assert!(fx.dj.current_intent().unwrap().station_ids.is_empty());

        // Past the spacing window the generic ID returns.
        fx.dj.state.last_generic_id = Some(Utc::now() - ChronoDuration::seconds(200));
        fx.dj.on_segment_started(&playing).unwrap();
        let intent = fx.dj.current_intent().unwrap();
        assert_eq!(intent.station_ids.len(), 1);
        assert!(!intent.has_legal_id);
    }

    #[test]
    fn intro_cooldown_rotates_between_assets() {
        let mut fx = fixture(
            DjPolicy {
                talk_allow_probability: 0.0,
                intro_probability: 1.0,
                ..DjPolicy::default()
            },
            true,
        );
        fx.dj.state.last_legal_id = Some(Utc::now());
        fx.dj.state.last_talk = Some(Utc::now());
        fx.dj.state.last_generic_id = Some(Utc::now());

        let playing = song_event(&fx.songs[0]);
        fx.dj.on_segment_started(&playing).unwrap();
        let first = fx.dj.current_intent().unwrap().intro.clone().unwrap();
        fx.dj.on_segment_finished(&playing).unwrap();
        fx.queue.clear();

        fx.dj.on_segment_started(&playing).unwrap();
        let second = fx.dj.current_intent().unwrap().intro.clone().unwrap();
        assert_ne!(first.path, second.path, "cooldown must rotate intros");
    }

    #[test]
    fn non_song_segments_do_not_trigger_breaks() {
        let mut fx = fixture(quiet_policy(), true);
        let mut id_event = AudioEvent::new("/dj/id.mp3", AudioEventKind::Id);
        id_event.intent_id = Some(IntentId::new_v4());

        fx.dj.on_segment_started(&id_event).unwrap();
        assert!(fx.dj.current_intent().is_none());
        fx.dj.on_segment_finished(&id_event).unwrap();
        assert!(fx.queue.is_empty());
    }

    #[test]
    fn startup_announcement_prepares_first_intent() {
        let mut fx = fixture(quiet_policy(), true);
        let announcement = fx.dj.take_startup_announcement().unwrap();
        assert!(announcement.intent_id.is_none());

        fx.dj.on_segment_started(&announcement).unwrap();
        let intent = fx.dj.current_intent().unwrap();
        assert!(intent.next_song.is_some());

        fx.dj.on_segment_finished(&announcement).unwrap();
        assert!(!fx.queue.is_empty());
        let ids = fx.queue.all_intent_ids();
        assert!(ids.iter().all(|&i| i == ids[0]));
    }

    #[test]
    fn bootstrap_without_announcement_enqueues_first_break() {
        let mut fx = fixture(quiet_policy(), true);
        fx.dj.bootstrap_first_break().unwrap();
        assert!(!fx.queue.is_empty());
    }

    #[test]
    fn terminal_intent_enqueued_exactly_once() {
        let mut fx = fixture(quiet_policy(), true);
        fx.dj.set_draining();

        let playing = song_event(&fx.songs[0]);
        fx.dj.on_segment_started(&playing).unwrap();
        assert!(fx.dj.current_intent().unwrap().is_terminal);

        fx.dj.on_segment_finished(&playing).unwrap();
        assert!(fx.dj.terminal_enqueued());
        assert_eq!(fx.queue.len(), 1);
        let announcement = fx.queue.dequeue().unwrap();
        assert!(announcement.is_terminal);
        assert!(announcement.intent_id.is_some());

        // The announcement finishing must not produce a second terminal DO.
        fx.dj.on_segment_started(&announcement).unwrap();
        fx.dj.on_segment_finished(&announcement).unwrap();
        assert!(fx.queue.is_empty());
    }

    #[test]
    fn draining_discards_pending_normal_intent() {
        let mut fx = fixture(quiet_policy(), true);
        let playing = song_event(&fx.songs[0]);
        // THINK committed a normal break, then draining begins before DO.
        fx.dj.on_segment_started(&playing).unwrap();
        fx.dj.set_draining();
        fx.dj.on_segment_finished(&playing).unwrap();

        // Only the terminal announcement may reach the queue.
        assert_eq!(fx.queue.len(), 1);
        assert!(fx.queue.dequeue().unwrap().is_terminal);
    }

    #[test]
    fn think_failure_yields_fallback_event() {
        let dir = tempfile::tempdir().unwrap();
        let assets = AssetLibrary::new(dir.path().join("dj"));
        let queue = Arc::new(PlayoutQueue::new());
        let mut dj = DjCore::new(
            quiet_policy(),
            Box::new(ScriptedRotation::new(&[])),
            assets,
            QueueHandle::new(queue.clone()),
            true,
        );

        let playing = song_event(Path::new("/music/gone.mp3"));
        dj.on_segment_started(&playing).unwrap();
        let intent = dj.current_intent().unwrap();
        assert_eq!(
            intent.next_song.as_ref().unwrap().kind,
            AudioEventKind::Fallback
        );
    }

    #[test]
    fn cross_intent_leakage_raises_in_strict_mode() {
        let mut fx = fixture(quiet_policy(), true);
        // Poison the queue with a foreign intent.
        let foreign = DjIntent::new_break(
            AudioEvent::new("/music/foreign.mp3", AudioEventKind::Song),
            None,
            Vec::new(),
            None,
            false,
        );
        fx.queue.enqueue_all(foreign.expand()).unwrap();

        let playing = song_event(&fx.songs[0]);
        fx.dj.on_segment_started(&playing).unwrap();
        let result = fx.dj.on_segment_finished(&playing);
        assert!(matches!(result, Err(DjError::CrossIntentLeakage { .. })));
    }

    #[test]
    fn production_mode_logs_and_continues_on_leakage() {
        let mut fx = fixture(quiet_policy(), false);
        let foreign = DjIntent::new_break(
            AudioEvent::new("/music/foreign.mp3", AudioEventKind::Song),
            None,
            Vec::new(),
            None,
            false,
        );
        fx.queue.enqueue_all(foreign.expand()).unwrap();

        let playing = song_event(&fx.songs[0]);
        fx.dj.on_segment_started(&playing).unwrap();
        fx.dj.on_segment_finished(&playing).unwrap();
    }
}
