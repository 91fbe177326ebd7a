//! Conversational turn control.
//!
//! A session runs `Idle -> Connecting -> Listening <-> Speaking -> Ending ->
//! Idle`. It streams mic audio out, feeds assistant audio into the playback
//! engine and decides when a turn is over: on idle timeout, barge-in, a
//! protocol error, a song request, or the provider closing the stream. In the
//! last case a question from the assistant that the user answered reconnects
//! for a follow-up turn.

mod functions;
mod say;
mod signals;

pub use functions::tools;
pub use signals::MicInput;

use crate::collaborators::{
    LogPublisher, STATE_IDLE, STATE_LISTENING, STATE_PLAYING_SONG, STATE_SPEAKING, SmartHome,
    StatePublisher, UnconfiguredSmartHome,
};
use crate::config::SessionConfig;
use crate::cues::{Cue, CueLibrary, ResponseHistory};
use crate::error::{PlaybackError, ProtocolFault, Result, SessionError};
use crate::lock;
use crate::personality::{MemoryPersonaStore, PersonaStore, PersonalityTraits};
use crate::playback::PlaybackEngine;
use crate::realtime_api::{Connection, Connector, InboundEvent, RealtimeApi, SessionSetup};
use crate::songs::SongLibrary;
use crate::watchdog::IdleWatchdog;
use signals::TurnSignals;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Listening,
    Speaking,
    Ending,
}

/// The outside world as seen by a session.
#[derive(Clone)]
pub struct Collaborators {
    pub publisher: Arc<dyn StatePublisher>,
    pub smart_home: Arc<dyn SmartHome>,
    pub persona: Arc<dyn PersonaStore>,
    pub songs: SongLibrary,
    pub cues: CueLibrary,
    pub history: Option<ResponseHistory>,
}

impl Collaborators {
    /// Defaults rooted at a sounds directory: `songs/`, the cue clips and
    /// `response-history/`, logging-only publishing and no smart home.
    pub fn new(sounds_dir: impl Into<PathBuf>) -> Self {
        let sounds_dir = sounds_dir.into();
        Self {
            publisher: Arc::new(LogPublisher),
            smart_home: Arc::new(UnconfiguredSmartHome),
            persona: Arc::new(MemoryPersonaStore::default()),
            songs: SongLibrary::new(sounds_dir.join("songs")),
            history: Some(ResponseHistory::new(sounds_dir.join("response-history"))),
            cues: CueLibrary::new(sounds_dir),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn StatePublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_smart_home(mut self, smart_home: Arc<dyn SmartHome>) -> Self {
        self.smart_home = smart_home;
        self
    }

    pub fn with_persona_store(mut self, persona: Arc<dyn PersonaStore>) -> Self {
        self.persona = persona;
        self
    }

    pub fn without_history(mut self) -> Self {
        self.history = None;
        self
    }
}

/// What the event loop does after handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// End the session without a follow-up check.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// The turn was deactivated: timeout, barge-in or an explicit stop.
    Inactive,
    /// The provider closed the stream while the turn was still active.
    Closed,
    Stop,
}

/// Buffers that live for one `start` pass.
#[derive(Debug)]
pub(crate) struct Turn {
    transcript: String,
    audio: Vec<i16>,
    committed: bool,
    first_text: bool,
}

impl Default for Turn {
    fn default() -> Self {
        Self {
            transcript: String::new(),
            audio: Vec::new(),
            committed: false,
            first_text: true,
        }
    }
}

/// True when the assistant ended on a question and the user answered.
pub fn wants_follow_up(transcript: &str, user_spoke: bool) -> bool {
    let mut tail = transcript.trim_end().chars().rev();
    user_spoke && tail.next() == Some('?') && tail.next().is_some_and(|c| c.is_ascii_alphabetic())
}

struct Inner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    playback: PlaybackEngine,
    collaborators: Collaborators,
    personality: Mutex<PersonalityTraits>,
    signals: Arc<TurnSignals>,
    state: watch::Sender<SessionState>,
    link: tokio::sync::Mutex<Option<Arc<dyn RealtimeApi>>>,
    mic_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<i16>>>,
    running: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Drives conversational turns. Clones share one session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        playback: PlaybackEngine,
        collaborators: Collaborators,
    ) -> Self {
        let personality = collaborators.persona.load().unwrap_or_else(|e| {
            warn!("failed to load personality, using defaults: {:#}", e);
            PersonalityTraits::default()
        });
        let (signals, mic_rx) = TurnSignals::new(config.silence_threshold);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                playback,
                collaborators,
                personality: Mutex::new(personality),
                signals: Arc::new(signals),
                state: watch::channel(SessionState::Idle).0,
                link: tokio::sync::Mutex::new(None),
                mic_rx: tokio::sync::Mutex::new(mic_rx),
                running: AtomicBool::new(false),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn mic_input(&self) -> MicInput {
        MicInput::new(self.inner.signals.clone())
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn personality(&self) -> PersonalityTraits {
        lock(&self.inner.personality).clone()
    }

    /// Error details of the last response that finished with an error.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    pub fn playback(&self) -> &PlaybackEngine {
        &self.inner.playback
    }

    /// Runs a session until it returns to idle.
    ///
    /// Calling it while a session is already running returns immediately.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            debug!("session already running");
            return Ok(());
        }
        let result = self.run().await;
        if let Err(e) = &result {
            error!("session failed: {}", e);
        }
        self.teardown().await;
        self.inner.running.store(false, Ordering::Release);
        result
    }

    /// Ends the turn and closes the connection. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.request_stop();
        self.close_link().await;
    }

    /// Ends the turn without waiting; the event loop closes the connection.
    pub fn request_stop(&self) {
        if self.inner.signals.deactivate() {
            info!("session stop requested");
        }
    }

    /// Barge-in: cuts the assistant off at its next audio delta.
    pub fn interrupt(&self) {
        self.inner.signals.raise_interrupt();
    }

    /// Plays a song bundle with the state published around it.
    pub async fn play_song(&self, name: &str) -> std::result::Result<(), PlaybackError> {
        self.publish(STATE_PLAYING_SONG);
        let result = self.inner.collaborators.songs.play(name, &self.inner.playback).await;
        if let Err(e) = &result {
            warn!(name, "song playback failed: {}", e);
        }
        self.publish(STATE_IDLE);
        result
    }

    async fn run(&self) -> Result<()> {
        loop {
            let Some(mut events) = self.connect(self.setup()).await? else {
                return Ok(());
            };
            let mut turn = Turn::default();
            self.inner.signals.activate();
            self.set_state(SessionState::Listening);
            self.publish(STATE_LISTENING);
            info!("session started, listening");

            let end = self.stream(&mut events, &mut turn).await?;
            debug!(?end, transcript = turn.transcript.trim(), "stream ended");
            if end == StreamEnd::Closed
                && !self.inner.config.single_turn
                && wants_follow_up(&turn.transcript, self.inner.signals.user_spoke())
            {
                info!("follow-up detected, restarting");
                self.close_link().await;
                continue;
            }
            return Ok(());
        }
    }

    /// Opens the connection. `None` means the session degraded to a cue.
    async fn connect(&self, setup: SessionSetup) -> Result<Option<mpsc::Receiver<InboundEvent>>> {
        self.set_state(SessionState::Connecting);
        match self.inner.connector.open(&setup).await {
            Ok(Connection { api, events }) => {
                *self.inner.link.lock().await = Some(api);
                Ok(Some(events))
            }
            Err(SessionError::Connectivity(fault)) => {
                warn!("{}", fault);
                self.play_cue(Cue::Offline).await;
                Ok(None)
            }
            Err(SessionError::Protocol(ProtocolFault::InvalidCredential)) => {
                error!("{}", ProtocolFault::InvalidCredential);
                self.play_cue(Cue::InvalidCredential).await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn setup(&self) -> SessionSetup {
        let personality = lock(&self.inner.personality).instructions();
        let base = self.inner.config.instructions.trim();
        let instructions = if base.is_empty() {
            personality
        } else {
            format!("{base}\n\n{personality}")
        };
        SessionSetup {
            instructions,
            voice: self.inner.config.voice.clone(),
            tools: tools(),
        }
    }

    async fn stream(
        &self,
        events: &mut mpsc::Receiver<InboundEvent>,
        turn: &mut Turn,
    ) -> Result<StreamEnd> {
        let watchdog = self.spawn_idle_watchdog();
        let mut active = self.inner.signals.subscribe();
        let mut mic = self.inner.mic_rx.lock().await;
        while mic.try_recv().is_ok() {}

        let end = loop {
            if !self.inner.signals.is_active() {
                break Ok(StreamEnd::Inactive);
            }
            tokio::select! {
                changed = active.changed() => {
                    if changed.is_err() {
                        break Ok(StreamEnd::Inactive);
                    }
                }
                Some(frame) = mic.recv() => self.forward_mic(frame).await,
                event = events.recv() => match event {
                    None | Some(InboundEvent::Closed { .. }) => {
                        break Ok(if self.inner.signals.is_active() {
                            StreamEnd::Closed
                        } else {
                            StreamEnd::Inactive
                        });
                    }
                    Some(event) => match self.handle(event, turn).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) => break Ok(StreamEnd::Stop),
                        Err(e) => break Err(e),
                    },
                },
            }
        };
        watchdog.abort();
        end
    }

    fn spawn_idle_watchdog(&self) -> tokio::task::JoinHandle<()> {
        let controller = self.clone();
        let watchdog = IdleWatchdog::new(self.inner.config.idle.clone());
        tokio::spawn(async move {
            let signals = controller.inner.signals.clone();
            let playback = controller.inner.playback.clone();
            let last_activity = move || signals.activity.last().max(playback.activity().last());
            let active = controller.inner.signals.subscribe();
            let driver = controller.inner.playback.driver().clone();
            if watchdog.run(last_activity, active, driver).await {
                controller.request_stop();
            }
        })
    }

    async fn forward_mic(&self, frame: Vec<i16>) {
        if !self.inner.signals.is_ready() {
            return;
        }
        if let Ok(api) = self.link().await {
            if let Err(e) = api.append_input_audio(frame).await {
                warn!("failed to forward mic audio: {}", e);
            }
        }
    }

    async fn handle(&self, event: InboundEvent, turn: &mut Turn) -> Result<Flow> {
        let signals = &self.inner.signals;
        match event {
            InboundEvent::SessionReady => {
                debug!("remote session ready");
                signals.set_ready();
            }
            InboundEvent::AudioDelta(pcm) => {
                if signals.take_interrupt() {
                    info!("assistant interrupted, dropping queued audio");
                    self.inner.playback.request_stop();
                    self.set_state(SessionState::Ending);
                    signals.deactivate();
                    return Ok(Flow::Stop);
                }
                if !turn.committed && signals.is_ready() {
                    self.link().await?.commit_input_audio().await?;
                    turn.committed = true;
                }
                self.inner.playback.enqueue_pcm(&pcm);
                turn.audio.extend_from_slice(&pcm);
                signals.activity.touch();
            }
            InboundEvent::TextDelta(delta) | InboundEvent::TranscriptDelta(delta) => {
                signals.set_mic_enabled(false);
                if turn.first_text {
                    turn.first_text = false;
                    signals.set_user_spoke(false);
                    self.set_state(SessionState::Speaking);
                    self.publish(STATE_SPEAKING);
                }
                turn.transcript.push_str(&delta);
            }
            InboundEvent::TranscriptDone => turn.transcript.push('\n'),
            InboundEvent::FunctionCall(call) => return functions::dispatch(self, &call, turn).await,
            InboundEvent::TurnComplete { error: Some(e) } => {
                error!(kind = ?e.kind, "response failed: {}", e.message);
                *lock(&self.inner.last_error) = Some(e.message);
                turn.audio.clear();
                return self.finish_turn(turn).await;
            }
            InboundEvent::TurnComplete { error: None } => {
                info!("assistant response complete");
                self.inner.playback.wait_drained().await;
                tokio::time::sleep(self.inner.config.settle_delay).await;
                self.save_response(std::mem::take(&mut turn.audio)).await;
                self.inner.playback.mark_idle();
                return self.finish_turn(turn).await;
            }
            InboundEvent::ProtocolError { code, message } => {
                self.inner.playback.stop_actuators();
                match ProtocolFault::from_remote(code.as_deref(), &message) {
                    ProtocolFault::InvalidCredential => {
                        error!("{}", ProtocolFault::InvalidCredential);
                        self.play_cue(Cue::InvalidCredential).await;
                        return Ok(Flow::Stop);
                    }
                    fault => warn!("{}", fault),
                }
            }
            InboundEvent::Closed { .. } => {}
        }
        Ok(Flow::Continue)
    }

    /// Reopens the mic for the next turn, or ends a single-turn session.
    async fn finish_turn(&self, turn: &mut Turn) -> Result<Flow> {
        turn.first_text = true;
        let signals = &self.inner.signals;
        signals.activity.touch();
        signals.set_mic_enabled(true);
        if self.inner.config.single_turn {
            info!("single-turn mode, ending session");
            self.link().await?.end_session().await?;
            return Ok(Flow::Stop);
        }
        self.set_state(SessionState::Listening);
        self.publish(STATE_LISTENING);
        Ok(Flow::Continue)
    }

    async fn save_response(&self, audio: Vec<i16>) {
        let Some(history) = self.inner.collaborators.history.clone() else {
            return;
        };
        if audio.is_empty() {
            debug!("response audio empty, not saving");
            return;
        }
        let saved = tokio::task::spawn_blocking(move || history.save(&audio)).await;
        match saved {
            Ok(Ok(path)) => debug!("saved response to {}", path.display()),
            Ok(Err(e)) => warn!("failed to save response audio: {}", e),
            Err(e) => warn!("response save task failed: {}", e),
        }
    }

    async fn play_cue(&self, cue: Cue) {
        if let Err(e) = self.inner.collaborators.cues.play(cue, &self.inner.playback).await {
            warn!(?cue, "failed to play cue: {}", e);
        }
    }

    async fn teardown(&self) {
        if self.state() != SessionState::Idle {
            self.set_state(SessionState::Ending);
        }
        self.inner.signals.deactivate();
        self.inner.playback.stop_actuators();
        self.close_link().await;
        self.publish(STATE_IDLE);
        self.set_state(SessionState::Idle);
        info!("session ended");
    }

    async fn link(&self) -> Result<Arc<dyn RealtimeApi>> {
        self.inner
            .link
            .lock()
            .await
            .clone()
            .ok_or(SessionError::NotConnected)
    }

    async fn close_link(&self) {
        let api = self.inner.link.lock().await.take();
        if let Some(api) = api {
            api.close().await;
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "session state");
        }
    }

    fn publish(&self, state: &str) {
        self.inner.collaborators.publisher.publish_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuation::{Channel, SimulatedDriver};
    use crate::collaborators::MockSmartHome;
    use crate::config::{IdleConfig, PlaybackConfig};
    use crate::error::ConnectivityFault;
    use crate::personality::MockPersonaStore;
    use crate::playback::null_sinks;
    use crate::realtime_api::{FunctionCall, TurnError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Audio(usize),
        Commit,
        Text(String),
        Response,
        EndSession,
        Close,
    }

    #[derive(Default)]
    struct FakeApi {
        sent: Mutex<Vec<Sent>>,
    }

    impl FakeApi {
        fn sent(&self) -> Vec<Sent> {
            lock(&self.sent).clone()
        }

        fn record(&self, sent: Sent) {
            lock(&self.sent).push(sent);
        }
    }

    #[async_trait]
    impl RealtimeApi for FakeApi {
        async fn append_input_audio(&self, pcm: Vec<i16>) -> Result<()> {
            self.record(Sent::Audio(pcm.len()));
            Ok(())
        }

        async fn commit_input_audio(&self) -> Result<()> {
            self.record(Sent::Commit);
            Ok(())
        }

        async fn send_text(&self, text: String) -> Result<()> {
            self.record(Sent::Text(text));
            Ok(())
        }

        async fn create_response(&self) -> Result<()> {
            self.record(Sent::Response);
            Ok(())
        }

        async fn end_session(&self) -> Result<()> {
            self.record(Sent::EndSession);
            Ok(())
        }

        async fn close(&self) {
            self.record(Sent::Close);
        }
    }

    type Script = std::result::Result<mpsc::Receiver<InboundEvent>, SessionError>;

    #[derive(Default)]
    struct FakeConnector {
        scripts: Mutex<VecDeque<Script>>,
        api: Arc<FakeApi>,
        opens: AtomicUsize,
        setups: Mutex<Vec<SessionSetup>>,
    }

    impl FakeConnector {
        /// Queues one successful connection and hands back its event feed.
        fn script(&self) -> mpsc::Sender<InboundEvent> {
            let (tx, rx) = mpsc::channel(32);
            lock(&self.scripts).push_back(Ok(rx));
            tx
        }

        fn fail_with(&self, error: SessionError) {
            lock(&self.scripts).push_back(Err(error));
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn open(&self, setup: &SessionSetup) -> Result<Connection> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            lock(&self.setups).push(setup.clone());
            match lock(&self.scripts).pop_front() {
                Some(Ok(events)) => Ok(Connection {
                    api: self.api.clone(),
                    events,
                }),
                Some(Err(e)) => Err(e),
                None => Err(ConnectivityFault("no connection scripted".to_string()).into()),
            }
        }
    }

    #[derive(Default)]
    struct RecordingPublisher(Mutex<Vec<String>>);

    impl StatePublisher for RecordingPublisher {
        fn publish_state(&self, state: &str) {
            lock(&self.0).push(state.to_string());
        }
    }

    struct Harness {
        controller: SessionController,
        connector: Arc<FakeConnector>,
        driver: Arc<SimulatedDriver>,
        publisher: Arc<RecordingPublisher>,
        sounds: TempDir,
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            instructions: "You are a fish.".to_string(),
            settle_delay: Duration::from_millis(10),
            song_settle_delay: Duration::from_millis(10),
            idle: IdleConfig {
                timeout: Duration::from_secs(60),
                ..IdleConfig::default()
            },
            ..SessionConfig::default()
        }
    }

    fn harness_with(
        config: SessionConfig,
        customize: impl FnOnce(Collaborators) -> Collaborators,
    ) -> Harness {
        let sounds = tempfile::tempdir().unwrap();
        let driver = Arc::new(SimulatedDriver::recording());
        let playback = PlaybackEngine::new(
            PlaybackConfig {
                interludes: false,
                ..PlaybackConfig::default()
            },
            driver.clone(),
            null_sinks(),
        );
        let publisher = Arc::new(RecordingPublisher::default());
        let collaborators =
            customize(Collaborators::new(sounds.path()).with_publisher(publisher.clone()));
        let connector = Arc::new(FakeConnector::default());
        let controller = SessionController::new(config, connector.clone(), playback, collaborators);
        Harness {
            controller,
            connector,
            driver,
            publisher,
            sounds,
        }
    }

    fn harness() -> Harness {
        harness_with(fast_config(), |c| c)
    }

    impl Harness {
        fn start(&self) -> tokio::task::JoinHandle<Result<()>> {
            let controller = self.controller.clone();
            tokio::spawn(async move { controller.start().await })
        }

        async fn wait_state(&self, state: SessionState) {
            let mut rx = self.controller.subscribe_state();
            tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
                .await
                .unwrap_or_else(|_| panic!("never reached {state:?}"))
                .unwrap();
        }

        fn sent(&self) -> Vec<Sent> {
            self.connector.api.sent()
        }

        fn write_cue(&self, file: &str) {
            crate::wav::write_pcm16(&self.sounds.path().join(file), &vec![4000; 2400], 24_000, 1)
                .unwrap();
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    async fn finished<T>(task: impl Future<Output = T>) -> T {
        tokio::time::timeout(WAIT, task).await.expect("session did not end")
    }

    /// Runs one spoken turn to completion on `events`.
    async fn speak_turn(h: &Harness, events: &mpsc::Sender<InboundEvent>, transcript: &str) {
        events.send(InboundEvent::TranscriptDelta(transcript.to_string())).await.unwrap();
        h.wait_state(SessionState::Speaking).await;
        events.send(InboundEvent::AudioDelta(vec![3000; 2400])).await.unwrap();
        events.send(InboundEvent::TurnComplete { error: None }).await.unwrap();
        h.wait_state(SessionState::Listening).await;
    }

    #[test]
    fn follow_up_needs_a_question_and_an_answer() {
        assert!(wants_follow_up("Want to hear a joke?", true));
        assert!(wants_follow_up("Want to hear a joke?\n\n  ", true));
        assert!(!wants_follow_up("Want to hear a joke?", false));
        assert!(!wants_follow_up("Have a nice day.", true));
        assert!(!wants_follow_up("Really ?", true));
        assert!(!wants_follow_up("42?", true));
        assert!(!wants_follow_up("?", true));
        assert!(!wants_follow_up("", true));
    }

    #[tokio::test]
    async fn answered_question_restarts_exactly_once() {
        let h = harness();
        let first = h.connector.script();
        let second = h.connector.script();
        let task = h.start();

        h.wait_state(SessionState::Listening).await;
        first.send(InboundEvent::SessionReady).await.unwrap();
        speak_turn(&h, &first, "Want to hear a joke?").await;
        assert!(h.controller.mic_input().push(vec![5000; 480]));
        drop(first);

        eventually(|| h.connector.opens() == 2).await;
        drop(second);
        finished(task).await.unwrap().unwrap();

        assert_eq!(h.connector.opens(), 2);
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(h.sounds.path().join("response-history/response-1.wav").exists());
        assert!(h.sent().contains(&Sent::Commit));
    }

    #[tokio::test]
    async fn statement_ending_does_not_restart() {
        let h = harness();
        let events = h.connector.script();
        let task = h.start();

        h.wait_state(SessionState::Listening).await;
        events.send(InboundEvent::SessionReady).await.unwrap();
        speak_turn(&h, &events, "Have a nice day.").await;
        h.controller.mic_input().push(vec![5000; 480]);
        drop(events);

        finished(task).await.unwrap().unwrap();
        assert_eq!(h.connector.opens(), 1);
        let published = lock(&h.publisher.0).clone();
        assert_eq!(published, ["listening", "speaking", "listening", "idle"]);
        assert_eq!(h.sent().last(), Some(&Sent::Close));
    }

    #[tokio::test]
    async fn unanswered_question_does_not_restart() {
        let h = harness();
        let events = h.connector.script();
        let task = h.start();

        h.wait_state(SessionState::Listening).await;
        speak_turn(&h, &events, "Are you there?").await;
        drop(events);

        finished(task).await.unwrap().unwrap();
        assert_eq!(h.connector.opens(), 1);
    }

    #[tokio::test]
    async fn instructions_carry_personality_and_tools() {
        let h = harness();
        let events = h.connector.script();
        let task = h.start();
        h.wait_state(SessionState::Listening).await;
        drop(events);
        finished(task).await.unwrap().unwrap();

        let setup = lock(&h.connector.setups)[0].clone();
        assert!(setup.instructions.starts_with("You are a fish.\n\n"));
        assert!(setup.instructions.contains("- humor: med (50%)"));
        assert_eq!(setup.voice, "ash");
        assert_eq!(setup.tools.len(), 3);
    }

    #[tokio::test]
    async fn barge_in_drops_audio_and_ends_the_session() {
        let h = harness();
        let events = h.connector.script();
        let task = h.start();

        h.wait_state(SessionState::Listening).await;
        events.send(InboundEvent::TranscriptDelta("Once upon a time?".into())).await.unwrap();
        h.wait_state(SessionState::Speaking).await;
        h.controller.interrupt();
        events.send(InboundEvent::AudioDelta(vec![3000; 24_000])).await.unwrap();

        finished(task).await.unwrap().unwrap();
        assert_eq!(h.connector.opens(), 1);
        assert_eq!(h.controller.playback().pending(), 0);
        assert!(h.driver.drives(Channel::Mouth).is_empty());
        assert!(!h.sent().contains(&Sent::Commit));
    }

    #[tokio::test]
    async fn mic_frames_flow_only_when_ready_and_listening() {
        let h = harness();
        let events = h.connector.script();
        let task = h.start();
        let mic = h.controller.mic_input();

        h.wait_state(SessionState::Listening).await;
        assert!(!mic.push(vec![100; 480]));

        events.send(InboundEvent::SessionReady).await.unwrap();
        eventually(|| h.controller.inner.signals.is_ready()).await;
        assert!(mic.push(vec![100; 480]));
        eventually(|| h.sent().contains(&Sent::Audio(480))).await;

        events.send(InboundEvent::TextDelta("Hi".into())).await.unwrap();
        h.wait_state(SessionState::Speaking).await;
        assert!(!mic.push(vec![100; 480]));

        drop(events);
        finished(task).await.unwrap().unwrap();
        assert!(!mic.push(vec![100; 480]));
    }

    #[tokio::test]
    async fn personality_update_is_validated_persisted_and_confirmed() {
        let mut store = MockPersonaStore::new();
        store.expect_load().times(1).returning(|| Ok(PersonalityTraits::default()));
        store
            .expect_save()
            .withf(|traits| traits.get("humor") == Some(90) && traits.get("sarcasm") == Some(50))
            .times(1)
            .returning(|_| Ok(()));
        let store = Arc::new(store);
        let h = harness_with(fast_config(), |c| c.with_persona_store(store));
        let events = h.connector.script();
        let task = h.start();

        h.wait_state(SessionState::Listening).await;
        events
            .send(InboundEvent::FunctionCall(FunctionCall {
                name: "update_personality".into(),
                call_id: "call_1".into(),
                arguments: r#"{"humor": 90, "sarcasm": 400}"#.into(),
            }))
            .await
            .unwrap();

        eventually(|| h.sent().contains(&Sent::Response)).await;
        assert_eq!(
            h.sent(),
            [Sent::Text("Okay, humor is now set to 90%.".into()), Sent::Response]
        );
        assert_eq!(h.controller.personality().get("humor"), Some(90));

        drop(events);
        finished(task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn invalid_personality_update_sends_nothing() {
        let h = harness();
        let events = h.connector.script();
        let task = h.start();

        h.wait_state(SessionState::Listening).await;
        events
            .send(InboundEvent::FunctionCall(FunctionCall {
                name: "update_personality".into(),
                call_id: "call_1".into(),
                arguments: r#"{"charisma": 90}"#.into(),
            }))
            .await
            .unwrap();
        drop(events);

        finished(task).await.unwrap().unwrap();
        assert_eq!(h.sent(), [Sent::Close]);
    }

    async fn smart_home_reply(reply: anyhow::Result<serde_json::Value>) -> Vec<Sent> {
        let mut smart_home = MockSmartHome::new();
        let mut reply = Some(reply);
        smart_home
            .expect_converse()
            .withf(|prompt| prompt == "turn on the lights")
            .times(1)
            .returning(move |_| reply.take().unwrap_or_else(|| Ok(json!({}))));
        let smart_home = Arc::new(smart_home);
        let h = harness_with(fast_config(), |c| c.with_smart_home(smart_home));
        let events = h.connector.script();
        let task = h.start();

        h.wait_state(SessionState::Listening).await;
        events
            .send(InboundEvent::FunctionCall(FunctionCall {
                name: "smart_home_command".into(),
                call_id: "call_2".into(),
                arguments: r#"{"prompt": "turn on the lights"}"#.into(),
            }))
            .await
            .unwrap();
        eventually(|| h.sent().contains(&Sent::Response)).await;
        drop(events);
        finished(task).await.unwrap().unwrap();
        h.sent()
    }

    #[tokio::test]
    async fn smart_home_speech_is_relayed() {
        let sent = smart_home_reply(Ok(json!({
            "response": {"speech": {"plain": {"speech": "Turned on the lights."}}}
        })))
        .await;
        assert_eq!(sent[0], Sent::Text("Home Assistant says: Turned on the lights.".into()));
        assert_eq!(sent[1], Sent::Response);
    }

    #[tokio::test]
    async fn smart_home_failure_is_apologized_for() {
        let sent = smart_home_reply(Err(anyhow::anyhow!("connection refused"))).await;
        assert_eq!(sent[0], Sent::Text(SMART_HOME_FAILURE_TEXT.into()));
        assert_eq!(sent[1], Sent::Response);

        let sent = smart_home_reply(Ok(json!({"unexpected": true}))).await;
        assert_eq!(sent[0], Sent::Text(SMART_HOME_FAILURE_TEXT.into()));
    }

    const SMART_HOME_FAILURE_TEXT: &str = "Home Assistant didn't understand the request.";

    #[tokio::test]
    async fn song_request_ends_the_turn_and_plays() {
        let h = harness();
        let events = h.connector.script();
        let task = h.start();

        h.wait_state(SessionState::Listening).await;
        events
            .send(InboundEvent::FunctionCall(FunctionCall {
                name: "play_song".into(),
                call_id: "call_3".into(),
                arguments: r#"{"song": "missing"}"#.into(),
            }))
            .await
            .unwrap();

        finished(task).await.unwrap().unwrap();
        assert_eq!(h.connector.opens(), 1);
        let published = lock(&h.publisher.0).clone();
        assert!(published.iter().any(|s| s == "playing_song"));
        assert_eq!(published.last().map(String::as_str), Some("idle"));
        assert!(h.sent().contains(&Sent::Close));
    }

    #[tokio::test]
    async fn invalid_credential_plays_cue_and_ends() {
        let h = harness();
        h.write_cue("noapikey.wav");
        let events = h.connector.script();
        let task = h.start();

        h.wait_state(SessionState::Listening).await;
        events
            .send(InboundEvent::ProtocolError {
                code: Some("invalid_api_key".into()),
                message: "Incorrect API key provided".into(),
            })
            .await
            .unwrap();

        finished(task).await.unwrap().unwrap();
        assert!(!h.driver.drives(Channel::Mouth).is_empty());
        assert!(h.driver.brakes(Channel::Head) >= 1);
        assert_eq!(h.controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn other_protocol_errors_keep_the_turn() {
        let h = harness();
        let events = h.connector.script();
        let task = h.start();

        h.wait_state(SessionState::Listening).await;
        events
            .send(InboundEvent::ProtocolError {
                code: Some("rate_limit_exceeded".into()),
                message: "slow down".into(),
            })
            .await
            .unwrap();
        events.send(InboundEvent::TextDelta("Still here".into())).await.unwrap();
        h.wait_state(SessionState::Speaking).await;
        assert!(h.driver.brakes(Channel::Mouth) >= 1);

        drop(events);
        finished(task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_response_is_surfaced() {
        let h = harness();
        let events = h.connector.script();
        let task = h.start();

        h.wait_state(SessionState::Listening).await;
        events.send(InboundEvent::TranscriptDelta("Hm".into())).await.unwrap();
        h.wait_state(SessionState::Speaking).await;
        events
            .send(InboundEvent::TurnComplete {
                error: Some(TurnError {
                    kind: Some("server_error".into()),
                    message: "internal failure".into(),
                }),
            })
            .await
            .unwrap();
        h.wait_state(SessionState::Listening).await;
        assert_eq!(h.controller.last_error().as_deref(), Some("internal failure"));
        assert!(!h.sounds.path().join("response-history").exists());

        drop(events);
        finished(task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn connectivity_fault_plays_offline_cue() {
        let h = harness();
        h.write_cue("nowifi.wav");
        h.connector
            .fail_with(ConnectivityFault("dns lookup failed".to_string()).into());

        finished(h.controller.start()).await.unwrap();
        assert_eq!(h.connector.opens(), 1);
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(!h.driver.drives(Channel::Mouth).is_empty());
        assert!(!h.controller.is_running());
    }

    #[tokio::test]
    async fn single_turn_mode_ends_after_first_response() {
        let config = SessionConfig {
            single_turn: true,
            ..fast_config()
        };
        let h = harness_with(config, |c| c.without_history());
        let events = h.connector.script();
        let task = h.start();

        h.wait_state(SessionState::Listening).await;
        events.send(InboundEvent::TranscriptDelta("Bye?".into())).await.unwrap();
        h.wait_state(SessionState::Speaking).await;
        events.send(InboundEvent::TurnComplete { error: None }).await.unwrap();

        finished(task).await.unwrap().unwrap();
        assert_eq!(h.sent(), [Sent::EndSession, Sent::Close]);
        assert!(!h.sounds.path().join("response-history").exists());
    }

    #[tokio::test]
    async fn idle_timeout_ends_the_session() {
        let config = SessionConfig {
            idle: IdleConfig {
                offset: Duration::ZERO,
                timeout: Duration::from_millis(100),
                poll: Duration::from_millis(10),
                impatience_after: Duration::from_millis(20),
                ..IdleConfig::default()
            },
            ..fast_config()
        };
        let h = harness_with(config, |c| c);
        let _events = h.connector.script();

        finished(h.controller.start()).await.unwrap();
        assert_eq!(h.connector.opens(), 1);
        assert_eq!(h.sent(), [Sent::Close]);
    }

    #[tokio::test]
    async fn second_start_while_running_is_a_no_op() {
        let h = harness();
        let events = h.connector.script();
        let task = h.start();
        h.wait_state(SessionState::Listening).await;

        finished(h.controller.start()).await.unwrap();
        assert_eq!(h.connector.opens(), 1);

        h.controller.stop().await;
        h.controller.stop().await;
        finished(task).await.unwrap().unwrap();
        drop(events);
    }

    #[tokio::test]
    async fn say_speaks_once_with_the_head_out_and_hangs_up() {
        let h = harness();
        let events = h.connector.script();
        events.send(InboundEvent::SessionReady).await.unwrap();
        events.send(InboundEvent::TranscriptDelta("Hello there.".into())).await.unwrap();
        events.send(InboundEvent::AudioDelta(vec![3000; 2400])).await.unwrap();
        events.send(InboundEvent::TurnComplete { error: None }).await.unwrap();

        let said = finished(h.controller.say("Hello there.")).await.unwrap();
        assert_eq!(said, "Hello there.");

        let sent = h.sent();
        assert!(
            matches!(&sent[0], Sent::Text(t) if t.ends_with("Repeat this literal message: Hello there.")),
            "{sent:?}"
        );
        assert_eq!(sent[1..], [Sent::Response, Sent::EndSession, Sent::Close]);
        assert!(lock(&h.connector.setups)[0].tools.is_empty());
        assert_eq!(h.driver.drives(Channel::Head), vec![(80, Duration::from_millis(500), false)]);
        assert!(h.driver.brakes(Channel::Head) >= 1);
        assert!(!h.driver.drives(Channel::Mouth).is_empty());
        assert!(h.sounds.path().join("response-history/response-1.wav").exists());
        assert_eq!(lock(&h.publisher.0).clone(), ["speaking", "idle"]);
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(!h.controller.is_running());
    }

    #[tokio::test]
    async fn say_passes_braced_prompts_through() {
        let h = harness_with(fast_config(), |c| c.without_history());
        let events = h.connector.script();
        events.send(InboundEvent::TurnComplete { error: None }).await.unwrap();

        let said = finished(h.controller.say("{{ tell a fish joke }}")).await.unwrap();
        assert_eq!(said, "");
        assert_eq!(
            h.sent(),
            [
                Sent::Text("tell a fish joke".into()),
                Sent::Response,
                Sent::EndSession,
                Sent::Close
            ]
        );
    }

    #[tokio::test]
    async fn say_is_refused_during_a_conversation() {
        let h = harness();
        let events = h.connector.script();
        let task = h.start();
        h.wait_state(SessionState::Listening).await;

        assert!(matches!(h.controller.say("hi").await, Err(SessionError::Busy)));
        assert_eq!(h.connector.opens(), 1);

        drop(events);
        finished(task).await.unwrap().unwrap();
    }
}
