//! Group call session state machine
//!
//! [`GroupCallSession`] owns every piece of session state and runs on one
//! owner task (see [`crate::service`]). Everything that happens to a session
//! arrives there as a [`SessionMessage`]: commands from [`crate::GroupCall`]
//! handles, completions of the signaling requests the session spawned,
//! signaling pushes and media engine events. Nothing in here locks.
//!
//! Requests that can be superseded carry a token. A completion whose token
//! is not the latest one issued for its kind is discarded.

use crate::media::{
    EngineConfig, EngineEvent, EngineEventSender, EngineInstance, MediaEngineFactory,
};
use crate::service::{GroupCallConfig, GroupCallDelegate, InviteResult, SessionError};
use crate::signaling::{
    update_type, CallUpdate, FullCall, InviteOutcome, JoinRequest, JoinResponse, MediaConfig,
    ParticipantsUpdate, SignalingError, SignalingHandler,
};
use crate::snapshot::{ApplyOutcome, CallSnapshot, ParticipantChange};
use crate::speaking::{SpeakingChange, SpeakingTracker};
use crate::types::{
    AudioDeviceKind, CallHandle, FinishType, LevelUpdate, MuteState, SessionId, SessionState,
    SourceId, UserId,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Events published by a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SessionEvent {
    /// Session state changed
    StateChanged {
        /// Previous state
        old: SessionState,
        /// New state
        new: SessionState,
    },
    /// Local mute state changed
    MuteChanged(MuteState),
    /// A source started or stopped speaking
    Speaking(SpeakingChange),
    /// A participant changed
    ParticipantUpdated(ParticipantChange),
    /// Call-wide metadata changed
    CallUpdated(CallInfo),
    /// Session ended normally
    Finished,
    /// Session failed
    Failed,
}

/// Call-wide metadata carried by [`SessionEvent::CallUpdated`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallInfo {
    /// Call title
    pub title: Option<String>,
    /// Recording start date
    pub record_start_date: Option<DateTime<Utc>>,
    /// Best-known participant count
    pub participants_count: usize,
    /// Discarded for everyone
    pub discarded: bool,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Session identifier
    pub session_id: SessionId,
    /// Current state
    pub state: SessionState,
    /// Local mute state
    pub mute: MuteState,
    /// Call handle, once known
    pub handle: Option<CallHandle>,
    /// Local source (0 until joined)
    pub self_source: SourceId,
    /// Generation of the live media engine
    pub engine_generation: Option<u64>,
    /// A join request is outstanding
    pub join_in_flight: bool,
    /// A mute update is outstanding
    pub mute_update_in_flight: bool,
    /// Current rejoin attempt (0 when not rejoining)
    pub rejoin_attempt: u32,
    /// Currently speaking sources
    pub speakers: Vec<SourceId>,
    /// Users invited by this session
    pub invited: Vec<UserId>,
    /// Selected input device
    pub input_device: Option<String>,
    /// Selected output device
    pub output_device: Option<String>,
    /// Ducking enabled
    pub ducking_enabled: bool,
    /// Call and participant snapshot
    pub call: Option<CallSnapshot>,
}

/// Commands sent by [`crate::GroupCall`] handles
#[derive(Debug)]
pub(crate) enum Command {
    Start {
        title: Option<String>,
    },
    Join(CallHandle),
    Rejoin,
    Hangup,
    Discard,
    SetMuted(MuteState),
    ToggleMute {
        user: UserId,
        mute: bool,
    },
    InviteUsers {
        users: Vec<UserId>,
        reply: oneshot::Sender<Result<InviteResult, SessionError>>,
    },
    SetAudioDevice {
        kind: AudioDeviceKind,
        device_id: String,
    },
    SetDucking(bool),
    ChangeTitle(String),
    ToggleRecording {
        enabled: bool,
        title: Option<String>,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// Everything the owner task reacts to
#[derive(Debug)]
pub(crate) enum SessionMessage {
    Command(Command),
    CreateFinished {
        token: u64,
        result: Result<CallHandle, SignalingError>,
    },
    JoinFinished {
        token: u64,
        muted: bool,
        result: Result<JoinResponse, SignalingError>,
    },
    LeaveFinished {
        token: u64,
    },
    DiscardFinished {
        token: u64,
        result: Result<(), SignalingError>,
    },
    MuteFinished {
        token: u64,
        result: Result<(), SignalingError>,
    },
    CheckFinished {
        source: SourceId,
        result: Result<Vec<SourceId>, SignalingError>,
    },
    ReloadFinished {
        result: Result<FullCall, SignalingError>,
    },
    Update(CallUpdate),
    Engine {
        generation: u64,
        event: EngineEvent,
    },
    Released,
}

/// Output channels shared with the handles
pub(crate) struct SessionChannels {
    pub(crate) state: watch::Sender<SessionState>,
    pub(crate) mute: watch::Sender<MuteState>,
    pub(crate) levels: broadcast::Sender<LevelUpdate>,
    pub(crate) events: broadcast::Sender<SessionEvent>,
}

/// Everything a session is constructed from
pub(crate) struct SessionSetup {
    pub(crate) id: SessionId,
    pub(crate) self_user: UserId,
    pub(crate) config: GroupCallConfig,
    pub(crate) signaling: SignalingHandler,
    pub(crate) engines: Arc<dyn MediaEngineFactory>,
    pub(crate) delegate: Option<Arc<dyn GroupCallDelegate>>,
    pub(crate) mailbox: mpsc::WeakUnboundedSender<SessionMessage>,
    pub(crate) channels: SessionChannels,
    pub(crate) mute: MuteState,
}

/// Group call session core
pub(crate) struct GroupCallSession {
    id: SessionId,
    self_user: UserId,
    config: GroupCallConfig,
    signaling: SignalingHandler,
    engines: Arc<dyn MediaEngineFactory>,
    delegate: Option<Arc<dyn GroupCallDelegate>>,
    mailbox: mpsc::WeakUnboundedSender<SessionMessage>,
    channels: SessionChannels,

    state: SessionState,
    mute: MuteState,
    handle: Option<CallHandle>,
    call: Option<CallSnapshot>,
    my_source: SourceId,
    engine: Option<EngineInstance>,
    engine_generation: u64,
    speaking: SpeakingTracker,
    invited: BTreeSet<UserId>,
    input_device: Option<String>,
    output_device: Option<String>,
    ducking_enabled: bool,

    next_token: u64,
    create_token: Option<u64>,
    join_token: Option<u64>,
    mute_token: Option<u64>,
    leave_token: Option<u64>,
    discard_token: Option<u64>,
    rejoin_attempt: u32,
    finish_type: Option<FinishType>,
    reload_in_flight: bool,
    last_reload_version: Option<u32>,
    updates_task: Option<JoinHandle<()>>,

    join_check_at: Option<Instant>,
    leave_deadline: Option<Instant>,
    discard_deadline: Option<Instant>,
    rejoin_at: Option<Instant>,
    gap_deadline: Option<Instant>,
    speaking_tick: Option<Instant>,
}

impl GroupCallSession {
    pub(crate) fn new(setup: SessionSetup) -> Self {
        let speaking = SpeakingTracker::new(setup.config.speaking.clone());
        let ducking_enabled = setup.config.ducking_enabled;
        setup.channels.mute.send_replace(setup.mute);
        Self {
            id: setup.id,
            self_user: setup.self_user,
            config: setup.config,
            signaling: setup.signaling,
            engines: setup.engines,
            delegate: setup.delegate,
            mailbox: setup.mailbox,
            channels: setup.channels,
            state: SessionState::Creating,
            mute: setup.mute,
            handle: None,
            call: None,
            my_source: 0,
            engine: None,
            engine_generation: 0,
            speaking,
            invited: BTreeSet::new(),
            input_device: None,
            output_device: None,
            ducking_enabled,
            next_token: 0,
            create_token: None,
            join_token: None,
            mute_token: None,
            leave_token: None,
            discard_token: None,
            rejoin_attempt: 0,
            finish_type: None,
            reload_in_flight: false,
            last_reload_version: None,
            updates_task: None,
            join_check_at: None,
            leave_deadline: None,
            discard_deadline: None,
            rejoin_at: None,
            gap_deadline: None,
            speaking_tick: None,
        }
    }

    /// Process one message; returns `false` once the session is released
    pub(crate) fn handle(&mut self, message: SessionMessage) -> bool {
        match message {
            SessionMessage::Command(command) => self.handle_command(command),
            SessionMessage::CreateFinished { token, result } => {
                self.on_create_finished(token, result);
            }
            SessionMessage::JoinFinished {
                token,
                muted,
                result,
            } => self.on_join_finished(token, muted, result),
            SessionMessage::LeaveFinished { token } => self.on_leave_finished(token),
            SessionMessage::DiscardFinished { token, result } => {
                self.on_discard_finished(token, result);
            }
            SessionMessage::MuteFinished { token, result } => self.on_mute_finished(token, result),
            SessionMessage::CheckFinished { source, result } => {
                self.on_check_finished(source, result);
            }
            SessionMessage::ReloadFinished { result } => self.on_reload_finished(result),
            SessionMessage::Update(update) => self.handle_update(update),
            SessionMessage::Engine { generation, event } => {
                self.on_engine_event(generation, event);
            }
            SessionMessage::Released => {
                self.release();
                return false;
            }
        }
        true
    }

    /// Earliest armed timer
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        [
            self.join_check_at,
            self.leave_deadline,
            self.discard_deadline,
            self.rejoin_at,
            self.gap_deadline,
            self.speaking_tick,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire every timer due at `now`
    pub(crate) fn on_timer(&mut self, now: Instant) {
        if self.state.is_terminal() {
            self.clear_timers();
            return;
        }
        if take_due(&mut self.leave_deadline, now) {
            tracing::warn!(session = %self.id, "Leave request timed out");
            if let Some(kind) = self.finish_type {
                self.complete_finish(kind);
            }
        }
        if take_due(&mut self.discard_deadline, now) && self.discard_token.take().is_some() {
            tracing::warn!(session = %self.id, "Discard request timed out");
            self.finish(FinishType::Failed);
        }
        if self.state.is_terminal() {
            return;
        }
        if take_due(&mut self.rejoin_at, now)
            && self.state == SessionState::Joining
            && self.join_token.is_none()
        {
            self.send_join();
        }
        if take_due(&mut self.join_check_at, now) {
            self.check_joined();
        }
        if take_due(&mut self.gap_deadline, now) {
            tracing::debug!(session = %self.id, "Update gap not filled, reloading call");
            self.request_reload(true);
        }
        if take_due(&mut self.speaking_tick, now) {
            self.on_speaking_tick(now);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { title } => self.start(title),
            Command::Join(handle) => self.join(handle),
            Command::Rejoin => self.rejoin(),
            Command::Hangup => self.hangup(),
            Command::Discard => self.discard(),
            Command::SetMuted(state) => self.set_muted(state),
            Command::ToggleMute { user, mute } => self.toggle_mute(user, mute),
            Command::InviteUsers { users, reply } => self.invite_users(users, reply),
            Command::SetAudioDevice { kind, device_id } => self.set_audio_device(kind, device_id),
            Command::SetDucking(enabled) => self.set_ducking_enabled(enabled),
            Command::ChangeTitle(title) => self.change_title(title),
            Command::ToggleRecording { enabled, title } => self.toggle_recording(enabled, title),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    // Lifecycle

    fn start(&mut self, title: Option<String>) {
        if self.state != SessionState::Creating
            || self.handle.is_some()
            || self.create_token.is_some()
        {
            tracing::warn!(session = %self.id, state = ?self.state, "Ignoring start: call already set up");
            return;
        }
        let token = self.next_token();
        self.create_token = Some(token);
        let random_id: u64 = rand::random();
        let signaling = self.signaling.clone();
        tracing::info!(session = %self.id, "Creating group call");
        self.spawn_request(async move {
            let result = signaling.create_call(random_id, title).await;
            SessionMessage::CreateFinished { token, result }
        });
    }

    fn on_create_finished(&mut self, token: u64, result: Result<CallHandle, SignalingError>) {
        if self.create_token != Some(token) {
            tracing::debug!(session = %self.id, token, "Discarding stale create response");
            return;
        }
        self.create_token = None;
        match result {
            Ok(handle) => {
                tracing::info!(session = %self.id, call_id = %handle, "Group call created");
                self.attach(handle);
                self.send_join();
            }
            Err(e) => {
                tracing::error!(session = %self.id, error = %e, "Failed to create group call");
                self.finish(FinishType::Failed);
            }
        }
    }

    fn join(&mut self, handle: CallHandle) {
        match self.state {
            SessionState::Creating if self.create_token.is_none() => {}
            SessionState::Joining if self.handle == Some(handle) => {}
            state => {
                tracing::warn!(session = %self.id, state = ?state, call_id = %handle, "Ignoring join in current state");
                return;
            }
        }
        if self.handle.is_none() {
            self.attach(handle);
        }
        if self.join_token.is_some() {
            tracing::debug!(session = %self.id, "Superseding in-flight join request");
        }
        self.rejoin_attempt = 0;
        self.rejoin_at = None;
        self.send_join();
    }

    fn attach(&mut self, handle: CallHandle) {
        self.handle = Some(handle);
        self.call = Some(CallSnapshot::new(handle));
        if let Some(tx) = self.mailbox.upgrade() {
            let signaling = self.signaling.clone();
            self.updates_task = Some(tokio::spawn(async move {
                let Ok(mut updates) = signaling.subscribe_updates(handle).await else {
                    return;
                };
                while let Some(update) = updates.next().await {
                    if tx.send(SessionMessage::Update(update)).is_err() {
                        break;
                    }
                }
            }));
        }
        self.request_reload(true);
    }

    fn send_join(&mut self) {
        let Some(handle) = self.handle else {
            return;
        };
        self.set_state(SessionState::Joining);
        let token = self.next_token();
        self.join_token = Some(token);
        let muted = self.mute.engine_muted();
        let request = JoinRequest {
            muted,
            capabilities: self.config.capabilities.clone(),
        };
        let signaling = self.signaling.clone();
        tracing::debug!(session = %self.id, call_id = %handle, token, "Sending join request");
        self.spawn_request(async move {
            let result = signaling.join_call(handle, request).await;
            SessionMessage::JoinFinished {
                token,
                muted,
                result,
            }
        });
    }

    fn on_join_finished(
        &mut self,
        token: u64,
        muted: bool,
        result: Result<JoinResponse, SignalingError>,
    ) {
        if self.join_token != Some(token) {
            tracing::debug!(session = %self.id, token, "Discarding stale join response");
            return;
        }
        self.join_token = None;
        if self.state != SessionState::Joining {
            return;
        }
        match result {
            Ok(response) => self.on_joined(response, muted),
            Err(e) => self.on_join_failed(&e),
        }
    }

    fn on_joined(&mut self, response: JoinResponse, muted_sent: bool) {
        self.rejoin_attempt = 0;
        self.rejoin_at = None;
        self.my_source = response.self_source;
        self.speaking.set_self_source(response.self_source);
        tracing::info!(
            session = %self.id,
            call_id = self.call_id(),
            source = response.self_source,
            "Joined group call"
        );

        if !self.create_engine(response.media) {
            self.finish(FinishType::Failed);
            return;
        }
        self.set_state(SessionState::Connecting);
        self.join_check_at = Some(Instant::now() + self.config.join_check_timeout);

        if muted_sent != self.mute.engine_muted() {
            self.send_mute_update();
        }
    }

    fn on_join_failed(&mut self, error: &SignalingError) {
        if self.rejoin_attempt == 0 {
            tracing::error!(session = %self.id, error = %error, "Join failed");
            self.finish(FinishType::Failed);
            return;
        }
        if self.rejoin_attempt >= self.config.rejoin.max_attempts {
            tracing::error!(
                session = %self.id,
                attempts = self.rejoin_attempt,
                error = %error,
                "Rejoin attempts exhausted"
            );
            self.finish(FinishType::Failed);
            return;
        }
        let delay = self.config.rejoin.delay(self.rejoin_attempt);
        tracing::warn!(
            session = %self.id,
            attempt = self.rejoin_attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Rejoin failed, retrying"
        );
        self.rejoin_attempt += 1;
        self.rejoin_at = Some(Instant::now() + delay);
    }

    fn rejoin(&mut self) {
        match self.state {
            SessionState::Connecting | SessionState::Joined => {}
            SessionState::Joining if self.join_token.is_none() && self.handle.is_some() => {}
            state => {
                tracing::debug!(session = %self.id, state = ?state, "Ignoring rejoin in current state");
                return;
            }
        }
        if self.rejoin_attempt == 0 {
            self.rejoin_attempt = 1;
        }
        tracing::info!(session = %self.id, attempt = self.rejoin_attempt, "Rejoining group call");
        self.rejoin_at = None;
        self.join_check_at = None;
        self.destroy_engine();
        self.clear_speaking();
        self.send_join();
    }

    fn create_engine(&mut self, media: MediaConfig) -> bool {
        let Some(tx) = self.mailbox.upgrade() else {
            return false;
        };
        self.engine_generation += 1;
        let generation = self.engine_generation;
        let muted = self.mute.engine_muted();
        let config = EngineConfig {
            self_source: self.my_source,
            media,
            muted,
            input_device: self.input_device.clone(),
            output_device: self.output_device.clone(),
            ducking_enabled: self.ducking_enabled,
        };
        match self
            .engines
            .create(config, EngineEventSender::new(generation, tx))
        {
            Ok(engine) => {
                tracing::debug!(session = %self.id, generation, "Media engine created");
                self.engine = Some(EngineInstance::new(generation, engine, muted));
                true
            }
            Err(e) => {
                tracing::error!(session = %self.id, error = %e, "Failed to create media engine");
                false
            }
        }
    }

    fn destroy_engine(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.destroy();
        }
    }

    fn check_joined(&mut self) {
        if self.state != SessionState::Connecting {
            return;
        }
        let Some(handle) = self.handle else {
            return;
        };
        let source = self.my_source;
        let signaling = self.signaling.clone();
        tracing::debug!(session = %self.id, source, "Media not connected yet, checking membership");
        self.spawn_request(async move {
            let result = signaling.check_call(handle, vec![source]).await;
            SessionMessage::CheckFinished { source, result }
        });
    }

    fn on_check_finished(&mut self, source: SourceId, result: Result<Vec<SourceId>, SignalingError>) {
        if self.state != SessionState::Connecting || source != self.my_source {
            return;
        }
        match result {
            Ok(present) if present.contains(&source) => {
                self.join_check_at = Some(Instant::now() + self.config.join_check_timeout);
            }
            Ok(_) => {
                tracing::warn!(session = %self.id, source, "No longer a member of the call");
                self.rejoin();
            }
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "Membership check failed");
                self.rejoin();
            }
        }
    }

    fn hangup(&mut self) {
        self.finish(FinishType::Ended);
    }

    fn discard(&mut self) {
        if self.state.is_terminal() || self.state.is_hanging_up() || self.discard_token.is_some()
        {
            return;
        }
        let Some(handle) = self.handle else {
            self.finish(FinishType::Ended);
            return;
        };
        let token = self.next_token();
        self.discard_token = Some(token);
        self.discard_deadline = Some(Instant::now() + self.config.leave_timeout);
        let signaling = self.signaling.clone();
        tracing::info!(session = %self.id, call_id = %handle, "Discarding group call");
        self.spawn_request(async move {
            let result = signaling.discard_call(handle).await;
            SessionMessage::DiscardFinished { token, result }
        });
    }

    fn on_discard_finished(&mut self, token: u64, result: Result<(), SignalingError>) {
        if self.discard_token != Some(token) {
            return;
        }
        self.discard_token = None;
        self.discard_deadline = None;
        match result {
            Ok(()) => self.finish(FinishType::Ended),
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "Discard failed");
                self.finish(FinishType::Failed);
            }
        }
    }

    fn finish(&mut self, kind: FinishType) {
        if self.state.is_terminal() || self.state.is_hanging_up() {
            return;
        }
        self.create_token = None;
        self.join_token = None;
        self.discard_token = None;
        self.discard_deadline = None;
        self.rejoin_at = None;
        self.join_check_at = None;
        self.gap_deadline = None;

        let leave_target = self.handle.filter(|_| self.my_source != 0);
        if self.engine.is_none() {
            if let Some(handle) = leave_target {
                let source = self.my_source;
                let signaling = self.signaling.clone();
                tokio::spawn(async move {
                    let _ = signaling.leave_call(handle, source).await;
                });
            }
            self.complete_finish(kind);
            return;
        }

        self.finish_type = Some(kind);
        self.set_state(kind.hangup_state());
        match leave_target {
            Some(handle) => {
                let token = self.next_token();
                self.leave_token = Some(token);
                self.leave_deadline = Some(Instant::now() + self.config.leave_timeout);
                let source = self.my_source;
                let signaling = self.signaling.clone();
                self.spawn_request(async move {
                    let _ = signaling.leave_call(handle, source).await;
                    SessionMessage::LeaveFinished { token }
                });
            }
            None => self.complete_finish(kind),
        }
    }

    fn on_leave_finished(&mut self, token: u64) {
        if self.leave_token != Some(token) {
            return;
        }
        if let Some(kind) = self.finish_type {
            self.complete_finish(kind);
        }
    }

    fn complete_finish(&mut self, kind: FinishType) {
        self.leave_token = None;
        self.finish_type = None;
        self.clear_timers();
        self.destroy_engine();
        self.clear_speaking();
        if let Some(task) = self.updates_task.take() {
            task.abort();
        }

        self.set_state(kind.final_state());
        match kind {
            FinishType::Ended => {
                tracing::info!(session = %self.id, call_id = self.call_id(), "Group call ended");
                self.emit(SessionEvent::Finished);
                if let Some(delegate) = &self.delegate {
                    delegate.on_finished(self.id, self.handle);
                }
            }
            FinishType::Failed => {
                tracing::warn!(session = %self.id, call_id = self.call_id(), "Group call failed");
                self.emit(SessionEvent::Failed);
                if let Some(delegate) = &self.delegate {
                    delegate.on_failed(self.id, self.handle);
                }
            }
        }
    }

    fn clear_timers(&mut self) {
        self.join_check_at = None;
        self.leave_deadline = None;
        self.discard_deadline = None;
        self.rejoin_at = None;
        self.gap_deadline = None;
        self.speaking_tick = None;
    }

    fn release(&mut self) {
        tracing::debug!(session = %self.id, state = ?self.state, "Session released");
        self.destroy_engine();
        if let Some(task) = self.updates_task.take() {
            task.abort();
        }
    }

    // Mute

    fn set_muted(&mut self, state: MuteState) {
        if self.state.is_terminal() {
            return;
        }
        if self.mute == MuteState::ForceMuted && state != MuteState::ForceMuted {
            tracing::debug!(session = %self.id, requested = ?state, "Ignoring local mute change while force-muted");
            return;
        }
        let was_muted = self.mute.engine_muted();
        if !self.apply_mute(state) {
            return;
        }
        let joined = matches!(
            self.state,
            SessionState::Connecting | SessionState::Joined
        );
        if joined && was_muted != state.engine_muted() {
            self.send_mute_update();
        }
    }

    fn apply_mute(&mut self, state: MuteState) -> bool {
        if self.mute == state {
            return false;
        }
        let old = self.mute;
        self.mute = state;
        tracing::debug!(session = %self.id, old_mute = ?old, new_mute = ?state, "Mute state change");
        if let Some(engine) = self.engine.as_mut() {
            if engine.muted() != state.engine_muted() {
                engine.set_muted(state.engine_muted());
            }
        }
        self.channels.mute.send_replace(state);
        self.emit(SessionEvent::MuteChanged(state));
        true
    }

    fn send_mute_update(&mut self) {
        let Some(handle) = self.handle else {
            return;
        };
        let token = self.next_token();
        if self.mute_token.is_some() {
            tracing::debug!(session = %self.id, token, "Superseding in-flight mute update");
        }
        self.mute_token = Some(token);
        let muted = self.mute.engine_muted();
        let signaling = self.signaling.clone();
        self.spawn_request(async move {
            let result = signaling.update_mute(handle, muted).await;
            SessionMessage::MuteFinished { token, result }
        });
    }

    fn on_mute_finished(&mut self, token: u64, result: Result<(), SignalingError>) {
        if self.mute_token != Some(token) {
            tracing::debug!(session = %self.id, token, "Discarding stale mute response");
            return;
        }
        self.mute_token = None;
        if let Err(e) = result {
            tracing::warn!(session = %self.id, error = %e, "Mute update failed, keeping local state");
        }
    }

    fn toggle_mute(&mut self, user: UserId, mute: bool) {
        let Some(handle) = self.handle else {
            tracing::warn!(session = %self.id, user = %user, "Cannot toggle mute without a call");
            return;
        };
        let signaling = self.signaling.clone();
        tokio::spawn(async move {
            let _ = signaling.toggle_participant_mute(handle, user, mute).await;
        });
    }

    // Administration

    fn invite_users(
        &mut self,
        users: Vec<UserId>,
        reply: oneshot::Sender<Result<InviteResult, SessionError>>,
    ) {
        let Some(handle) = self.handle else {
            let _ = reply.send(Err(SessionError::NoCall));
            return;
        };
        let mut fresh = Vec::new();
        for user in users {
            let present = self
                .call
                .as_ref()
                .is_some_and(|call| call.participant(user).is_some());
            if present || user == self.self_user || !self.invited.insert(user) {
                continue;
            }
            fresh.push(user);
        }
        if fresh.is_empty() {
            let _ = reply.send(Ok(InviteResult::Invited(0)));
            return;
        }
        let slice = self.config.invite_slice_size.max(1);
        let signaling = self.signaling.clone();
        tokio::spawn(async move {
            let result = invite_in_slices(&signaling, handle, &fresh, slice).await;
            let _ = reply.send(result);
        });
    }

    fn change_title(&mut self, title: String) {
        let Some(handle) = self.handle else {
            tracing::warn!(session = %self.id, "Cannot change title without a call");
            return;
        };
        if self.call.as_ref().and_then(CallSnapshot::title) == Some(title.as_str()) {
            return;
        }
        let signaling = self.signaling.clone();
        tokio::spawn(async move {
            let _ = signaling.edit_title(handle, title).await;
        });
    }

    fn toggle_recording(&mut self, enabled: bool, title: Option<String>) {
        let Some(handle) = self.handle else {
            tracing::warn!(session = %self.id, "Cannot toggle recording without a call");
            return;
        };
        let signaling = self.signaling.clone();
        tokio::spawn(async move {
            let _ = signaling.toggle_recording(handle, enabled, title).await;
        });
    }

    fn set_audio_device(&mut self, kind: AudioDeviceKind, device_id: String) {
        if let Some(engine) = self.engine.as_mut() {
            engine.set_audio_device(kind, &device_id);
        }
        match kind {
            AudioDeviceKind::Input => self.input_device = Some(device_id),
            AudioDeviceKind::Output => self.output_device = Some(device_id),
        }
    }

    fn set_ducking_enabled(&mut self, enabled: bool) {
        if self.ducking_enabled == enabled {
            return;
        }
        self.ducking_enabled = enabled;
        if let Some(engine) = self.engine.as_mut() {
            engine.set_ducking_enabled(enabled);
        }
    }

    // Signaling pushes

    fn handle_update(&mut self, update: CallUpdate) {
        if self.state.is_terminal() {
            return;
        }
        let Some(call) = self.call.as_mut() else {
            tracing::debug!(session = %self.id, "Ignoring update before the call is known");
            return;
        };
        tracing::trace!(
            session = %self.id,
            update_type = update_type(&update),
            "Applying call update"
        );
        let outcome = call.enqueue(update);
        self.process_outcome(outcome);
    }

    fn process_outcome(&mut self, outcome: ApplyOutcome) {
        if outcome.call_changed {
            if let Some(info) = self.call_info() {
                self.emit(SessionEvent::CallUpdated(info));
            }
        }
        for change in outcome.participant_changes {
            self.emit(SessionEvent::ParticipantUpdated(change));
        }

        let mut discarded = false;
        for update in &outcome.applied {
            match update {
                CallUpdate::Participants(data) => self.reconcile_self(data),
                CallUpdate::Discarded { .. } => discarded = true,
                CallUpdate::Call(_) => {}
            }
        }

        if outcome.pending {
            if self.gap_deadline.is_none() {
                self.gap_deadline = Some(Instant::now() + self.config.update_gap_timeout);
            }
        } else {
            self.gap_deadline = None;
        }
        if outcome.reload_needed {
            self.request_reload(false);
        }
        if discarded {
            tracing::info!(session = %self.id, call_id = self.call_id(), "Call discarded");
            self.finish(FinishType::Ended);
        }
    }

    fn reconcile_self(&mut self, data: &ParticipantsUpdate) {
        let me = self.self_user;
        for entry in data.participants.iter().filter(|p| p.user == me) {
            if self.state.is_terminal() || self.state.is_hanging_up() {
                return;
            }
            let in_call = matches!(
                self.state,
                SessionState::Connecting | SessionState::Joined
            );
            if entry.left {
                if in_call && entry.source == self.my_source {
                    tracing::warn!(session = %self.id, "Removed from the call by the server, rejoining");
                    self.rejoin();
                }
                continue;
            }
            if in_call
                && entry.source != 0
                && self.my_source != 0
                && entry.source != self.my_source
            {
                tracing::warn!(session = %self.id, source = entry.source, "Joined from another device, hanging up");
                self.my_source = 0;
                self.speaking.set_self_source(0);
                self.hangup();
                return;
            }
            if entry.muted && !entry.can_self_unmute {
                self.apply_mute(MuteState::ForceMuted);
            } else if self.mute == MuteState::ForceMuted {
                self.apply_mute(MuteState::Muted);
            }
        }
    }

    fn request_reload(&mut self, force: bool) {
        if self.state.is_terminal() {
            return;
        }
        let Some(handle) = self.handle else {
            return;
        };
        if self.reload_in_flight {
            return;
        }
        let version = self.call.as_ref().map(CallSnapshot::version);
        if !force && self.last_reload_version == version {
            return;
        }
        self.reload_in_flight = true;
        self.last_reload_version = version;
        let signaling = self.signaling.clone();
        self.spawn_request(async move {
            let result = signaling.get_call(handle).await;
            SessionMessage::ReloadFinished { result }
        });
    }

    fn on_reload_finished(&mut self, result: Result<FullCall, SignalingError>) {
        self.reload_in_flight = false;
        if self.state.is_terminal() {
            return;
        }
        match result {
            Ok(full) => {
                let Some(call) = self.call.as_mut() else {
                    return;
                };
                let outcome = call.apply_full_call(full);
                self.process_outcome(outcome);
            }
            Err(SignalingError::CallNotFound(id)) => {
                tracing::info!(session = %self.id, call_id = id, "Call no longer exists");
                self.finish(FinishType::Ended);
            }
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "Call reload failed");
            }
        }
    }

    // Media engine events

    fn on_engine_event(&mut self, generation: u64, event: EngineEvent) {
        if self.engine.as_ref().map(EngineInstance::generation) != Some(generation) {
            tracing::trace!(session = %self.id, generation, "Dropping event from a destroyed engine");
            return;
        }
        match event {
            EngineEvent::ConnectivityChanged(true) => {
                if self.state == SessionState::Connecting {
                    self.join_check_at = None;
                    self.set_state(SessionState::Joined);
                }
            }
            EngineEvent::ConnectivityChanged(false) => {
                if matches!(
                    self.state,
                    SessionState::Connecting | SessionState::Joined
                ) {
                    tracing::warn!(session = %self.id, "Media connectivity lost");
                    self.rejoin();
                }
            }
            EngineEvent::Levels(levels) => self.on_levels(&levels),
            EngineEvent::SelfLevel(value) => {
                let source = self.my_source;
                if source != 0 {
                    self.on_levels(&[(source, value)]);
                }
            }
            EngineEvent::Fatal(reason) => {
                tracing::error!(session = %self.id, reason = %reason, "Media engine failed");
                self.finish(FinishType::Failed);
            }
        }
    }

    fn on_levels(&mut self, levels: &[(SourceId, f32)]) {
        let now = Instant::now();
        let self_active = self.mute == MuteState::Active;
        let (updates, started) = self.speaking.process_levels(levels, self_active, now);
        for update in updates {
            let _ = self.channels.levels.send(update);
        }
        for change in started {
            self.on_speaking_change(change);
        }
        if self.speaking_tick.is_none() && !self.speaking.speakers().is_empty() {
            self.speaking_tick = Some(now + self.speaking.config().check_interval);
        }
    }

    fn on_speaking_tick(&mut self, now: Instant) {
        for change in self.speaking.evict(now) {
            self.on_speaking_change(change);
        }
        if !self.speaking.speakers().is_empty() {
            self.speaking_tick = Some(now + self.speaking.config().check_interval);
        }
    }

    fn on_speaking_change(&mut self, change: SpeakingChange) {
        let updated = self
            .call
            .as_mut()
            .and_then(|call| call.set_speaking(change.source, change.speaking));
        if let Some(participant) = updated {
            self.emit(SessionEvent::ParticipantUpdated(participant));
        }
        self.emit(SessionEvent::Speaking(change));
    }

    fn clear_speaking(&mut self) {
        for source in self.speaking.speakers() {
            let change = SpeakingChange {
                source,
                speaking: false,
                self_: self.speaking.is_self(source),
            };
            self.on_speaking_change(change);
        }
        self.speaking.clear();
        self.speaking_tick = None;
    }

    // Helpers

    fn set_state(&mut self, new: SessionState) {
        let old = self.state;
        if old == new {
            return;
        }
        debug_assert_eq!(
            new.has_engine(),
            self.engine.is_some(),
            "media engine presence must match state {new:?}"
        );
        self.state = new;
        tracing::debug!(
            session = %self.id,
            call_id = self.call_id(),
            old_state = ?old,
            new_state = ?new,
            "Session state transition"
        );
        self.channels.state.send_replace(new);
        self.emit(SessionEvent::StateChanged { old, new });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.channels.events.send(event);
    }

    fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn call_id(&self) -> u64 {
        self.handle.map_or(0, |handle| handle.id)
    }

    fn call_info(&self) -> Option<CallInfo> {
        self.call.as_ref().map(|call| CallInfo {
            title: call.title().map(str::to_string),
            record_start_date: call.record_start_date(),
            participants_count: call.full_count(),
            discarded: call.is_discarded(),
        })
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            state: self.state,
            mute: self.mute,
            handle: self.handle,
            self_source: self.my_source,
            engine_generation: self.engine.as_ref().map(EngineInstance::generation),
            join_in_flight: self.join_token.is_some(),
            mute_update_in_flight: self.mute_token.is_some(),
            rejoin_attempt: self.rejoin_attempt,
            speakers: self.speaking.speakers(),
            invited: self.invited.iter().copied().collect(),
            input_device: self.input_device.clone(),
            output_device: self.output_device.clone(),
            ducking_enabled: self.ducking_enabled,
            call: self.call.clone(),
        }
    }

    /// Run a request off the owner task and post its completion back
    fn spawn_request<F>(&self, request: F)
    where
        F: Future<Output = SessionMessage> + Send + 'static,
    {
        let Some(tx) = self.mailbox.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let _ = tx.send(request.await);
        });
    }
}

fn take_due(deadline: &mut Option<Instant>, now: Instant) -> bool {
    match *deadline {
        Some(at) if at <= now => {
            *deadline = None;
            true
        }
        _ => false,
    }
}

async fn invite_in_slices(
    signaling: &SignalingHandler,
    handle: CallHandle,
    users: &[UserId],
    slice: usize,
) -> Result<InviteResult, SessionError> {
    let mut invited = 0;
    let mut direct = Vec::new();
    let mut last_error = None;
    for chunk in users.chunks(slice) {
        match signaling.invite_users(handle, chunk.to_vec()).await {
            Ok(InviteOutcome::Invited { count }) => invited += count,
            Ok(InviteOutcome::NeedsDirectCall { user }) => direct.push(user),
            Err(e) => last_error = Some(e),
        }
    }
    match (direct.as_slice(), last_error) {
        ([user], _) => Ok(InviteResult::DirectCall(*user)),
        ([], Some(e)) if invited == 0 => Err(e.into()),
        _ => Ok(InviteResult::Invited(invited)),
    }
}
