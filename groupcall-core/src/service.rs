//! Group call session handle and orchestration
//!
//! [`GroupCall`] is the public face of a session. The session itself lives
//! on a spawned owner task; the handle only sends commands into its mailbox
//! and reads the published state. Dropping the last handle releases the
//! session (its media engine is destroyed without a leave request).

use crate::call::{
    Command, GroupCallSession, SessionChannels, SessionEvent, SessionMessage, SessionSetup,
    SessionSnapshot,
};
use crate::media::MediaEngineFactory;
use crate::signaling::{CallUpdate, SignalingClient, SignalingError, SignalingHandler};
use crate::speaking::SpeakingConfig;
use crate::types::{
    AudioDeviceKind, CallHandle, LevelUpdate, MediaCapabilities, MuteState, SessionId,
    SessionState, UserId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session task is gone
    #[error("Session closed")]
    SessionClosed,

    /// The operation needs a call handle and none is known yet
    #[error("No call handle yet")]
    NoCall,

    /// No tokio runtime to run the session on
    #[error("No tokio runtime available")]
    NoRuntime,

    /// Signaling error
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

/// Result of inviting users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InviteResult {
    /// Number of users invited
    Invited(usize),
    /// The only failed invite; call this user directly instead
    DirectCall(UserId),
}

/// Exponential backoff for rejoin attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejoinPolicy {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
}

impl RejoinPolicy {
    /// Delay before the attempt following failed attempt number `attempt`
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RejoinPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Group call configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupCallConfig {
    /// Speaking detection
    pub speaking: SpeakingConfig,
    /// How long to wait for media connectivity before checking membership
    pub join_check_timeout: Duration,
    /// How long to wait for a leave response
    pub leave_timeout: Duration,
    /// Rejoin backoff
    pub rejoin: RejoinPolicy,
    /// Users per invite request
    pub invite_slice_size: usize,
    /// How long queued updates may wait for a missing version
    pub update_gap_timeout: Duration,
    /// Capabilities sent with join requests
    pub capabilities: MediaCapabilities,
    /// Initial ducking flag
    pub ducking_enabled: bool,
    /// Capacity of the session event channel
    pub event_capacity: usize,
    /// Capacity of the level update channel
    pub level_capacity: usize,
}

impl Default for GroupCallConfig {
    fn default() -> Self {
        Self {
            speaking: SpeakingConfig::default(),
            join_check_timeout: Duration::from_secs(10),
            leave_timeout: Duration::from_secs(5),
            rejoin: RejoinPolicy::default(),
            invite_slice_size: 10,
            update_gap_timeout: Duration::from_secs(3),
            capabilities: MediaCapabilities::default(),
            ducking_enabled: false,
            event_capacity: 256,
            level_capacity: 1024,
        }
    }
}

/// Owner notified once a session reaches a terminal state
///
/// Called from the session task after the terminal state is published.
/// The owner is expected to drop its handles afterwards.
pub trait GroupCallDelegate: Send + Sync {
    /// Session ended normally
    fn on_finished(&self, session: SessionId, call: Option<CallHandle>);

    /// Session failed
    fn on_failed(&self, session: SessionId, call: Option<CallHandle>);
}

struct Shared {
    id: SessionId,
    tx: mpsc::UnboundedSender<SessionMessage>,
    state: watch::Receiver<SessionState>,
    mute: watch::Receiver<MuteState>,
    levels: broadcast::Sender<LevelUpdate>,
    events: broadcast::Sender<SessionEvent>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.tx.send(SessionMessage::Released);
    }
}

/// Handle to a group call session
///
/// Cheap to clone. Commands are processed in the order they are sent.
#[derive(Clone)]
pub struct GroupCall {
    shared: Arc<Shared>,
}

impl GroupCall {
    /// Create a builder
    #[must_use]
    pub fn builder(
        self_user: UserId,
        signaling: Arc<dyn SignalingClient>,
        engines: Arc<dyn MediaEngineFactory>,
    ) -> GroupCallBuilder {
        GroupCallBuilder::new(self_user, signaling, engines)
    }

    /// Session identifier
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    fn command(&self, command: Command) -> Result<(), SessionError> {
        self.shared
            .tx
            .send(SessionMessage::Command(command))
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Create a new call and join it
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed
    pub fn start(&self, title: Option<String>) -> Result<(), SessionError> {
        self.command(Command::Start { title })
    }

    /// Join an existing call
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed
    pub fn join(&self, handle: CallHandle) -> Result<(), SessionError> {
        self.command(Command::Join(handle))
    }

    /// Re-establish the media connection without leaving the call
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed
    pub fn rejoin(&self) -> Result<(), SessionError> {
        self.command(Command::Rejoin)
    }

    /// Leave the call
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed
    pub fn hangup(&self) -> Result<(), SessionError> {
        self.command(Command::Hangup)
    }

    /// End the call for everyone
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed
    pub fn discard(&self) -> Result<(), SessionError> {
        self.command(Command::Discard)
    }

    /// Change the local mute state
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed
    pub fn set_muted(&self, state: MuteState) -> Result<(), SessionError> {
        self.command(Command::SetMuted(state))
    }

    /// Mute or unmute another participant
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed
    pub fn toggle_mute(&self, user: UserId, mute: bool) -> Result<(), SessionError> {
        self.command(Command::ToggleMute { user, mute })
    }

    /// Invite users to the call
    ///
    /// # Errors
    ///
    /// Returns error if there is no call yet, the session is closed or
    /// every invite request failed
    pub async fn invite_users(&self, users: Vec<UserId>) -> Result<InviteResult, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::InviteUsers { users, reply })?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Switch an audio device
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed
    pub fn set_audio_device(
        &self,
        kind: AudioDeviceKind,
        device_id: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.command(Command::SetAudioDevice {
            kind,
            device_id: device_id.into(),
        })
    }

    /// Enable or disable ducking of other audio
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed
    pub fn set_ducking_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        self.command(Command::SetDucking(enabled))
    }

    /// Change the call title
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed
    pub fn change_title(&self, title: impl Into<String>) -> Result<(), SessionError> {
        self.command(Command::ChangeTitle(title.into()))
    }

    /// Start or stop recording
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed
    pub fn toggle_recording(
        &self,
        enabled: bool,
        title: Option<String>,
    ) -> Result<(), SessionError> {
        self.command(Command::ToggleRecording { enabled, title })
    }

    /// Feed a signaling push into the session
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed
    pub fn handle_update(&self, update: CallUpdate) -> Result<(), SessionError> {
        self.shared
            .tx
            .send(SessionMessage::Update(update))
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Subscribe to state changes
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.clone()
    }

    /// Current mute state
    #[must_use]
    pub fn muted(&self) -> MuteState {
        *self.shared.mute.borrow()
    }

    /// Subscribe to mute state changes
    #[must_use]
    pub fn subscribe_muted(&self) -> watch::Receiver<MuteState> {
        self.shared.mute.clone()
    }

    /// Subscribe to audio level updates
    #[must_use]
    pub fn level_updates(&self) -> broadcast::Receiver<LevelUpdate> {
        self.shared.levels.subscribe()
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Point-in-time snapshot of the session
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot(reply))?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    /// Wait until the state satisfies `predicate`
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed first
    pub async fn wait_for_state(
        &self,
        predicate: impl Fn(SessionState) -> bool,
    ) -> Result<SessionState, SessionError> {
        let mut rx = self.shared.state.clone();
        loop {
            let state = *rx.borrow_and_update();
            if predicate(state) {
                return Ok(state);
            }
            rx.changed()
                .await
                .map_err(|_| SessionError::SessionClosed)?;
        }
    }
}

impl std::fmt::Debug for GroupCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCall")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Group call session builder
pub struct GroupCallBuilder {
    self_user: UserId,
    signaling: Arc<dyn SignalingClient>,
    engines: Arc<dyn MediaEngineFactory>,
    config: GroupCallConfig,
    delegate: Option<Arc<dyn GroupCallDelegate>>,
    mute: MuteState,
}

impl GroupCallBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(
        self_user: UserId,
        signaling: Arc<dyn SignalingClient>,
        engines: Arc<dyn MediaEngineFactory>,
    ) -> Self {
        Self {
            self_user,
            signaling,
            engines,
            config: GroupCallConfig::default(),
            delegate: None,
            mute: MuteState::Muted,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: GroupCallConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the terminal-state delegate
    #[must_use]
    pub fn with_delegate(mut self, delegate: Arc<dyn GroupCallDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Set the initial mute state
    #[must_use]
    pub fn with_mute(mut self, mute: MuteState) -> Self {
        self.mute = mute;
        self
    }

    /// Spawn the session and return its handle
    ///
    /// # Errors
    ///
    /// Returns error if called outside a tokio runtime
    pub fn build(self) -> Result<GroupCall, SessionError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        let id = SessionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Creating);
        let (mute_tx, mute_rx) = watch::channel(self.mute);
        let (levels, _) = broadcast::channel(self.config.level_capacity.max(1));
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));

        let session = GroupCallSession::new(SessionSetup {
            id,
            self_user: self.self_user,
            config: self.config,
            signaling: SignalingHandler::new(self.signaling),
            engines: self.engines,
            delegate: self.delegate,
            mailbox: tx.downgrade(),
            channels: SessionChannels {
                state: state_tx,
                mute: mute_tx,
                levels: levels.clone(),
                events: events.clone(),
            },
            mute: self.mute,
        });
        runtime.spawn(run_session(session, rx));
        tracing::debug!(session = %id, user = %self.self_user, "Group call session spawned");

        Ok(GroupCall {
            shared: Arc::new(Shared {
                id,
                tx,
                state: state_rx,
                mute: mute_rx,
                levels,
                events,
            }),
        })
    }
}

async fn run_session(
    mut session: GroupCallSession,
    mut mailbox: mpsc::UnboundedReceiver<SessionMessage>,
) {
    loop {
        let deadline = session.next_deadline();
        tokio::select! {
            message = mailbox.recv() => {
                let Some(message) = message else {
                    session.handle(SessionMessage::Released);
                    break;
                };
                if !session.handle(message) {
                    break;
                }
            }
            () = sleep_until(deadline) => session.on_timer(Instant::now()),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
