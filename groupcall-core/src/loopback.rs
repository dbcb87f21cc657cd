//! In-process collaborators
//!
//! [`LoopbackService`] is a small call-management service living in the
//! same process and [`LoopbackSignaling`] is one user's connection to it.
//! [`SimulatedEngineFactory`] creates media engines that only record what
//! they are told and hand out their event senders. Together they drive a
//! session without a network or audio hardware.

use crate::media::{EngineConfig, EngineEventSender, MediaEngine, MediaEngineFactory, MediaError};
use crate::signaling::{
    CallMetadata, CallUpdate, FullCall, InviteOutcome, JoinRequest, JoinResponse, MediaConfig,
    ParticipantData, ParticipantsUpdate, SignalingClient, SignalingError,
};
use crate::types::{AudioDeviceKind, CallHandle, SourceId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Request kinds, for failure scripting and the request log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// `create_call`
    Create,
    /// `join_call`
    Join,
    /// `leave_call`
    Leave,
    /// `discard_call`
    Discard,
    /// `update_mute`
    UpdateMute,
    /// `toggle_participant_mute`
    ToggleParticipantMute,
    /// `invite_users`
    Invite,
    /// `edit_title`
    EditTitle,
    /// `toggle_recording`
    ToggleRecording,
    /// `get_call`
    GetCall,
    /// `check_call`
    CheckCall,
    /// `subscribe_updates`
    Subscribe,
}

struct LoopbackCall {
    handle: CallHandle,
    version: u32,
    title: Option<String>,
    record_start_date: Option<DateTime<Utc>>,
    join_muted: bool,
    participants: BTreeMap<UserId, ParticipantData>,
    subscribers: Vec<mpsc::UnboundedSender<CallUpdate>>,
}

impl LoopbackCall {
    fn metadata(&self) -> CallMetadata {
        CallMetadata {
            id: self.handle.id,
            access_hash: self.handle.access_hash,
            version: self.version,
            title: self.title.clone(),
            record_start_date: self.record_start_date,
            participants_count: self.participants.len() as u32,
            join_muted: self.join_muted,
            can_change_join_muted: true,
        }
    }

    fn publish(&mut self, update: &CallUpdate) {
        self.subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }

    fn publish_call(&mut self) {
        let update = CallUpdate::Call(self.metadata());
        self.publish(&update);
    }

    fn publish_participant(&mut self, mut data: ParticipantData, versioned: bool) {
        if versioned {
            self.version += 1;
        }
        data.versioned = versioned;
        let update = CallUpdate::Participants(ParticipantsUpdate {
            call_id: self.handle.id,
            version: self.version,
            participants: vec![data],
        });
        self.publish(&update);
        self.publish_call();
    }

    fn allocate_source(&self) -> SourceId {
        let mut rng = rand::thread_rng();
        loop {
            let source = rng.gen_range(1..=u32::MAX / 2);
            if !self.participants.values().any(|p| p.source == source) {
                return source;
            }
        }
    }

    fn add(&mut self, user: UserId, muted: bool, can_self_unmute: bool) -> SourceId {
        let source = self.allocate_source();
        let existed = self.participants.contains_key(&user);
        let now = Utc::now();
        let data = ParticipantData {
            user,
            source,
            date: now,
            active_date: Some(now),
            muted,
            can_self_unmute,
            muted_by_you: false,
            volume: None,
            raise_hand_rating: None,
            left: false,
            just_joined: false,
            versioned: false,
        };
        self.participants.insert(user, data.clone());
        let mut pushed = data;
        pushed.just_joined = !existed;
        self.publish_participant(pushed, true);
        source
    }

    fn remove(&mut self, user: UserId) -> bool {
        match self.participants.remove(&user) {
            Some(mut data) => {
                data.left = true;
                self.publish_participant(data, true);
                true
            }
            None => false,
        }
    }

    fn set_mute(
        &mut self,
        user: UserId,
        muted: bool,
        can_self_unmute: bool,
        versioned: bool,
    ) -> bool {
        let Some(data) = self.participants.get_mut(&user) else {
            return false;
        };
        data.muted = muted;
        data.can_self_unmute = can_self_unmute;
        let data = data.clone();
        self.publish_participant(data, versioned);
        true
    }
}

#[derive(Default)]
struct ServiceState {
    next_call_id: u64,
    created: HashMap<u64, CallHandle>,
    calls: HashMap<u64, LoopbackCall>,
    failures: HashMap<RequestKind, VecDeque<SignalingError>>,
    direct_call_users: HashSet<UserId>,
    requests: Vec<(UserId, RequestKind)>,
}

impl ServiceState {
    fn begin(&mut self, user: UserId, kind: RequestKind) -> Result<(), SignalingError> {
        self.requests.push((user, kind));
        match self.failures.get_mut(&kind).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn call(&mut self, handle: CallHandle) -> Result<&mut LoopbackCall, SignalingError> {
        match self.calls.get_mut(&handle.id) {
            Some(call) if call.handle.access_hash == handle.access_hash => Ok(call),
            Some(_) => Err(SignalingError::Rejected("GROUPCALL_INVALID".to_string())),
            None => Err(SignalingError::CallNotFound(handle.id)),
        }
    }
}

/// In-process call-management service
///
/// Cheap to clone; every clone is the same service.
#[derive(Clone, Default)]
pub struct LoopbackService {
    state: Arc<Mutex<ServiceState>>,
}

impl LoopbackService {
    /// Create an empty service
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a user
    #[must_use]
    pub fn client(&self, user: UserId) -> Arc<LoopbackSignaling> {
        Arc::new(LoopbackSignaling {
            state: self.state.clone(),
            user,
        })
    }

    /// Fail the next request of `kind` with `error`
    pub fn fail_next(&self, kind: RequestKind, error: SignalingError) {
        self.state
            .lock()
            .failures
            .entry(kind)
            .or_default()
            .push_back(error);
    }

    /// Make invites of `user` come back as [`InviteOutcome::NeedsDirectCall`]
    pub fn require_direct_call(&self, user: UserId) {
        self.state.lock().direct_call_users.insert(user);
    }

    /// Requests seen so far, in arrival order
    #[must_use]
    pub fn requests(&self) -> Vec<(UserId, RequestKind)> {
        self.state.lock().requests.clone()
    }

    /// Current participants of a call
    #[must_use]
    pub fn participants(&self, handle: CallHandle) -> Vec<ParticipantData> {
        self.state
            .lock()
            .calls
            .get(&handle.id)
            .map(|call| call.participants.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Current server version of a call
    #[must_use]
    pub fn version(&self, handle: CallHandle) -> Option<u32> {
        self.state.lock().calls.get(&handle.id).map(|call| call.version)
    }

    /// Add a participant that is not driven by a session
    ///
    /// # Errors
    ///
    /// Returns error if the call does not exist
    pub fn add_participant(
        &self,
        handle: CallHandle,
        user: UserId,
        muted: bool,
    ) -> Result<SourceId, SignalingError> {
        let mut state = self.state.lock();
        Ok(state.call(handle)?.add(user, muted, true))
    }

    /// Remove a participant as if the server dropped them
    ///
    /// # Errors
    ///
    /// Returns error if the call does not exist
    pub fn remove_participant(
        &self,
        handle: CallHandle,
        user: UserId,
    ) -> Result<bool, SignalingError> {
        let mut state = self.state.lock();
        Ok(state.call(handle)?.remove(user))
    }

    /// Mute or unmute a participant with administrator authority
    ///
    /// A muted participant loses the right to unmute themselves.
    ///
    /// # Errors
    ///
    /// Returns error if the call does not exist
    pub fn force_mute(
        &self,
        handle: CallHandle,
        user: UserId,
        mute: bool,
    ) -> Result<bool, SignalingError> {
        let mut state = self.state.lock();
        Ok(state.call(handle)?.set_mute(user, mute, !mute, true))
    }
}

/// One user's connection to a [`LoopbackService`]
pub struct LoopbackSignaling {
    state: Arc<Mutex<ServiceState>>,
    user: UserId,
}

impl LoopbackSignaling {
    /// User this connection acts as
    #[must_use]
    pub fn user(&self) -> UserId {
        self.user
    }
}

#[async_trait]
impl SignalingClient for LoopbackSignaling {
    async fn create_call(
        &self,
        random_id: u64,
        title: Option<String>,
    ) -> Result<CallHandle, SignalingError> {
        let mut state = self.state.lock();
        state.begin(self.user, RequestKind::Create)?;
        if let Some(handle) = state.created.get(&random_id) {
            return Ok(*handle);
        }
        state.next_call_id += 1;
        let handle = CallHandle::new(state.next_call_id, rand::thread_rng().gen());
        state.created.insert(random_id, handle);
        state.calls.insert(
            handle.id,
            LoopbackCall {
                handle,
                version: 1,
                title: title.filter(|t| !t.is_empty()),
                record_start_date: None,
                join_muted: false,
                participants: BTreeMap::new(),
                subscribers: Vec::new(),
            },
        );
        tracing::debug!(call_id = %handle, user = %self.user, "Loopback call created");
        Ok(handle)
    }

    async fn join_call(
        &self,
        handle: CallHandle,
        request: JoinRequest,
    ) -> Result<JoinResponse, SignalingError> {
        let mut state = self.state.lock();
        state.begin(self.user, RequestKind::Join)?;
        let call = state.call(handle)?;
        let self_source = call.add(self.user, request.muted, true);
        Ok(JoinResponse {
            self_source,
            media: MediaConfig {
                transport: serde_json::json!({
                    "endpoint": "loopback",
                    "call_id": handle.id,
                    "codecs": request.capabilities.audio_codecs,
                }),
            },
        })
    }

    async fn leave_call(&self, handle: CallHandle, source: SourceId) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        state.begin(self.user, RequestKind::Leave)?;
        let call = state.call(handle)?;
        if call
            .participants
            .get(&self.user)
            .is_some_and(|p| p.source == source)
        {
            call.remove(self.user);
        }
        Ok(())
    }

    async fn discard_call(&self, handle: CallHandle) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        state.begin(self.user, RequestKind::Discard)?;
        state.call(handle)?;
        if let Some(mut call) = state.calls.remove(&handle.id) {
            call.publish(&CallUpdate::Discarded { id: handle.id });
        }
        Ok(())
    }

    async fn update_mute(&self, handle: CallHandle, muted: bool) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        state.begin(self.user, RequestKind::UpdateMute)?;
        let call = state.call(handle)?;
        let can_self_unmute = match call.participants.get(&self.user) {
            Some(p) if !muted && !p.can_self_unmute => {
                return Err(SignalingError::Rejected("GROUPCALL_FORBIDDEN".to_string()));
            }
            Some(p) => p.can_self_unmute,
            None => return Err(SignalingError::Rejected("PARTICIPANT_NOT_FOUND".to_string())),
        };
        call.set_mute(self.user, muted, can_self_unmute, false);
        Ok(())
    }

    async fn toggle_participant_mute(
        &self,
        handle: CallHandle,
        user: UserId,
        mute: bool,
    ) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        state.begin(self.user, RequestKind::ToggleParticipantMute)?;
        if state.call(handle)?.set_mute(user, mute, !mute, true) {
            Ok(())
        } else {
            Err(SignalingError::Rejected("PARTICIPANT_NOT_FOUND".to_string()))
        }
    }

    async fn invite_users(
        &self,
        handle: CallHandle,
        users: Vec<UserId>,
    ) -> Result<InviteOutcome, SignalingError> {
        let mut state = self.state.lock();
        state.begin(self.user, RequestKind::Invite)?;
        let direct: Vec<UserId> = users
            .iter()
            .filter(|user| state.direct_call_users.contains(*user))
            .copied()
            .collect();
        let call = state.call(handle)?;
        let count = users
            .iter()
            .filter(|user| !direct.contains(*user) && !call.participants.contains_key(*user))
            .count();
        match direct.as_slice() {
            [user] => Ok(InviteOutcome::NeedsDirectCall { user: *user }),
            _ => Ok(InviteOutcome::Invited { count }),
        }
    }

    async fn edit_title(&self, handle: CallHandle, title: String) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        state.begin(self.user, RequestKind::EditTitle)?;
        let call = state.call(handle)?;
        call.title = Some(title).filter(|t| !t.is_empty());
        call.publish_call();
        Ok(())
    }

    async fn toggle_recording(
        &self,
        handle: CallHandle,
        enabled: bool,
        title: Option<String>,
    ) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        state.begin(self.user, RequestKind::ToggleRecording)?;
        let call = state.call(handle)?;
        call.record_start_date = if enabled {
            call.record_start_date.or_else(|| Some(Utc::now()))
        } else {
            None
        };
        if let Some(title) = title.filter(|t| !t.is_empty()) {
            tracing::debug!(call_id = %handle, title = %title, "Recording title set");
        }
        call.publish_call();
        Ok(())
    }

    async fn get_call(&self, handle: CallHandle) -> Result<FullCall, SignalingError> {
        let mut state = self.state.lock();
        state.begin(self.user, RequestKind::GetCall)?;
        let call = state.call(handle)?;
        Ok(FullCall {
            call: call.metadata(),
            participants: call.participants.values().cloned().collect(),
        })
    }

    async fn check_call(
        &self,
        handle: CallHandle,
        sources: Vec<SourceId>,
    ) -> Result<Vec<SourceId>, SignalingError> {
        let mut state = self.state.lock();
        state.begin(self.user, RequestKind::CheckCall)?;
        let call = state.call(handle)?;
        Ok(sources
            .into_iter()
            .filter(|source| call.participants.values().any(|p| p.source == *source))
            .collect())
    }

    async fn subscribe_updates(
        &self,
        handle: CallHandle,
    ) -> Result<BoxStream<'static, CallUpdate>, SignalingError> {
        let mut state = self.state.lock();
        state.begin(self.user, RequestKind::Subscribe)?;
        let call = state.call(handle)?;
        let (tx, rx) = mpsc::unbounded_channel();
        call.subscribers.push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

/// Configuration call received by a simulated engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    /// `set_muted`
    SetMuted(bool),
    /// `set_audio_device`
    SetAudioDevice(AudioDeviceKind, String),
    /// `set_ducking_enabled`
    SetDucking(bool),
}

/// Record of one simulated engine instance
#[derive(Debug, Clone)]
pub struct SimulatedEngineInfo {
    /// Configuration the engine was created with
    pub config: EngineConfig,
    /// Calls received, in order
    pub calls: Vec<EngineCall>,
    /// Not destroyed yet
    pub alive: bool,
    events: EngineEventSender,
}

impl SimulatedEngineInfo {
    /// Generation assigned by the session
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    /// Sender to inject engine events
    #[must_use]
    pub fn events(&self) -> &EngineEventSender {
        &self.events
    }
}

#[derive(Default)]
struct FactoryState {
    engines: Vec<SimulatedEngineInfo>,
    fail_next: Option<String>,
    max_live: usize,
}

/// Factory of simulated media engines
#[derive(Clone)]
pub struct SimulatedEngineFactory {
    state: Arc<Mutex<FactoryState>>,
    auto_connect: bool,
}

impl SimulatedEngineFactory {
    /// Engines report connectivity as soon as they are created
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            auto_connect: true,
        }
    }

    /// Engines stay silent until events are injected
    #[must_use]
    pub fn manual() -> Self {
        Self {
            auto_connect: false,
            ..Self::new()
        }
    }

    /// Fail the next engine creation
    pub fn fail_next_create(&self, reason: impl Into<String>) {
        self.state.lock().fail_next = Some(reason.into());
    }

    /// Every engine created so far
    #[must_use]
    pub fn engines(&self) -> Vec<SimulatedEngineInfo> {
        self.state.lock().engines.clone()
    }

    /// The live engine, if any
    #[must_use]
    pub fn live(&self) -> Option<SimulatedEngineInfo> {
        self.state
            .lock()
            .engines
            .iter()
            .rev()
            .find(|engine| engine.alive)
            .cloned()
    }

    /// Number of engines not destroyed yet
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.lock().engines.iter().filter(|e| e.alive).count()
    }

    /// Highest number of simultaneously live engines seen
    #[must_use]
    pub fn max_live(&self) -> usize {
        self.state.lock().max_live
    }
}

impl Default for SimulatedEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaEngineFactory for SimulatedEngineFactory {
    fn create(
        &self,
        config: EngineConfig,
        events: EngineEventSender,
    ) -> Result<Box<dyn MediaEngine>, MediaError> {
        let index = {
            let mut state = self.state.lock();
            if let Some(reason) = state.fail_next.take() {
                return Err(MediaError::CreateFailed(reason));
            }
            state.engines.push(SimulatedEngineInfo {
                config,
                calls: Vec::new(),
                alive: true,
                events: events.clone(),
            });
            let live = state.engines.iter().filter(|e| e.alive).count();
            state.max_live = state.max_live.max(live);
            state.engines.len() - 1
        };
        if self.auto_connect {
            events.connectivity_changed(true);
        }
        Ok(Box::new(SimulatedEngine {
            index,
            state: self.state.clone(),
        }))
    }
}

struct SimulatedEngine {
    index: usize,
    state: Arc<Mutex<FactoryState>>,
}

impl SimulatedEngine {
    fn record(&self, call: EngineCall) {
        if let Some(engine) = self.state.lock().engines.get_mut(self.index) {
            engine.calls.push(call);
        }
    }
}

impl MediaEngine for SimulatedEngine {
    fn set_muted(&mut self, muted: bool) {
        self.record(EngineCall::SetMuted(muted));
    }

    fn set_audio_device(&mut self, kind: AudioDeviceKind, device_id: &str) {
        self.record(EngineCall::SetAudioDevice(kind, device_id.to_string()));
    }

    fn set_ducking_enabled(&mut self, enabled: bool) {
        self.record(EngineCall::SetDucking(enabled));
    }

    fn destroy(self: Box<Self>) {
        if let Some(engine) = self.state.lock().engines.get_mut(self.index) {
            engine.alive = false;
        }
    }
}
