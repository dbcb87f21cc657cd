//! Shared fixtures for session integration tests
//!
//! [`MockSignaling`] answers every request immediately unless its kind is
//! gated, in which case the request parks until the test resolves it. That
//! lets tests deliver responses out of order.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use groupcall_core::loopback::SimulatedEngineFactory;
use groupcall_core::speaking::SpeakingConfig;
use groupcall_core::{
    CallHandle, CallMetadata, CallUpdate, FullCall, GroupCall, GroupCallConfig, GroupCallDelegate,
    InviteOutcome, JoinRequest, JoinResponse, MediaConfig, MuteState, ParticipantData,
    ParticipantsUpdate, RejoinPolicy, SessionEvent, SessionId, SessionSnapshot, SessionState,
    SignalingClient, SignalingError, SourceId, UserId,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Call handed out by [`MockSignaling::create_call`]
pub const CALL: CallHandle = CallHandle {
    id: 7,
    access_hash: 42,
};

/// User the session under test acts as
pub const SELF_USER: UserId = UserId(1);

/// First source assigned by default join answers
pub const FIRST_SOURCE: SourceId = 1001;

const WAIT: Duration = Duration::from_secs(2);

/// Request received by the mock
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Create { title: Option<String> },
    Join { handle: CallHandle, muted: bool },
    Leave { source: SourceId },
    Discard,
    UpdateMute { muted: bool },
    ToggleParticipantMute { user: UserId, mute: bool },
    Invite(Vec<UserId>),
    EditTitle(String),
    ToggleRecording { enabled: bool },
    GetCall,
    CheckCall(Vec<SourceId>),
    Subscribe,
}

/// Request kinds that can be held back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Join,
    Mute,
    Leave,
    Discard,
}

type Reply<T> = oneshot::Sender<Result<T, SignalingError>>;

struct MockState {
    requests: Vec<Request>,
    gates: Vec<Gate>,
    joins: Vec<Option<Reply<JoinResponse>>>,
    mutes: Vec<Option<Reply<()>>>,
    leaves: Vec<Option<Reply<()>>>,
    discards: Vec<Option<Reply<()>>>,
    join_results: VecDeque<Result<JoinResponse, SignalingError>>,
    next_source: SourceId,
    create_result: Option<SignalingError>,
    discard_result: Option<SignalingError>,
    invite_results: VecDeque<Result<InviteOutcome, SignalingError>>,
    check_result: Option<Result<Vec<SourceId>, SignalingError>>,
    full_call: Option<FullCall>,
    get_call_error: Option<SignalingError>,
    subscribers: Vec<mpsc::UnboundedSender<CallUpdate>>,
}

/// Scriptable signaling service
pub struct MockSignaling {
    state: Mutex<MockState>,
}

impl MockSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                requests: Vec::new(),
                gates: Vec::new(),
                joins: Vec::new(),
                mutes: Vec::new(),
                leaves: Vec::new(),
                discards: Vec::new(),
                join_results: VecDeque::new(),
                next_source: FIRST_SOURCE,
                create_result: None,
                discard_result: None,
                invite_results: VecDeque::new(),
                check_result: None,
                full_call: None,
                get_call_error: None,
                subscribers: Vec::new(),
            }),
        })
    }

    /// Hold back every later request of this kind
    pub fn gate(&self, gate: Gate) {
        self.state.lock().gates.push(gate);
    }

    /// Answer the next ungated join with `result`
    pub fn script_join(&self, result: Result<JoinResponse, SignalingError>) {
        self.state.lock().join_results.push_back(result);
    }

    pub fn fail_create(&self, error: SignalingError) {
        self.state.lock().create_result = Some(error);
    }

    pub fn fail_discard(&self, error: SignalingError) {
        self.state.lock().discard_result = Some(error);
    }

    pub fn script_invite(&self, result: Result<InviteOutcome, SignalingError>) {
        self.state.lock().invite_results.push_back(result);
    }

    /// Answer membership checks with `result` instead of echoing the sources
    pub fn set_check_result(&self, result: Result<Vec<SourceId>, SignalingError>) {
        self.state.lock().check_result = Some(result);
    }

    /// Serve `full` from `get_call`
    pub fn set_full_call(&self, full: FullCall) {
        self.state.lock().full_call = Some(full);
    }

    /// Fail every later `get_call` with `error`
    pub fn fail_get_call(&self, error: SignalingError) {
        self.state.lock().get_call_error = Some(error);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().requests.clone()
    }

    pub fn count(&self, predicate: impl Fn(&Request) -> bool) -> usize {
        self.state.lock().requests.iter().filter(|r| predicate(r)).count()
    }

    /// Resolve the `index`th gated join
    pub fn resolve_join(&self, index: usize, result: Result<JoinResponse, SignalingError>) -> bool {
        let reply = self.state.lock().joins.get_mut(index).and_then(Option::take);
        reply.is_some_and(|reply| reply.send(result).is_ok())
    }

    /// Resolve the `index`th gated mute update
    pub fn resolve_mute(&self, index: usize, result: Result<(), SignalingError>) -> bool {
        let reply = self.state.lock().mutes.get_mut(index).and_then(Option::take);
        reply.is_some_and(|reply| reply.send(result).is_ok())
    }

    /// Resolve the `index`th gated leave
    pub fn resolve_leave(&self, index: usize) -> bool {
        let reply = self.state.lock().leaves.get_mut(index).and_then(Option::take);
        reply.is_some_and(|reply| reply.send(Ok(())).is_ok())
    }

    /// Resolve the `index`th gated discard
    pub fn resolve_discard(&self, index: usize, result: Result<(), SignalingError>) -> bool {
        let reply = self.state.lock().discards.get_mut(index).and_then(Option::take);
        reply.is_some_and(|reply| reply.send(result).is_ok())
    }

    /// Deliver a push to every subscriber
    pub fn push(&self, update: CallUpdate) {
        self.state
            .lock()
            .subscribers
            .retain(|tx| tx.send(update.clone()).is_ok());
    }

    /// Wait until the request log satisfies `predicate`
    pub async fn wait_until(&self, predicate: impl Fn(&[Request]) -> bool) {
        eventually(|| predicate(&self.state.lock().requests)).await;
    }

    fn record(&self, request: Request) {
        self.state.lock().requests.push(request);
    }

    fn gated(&self, gate: Gate) -> bool {
        self.state.lock().gates.contains(&gate)
    }
}

#[async_trait]
impl SignalingClient for MockSignaling {
    async fn create_call(
        &self,
        _random_id: u64,
        title: Option<String>,
    ) -> Result<CallHandle, SignalingError> {
        let mut state = self.state.lock();
        state.requests.push(Request::Create { title });
        match state.create_result.take() {
            Some(error) => Err(error),
            None => Ok(CALL),
        }
    }

    async fn join_call(
        &self,
        handle: CallHandle,
        request: JoinRequest,
    ) -> Result<JoinResponse, SignalingError> {
        let rx = {
            let mut state = self.state.lock();
            state.requests.push(Request::Join {
                handle,
                muted: request.muted,
            });
            if !state.gates.contains(&Gate::Join) {
                if let Some(result) = state.join_results.pop_front() {
                    return result;
                }
                let source = state.next_source;
                state.next_source += 1;
                return Ok(join_response(source));
            }
            let (tx, rx) = oneshot::channel();
            state.joins.push(Some(tx));
            rx
        };
        rx.await.unwrap_or(Err(SignalingError::Timeout))
    }

    async fn leave_call(&self, _handle: CallHandle, source: SourceId) -> Result<(), SignalingError> {
        self.record(Request::Leave { source });
        if !self.gated(Gate::Leave) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.state.lock().leaves.push(Some(tx));
        rx.await.unwrap_or(Err(SignalingError::Timeout))
    }

    async fn discard_call(&self, _handle: CallHandle) -> Result<(), SignalingError> {
        let rx = {
            let mut state = self.state.lock();
            state.requests.push(Request::Discard);
            if !state.gates.contains(&Gate::Discard) {
                return match state.discard_result.take() {
                    Some(error) => Err(error),
                    None => Ok(()),
                };
            }
            let (tx, rx) = oneshot::channel();
            state.discards.push(Some(tx));
            rx
        };
        rx.await.unwrap_or(Err(SignalingError::Timeout))
    }

    async fn update_mute(&self, _handle: CallHandle, muted: bool) -> Result<(), SignalingError> {
        self.record(Request::UpdateMute { muted });
        if !self.gated(Gate::Mute) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.state.lock().mutes.push(Some(tx));
        rx.await.unwrap_or(Err(SignalingError::Timeout))
    }

    async fn toggle_participant_mute(
        &self,
        _handle: CallHandle,
        user: UserId,
        mute: bool,
    ) -> Result<(), SignalingError> {
        self.record(Request::ToggleParticipantMute { user, mute });
        Ok(())
    }

    async fn invite_users(
        &self,
        _handle: CallHandle,
        users: Vec<UserId>,
    ) -> Result<InviteOutcome, SignalingError> {
        let count = users.len();
        let mut state = self.state.lock();
        state.requests.push(Request::Invite(users));
        state
            .invite_results
            .pop_front()
            .unwrap_or(Ok(InviteOutcome::Invited { count }))
    }

    async fn edit_title(&self, _handle: CallHandle, title: String) -> Result<(), SignalingError> {
        self.record(Request::EditTitle(title));
        Ok(())
    }

    async fn toggle_recording(
        &self,
        _handle: CallHandle,
        enabled: bool,
        _title: Option<String>,
    ) -> Result<(), SignalingError> {
        self.record(Request::ToggleRecording { enabled });
        Ok(())
    }

    async fn get_call(&self, _handle: CallHandle) -> Result<FullCall, SignalingError> {
        let mut state = self.state.lock();
        state.requests.push(Request::GetCall);
        if let Some(error) = state.get_call_error.clone() {
            return Err(error);
        }
        state
            .full_call
            .clone()
            .ok_or_else(|| SignalingError::TransportError("unavailable".to_string()))
    }

    async fn check_call(
        &self,
        _handle: CallHandle,
        sources: Vec<SourceId>,
    ) -> Result<Vec<SourceId>, SignalingError> {
        let mut state = self.state.lock();
        state.requests.push(Request::CheckCall(sources.clone()));
        state.check_result.clone().unwrap_or(Ok(sources))
    }

    async fn subscribe_updates(
        &self,
        _handle: CallHandle,
    ) -> Result<BoxStream<'static, CallUpdate>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.requests.push(Request::Subscribe);
        state.subscribers.push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

/// Delegate that records its callbacks
#[derive(Default)]
pub struct RecordingDelegate {
    finished: Mutex<Vec<(SessionId, Option<CallHandle>)>>,
    failed: Mutex<Vec<(SessionId, Option<CallHandle>)>>,
}

impl RecordingDelegate {
    pub fn finished(&self) -> Vec<(SessionId, Option<CallHandle>)> {
        self.finished.lock().clone()
    }

    pub fn failed(&self) -> Vec<(SessionId, Option<CallHandle>)> {
        self.failed.lock().clone()
    }
}

impl GroupCallDelegate for RecordingDelegate {
    fn on_finished(&self, session: SessionId, call: Option<CallHandle>) {
        self.finished.lock().push((session, call));
    }

    fn on_failed(&self, session: SessionId, call: Option<CallHandle>) {
        self.failed.lock().push((session, call));
    }
}

/// A session wired to a mock service and manual engines
pub struct Harness {
    pub call: GroupCall,
    pub signaling: Arc<MockSignaling>,
    pub engines: SimulatedEngineFactory,
    pub delegate: Arc<RecordingDelegate>,
    pub events: broadcast::Receiver<SessionEvent>,
}

/// Short timers so timeout paths finish quickly
pub fn fast_config() -> GroupCallConfig {
    GroupCallConfig {
        speaking: SpeakingConfig {
            threshold: 0.2,
            check_interval: Duration::from_millis(20),
            stale_after: Duration::from_millis(100),
        },
        join_check_timeout: Duration::from_secs(5),
        leave_timeout: Duration::from_millis(200),
        rejoin: RejoinPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        },
        invite_slice_size: 2,
        update_gap_timeout: Duration::from_millis(100),
        ..GroupCallConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(fast_config(), MuteState::Muted)
}

/// Logs to the test writer; filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn harness_with(config: GroupCallConfig, mute: MuteState) -> Harness {
    init_tracing();
    let signaling = MockSignaling::new();
    let engines = SimulatedEngineFactory::manual();
    let delegate = Arc::new(RecordingDelegate::default());
    let call = GroupCall::builder(SELF_USER, signaling.clone(), Arc::new(engines.clone()))
        .with_config(config)
        .with_delegate(delegate.clone())
        .with_mute(mute)
        .build()
        .unwrap();
    let events = call.subscribe_events();
    Harness {
        call,
        signaling,
        engines,
        delegate,
        events,
    }
}

impl Harness {
    /// Start a call and bring it to `Joined`
    pub async fn joined(&self) -> SessionSnapshot {
        self.call.start(None).unwrap();
        wait_state(&self.call, SessionState::Connecting).await;
        self.engines
            .live()
            .unwrap()
            .events()
            .connectivity_changed(true);
        wait_state(&self.call, SessionState::Joined).await;
        self.call.snapshot().await.unwrap()
    }

    /// State transitions published so far
    pub fn drain_states(&mut self) -> Vec<(SessionState, SessionState)> {
        drain(&mut self.events)
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::StateChanged { old, new } => Some((old, new)),
                _ => None,
            })
            .collect()
    }
}

/// Events published so far
pub fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Receive events until one matches `predicate`
pub async fn next_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    predicate: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

pub async fn wait_state(call: &GroupCall, state: SessionState) {
    tokio::time::timeout(WAIT, call.wait_for_state(|s| s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state:?}, at {:?}", call.state()))
        .unwrap();
}

/// Poll snapshots until one satisfies `predicate`
pub async fn wait_snapshot(
    call: &GroupCall,
    predicate: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    tokio::time::timeout(WAIT, async {
        loop {
            let snapshot = call.snapshot().await.unwrap();
            if predicate(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

pub async fn eventually(predicate: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Let in-flight completions reach the session
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn join_response(source: SourceId) -> JoinResponse {
    JoinResponse {
        self_source: source,
        media: MediaConfig {
            transport: serde_json::json!({ "endpoint": "mock" }),
        },
    }
}

pub fn metadata(version: u32, participants_count: u32) -> CallUpdate {
    CallUpdate::Call(CallMetadata {
        id: CALL.id,
        access_hash: CALL.access_hash,
        version,
        title: None,
        record_start_date: None,
        participants_count,
        join_muted: false,
        can_change_join_muted: true,
    })
}

pub fn participant(user: u64, source: SourceId) -> ParticipantData {
    ParticipantData {
        user: UserId(user),
        source,
        date: Utc::now(),
        active_date: None,
        muted: false,
        can_self_unmute: true,
        muted_by_you: false,
        volume: None,
        raise_hand_rating: None,
        left: false,
        just_joined: false,
        versioned: false,
    }
}

pub fn participants(version: u32, participants: Vec<ParticipantData>) -> CallUpdate {
    CallUpdate::Participants(ParticipantsUpdate {
        call_id: CALL.id,
        version,
        participants,
    })
}
