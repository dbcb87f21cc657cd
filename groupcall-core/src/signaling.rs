//! Group call signaling protocol
//!
//! Request/response contract with the call-management service plus the
//! asynchronous update pushes it delivers for a call.

use crate::types::{CallHandle, MediaCapabilities, SourceId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Request could not reach the service
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Service rejected the request
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Call does not exist (or was discarded)
    #[error("Call not found: {0}")]
    CallNotFound(u64),

    /// No answer within the allotted time
    #[error("Request timed out")]
    Timeout,
}

/// Join request payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Join muted
    pub muted: bool,
    /// Local media capabilities
    pub capabilities: MediaCapabilities,
}

/// Server media configuration handed to the media engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Opaque transport parameters for the engine
    pub transport: serde_json::Value,
}

/// Successful join response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Source identifier assigned to the local participant
    pub self_source: SourceId,
    /// Engine configuration
    pub media: MediaConfig,
}

/// Result of an invite request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InviteOutcome {
    /// Number of users successfully invited
    Invited {
        /// Accepted invites
        count: usize,
    },
    /// The user requires a private handshake the server cannot broker
    NeedsDirectCall {
        /// User to call directly
        user: UserId,
    },
}

/// Call-wide metadata pushed by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    /// Call identifier
    pub id: u64,
    /// Call access hash
    pub access_hash: u64,
    /// Server version of the call state
    pub version: u32,
    /// Call title
    pub title: Option<String>,
    /// When recording started, if recording
    pub record_start_date: Option<DateTime<Utc>>,
    /// Number of participants known to the server
    pub participants_count: u32,
    /// New participants join muted
    pub join_muted: bool,
    /// The local user may change `join_muted`
    pub can_change_join_muted: bool,
}

impl CallMetadata {
    /// Handle described by this metadata
    #[must_use]
    pub fn handle(&self) -> CallHandle {
        CallHandle::new(self.id, self.access_hash)
    }
}

/// Single participant entry of a participants push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantData {
    /// Participant user
    pub user: UserId,
    /// Participant audio source
    pub source: SourceId,
    /// When the participant joined
    pub date: DateTime<Utc>,
    /// Last time the participant was active
    pub active_date: Option<DateTime<Utc>>,
    /// Participant is muted
    pub muted: bool,
    /// Participant may unmute themselves
    pub can_self_unmute: bool,
    /// Local user muted this participant for themselves
    pub muted_by_you: bool,
    /// Playback volume (10000 = 100%)
    pub volume: Option<u32>,
    /// Raised hand rating, if the hand is raised
    pub raise_hand_rating: Option<u64>,
    /// Participant left the call
    pub left: bool,
    /// Participant joined just now (server count grows)
    pub just_joined: bool,
    /// Entry increments the call version
    pub versioned: bool,
}

/// Participants push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantsUpdate {
    /// Call identifier
    pub call_id: u64,
    /// Server version after this update
    pub version: u32,
    /// Changed participants
    pub participants: Vec<ParticipantData>,
}

impl ParticipantsUpdate {
    /// Whether applying this update increments the call version
    #[must_use]
    pub fn increments_version(&self) -> bool {
        self.participants.iter().any(|p| p.versioned)
    }
}

/// Signaling push for a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallUpdate {
    /// Call metadata changed
    Call(CallMetadata),
    /// Call was discarded for everyone
    Discarded {
        /// Call identifier
        id: u64,
    },
    /// Participants changed
    Participants(ParticipantsUpdate),
}

impl CallUpdate {
    /// Call the update refers to
    #[must_use]
    pub fn call_id(&self) -> u64 {
        match self {
            Self::Call(data) => data.id,
            Self::Discarded { id } => *id,
            Self::Participants(data) => data.call_id,
        }
    }
}

/// Full call state, as returned by a reload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullCall {
    /// Call metadata
    pub call: CallMetadata,
    /// Complete participant list
    pub participants: Vec<ParticipantData>,
}

/// Call-management service client
///
/// Implement this for your specific transport. Every method is a single
/// request; the session never assumes responses arrive in issue order.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Create a new call
    async fn create_call(
        &self,
        random_id: u64,
        title: Option<String>,
    ) -> Result<CallHandle, SignalingError>;

    /// Join a call
    async fn join_call(
        &self,
        handle: CallHandle,
        request: JoinRequest,
    ) -> Result<JoinResponse, SignalingError>;

    /// Leave a call
    async fn leave_call(&self, handle: CallHandle, source: SourceId)
        -> Result<(), SignalingError>;

    /// End a call for everyone
    async fn discard_call(&self, handle: CallHandle) -> Result<(), SignalingError>;

    /// Update the local participant's mute flag
    async fn update_mute(&self, handle: CallHandle, muted: bool) -> Result<(), SignalingError>;

    /// Mute or unmute another participant (administrator action)
    async fn toggle_participant_mute(
        &self,
        handle: CallHandle,
        user: UserId,
        mute: bool,
    ) -> Result<(), SignalingError>;

    /// Invite users to the call
    async fn invite_users(
        &self,
        handle: CallHandle,
        users: Vec<UserId>,
    ) -> Result<InviteOutcome, SignalingError>;

    /// Change the call title
    async fn edit_title(&self, handle: CallHandle, title: String) -> Result<(), SignalingError>;

    /// Start or stop recording
    async fn toggle_recording(
        &self,
        handle: CallHandle,
        enabled: bool,
        title: Option<String>,
    ) -> Result<(), SignalingError>;

    /// Fetch the full call state
    async fn get_call(&self, handle: CallHandle) -> Result<FullCall, SignalingError>;

    /// Return the subset of `sources` still present in the call
    async fn check_call(
        &self,
        handle: CallHandle,
        sources: Vec<SourceId>,
    ) -> Result<Vec<SourceId>, SignalingError>;

    /// Subscribe to update pushes for a call
    async fn subscribe_updates(
        &self,
        handle: CallHandle,
    ) -> Result<BoxStream<'static, CallUpdate>, SignalingError>;
}

/// Instrumented wrapper around a [`SignalingClient`]
///
/// Cheap to clone; request tasks take their own copy.
#[derive(Clone)]
pub struct SignalingHandler {
    client: Arc<dyn SignalingClient>,
}

impl SignalingHandler {
    /// Create new signaling handler
    #[must_use]
    pub fn new(client: Arc<dyn SignalingClient>) -> Self {
        Self { client }
    }

    /// Create a call
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    #[tracing::instrument(skip(self, title))]
    pub async fn create_call(
        &self,
        random_id: u64,
        title: Option<String>,
    ) -> Result<CallHandle, SignalingError> {
        tracing::debug!("Sending create request");
        let result = self.client.create_call(random_id, title).await;
        log_outcome("create", &result);
        result
    }

    /// Join a call
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    #[tracing::instrument(skip(self, request), fields(call_id = %handle, muted = request.muted))]
    pub async fn join_call(
        &self,
        handle: CallHandle,
        request: JoinRequest,
    ) -> Result<JoinResponse, SignalingError> {
        tracing::debug!("Sending join request");
        let result = self.client.join_call(handle, request).await;
        log_outcome("join", &result);
        result
    }

    /// Leave a call
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    #[tracing::instrument(skip(self), fields(call_id = %handle))]
    pub async fn leave_call(
        &self,
        handle: CallHandle,
        source: SourceId,
    ) -> Result<(), SignalingError> {
        let result = self.client.leave_call(handle, source).await;
        log_outcome("leave", &result);
        result
    }

    /// Discard a call
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    #[tracing::instrument(skip(self), fields(call_id = %handle))]
    pub async fn discard_call(&self, handle: CallHandle) -> Result<(), SignalingError> {
        let result = self.client.discard_call(handle).await;
        log_outcome("discard", &result);
        result
    }

    /// Update self mute flag
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    #[tracing::instrument(skip(self), fields(call_id = %handle))]
    pub async fn update_mute(&self, handle: CallHandle, muted: bool) -> Result<(), SignalingError> {
        let result = self.client.update_mute(handle, muted).await;
        log_outcome("update_mute", &result);
        result
    }

    /// Mute or unmute another participant
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    #[tracing::instrument(skip(self), fields(call_id = %handle, user = %user))]
    pub async fn toggle_participant_mute(
        &self,
        handle: CallHandle,
        user: UserId,
        mute: bool,
    ) -> Result<(), SignalingError> {
        let result = self.client.toggle_participant_mute(handle, user, mute).await;
        log_outcome("toggle_participant_mute", &result);
        result
    }

    /// Invite a slice of users
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    #[tracing::instrument(skip(self, users), fields(call_id = %handle, count = users.len()))]
    pub async fn invite_users(
        &self,
        handle: CallHandle,
        users: Vec<UserId>,
    ) -> Result<InviteOutcome, SignalingError> {
        let result = self.client.invite_users(handle, users).await;
        log_outcome("invite", &result);
        result
    }

    /// Change the call title
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    #[tracing::instrument(skip(self, title), fields(call_id = %handle))]
    pub async fn edit_title(&self, handle: CallHandle, title: String) -> Result<(), SignalingError> {
        let result = self.client.edit_title(handle, title).await;
        log_outcome("edit_title", &result);
        result
    }

    /// Start or stop recording
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    #[tracing::instrument(skip(self, title), fields(call_id = %handle))]
    pub async fn toggle_recording(
        &self,
        handle: CallHandle,
        enabled: bool,
        title: Option<String>,
    ) -> Result<(), SignalingError> {
        let result = self.client.toggle_recording(handle, enabled, title).await;
        log_outcome("toggle_recording", &result);
        result
    }

    /// Reload the full call
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    #[tracing::instrument(skip(self), fields(call_id = %handle))]
    pub async fn get_call(&self, handle: CallHandle) -> Result<FullCall, SignalingError> {
        let result = self.client.get_call(handle).await;
        log_outcome("get_call", &result);
        result
    }

    /// Check which sources are still in the call
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    #[tracing::instrument(skip(self), fields(call_id = %handle))]
    pub async fn check_call(
        &self,
        handle: CallHandle,
        sources: Vec<SourceId>,
    ) -> Result<Vec<SourceId>, SignalingError> {
        let result = self.client.check_call(handle, sources).await;
        log_outcome("check_call", &result);
        result
    }

    /// Subscribe to update pushes
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be established
    #[tracing::instrument(skip(self), fields(call_id = %handle))]
    pub async fn subscribe_updates(
        &self,
        handle: CallHandle,
    ) -> Result<BoxStream<'static, CallUpdate>, SignalingError> {
        let result = self.client.subscribe_updates(handle).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Update subscription failed");
        }
        result
    }
}

fn log_outcome<T>(request: &'static str, result: &Result<T, SignalingError>) {
    match result {
        Ok(_) => tracing::debug!(request, "Signaling request succeeded"),
        Err(e) => tracing::warn!(request, error = %e, "Signaling request failed"),
    }
}

/// Helper function to extract update type for tracing
#[must_use]
pub fn update_type(update: &CallUpdate) -> &'static str {
    match update {
        CallUpdate::Call(_) => "Call",
        CallUpdate::Discarded { .. } => "Discarded",
        CallUpdate::Participants(_) => "Participants",
    }
}
