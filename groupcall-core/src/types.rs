//! Group call types and data structures

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handle to a server-side group call
///
/// The access hash is a capability token issued by the call-management
/// service. It is required on every signaling request for the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallHandle {
    /// Server-assigned call identifier
    pub id: u64,
    /// Capability token for the call
    pub access_hash: u64,
}

impl CallHandle {
    /// Create a new call handle
    pub fn new(id: u64, access_hash: u64) -> Self {
        Self { id, access_hash }
    }
}

impl std::fmt::Display for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Identifier of a single session instance, used to correlate logs before
/// the server has assigned a call handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user that can take part in a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user{}", self.0)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Audio stream source identifier assigned by the media engine
///
/// Zero means "not assigned yet".
pub type SourceId = u32;

/// Local participant mute state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MuteState {
    /// Microphone is live
    Active,
    /// Voluntarily muted
    Muted,
    /// Muted by a call administrator; only an authoritative push clears it
    ForceMuted,
}

impl MuteState {
    /// Whether the media engine must be muted in this state
    #[must_use]
    pub fn engine_muted(self) -> bool {
        self != Self::Active
    }
}

impl Default for MuteState {
    fn default() -> Self {
        Self::Muted
    }
}

/// Session state
///
/// `Ended` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Waiting for the call to be created (or for `start`/`join`)
    Creating,
    /// Join handshake in flight
    Joining,
    /// Joined on the server, waiting for media connectivity
    Connecting,
    /// Media connected
    Joined,
    /// Leaving after a failure
    FailedHangingUp,
    /// Call failed
    Failed,
    /// Leaving gracefully
    HangingUp,
    /// Call ended
    Ended,
}

impl SessionState {
    /// Whether no further transitions are possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Whether the session is tearing down
    #[must_use]
    pub fn is_hanging_up(self) -> bool {
        matches!(self, Self::HangingUp | Self::FailedHangingUp)
    }

    /// Whether a media engine instance must exist in this state
    #[must_use]
    pub fn has_engine(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Joined | Self::HangingUp | Self::FailedHangingUp
        )
    }
}

/// How a session terminates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishType {
    /// Normal end (hangup, discard, call ended for everyone)
    Ended,
    /// Failure
    Failed,
}

impl FinishType {
    /// Intermediate state while the leave request is in flight
    #[must_use]
    pub fn hangup_state(self) -> SessionState {
        match self {
            Self::Ended => SessionState::HangingUp,
            Self::Failed => SessionState::FailedHangingUp,
        }
    }

    /// Terminal state
    #[must_use]
    pub fn final_state(self) -> SessionState {
        match self {
            Self::Ended => SessionState::Ended,
            Self::Failed => SessionState::Failed,
        }
    }
}

/// Audio level sample for a level-meter UI
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelUpdate {
    /// Source the level belongs to
    pub source: SourceId,
    /// Level value (0.0 ..= 1.0)
    pub value: f32,
    /// Whether the source is the local participant
    pub self_: bool,
}

/// Local media capabilities sent with the join request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCapabilities {
    /// Supported audio codecs in preference order
    pub audio_codecs: Vec<String>,
    /// Maximum outgoing bitrate in kilobits per second
    pub max_bitrate_kbps: u32,
    /// Echo cancellation available
    pub echo_cancellation: bool,
    /// Noise suppression available
    pub noise_suppression: bool,
}

impl Default for MediaCapabilities {
    fn default() -> Self {
        Self {
            audio_codecs: vec!["opus".to_string()],
            max_bitrate_kbps: 64,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Audio device direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioDeviceKind {
    /// Microphone
    Input,
    /// Speaker / headphones
    Output,
}
