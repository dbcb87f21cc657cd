//! Groupcall - group voice call session orchestration
//!
//! This library drives one client's membership in a server-hosted group
//! voice call. It features:
//!
//! - **Session state machine**: create, join, connect, rejoin and leave with
//!   token-based supersession of out-of-order responses
//! - **Media engine lifecycle**: the engine exists exactly while the session
//!   is joined, and its callbacks are marshaled onto the session task
//! - **Participant reconciliation**: versioned signaling pushes applied in
//!   order, with reloads when updates go missing
//! - **Speaking activity**: per-source level tracking with stale-entry
//!   eviction
//!
//! The signaling service and the media engine are collaborators behind the
//! [`SignalingClient`] and [`MediaEngineFactory`] traits. The `loopback`
//! feature ships in-process implementations of both.
//!
//! # Examples
//!
//! ```rust,no_run
//! use groupcall_core::loopback::{LoopbackService, SimulatedEngineFactory};
//! use groupcall_core::{GroupCall, MuteState, SessionState, UserId};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let service = LoopbackService::new();
//! let call = GroupCall::builder(
//!     UserId(1),
//!     service.client(UserId(1)),
//!     Arc::new(SimulatedEngineFactory::new()),
//! )
//! .build()?;
//!
//! call.start(Some("Standup".to_string()))?;
//! call.wait_for_state(|state| state == SessionState::Joined).await?;
//! call.set_muted(MuteState::Active)?;
//! call.hangup()?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core group call types
pub mod types;

/// Signaling contract and push data
pub mod signaling;

/// Media engine contract
pub mod media;

/// Call and participant snapshot
pub mod snapshot;

/// Speaking-activity tracking
pub mod speaking;

/// Session state machine
pub mod call;

/// Session handle, builder and configuration
pub mod service;

/// In-process signaling service and simulated media engine
#[cfg(feature = "loopback")]
pub mod loopback;

// Re-export main types at crate root
pub use call::{CallInfo, SessionEvent, SessionSnapshot};
pub use media::{
    EngineConfig, EngineEvent, EngineEventSender, MediaEngine, MediaEngineFactory, MediaError,
};
pub use service::{
    GroupCall, GroupCallBuilder, GroupCallConfig, GroupCallDelegate, InviteResult, RejoinPolicy,
    SessionError,
};
pub use signaling::{
    CallMetadata, CallUpdate, FullCall, InviteOutcome, JoinRequest, JoinResponse, MediaConfig,
    ParticipantData, ParticipantsUpdate, SignalingClient, SignalingError, SignalingHandler,
};
pub use snapshot::{CallSnapshot, Participant, ParticipantChange};
pub use speaking::{SpeakingChange, SpeakingConfig, SpeakingTracker};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{SessionEvent, SessionSnapshot};
    pub use crate::media::{EngineEvent, EngineEventSender, MediaEngine, MediaEngineFactory};
    pub use crate::service::{GroupCall, GroupCallConfig, GroupCallDelegate, InviteResult};
    pub use crate::signaling::{CallUpdate, SignalingClient, SignalingError};
    pub use crate::types::{CallHandle, MuteState, SessionState, SourceId, UserId};
}
