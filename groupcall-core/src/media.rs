//! Media engine contract
//!
//! The media engine performs audio capture, transport, codec and mixing
//! work. The session only creates it, pushes configuration into it and
//! consumes its callbacks.
//!
//! # Threading
//!
//! Engines usually report events from their own threads. Every engine gets
//! an [`EngineEventSender`] at creation time; sending through it is
//! synchronous, non-blocking and safe from any thread. Events are queued on
//! the session's owner task and never touch session state directly.

use crate::call::SessionMessage;
use crate::signaling::MediaConfig;
use crate::types::{AudioDeviceKind, SourceId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Engine could not be created
    #[error("Engine creation failed: {0}")]
    CreateFailed(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
}

/// Configuration an engine instance is created with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Source assigned to the local participant
    pub self_source: SourceId,
    /// Server-provided transport configuration
    pub media: MediaConfig,
    /// Start muted
    pub muted: bool,
    /// Preferred input device
    pub input_device: Option<String>,
    /// Preferred output device
    pub output_device: Option<String>,
    /// Duck other applications' audio while in the call
    pub ducking_enabled: bool,
}

/// Events reported by a media engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Media connectivity changed
    ConnectivityChanged(bool),
    /// Batch of per-source audio levels
    Levels(Vec<(SourceId, f32)>),
    /// Local microphone level
    SelfLevel(f32),
    /// Unrecoverable engine failure
    Fatal(String),
}

/// Thread-safe handoff from engine callbacks to the session owner task
///
/// Carries the generation of the engine instance it was created for, so
/// late events from a destroyed instance are recognised and dropped.
#[derive(Debug, Clone)]
pub struct EngineEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl EngineEventSender {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<SessionMessage>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the engine instance this sender belongs to
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue an event for the session
    ///
    /// Returns `false` if the session is gone.
    pub fn send(&self, event: EngineEvent) -> bool {
        self.tx
            .send(SessionMessage::Engine {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    /// Report a connectivity change
    pub fn connectivity_changed(&self, connected: bool) -> bool {
        self.send(EngineEvent::ConnectivityChanged(connected))
    }

    /// Report a batch of audio levels
    pub fn levels(&self, levels: Vec<(SourceId, f32)>) -> bool {
        self.send(EngineEvent::Levels(levels))
    }

    /// Report the local microphone level
    pub fn self_level(&self, level: f32) -> bool {
        self.send(EngineEvent::SelfLevel(level))
    }

    /// Report an unrecoverable failure
    pub fn fatal(&self, reason: impl Into<String>) -> bool {
        self.send(EngineEvent::Fatal(reason.into()))
    }
}

/// Live media engine instance
pub trait MediaEngine: Send {
    /// Mute or unmute the outgoing stream
    fn set_muted(&mut self, muted: bool);

    /// Switch an audio device
    fn set_audio_device(&mut self, kind: AudioDeviceKind, device_id: &str);

    /// Enable or disable ducking of other audio
    fn set_ducking_enabled(&mut self, enabled: bool);

    /// Tear the instance down; no events are delivered afterwards
    fn destroy(self: Box<Self>);
}

/// Creates media engine instances
pub trait MediaEngineFactory: Send + Sync {
    /// Create and start an engine
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be created
    fn create(
        &self,
        config: EngineConfig,
        events: EngineEventSender,
    ) -> Result<Box<dyn MediaEngine>, MediaError>;
}

/// Engine owned by a session, tagged with its generation
pub(crate) struct EngineInstance {
    generation: u64,
    engine: Box<dyn MediaEngine>,
    muted: bool,
}

impl EngineInstance {
    pub(crate) fn new(generation: u64, engine: Box<dyn MediaEngine>, muted: bool) -> Self {
        Self {
            generation,
            engine,
            muted,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn muted(&self) -> bool {
        self.muted
    }

    pub(crate) fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.engine.set_muted(muted);
    }

    pub(crate) fn set_audio_device(&mut self, kind: AudioDeviceKind, device_id: &str) {
        self.engine.set_audio_device(kind, device_id);
    }

    pub(crate) fn set_ducking_enabled(&mut self, enabled: bool) {
        self.engine.set_ducking_enabled(enabled);
    }

    pub(crate) fn destroy(self) {
        tracing::debug!(generation = self.generation, "Destroying media engine");
        self.engine.destroy();
    }
}
