//! Speaking-activity tracking
//!
//! Keeps the last time each source was heard above the speaking threshold
//! and reports start/stop transitions. Nothing here is persisted.

use crate::types::{LevelUpdate, SourceId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Speaking detection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakingConfig {
    /// Level above which a source counts as speaking
    pub threshold: f32,
    /// How often stale entries are evicted
    pub check_interval: Duration,
    /// How long a source stays "speaking" after its last loud sample
    pub stale_after: Duration,
}

impl Default for SpeakingConfig {
    fn default() -> Self {
        Self {
            threshold: 0.2,
            check_interval: Duration::from_millis(500),
            stale_after: Duration::from_secs(3),
        }
    }
}

/// A source started or stopped speaking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakingChange {
    /// Source
    pub source: SourceId,
    /// New speaking flag
    pub speaking: bool,
    /// Whether the source is the local participant
    pub self_: bool,
}

/// Per-source last-spoke tracker
#[derive(Debug)]
pub struct SpeakingTracker {
    config: SpeakingConfig,
    self_source: SourceId,
    last_spoke: HashMap<SourceId, Instant>,
}

impl SpeakingTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new(config: SpeakingConfig) -> Self {
        Self {
            config,
            self_source: 0,
            last_spoke: HashMap::new(),
        }
    }

    /// Tracker configuration
    #[must_use]
    pub fn config(&self) -> &SpeakingConfig {
        &self.config
    }

    /// Set the local participant's source (0 when unknown)
    pub fn set_self_source(&mut self, source: SourceId) {
        if self.self_source != source && self.self_source != 0 {
            self.last_spoke.remove(&self.self_source);
        }
        self.self_source = source;
    }

    /// Whether `source` is the local participant
    #[must_use]
    pub fn is_self(&self, source: SourceId) -> bool {
        self.self_source != 0 && source == self.self_source
    }

    /// Process a batch of levels
    ///
    /// Every sample yields a [`LevelUpdate`]. Samples above the threshold
    /// refresh the source's last-spoke time; the local source only counts
    /// while `self_active` is set. Returns the level updates and any
    /// sources that started speaking.
    pub fn process_levels(
        &mut self,
        levels: &[(SourceId, f32)],
        self_active: bool,
        now: Instant,
    ) -> (Vec<LevelUpdate>, Vec<SpeakingChange>) {
        let mut updates = Vec::with_capacity(levels.len());
        let mut started = Vec::new();
        for &(source, value) in levels {
            let self_ = self.is_self(source);
            updates.push(LevelUpdate {
                source,
                value,
                self_,
            });
            if value <= self.config.threshold || (self_ && !self_active) {
                continue;
            }
            if self.last_spoke.insert(source, now).is_none() {
                started.push(SpeakingChange {
                    source,
                    speaking: true,
                    self_,
                });
            }
        }
        (updates, started)
    }

    /// Evict sources silent for longer than the staleness window
    pub fn evict(&mut self, now: Instant) -> Vec<SpeakingChange> {
        let stale_after = self.config.stale_after;
        let mut stopped: Vec<SpeakingChange> = self
            .last_spoke
            .iter()
            .filter(|(_, &when)| now.saturating_duration_since(when) > stale_after)
            .map(|(&source, _)| SpeakingChange {
                source,
                speaking: false,
                self_: self.is_self(source),
            })
            .collect();
        for change in &stopped {
            self.last_spoke.remove(&change.source);
        }
        stopped.sort_by_key(|change| change.source);
        stopped
    }

    /// Whether `source` is currently speaking
    #[must_use]
    pub fn is_speaking(&self, source: SourceId) -> bool {
        self.last_spoke.contains_key(&source)
    }

    /// Currently speaking sources, sorted
    #[must_use]
    pub fn speakers(&self) -> Vec<SourceId> {
        let mut speakers: Vec<SourceId> = self.last_spoke.keys().copied().collect();
        speakers.sort_unstable();
        speakers
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.last_spoke.clear();
    }
}
