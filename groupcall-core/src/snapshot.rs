//! Call and participant snapshot
//!
//! In-memory view of call-wide metadata and the participant list,
//! reconciled from signaling pushes. Pushes carry a server version; the
//! snapshot applies them in version order, queues the ones that arrive
//! early and drops the ones it has already seen, so applying the same push
//! twice never changes the result.

use crate::signaling::{CallMetadata, CallUpdate, FullCall, ParticipantData, ParticipantsUpdate};
use crate::types::{CallHandle, SourceId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Participant volume when the server sends none (100%)
pub const DEFAULT_VOLUME: u32 = 10_000;

/// Participant as seen by the local client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    /// User
    pub user: UserId,
    /// Audio source
    pub source: SourceId,
    /// Join date
    pub date: DateTime<Utc>,
    /// Last activity reported by the server
    pub last_active: Option<DateTime<Utc>>,
    /// Raised hand rating
    pub raise_hand_rating: Option<u64>,
    /// Playback volume (10000 = 100%)
    pub volume: u32,
    /// Currently speaking
    pub speaking: bool,
    /// Muted
    pub muted: bool,
    /// Muted locally by us
    pub muted_by_me: bool,
    /// May unmute themselves
    pub can_self_unmute: bool,
}

/// Participant before and after a change
///
/// `was == None` means the participant joined, `now == None` that they left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantChange {
    /// Previous value
    pub was: Option<Participant>,
    /// New value
    pub now: Option<Participant>,
}

/// What applying one or more pushes did to the snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Pushes actually applied, in application order
    pub applied: Vec<CallUpdate>,
    /// Call metadata changed
    pub call_changed: bool,
    /// Effective participant changes
    pub participant_changes: Vec<ParticipantChange>,
    /// Pushes are waiting for an earlier version
    pub pending: bool,
    /// Local and server participant counts disagree
    pub reload_needed: bool,
}

impl ApplyOutcome {
    fn merge(&mut self, other: ApplyOutcome) {
        self.applied.extend(other.applied);
        self.call_changed |= other.call_changed;
        self.participant_changes.extend(other.participant_changes);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SliceSource {
    Loaded,
    Update,
}

/// Call-wide metadata plus the participant list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    handle: CallHandle,
    version: u32,
    title: Option<String>,
    record_start_date: Option<DateTime<Utc>>,
    join_muted: bool,
    can_change_join_muted: bool,
    server_participants_count: u32,
    all_participants_loaded: bool,
    discarded: bool,
    participants: Vec<Participant>,
    #[serde(skip)]
    by_source: HashMap<SourceId, UserId>,
    #[serde(skip)]
    queued: BTreeMap<(u32, bool), CallUpdate>,
}

impl CallSnapshot {
    /// Empty snapshot for a call
    #[must_use]
    pub fn new(handle: CallHandle) -> Self {
        Self {
            handle,
            version: 0,
            title: None,
            record_start_date: None,
            join_muted: false,
            can_change_join_muted: false,
            server_participants_count: 0,
            all_participants_loaded: false,
            discarded: false,
            participants: Vec::new(),
            by_source: HashMap::new(),
            queued: BTreeMap::new(),
        }
    }

    /// Call handle
    #[must_use]
    pub fn handle(&self) -> CallHandle {
        self.handle
    }

    /// Server version (0 until the first metadata push)
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Call title
    #[must_use]
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Recording start date
    #[must_use]
    pub fn record_start_date(&self) -> Option<DateTime<Utc>> {
        self.record_start_date
    }

    /// Whether the call is being recorded
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.record_start_date.is_some()
    }

    /// New participants join muted
    #[must_use]
    pub fn join_muted(&self) -> bool {
        self.join_muted
    }

    /// The local user may change `join_muted`
    #[must_use]
    pub fn can_change_join_muted(&self) -> bool {
        self.can_change_join_muted
    }

    /// Whether the call was discarded for everyone
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    /// Participant list
    #[must_use]
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Look up a participant by user
    #[must_use]
    pub fn participant(&self, user: UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user == user)
    }

    /// Look up a participant by audio source
    #[must_use]
    pub fn participant_by_source(&self, source: SourceId) -> Option<&Participant> {
        self.by_source
            .get(&source)
            .and_then(|user| self.participant(*user))
    }

    /// Participant count known to the server
    #[must_use]
    pub fn server_participants_count(&self) -> u32 {
        self.server_participants_count
    }

    /// Best-known total participant count
    #[must_use]
    pub fn full_count(&self) -> usize {
        let local = self.participants.len();
        if self.all_participants_loaded {
            local
        } else {
            local.max(self.server_participants_count as usize)
        }
    }

    /// Whether pushes are waiting for an earlier version
    #[must_use]
    pub fn has_queued_updates(&self) -> bool {
        !self.queued.is_empty()
    }

    /// Apply or queue a push
    ///
    /// Pushes for a different call are ignored.
    pub fn enqueue(&mut self, update: CallUpdate) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        if update.call_id() != self.handle.id {
            return outcome;
        }
        match &update {
            CallUpdate::Call(data) => {
                if data.access_hash != self.handle.access_hash {
                    tracing::debug!(call_id = data.id, "Ignoring push with foreign access hash");
                    return outcome;
                }
                if self.version == 0 || self.version == data.version {
                    outcome.merge(self.apply(update));
                } else if self.version < data.version {
                    self.queued.insert((data.version, false), update);
                }
            }
            CallUpdate::Discarded { .. } => outcome.merge(self.apply(update)),
            CallUpdate::Participants(data) => {
                let increment = data.increments_version();
                let required = if increment {
                    data.version.saturating_sub(1)
                } else {
                    data.version
                };
                if self.version == required {
                    outcome.merge(self.apply(update));
                } else if self.version < required {
                    self.queued.insert((data.version, increment), update);
                }
            }
        }
        self.process_queued(&mut outcome);
        outcome
    }

    /// Replace everything with a freshly loaded call
    pub fn apply_full_call(&mut self, full: FullCall) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        if full.call.id != self.handle.id {
            return outcome;
        }
        self.queued.clear();
        let old = std::mem::take(&mut self.participants);
        self.by_source.clear();
        self.all_participants_loaded = false;
        // Keep speaking flags across the reload.
        let speaking: HashMap<UserId, bool> = old.iter().map(|p| (p.user, p.speaking)).collect();
        self.apply_participants_slice(&full.participants, SliceSource::Loaded);
        for participant in &mut self.participants {
            participant.speaking = participant.can_self_unmute
                && speaking.get(&participant.user).copied().unwrap_or(false);
        }
        outcome.call_changed = self.apply_call_fields(&full.call);
        outcome.participant_changes = diff_participants(&old, &self.participants);
        self.process_queued(&mut outcome);
        outcome
    }

    /// Mark the participant behind `source` as (not) speaking
    pub fn set_speaking(&mut self, source: SourceId, speaking: bool) -> Option<ParticipantChange> {
        let user = *self.by_source.get(&source)?;
        let participant = self.participants.iter_mut().find(|p| p.user == user)?;
        if participant.speaking == speaking || (speaking && !participant.can_self_unmute) {
            return None;
        }
        let was = participant.clone();
        participant.speaking = speaking;
        Some(ParticipantChange {
            was: Some(was),
            now: Some(participant.clone()),
        })
    }

    fn apply(&mut self, update: CallUpdate) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        match &update {
            CallUpdate::Call(data) => {
                outcome.call_changed = self.apply_call_fields(data);
            }
            CallUpdate::Discarded { .. } => {
                outcome.call_changed = !self.discarded;
                self.discarded = true;
            }
            CallUpdate::Participants(data) => {
                self.version = normalize_version(data.version);
                outcome.participant_changes = self.apply_participants_update(data);
            }
        }
        outcome.applied.push(update);
        outcome
    }

    fn apply_call_fields(&mut self, data: &CallMetadata) -> bool {
        let before = (
            self.title.clone(),
            self.record_start_date,
            self.join_muted,
            self.can_change_join_muted,
            self.server_participants_count,
        );
        self.version = normalize_version(data.version);
        self.title = data.title.clone();
        self.record_start_date = data.record_start_date;
        self.join_muted = data.join_muted;
        self.can_change_join_muted = data.can_change_join_muted;
        self.server_participants_count = data.participants_count;
        self.all_participants_loaded =
            self.server_participants_count as usize == self.participants.len();
        let after = (
            self.title.clone(),
            self.record_start_date,
            self.join_muted,
            self.can_change_join_muted,
            self.server_participants_count,
        );
        before != after
    }

    fn apply_participants_update(&mut self, data: &ParticipantsUpdate) -> Vec<ParticipantChange> {
        self.apply_participants_slice(&data.participants, SliceSource::Update)
    }

    fn apply_participants_slice(
        &mut self,
        list: &[ParticipantData],
        source: SliceSource,
    ) -> Vec<ParticipantChange> {
        let mut changes = Vec::new();
        for data in list {
            let index = self.participants.iter().position(|p| p.user == data.user);
            if data.left {
                if let Some(index) = index {
                    let was = self.participants.remove(index);
                    self.by_source.remove(&was.source);
                    self.server_participants_count =
                        self.server_participants_count.saturating_sub(1);
                    if source == SliceSource::Update {
                        changes.push(ParticipantChange {
                            was: Some(was),
                            now: None,
                        });
                    }
                }
                continue;
            }

            let was = index.map(|i| self.participants[i].clone());
            let can_self_unmute = !data.muted || data.can_self_unmute;
            let value = Participant {
                user: data.user,
                source: data.source,
                date: data.date,
                last_active: data
                    .active_date
                    .or_else(|| was.as_ref().and_then(|w| w.last_active)),
                raise_hand_rating: data.raise_hand_rating,
                volume: data
                    .volume
                    .or_else(|| was.as_ref().map(|w| w.volume))
                    .unwrap_or(DEFAULT_VOLUME),
                speaking: can_self_unmute && was.as_ref().is_some_and(|w| w.speaking),
                muted: data.muted,
                muted_by_me: data.muted_by_you,
                can_self_unmute,
            };

            match index {
                Some(i) => {
                    if self.participants[i].source != value.source {
                        self.by_source.remove(&self.participants[i].source);
                    }
                    self.participants[i] = value.clone();
                }
                None => {
                    self.participants.push(value.clone());
                    if data.just_joined {
                        self.server_participants_count += 1;
                    }
                }
            }
            self.by_source.insert(value.source, value.user);

            if source == SliceSource::Update && was.as_ref() != Some(&value) {
                changes.push(ParticipantChange {
                    was,
                    now: Some(value),
                });
            }
        }
        changes
    }

    fn process_queued(&mut self, outcome: &mut ApplyOutcome) {
        if self.version == 0 {
            outcome.pending = self.has_queued_updates();
            return;
        }
        while let Some((&(version, increment), _)) = self.queued.iter().next() {
            if version < self.version || (version == self.version && increment) {
                self.queued.remove(&(version, increment));
            } else if version == self.version || (version == self.version + 1 && increment) {
                if let Some(update) = self.queued.remove(&(version, increment)) {
                    outcome.merge(self.apply(update));
                }
            } else {
                break;
            }
        }
        if self.queued.is_empty() {
            let server = self.server_participants_count as usize;
            let local = self.participants.len();
            outcome.pending = false;
            outcome.reload_needed =
                server < local || (self.all_participants_loaded && server > local);
        } else {
            outcome.pending = true;
        }
    }
}

fn normalize_version(version: u32) -> u32 {
    if version == 0 {
        tracing::warn!("Got zero version for group call, treating as 1");
        1
    } else {
        version
    }
}

fn diff_participants(old: &[Participant], new: &[Participant]) -> Vec<ParticipantChange> {
    let mut changes = Vec::new();
    for was in old {
        match new.iter().find(|p| p.user == was.user) {
            Some(now) if now != was => changes.push(ParticipantChange {
                was: Some(was.clone()),
                now: Some(now.clone()),
            }),
            Some(_) => {}
            None => changes.push(ParticipantChange {
                was: Some(was.clone()),
                now: None,
            }),
        }
    }
    for now in new {
        if !old.iter().any(|p| p.user == now.user) {
            changes.push(ParticipantChange {
                was: None,
                now: Some(now.clone()),
            });
        }
    }
    changes
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const CALL: u64 = 7;
    const HASH: u64 = 42;

    fn date() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn metadata(version: u32, count: u32) -> CallUpdate {
        CallUpdate::Call(CallMetadata {
            id: CALL,
            access_hash: HASH,
            version,
            title: Some("Standup".to_string()),
            record_start_date: None,
            participants_count: count,
            join_muted: false,
            can_change_join_muted: true,
        })
    }

    fn entry(user: u64, muted: bool) -> ParticipantData {
        ParticipantData {
            user: UserId(user),
            source: 1000 + user as u32,
            date: date(),
            active_date: None,
            muted,
            can_self_unmute: true,
            muted_by_you: false,
            volume: None,
            raise_hand_rating: None,
            left: false,
            just_joined: false,
            versioned: false,
        }
    }

    fn participants(version: u32, list: Vec<ParticipantData>) -> CallUpdate {
        CallUpdate::Participants(ParticipantsUpdate {
            call_id: CALL,
            version,
            participants: list,
        })
    }

    fn snapshot() -> CallSnapshot {
        CallSnapshot::new(CallHandle::new(CALL, HASH))
    }

    #[test]
    fn test_metadata_applies_first_push() {
        let mut snap = snapshot();
        let outcome = snap.enqueue(metadata(3, 0));
        assert!(outcome.call_changed);
        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(snap.version(), 3);
        assert_eq!(snap.title(), Some("Standup"));
    }

    #[test]
    fn test_foreign_call_is_ignored() {
        let mut snap = snapshot();
        let mut foreign = metadata(1, 0);
        if let CallUpdate::Call(data) = &mut foreign {
            data.id = 99;
        }
        let outcome = snap.enqueue(foreign);
        assert!(outcome.applied.is_empty());
        assert_eq!(snap.version(), 0);

        let mut wrong_hash = metadata(1, 0);
        if let CallUpdate::Call(data) = &mut wrong_hash {
            data.access_hash = 1;
        }
        assert!(snap.enqueue(wrong_hash).applied.is_empty());
    }

    #[test]
    fn test_participants_applied_and_indexed() {
        let mut snap = snapshot();
        snap.enqueue(metadata(1, 2));
        let outcome = snap.enqueue(participants(1, vec![entry(1, false), entry(2, true)]));

        assert_eq!(outcome.participant_changes.len(), 2);
        assert!(outcome.participant_changes.iter().all(|c| c.was.is_none()));
        assert_eq!(snap.participants().len(), 2);
        assert_eq!(snap.participant_by_source(1002).unwrap().user, UserId(2));
        assert_eq!(snap.participant(UserId(1)).unwrap().volume, DEFAULT_VOLUME);
        assert!(!outcome.reload_needed);
    }

    #[test]
    fn test_duplicate_push_is_noop() {
        let mut snap = snapshot();
        snap.enqueue(metadata(1, 1));
        let update = participants(1, vec![entry(5, true)]);
        snap.enqueue(update.clone());
        let before = snap.clone();

        let outcome = snap.enqueue(update);
        assert_eq!(snap, before);
        assert!(outcome.participant_changes.is_empty());
    }

    #[test]
    fn test_versioned_push_applies_once() {
        let mut snap = snapshot();
        snap.enqueue(metadata(1, 0));
        let mut joined = entry(3, false);
        joined.versioned = true;
        joined.just_joined = true;
        let update = participants(2, vec![joined]);

        snap.enqueue(update.clone());
        assert_eq!(snap.version(), 2);
        assert_eq!(snap.server_participants_count(), 1);

        let outcome = snap.enqueue(update);
        assert!(outcome.applied.is_empty());
        assert_eq!(snap.server_participants_count(), 1);
    }

    #[test]
    fn test_early_push_waits_for_gap() {
        let mut snap = snapshot();
        snap.enqueue(metadata(1, 0));

        let mut second = entry(2, false);
        second.versioned = true;
        let mut third = entry(3, false);
        third.versioned = true;

        let outcome = snap.enqueue(participants(3, vec![third]));
        assert!(outcome.pending);
        assert!(outcome.applied.is_empty());
        assert!(snap.has_queued_updates());

        let outcome = snap.enqueue(participants(2, vec![second]));
        assert!(!outcome.pending);
        assert_eq!(outcome.applied.len(), 2);
        assert_eq!(snap.version(), 3);
        assert_eq!(snap.participants().len(), 2);
    }

    #[test]
    fn test_stale_push_dropped() {
        let mut snap = snapshot();
        snap.enqueue(metadata(5, 0));
        let outcome = snap.enqueue(participants(4, vec![entry(1, false)]));
        assert!(outcome.applied.is_empty());
        assert!(!snap.has_queued_updates());
        assert!(snap.participants().is_empty());
    }

    #[test]
    fn test_newer_metadata_is_queued() {
        let mut snap = snapshot();
        snap.enqueue(metadata(1, 0));
        let outcome = snap.enqueue(metadata(2, 0));
        assert!(outcome.pending);
        assert_eq!(snap.version(), 1);
    }

    #[test]
    fn test_left_participant_removed() {
        let mut snap = snapshot();
        snap.enqueue(metadata(1, 1));
        snap.enqueue(participants(1, vec![entry(4, false)]));

        let mut left = entry(4, false);
        left.left = true;
        let outcome = snap.enqueue(participants(1, vec![left.clone()]));
        assert_eq!(outcome.participant_changes.len(), 1);
        assert!(outcome.participant_changes[0].now.is_none());
        assert!(snap.participant_by_source(1004).is_none());
        assert_eq!(snap.server_participants_count(), 0);

        let again = snap.enqueue(participants(1, vec![left]));
        assert!(again.participant_changes.is_empty());
        assert_eq!(snap.server_participants_count(), 0);
    }

    #[test]
    fn test_count_mismatch_requests_reload() {
        let mut snap = snapshot();
        snap.enqueue(metadata(1, 0));
        let outcome = snap.enqueue(participants(1, vec![entry(1, false)]));
        assert!(outcome.reload_needed);
    }

    #[test]
    fn test_discarded() {
        let mut snap = snapshot();
        let outcome = snap.enqueue(CallUpdate::Discarded { id: CALL });
        assert!(outcome.call_changed);
        assert!(snap.is_discarded());
        let outcome = snap.enqueue(CallUpdate::Discarded { id: CALL });
        assert!(!outcome.call_changed);
    }

    #[test]
    fn test_speaking_flag() {
        let mut snap = snapshot();
        snap.enqueue(metadata(1, 2));
        let mut force_muted = entry(2, true);
        force_muted.can_self_unmute = false;
        snap.enqueue(participants(1, vec![entry(1, false), force_muted]));

        let change = snap.set_speaking(1001, true).unwrap();
        assert!(change.now.unwrap().speaking);
        assert!(snap.set_speaking(1001, true).is_none());
        assert!(snap.set_speaking(1002, true).is_none());
        assert!(snap.set_speaking(9999, true).is_none());

        // Speaking survives a plain participant refresh
        snap.enqueue(participants(1, vec![entry(1, false)]));
        assert!(snap.participant(UserId(1)).unwrap().speaking);
    }

    #[test]
    fn test_full_call_replaces_state() {
        let mut snap = snapshot();
        snap.enqueue(metadata(1, 1));
        snap.enqueue(participants(1, vec![entry(1, false)]));
        let mut queued = entry(9, false);
        queued.versioned = true;
        snap.enqueue(participants(5, vec![queued]));
        assert!(snap.has_queued_updates());

        let full = FullCall {
            call: match metadata(6, 1) {
                CallUpdate::Call(data) => data,
                _ => unreachable!(),
            },
            participants: vec![entry(2, false)],
        };
        let outcome = snap.apply_full_call(full);
        assert!(!snap.has_queued_updates());
        assert_eq!(snap.version(), 6);
        assert_eq!(outcome.participant_changes.len(), 2);
        assert!(snap.participant(UserId(1)).is_none());
        assert!(snap.participant(UserId(2)).is_some());
        assert_eq!(snap.full_count(), 1);
    }

    fn arb_update() -> impl Strategy<Value = CallUpdate> {
        prop_oneof![
            (1u32..6, 0u32..4).prop_map(|(v, c)| metadata(v, c)),
            (1u32..6, 1u64..5, any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
                |(v, user, muted, left, versioned)| {
                    let mut data = entry(user, muted);
                    data.left = left;
                    data.versioned = versioned;
                    data.just_joined = versioned && !left;
                    participants(v, vec![data])
                }
            ),
        ]
    }

    proptest! {
        #[test]
        fn prop_duplicate_update_is_noop(
            prefix in proptest::collection::vec(arb_update(), 0..12),
            update in arb_update(),
        ) {
            let mut snap = snapshot();
            for u in prefix {
                snap.enqueue(u);
            }
            snap.enqueue(update.clone());
            let before = snap.clone();
            snap.enqueue(update);
            prop_assert_eq!(snap, before);
        }
    }
}
