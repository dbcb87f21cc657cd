//! Human-readable rendering of session events

use groupcall_core::prelude::*;
use groupcall_core::{CallInfo, Participant, ParticipantChange, SpeakingChange};

/// Renders session events for one local user
#[derive(Debug, Clone, Copy)]
pub struct EventDisplay {
    self_user: UserId,
}

impl EventDisplay {
    pub fn new(self_user: UserId) -> Self {
        Self { self_user }
    }

    /// One line per interesting event; `None` for noise
    pub fn render(&self, event: &SessionEvent) -> Option<String> {
        match event {
            SessionEvent::StateChanged { old, new } => {
                Some(format!("🔄 State: {:?} -> {:?}", old, new))
            }
            SessionEvent::MuteChanged(state) => {
                Some(format!("🎙️  Microphone: {}", mute_label(*state)))
            }
            SessionEvent::Speaking(change) => Some(self.render_speaking(change)),
            SessionEvent::ParticipantUpdated(change) => self.render_participant(change),
            SessionEvent::CallUpdated(info) => Some(render_call(info)),
            SessionEvent::Finished => Some("✅ Session finished".to_string()),
            SessionEvent::Failed => Some("❌ Session failed".to_string()),
        }
    }

    fn render_speaking(&self, change: &SpeakingChange) -> String {
        let who = if change.self_ {
            "You".to_string()
        } else {
            format!("Source {}", change.source)
        };
        if change.speaking {
            format!("🗣️  {} started speaking", who)
        } else {
            format!("🤐 {} stopped speaking", who)
        }
    }

    fn render_participant(&self, change: &ParticipantChange) -> Option<String> {
        match (&change.was, &change.now) {
            (None, Some(now)) => Some(format!(
                "👋 {} joined (source {})",
                self.name(now),
                now.source
            )),
            (Some(was), None) => Some(format!("👋 {} left", self.name(was))),
            (Some(was), Some(now)) if was.muted != now.muted => {
                let icon = if now.muted { "🔇" } else { "🔊" };
                let action = match (now.muted, now.can_self_unmute) {
                    (true, false) => "muted by admin",
                    (true, true) => "muted",
                    (false, _) => "unmuted",
                };
                Some(format!("{} {}: {}", icon, self.name(now), action))
            }
            (Some(was), Some(now)) if was.source != now.source => Some(format!(
                "🔁 {} reconnected (source {})",
                self.name(now),
                now.source
            )),
            _ => None,
        }
    }

    fn name(&self, participant: &Participant) -> String {
        if participant.user == self.self_user {
            "You".to_string()
        } else {
            participant.user.to_string()
        }
    }
}

/// Short label for a mute state
pub fn mute_label(state: MuteState) -> &'static str {
    match state {
        MuteState::Active => "live",
        MuteState::Muted => "muted",
        MuteState::ForceMuted => "muted by admin",
    }
}

fn render_call(info: &CallInfo) -> String {
    let mut line = format!(
        "📋 Call: {} ({} participants)",
        info.title.as_deref().unwrap_or("untitled"),
        info.participants_count
    );
    if info.record_start_date.is_some() {
        line.push_str(" [recording]");
    }
    if info.discarded {
        line.push_str(" [discarded]");
    }
    line
}
