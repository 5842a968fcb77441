//! Transcript state and the fold that advances it

use sapp_protocol::ConversationEvent;
use serde::Serialize;
use std::collections::VecDeque;

/// Default number of completed entries kept in history
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Who produced an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

/// One utterance in the transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    /// Stable identity for list diffing, never reused by a fold
    pub id: u64,
    pub role: Role,
    pub text: String,
}

impl TranscriptEntry {
    /// The "no utterance yet" entry shown before the first turn
    pub fn placeholder() -> Self {
        Self {
            id: 0,
            role: Role::Agent,
            text: String::new(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// The in-progress utterance plus completed ones, oldest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptState {
    pub current: TranscriptEntry,
    pub history: VecDeque<TranscriptEntry>,
}

impl Default for TranscriptState {
    fn default() -> Self {
        Self {
            current: TranscriptEntry::placeholder(),
            history: VecDeque::new(),
        }
    }
}

/// Sequential entry ids, starting after the placeholder id.
#[derive(Debug)]
pub struct EntryIds(u64);

impl EntryIds {
    pub fn new() -> Self {
        Self(1)
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.0;
        self.0 += 1;
        id
    }
}

impl Default for EntryIds {
    fn default() -> Self {
        Self::new()
    }
}

/// A debounced full-text replace waiting for its delay to elapse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReplace {
    /// Entry the delta was received for
    pub entry_id: u64,
    /// Issue order; only the most recently issued replace may apply
    pub seq: u64,
    pub text: String,
}

/// What a single [`TranscriptFold::apply`] did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FoldOutcome {
    /// Entry moved into history by a turn start
    pub archived: Option<TranscriptEntry>,
    /// Whether the transcript state differs from before
    pub changed: bool,
    /// Replace the caller must apply after the debounce delay
    pub pending: Option<PendingReplace>,
}

/// Single writer of [`TranscriptState`].
///
/// Turn starts archive the current entry and open a new one, agent speech is
/// appended, and user transcription is handed back as a [`PendingReplace`]
/// for the caller to debounce.
#[derive(Debug)]
pub struct TranscriptFold {
    state: TranscriptState,
    ids: EntryIds,
    history_limit: usize,
    replace_seq: u64,
}

impl TranscriptFold {
    /// Create a fold keeping at most `history_limit` completed entries (at least one)
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: TranscriptState::default(),
            ids: EntryIds::new(),
            history_limit: history_limit.max(1),
            replace_seq: 0,
        }
    }

    pub fn state(&self) -> &TranscriptState {
        &self.state
    }

    /// Apply one conversation event
    pub fn apply(&mut self, event: &ConversationEvent) -> FoldOutcome {
        match event {
            ConversationEvent::AgentTurnStarted => self.start_turn(Role::Agent),
            ConversationEvent::UserTurnStarted => self.start_turn(Role::User),
            ConversationEvent::AgentSpeechDelta { text } => {
                let current = &mut self.state.current;
                let appended = format!("{} {}", current.text, text).trim().to_string();
                let changed = appended != current.text;
                current.text = appended;
                FoldOutcome {
                    changed,
                    ..Default::default()
                }
            }
            // `is_final` does not change how the replace is applied
            ConversationEvent::UserTranscriptionDelta { text, .. } => {
                self.replace_seq += 1;
                FoldOutcome {
                    pending: Some(PendingReplace {
                        entry_id: self.state.current.id,
                        seq: self.replace_seq,
                        text: text.clone(),
                    }),
                    ..Default::default()
                }
            }
            // Agent text arrives through speech deltas; these carry no
            // transcript change.
            ConversationEvent::AgentTextDelta { .. }
            | ConversationEvent::AgentOutput { .. }
            | ConversationEvent::AgentTurnStopped
            | ConversationEvent::UserTurnStopped => FoldOutcome::default(),
        }
    }

    /// Apply a debounced replace.
    ///
    /// Returns false without touching state when the target entry is no
    /// longer current or a newer replace has been issued since.
    pub fn apply_replace(&mut self, replace: PendingReplace) -> bool {
        if replace.entry_id != self.state.current.id || replace.seq != self.replace_seq {
            return false;
        }
        self.state.current.text = replace.text;
        true
    }

    /// Drop all transcript content. Entry ids keep counting up.
    pub fn reset(&mut self) {
        self.state = TranscriptState::default();
        self.replace_seq += 1;
    }

    fn start_turn(&mut self, role: Role) -> FoldOutcome {
        let next = TranscriptEntry {
            id: self.ids.next_id(),
            role,
            text: String::new(),
        };
        let previous = std::mem::replace(&mut self.state.current, next);
        FoldOutcome {
            archived: self.archive(previous),
            changed: true,
            pending: None,
        }
    }

    fn archive(&mut self, entry: TranscriptEntry) -> Option<TranscriptEntry> {
        if entry.is_blank() {
            return None;
        }
        self.state.history.push_back(entry.clone());
        while self.state.history.len() > self.history_limit {
            self.state.history.pop_front();
        }
        Some(entry)
    }
}

impl Default for TranscriptFold {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
