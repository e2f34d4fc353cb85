use crate::conversation::{ComposeState, Resolution, GENERIC_FAILURE};
use crate::session::{HistoryItem, IdClock, ItemId, ReplyState, Session, SessionId};
use crate::storage::PersistedSessions;

/// The list of conversations, which one is active, and the transient compose state.
///
/// Once [`SessionStore::initialize`] or [`SessionStore::restore`] has run the store
/// always holds at least one session and exactly one of them is active.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Vec<Session>,
    active: Option<SessionId>,
    compose: ComposeState,
    clock: IdClock,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self) {
        let active_known = self.active.is_some_and(|id| self.session(id).is_some());
        if self.sessions.is_empty() {
            self.create_session();
        } else if !active_known {
            self.active = Some(self.sessions[0].id);
        }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn active_id(&self) -> Option<SessionId> {
        self.active
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.active.and_then(|id| self.session(id))
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub(crate) fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    pub fn compose(&self) -> &ComposeState {
        &self.compose
    }

    pub fn compose_mut(&mut self) -> &mut ComposeState {
        &mut self.compose
    }

    pub(crate) fn clock_mut(&mut self) -> &mut IdClock {
        &mut self.clock
    }

    pub fn create_session(&mut self) -> SessionId {
        let id = SessionId(self.clock.next());
        self.sessions.insert(0, Session::new(id));
        self.active = Some(id);
        self.compose.clear();
        id
    }

    /// Returns `false` when nothing changed: the id is already active or unknown.
    pub fn select_session(&mut self, id: SessionId) -> bool {
        if self.active == Some(id) || self.session(id).is_none() {
            return false;
        }
        self.active = Some(id);
        self.compose.clear();
        true
    }

    pub fn delete_session(&mut self, id: SessionId) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != id);
        if self.sessions.len() == before {
            return false;
        }
        if self.active == Some(id) {
            match self.sessions.first() {
                Some(head) => {
                    self.active = Some(head.id);
                    self.compose.clear();
                }
                None => {
                    self.create_session();
                }
            }
        }
        true
    }

    pub fn snapshot(&self) -> PersistedSessions {
        PersistedSessions { sessions: self.sessions.clone(), active_id: self.active }
    }

    /// Replaces the store contents with saved state, or starts with one fresh
    /// session when there is nothing usable to restore.
    ///
    /// Replies still loading when the state was saved can never complete, so
    /// they come back as failures.
    pub fn restore(&mut self, saved: Option<PersistedSessions>) {
        self.compose.clear();
        match saved {
            Some(mut saved) if !saved.sessions.is_empty() => {
                for s in &mut saved.sessions {
                    self.clock.observe(s.id.0);
                    if let Some(max) = s.max_item_id() {
                        self.clock.observe(max);
                    }
                    for item in &mut s.history {
                        if let HistoryItem::Bot(bot) = item {
                            if bot.is_loading() {
                                bot.reply = ReplyState::Failed { message: GENERIC_FAILURE.to_string() };
                                bot.prompt = None;
                            }
                        }
                    }
                }
                self.sessions = saved.sessions;
                self.active = saved.active_id;
                self.initialize();
            }
            _ => {
                self.sessions.clear();
                self.active = None;
                self.create_session();
            }
        }
    }

    /// Writes a resolved reply into its placeholder, matched by id.
    /// Returns `false` when the session or the placeholder no longer exists.
    pub fn apply_reply(&mut self, session_id: SessionId, bot_id: ItemId, resolution: Resolution) -> bool {
        let Some(bot) = self.session_mut(session_id).and_then(|s| s.bot_mut(bot_id)) else {
            return false;
        };
        bot.reply = resolution.reply;
        bot.prompt = resolution.prompt;
        true
    }

    pub fn delete_item(&mut self, session_id: SessionId, item_id: ItemId) -> bool {
        let Some(session) = self.session_mut(session_id) else {
            return false;
        };
        let before = session.history.len();
        session.history.retain(|item: &HistoryItem| item.id() != item_id);
        session.history.len() != before
    }
}
