use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::attachment::EncodedImage;

pub const DEFAULT_SESSION_TITLE: &str = "New Chat";
pub const TITLE_MAX_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(SessionId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out timestamp-derived identifiers that never repeat or go backwards,
/// even when several are requested within the same millisecond.
#[derive(Debug, Clone, Default)]
pub struct IdClock {
    last: i64,
}

impl IdClock {
    pub fn next(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last = now.max(self.last + 1);
        self.last
    }

    /// Allocates a user/bot pair where the bot id is the user id plus one.
    pub fn next_pair(&mut self) -> (ItemId, ItemId) {
        let user = self.next();
        self.last = user + 1;
        (ItemId(user), ItemId(user + 1))
    }

    /// Makes sure later ids sort after everything already present, e.g. after a restore.
    pub fn observe(&mut self, id: i64) {
        self.last = self.last.max(id);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserItem {
    pub id: ItemId,
    pub text: String,
    #[serde(skip)]
    pub images: Vec<EncodedImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyState {
    Loading,
    Answered {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_url: Option<String>,
    },
    Empty { message: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotItem {
    pub id: ItemId,
    pub in_reply_to: ItemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub reply: ReplyState,
}

impl BotItem {
    pub fn loading(id: ItemId, in_reply_to: ItemId, prompt: impl Into<String>) -> Self {
        Self { id, in_reply_to, prompt: Some(prompt.into()), reply: ReplyState::Loading }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.reply, ReplyState::Loading)
    }

    /// Text shown for this reply: model text, or the advisory/error message.
    pub fn text(&self) -> Option<&str> {
        match &self.reply {
            ReplyState::Loading => None,
            ReplyState::Answered { text, .. } => text.as_deref(),
            ReplyState::Empty { message } | ReplyState::Failed { message } => Some(message),
        }
    }

    pub fn image_url(&self) -> Option<&str> {
        match &self.reply {
            ReplyState::Answered { image_url, .. } => image_url.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HistoryItem {
    User(UserItem),
    Bot(BotItem),
}

impl HistoryItem {
    pub fn id(&self) -> ItemId {
        match self {
            HistoryItem::User(u) => u.id,
            HistoryItem::Bot(b) => b.id,
        }
    }

    pub fn as_bot(&self) -> Option<&BotItem> {
        match self {
            HistoryItem::Bot(b) => Some(b),
            HistoryItem::User(_) => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserItem> {
        match self {
            HistoryItem::User(u) => Some(u),
            HistoryItem::Bot(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<HistoryItem>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            title: DEFAULT_SESSION_TITLE.to_string(),
            created_at: Utc::now(),
            history: Vec::new(),
        }
    }

    pub fn bot_mut(&mut self, id: ItemId) -> Option<&mut BotItem> {
        self.history.iter_mut().find_map(|item| match item {
            HistoryItem::Bot(b) if b.id == id => Some(b),
            _ => None,
        })
    }

    pub fn bot(&self, id: ItemId) -> Option<&BotItem> {
        self.history.iter().find_map(|item| item.as_bot().filter(|b| b.id == id))
    }

    pub fn max_item_id(&self) -> Option<i64> {
        self.history.iter().map(|item| item.id().0).max()
    }
}

/// First `TITLE_MAX_CHARS` characters of the message, or `None` for an empty message.
pub fn derive_title(message: &str) -> Option<String> {
    if message.is_empty() {
        return None;
    }
    Some(message.chars().take(TITLE_MAX_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_strictly_monotonic() {
        let mut clock = IdClock::default();
        let a = clock.next();
        let b = clock.next();
        let (u, bot) = clock.next_pair();
        let c = clock.next();
        assert!(b > a);
        assert!(u.0 > b);
        assert_eq!(bot.0, u.0 + 1);
        assert!(c > bot.0);
    }

    #[test]
    fn observe_moves_clock_past_restored_ids() {
        let mut clock = IdClock::default();
        let far_future = Utc::now().timestamp_millis() + 1_000_000;
        clock.observe(far_future);
        assert_eq!(clock.next(), far_future + 1);
    }

    #[test]
    fn title_is_truncated_by_characters() {
        let long = "é".repeat(60);
        let title = derive_title(&long).unwrap();
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS);
        assert_eq!(derive_title(""), None);
        assert_eq!(derive_title("a red bicycle").as_deref(), Some("a red bicycle"));
    }

    #[test]
    fn history_serializes_with_type_tags_and_skips_images() {
        let user = HistoryItem::User(UserItem {
            id: ItemId(10),
            text: "hi".into(),
            images: vec![EncodedImage {
                data: "AAAA".into(),
                mime_type: "image/png".into(),
                file_name: "a.png".into(),
            }],
        });
        let bot = HistoryItem::Bot(BotItem::loading(ItemId(11), ItemId(10), "hi"));
        let json = serde_json::to_value(vec![user, bot]).unwrap();
        assert_eq!(json[0]["type"], "user");
        assert!(json[0].get("images").is_none());
        assert_eq!(json[1]["type"], "bot");
        assert_eq!(json[1]["reply"]["status"], "loading");
        assert_eq!(json[1]["in_reply_to"], 10);

        let back: Vec<HistoryItem> = serde_json::from_value(json).unwrap();
        assert!(back[0].as_user().unwrap().images.is_empty());
        assert!(back[1].as_bot().unwrap().is_loading());
    }

    #[test]
    fn bot_accessors_follow_reply_state() {
        let mut bot = BotItem::loading(ItemId(2), ItemId(1), "p");
        assert!(bot.is_loading());
        assert_eq!(bot.text(), None);

        bot.reply = ReplyState::Failed { message: "rate limited".into() };
        assert!(!bot.is_loading());
        assert_eq!(bot.text(), Some("rate limited"));
        assert_eq!(bot.image_url(), None);

        bot.reply = ReplyState::Answered { text: None, image_url: Some("data:image/png;base64,AA".into()) };
        assert_eq!(bot.image_url(), Some("data:image/png;base64,AA"));
    }
}
