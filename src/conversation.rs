//! Optimistic submit, then reconcile-by-id.
//!
//! A submission moves through `Composing -> Submitted(Loading) -> Resolved`. The
//! submit step is synchronous: it appends a user item and a loading placeholder
//! and hands back a [`PendingReply`]. Whatever the model later returns is turned
//! into a [`Resolution`] by [`resolve`] and written over the placeholder by id.

use chrono::NaiveDate;
use serde::Serialize;

use crate::attachment::{decode_data_url, AttachmentError, AttachmentTray};
use crate::models::{ChatHandle, GenerateResponse, Part};
use crate::prompt::{compose, compose_variation, AspectRatio, ComposeRequest};
use crate::session::{derive_title, BotItem, HistoryItem, ItemId, ReplyState, SessionId, UserItem};
use crate::store::SessionStore;

pub const PROCESSING_IMAGE_ECHO: &str = "Processing image...";
pub const VARIATION_USER_TEXT: &str = "Create a variation...";
pub const VARIATION_ECHO: &str = "Generating variation...";

pub const NO_IMAGE_MESSAGE: &str = "The AI responded, but did not generate an image. Please try rephrasing your request.";
pub const NO_RESPONSE_MESSAGE: &str = "The AI did not return a valid response.";
pub const NO_VARIATION_MESSAGE: &str = "The AI responded, but did not generate a variation. Please try again.";
pub const GENERIC_FAILURE: &str = "Sorry, I couldn't process that. Please try again.";
pub const GENERIC_VARIATION_FAILURE: &str = "Sorry, I couldn't create a variation. Please try again.";

#[derive(Debug, Clone, Default)]
pub struct ComposeState {
    pub text: String,
    pub attachments: AttachmentTray,
    pub aspect_ratio: AspectRatio,
    pub aspect_menu_open: bool,
    pub chat: Option<ChatHandle>,
}

impl ComposeState {
    /// Drops the draft and the chat handle. The aspect ratio choice survives.
    pub fn clear(&mut self) {
        self.text.clear();
        self.attachments.clear();
        self.aspect_menu_open = false;
        self.chat = None;
    }

    fn chat_handle(&mut self) -> ChatHandle {
        self.chat.get_or_insert_with(ChatHandle::new).clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("nothing to send: enter a prompt or attach an image")]
    EmptyInput,
    #[error("no active session")]
    NoActiveSession,
    #[error(transparent)]
    InvalidImage(#[from] AttachmentError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionKind {
    Message,
    Variation,
}

/// A submitted message waiting for the model.
#[derive(Debug, Clone)]
pub struct PendingReply {
    pub session_id: SessionId,
    pub user_id: ItemId,
    pub bot_id: ItemId,
    pub parts: Vec<Part>,
    pub is_image_task: bool,
    pub original_prompt: Option<String>,
    pub kind: SubmissionKind,
    pub chat: ChatHandle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub reply: ReplyState,
    pub prompt: Option<String>,
}

fn insert_pair(
    store: &mut SessionStore,
    session_id: SessionId,
    user: UserItem,
    bot: BotItem,
    title_from: Option<&str>,
) -> Result<(), SubmitError> {
    let session = store.session_mut(session_id).ok_or(SubmitError::NoActiveSession)?;
    if session.history.is_empty() {
        if let Some(title) = title_from.and_then(derive_title) {
            session.title = title;
        }
    }
    session.history.push(HistoryItem::User(user));
    session.history.push(HistoryItem::Bot(bot));
    Ok(())
}

pub fn begin_submission(store: &mut SessionStore, date: NaiveDate) -> Result<PendingReply, SubmitError> {
    let message = store.compose().text.trim().to_string();
    let has_attachments = !store.compose().attachments.is_empty();
    if message.is_empty() && !has_attachments {
        return Err(SubmitError::EmptyInput);
    }
    let session_id = store
        .active_id()
        .filter(|id| store.session(*id).is_some())
        .ok_or(SubmitError::NoActiveSession)?;

    let aspect_ratio = store.compose().aspect_ratio;
    let prompt = compose(&ComposeRequest { text: &message, aspect_ratio, has_attachments }, date);
    let (user_id, bot_id) = store.clock_mut().next_pair();

    let compose_state = store.compose_mut();
    let images = compose_state.attachments.take();
    compose_state.text.clear();
    compose_state.aspect_menu_open = false;
    let chat = compose_state.chat_handle();

    let mut parts: Vec<Part> = images.iter().map(|img| Part::image(&img.mime_type, &img.data)).collect();
    parts.push(Part::text(prompt.text));

    let echo = if message.is_empty() { PROCESSING_IMAGE_ECHO.to_string() } else { message.clone() };
    let user = UserItem { id: user_id, text: message.clone(), images };
    insert_pair(store, session_id, user, BotItem::loading(bot_id, user_id, echo), Some(&message))?;

    Ok(PendingReply {
        session_id,
        user_id,
        bot_id,
        parts,
        is_image_task: prompt.is_image_task,
        original_prompt: (!message.is_empty()).then_some(message),
        kind: SubmissionKind::Message,
        chat,
    })
}

fn variation_file_name(original_prompt: &str) -> String {
    let stem: String = original_prompt
        .chars()
        .take(20)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if stem.is_empty() { "source.png".to_string() } else { format!("{stem}.png") }
}

/// Starts a "create variation" request from a previously rendered result image.
pub fn begin_variation(
    store: &mut SessionStore,
    original_prompt: &str,
    image_url: &str,
    date: NaiveDate,
) -> Result<PendingReply, SubmitError> {
    let session_id = store
        .active_id()
        .filter(|id| store.session(*id).is_some())
        .ok_or(SubmitError::NoActiveSession)?;
    let source = decode_data_url(image_url, &variation_file_name(original_prompt))?;

    let aspect_ratio: AspectRatio = store.compose().aspect_ratio;
    let prompt = compose_variation(original_prompt, aspect_ratio, date);
    let (user_id, bot_id) = store.clock_mut().next_pair();
    let chat = store.compose_mut().chat_handle();

    let parts = vec![Part::image(&source.mime_type, &source.data), Part::text(prompt.text)];
    let user = UserItem { id: user_id, text: VARIATION_USER_TEXT.to_string(), images: vec![source] };
    insert_pair(store, session_id, user, BotItem::loading(bot_id, user_id, VARIATION_ECHO), None)?;

    Ok(PendingReply {
        session_id,
        user_id,
        bot_id,
        parts,
        is_image_task: true,
        original_prompt: Some(original_prompt.to_string()),
        kind: SubmissionKind::Variation,
        chat,
    })
}

/// Maps the model outcome onto the final state of the placeholder.
pub fn resolve(pending: &PendingReply, result: anyhow::Result<GenerateResponse>) -> Resolution {
    match result {
        Ok(resp) => {
            let image_url = resp.last_image().map(|img| img.to_data_url());
            let text = resp.text.filter(|t| !t.is_empty());
            let reply = if image_url.is_some() || text.is_some() {
                ReplyState::Answered { text, image_url }
            } else {
                let message = match (pending.kind, pending.is_image_task) {
                    (SubmissionKind::Variation, _) => NO_VARIATION_MESSAGE,
                    (SubmissionKind::Message, true) => NO_IMAGE_MESSAGE,
                    (SubmissionKind::Message, false) => NO_RESPONSE_MESSAGE,
                };
                ReplyState::Empty { message: message.to_string() }
            };
            Resolution { reply, prompt: pending.original_prompt.clone() }
        }
        Err(err) => {
            let mut message = err.to_string();
            if message.trim().is_empty() {
                message = match pending.kind {
                    SubmissionKind::Message => GENERIC_FAILURE,
                    SubmissionKind::Variation => GENERIC_VARIATION_FAILURE,
                }
                .to_string();
            }
            Resolution { reply: ReplyState::Failed { message }, prompt: None }
        }
    }
}
