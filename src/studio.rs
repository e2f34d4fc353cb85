use std::sync::Arc;

use chrono::{Local, NaiveDate};
use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

use crate::attachment::{encode_batch, AddReport, RawFile};
use crate::conversation::{begin_submission, begin_variation, resolve, PendingReply, SubmitError};
use crate::models::GenerativeModel;
use crate::preferences::{Preferences, PreferencesPatch, UserProfile, UserProfilePatch};
use crate::prompt::AspectRatio;
use crate::session::{ItemId, ReplyState, SessionId};
use crate::storage::{load_sessions, save_sessions, KeyValueStore};
use crate::store::SessionStore;

/// Ids of a submission that is now waiting on the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Submitted {
    pub session_id: SessionId,
    pub user_id: ItemId,
    pub bot_id: ItemId,
}

impl From<&PendingReply> for Submitted {
    fn from(p: &PendingReply) -> Self {
        Self { session_id: p.session_id, user_id: p.user_id, bot_id: p.bot_id }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposePatch {
    pub text: Option<String>,
    pub aspect_ratio: Option<AspectRatio>,
    pub aspect_menu_open: Option<bool>,
}

/// Application state: the session store plus its storage and model.
///
/// Loaded once at startup with [`Studio::load`]; every mutation that touches the
/// session list or the active id is persisted before the call returns.
#[derive(Clone)]
pub struct Studio {
    store: Arc<RwLock<SessionStore>>,
    preferences: Arc<RwLock<Preferences>>,
    kv: Arc<dyn KeyValueStore>,
    model: Arc<dyn GenerativeModel>,
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

impl Studio {
    pub async fn load(kv: Arc<dyn KeyValueStore>, model: Arc<dyn GenerativeModel>) -> Self {
        let mut store = SessionStore::new();
        store.restore(load_sessions(kv.as_ref()).await);
        let preferences = Preferences::load(kv.as_ref()).await;
        info!(sessions = store.sessions().len(), active = ?store.active_id(), "studio state loaded");

        let studio = Self {
            store: Arc::new(RwLock::new(store)),
            preferences: Arc::new(RwLock::new(preferences)),
            kv,
            model,
        };
        {
            let store = studio.store.read().await;
            studio.persist(&store).await;
        }
        studio
    }

    /// Saves the session list and active id. Failures are logged and otherwise ignored.
    async fn persist(&self, store: &SessionStore) {
        if let Err(e) = save_sessions(self.kv.as_ref(), &store.snapshot()).await {
            metrics::counter!("studio_persist_failures_total").increment(1);
            warn!(error = %e, "failed to persist sessions");
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, SessionStore> {
        self.store.read().await
    }

    pub async fn create_session(&self) -> SessionId {
        let mut store = self.store.write().await;
        let id = store.create_session();
        self.persist(&store).await;
        id
    }

    pub async fn select_session(&self, id: SessionId) -> bool {
        let mut store = self.store.write().await;
        let changed = store.select_session(id);
        if changed {
            self.persist(&store).await;
        }
        changed
    }

    pub async fn delete_session(&self, id: SessionId) -> bool {
        let mut store = self.store.write().await;
        let removed = store.delete_session(id);
        if removed {
            self.persist(&store).await;
        }
        removed
    }

    pub async fn delete_item(&self, session_id: SessionId, item_id: ItemId) -> bool {
        let mut store = self.store.write().await;
        let removed = store.delete_item(session_id, item_id);
        if removed {
            self.persist(&store).await;
        }
        removed
    }

    pub async fn update_compose(&self, patch: ComposePatch) {
        let mut store = self.store.write().await;
        let compose = store.compose_mut();
        if let Some(text) = patch.text {
            compose.text = text;
        }
        if let Some(ratio) = patch.aspect_ratio {
            compose.aspect_ratio = ratio;
        }
        if let Some(open) = patch.aspect_menu_open {
            compose.aspect_menu_open = open;
        }
    }

    /// Encodes outside the lock, then appends what still fits under the cap.
    pub async fn attach(&self, files: Vec<RawFile>) -> AddReport {
        let remaining = self.store.read().await.compose().attachments.remaining();
        let (encoded, mut report) = encode_batch(files, remaining).await;
        let mut store = self.store.write().await;
        let dropped = store.compose_mut().attachments.push_all(encoded);
        report.accepted -= dropped;
        report.dropped_over_quota += dropped;
        report
    }

    pub async fn remove_attachment(&self, index: usize) -> bool {
        self.store.write().await.compose_mut().attachments.remove(index).is_some()
    }

    async fn start(&self, begin: impl FnOnce(&mut SessionStore) -> Result<PendingReply, SubmitError>) -> Result<PendingReply, SubmitError> {
        let mut store = self.store.write().await;
        let pending = begin(&mut *store)?;
        self.persist(&store).await;
        metrics::counter!("studio_submissions_total").increment(1);
        debug!(session = %pending.session_id, bot = %pending.bot_id, kind = ?pending.kind, "submitted");
        Ok(pending)
    }

    /// Calls the model and writes the outcome into the originating placeholder.
    /// A session deleted in the meantime turns the write into a no-op.
    async fn complete(&self, pending: PendingReply) -> Submitted {
        let result = pending.chat.send(self.model.as_ref(), pending.parts.clone()).await;
        if let Err(e) = &result {
            error!(session = %pending.session_id, error = %e, "model call failed");
        }
        let resolution = resolve(&pending, result);
        let outcome = match &resolution.reply {
            ReplyState::Loading => "loading",
            ReplyState::Answered { .. } => "answered",
            ReplyState::Empty { .. } => "empty",
            ReplyState::Failed { .. } => "failed",
        };
        metrics::counter!("studio_replies_total", "outcome" => outcome).increment(1);

        let mut store = self.store.write().await;
        if store.apply_reply(pending.session_id, pending.bot_id, resolution) {
            self.persist(&store).await;
        } else {
            debug!(session = %pending.session_id, bot = %pending.bot_id, "reply target gone, dropping");
        }
        Submitted::from(&pending)
    }

    /// Inserts the optimistic items and returns at once; the model call runs in the background.
    pub async fn submit(&self) -> Result<Submitted, SubmitError> {
        let pending = self.start(|s| begin_submission(s, today())).await?;
        let ids = Submitted::from(&pending);
        let this = self.clone();
        tokio::spawn(async move {
            this.complete(pending).await;
        });
        Ok(ids)
    }

    pub async fn submit_and_wait(&self) -> Result<Submitted, SubmitError> {
        let pending = self.start(|s| begin_submission(s, today())).await?;
        Ok(self.complete(pending).await)
    }

    pub async fn create_variation(&self, original_prompt: &str, image_url: &str) -> Result<Submitted, SubmitError> {
        let pending = self.start(|s| begin_variation(s, original_prompt, image_url, today())).await?;
        let ids = Submitted::from(&pending);
        let this = self.clone();
        tokio::spawn(async move {
            this.complete(pending).await;
        });
        Ok(ids)
    }

    pub async fn create_variation_and_wait(&self, original_prompt: &str, image_url: &str) -> Result<Submitted, SubmitError> {
        let pending = self.start(|s| begin_variation(s, original_prompt, image_url, today())).await?;
        Ok(self.complete(pending).await)
    }

    pub async fn preferences(&self) -> Preferences {
        self.preferences.read().await.clone()
    }

    pub async fn update_preferences(&self, patch: PreferencesPatch) -> Preferences {
        let mut prefs = self.preferences.write().await;
        prefs.apply_patch(patch);
        if let Err(e) = prefs.save(self.kv.as_ref()).await {
            warn!(error = %e, "failed to persist preferences");
        }
        prefs.clone()
    }

    pub async fn profile(&self) -> Option<UserProfile> {
        UserProfile::load(self.kv.as_ref()).await
    }

    pub async fn save_profile(&self, profile: UserProfile) -> anyhow::Result<UserProfile> {
        profile.save(self.kv.as_ref()).await?;
        Ok(profile)
    }

    pub async fn update_profile(&self, patch: UserProfilePatch) -> anyhow::Result<Option<UserProfile>> {
        let Some(mut profile) = self.profile().await else {
            return Ok(None);
        };
        profile.merge(patch);
        profile.save(self.kv.as_ref()).await?;
        Ok(Some(profile))
    }

    pub async fn clear_profile(&self) -> anyhow::Result<()> {
        UserProfile::clear(self.kv.as_ref()).await
    }
}
