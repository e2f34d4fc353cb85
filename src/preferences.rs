//! Settings persisted next to, but independent of, the session list.
//!
//! Each value lives under its own key so a corrupt entry never takes the
//! others down with it.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::KeyValueStore;

pub const SIDEBAR_KEY: &str = "studio-sidebar-open";
pub const THEME_KEY: &str = "studio-theme-id";
pub const USER_KEY: &str = "studio-user";

pub const KNOWN_THEMES: &[&str] = &["nebula", "aurora", "ember", "midnight", "paper"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub sidebar_open: bool,
    pub theme_id: String,
}

impl Default for Preferences {
    fn default() -> Self {
        Self { sidebar_open: true, theme_id: KNOWN_THEMES[0].to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferencesPatch {
    pub sidebar_open: Option<bool>,
    pub theme_id: Option<String>,
}

impl Preferences {
    pub fn apply_patch(&mut self, patch: PreferencesPatch) {
        if let Some(open) = patch.sidebar_open {
            self.sidebar_open = open;
        }
        if let Some(theme) = patch.theme_id {
            self.theme_id = normalize_theme(Some(&theme));
        }
    }

    pub async fn load(kv: &dyn KeyValueStore) -> Self {
        let sidebar = read(kv, SIDEBAR_KEY).await;
        let theme = read(kv, THEME_KEY).await;
        Self {
            // only an explicit "false" closes the sidebar
            sidebar_open: sidebar.as_deref() != Some("false"),
            theme_id: normalize_theme(theme.as_deref()),
        }
    }

    pub async fn save(&self, kv: &dyn KeyValueStore) -> anyhow::Result<()> {
        kv.set(SIDEBAR_KEY, if self.sidebar_open { "true" } else { "false" }).await?;
        kv.set(THEME_KEY, &self.theme_id).await?;
        Ok(())
    }
}

fn normalize_theme(id: Option<&str>) -> String {
    id.filter(|id| KNOWN_THEMES.contains(id)).unwrap_or(KNOWN_THEMES[0]).to_string()
}

async fn read(kv: &dyn KeyValueStore, key: &str) -> Option<String> {
    kv.get(key).await.unwrap_or_else(|e| {
        warn!(key, error = %e, "failed to read preference");
        None
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfilePatch {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub avatar: Option<String>,
}

impl UserProfile {
    pub fn merge(&mut self, patch: UserProfilePatch) {
        if let Some(v) = patch.first_name {
            self.first_name = v;
        }
        if let Some(v) = patch.last_name {
            self.last_name = v;
        }
        if let Some(v) = patch.email {
            self.email = v;
        }
        if let Some(v) = patch.avatar {
            self.avatar = Some(v);
        }
    }

    pub async fn load(kv: &dyn KeyValueStore) -> Option<Self> {
        let raw = read(kv, USER_KEY).await?;
        serde_json::from_str(&raw)
            .map_err(|e| warn!(error = %e, "saved user profile is malformed"))
            .ok()
    }

    pub async fn save(&self, kv: &dyn KeyValueStore) -> anyhow::Result<()> {
        kv.set(USER_KEY, &serde_json::to_string(self)?).await
    }

    pub async fn clear(kv: &dyn KeyValueStore) -> anyhow::Result<()> {
        kv.remove(USER_KEY).await
    }
}
