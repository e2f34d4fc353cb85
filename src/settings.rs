use serde::{Deserialize, Serialize};

use crate::models::{DEFAULT_BASE_URL, DEFAULT_MODEL};

/// Values taken from the process environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EnvDefaults {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub database_url: Option<String>,
}

impl EnvDefaults {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());
        Self {
            model: non_empty("GEMINI_MODEL"),
            base_url: non_empty("GEMINI_BASE_URL"),
            api_key: non_empty("GEMINI_API_KEY").or_else(|| non_empty("API_KEY")),
            database_url: non_empty("STUDIO_DATABASE_URL"),
        }
    }
}

/// Values given explicitly for this run, e.g. command-line flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RequestOverrides {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub database_url: Option<String>,
}

pub fn resolve_effective_settings(env: &EnvDefaults, request: &RequestOverrides) -> EffectiveSettings {
    let model = request
        .model
        .clone()
        .or_else(|| env.model.clone())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let base_url = request
        .base_url
        .clone()
        .or_else(|| env.base_url.clone())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

    let database_url = request
        .database_url
        .clone()
        .or_else(|| env.database_url.clone());

    EffectiveSettings {
        model,
        base_url,
        api_key: env.api_key.clone(),
        database_url,
    }
}
