use std::env;

use batchgen_contracts::batches::Tier;
use batchgen_contracts::tiers::TierProfiles;

use crate::context::clamp_outputs_per_batch;

pub const DEFAULT_OUTPUTS_PER_BATCH: usize = 4;
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub outputs_per_batch: usize,
    pub api_base: String,
    pub api_key: Option<String>,
    /// Key used for pro-tier calls; falls back to `api_key`.
    pub pro_api_key: Option<String>,
    pub profiles: TierProfiles,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            outputs_per_batch: DEFAULT_OUTPUTS_PER_BATCH,
            api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            api_key: None,
            pro_api_key: None,
            profiles: TierProfiles::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(non_empty_env)
    }

    /// Builds a config from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let outputs_per_batch = get("BATCHGEN_OUTPUTS_PER_BATCH")
            .and_then(|value| value.parse::<usize>().ok())
            .map(clamp_outputs_per_batch)
            .unwrap_or(defaults.outputs_per_batch);
        let api_base = get("GEMINI_API_BASE")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_base);

        let mut profiles = defaults.profiles;
        if let Some(model) = get("BATCHGEN_NORMAL_MODEL") {
            profiles = profiles.with_model(Tier::Normal, model);
        }
        if let Some(model) = get("BATCHGEN_PRO_MODEL") {
            profiles = profiles.with_model(Tier::Pro, model);
        }
        if let Some(size) = get("BATCHGEN_PRO_IMAGE_SIZE") {
            profiles = profiles.with_pro_image_size(size);
        }

        Self {
            outputs_per_batch,
            api_base,
            api_key: get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY")),
            pro_api_key: get("GEMINI_PRO_API_KEY"),
            profiles,
        }
    }

    pub fn with_outputs_per_batch(mut self, outputs: usize) -> Self {
        self.outputs_per_batch = clamp_outputs_per_batch(outputs);
        self
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
