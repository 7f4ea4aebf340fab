use crate::config::non_empty_env;

/// Collaborator that owns the user's permission to use the pro tier.
pub trait Entitlement: Send + Sync {
    fn has_entitlement(&self) -> bool;
    /// Prompts the user to connect an entitlement; returns whether one is now present.
    fn request_entitlement(&self) -> bool;
}

/// Entitlement backed by environment variables holding a pro-capable key.
#[derive(Debug, Clone)]
pub struct EnvEntitlement {
    keys: Vec<String>,
}

impl EnvEntitlement {
    pub fn new(keys: &[&str]) -> Self {
        Self {
            keys: keys.iter().map(|key| key.to_string()).collect(),
        }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Default for EnvEntitlement {
    fn default() -> Self {
        Self::new(&["GEMINI_PRO_API_KEY", "GEMINI_API_KEY", "GOOGLE_API_KEY"])
    }
}

impl Entitlement for EnvEntitlement {
    fn has_entitlement(&self) -> bool {
        self.keys.iter().any(|key| non_empty_env(key).is_some())
    }

    fn request_entitlement(&self) -> bool {
        self.has_entitlement()
    }
}
