use std::sync::Mutex;

/// Environment variable holding the merge collaborator's API key.
pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Holder for the collaborator credential.
///
/// The key is read once at startup and handed around as this store, never
/// re-read from the environment at call sites. Invalidation after an auth
/// rejection is therefore observable everywhere at once: the next batch
/// falls back to the local merge instead of retrying a bad key.
pub struct CredentialStore {
    key: Mutex<Option<String>>,
}

impl CredentialStore {
    pub fn new(key: Option<String>) -> Self {
        let key = key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty());
        Self {
            key: Mutex::new(key),
        }
    }

    /// Build from the environment, falling back to a config-file value.
    pub fn from_env(fallback: Option<String>) -> Self {
        let env_key = std::env::var(GEMINI_API_KEY_ENV).ok();
        Self::new(env_key.or(fallback))
    }

    pub fn get(&self) -> Option<String> {
        self.key.lock().unwrap().clone()
    }

    pub fn is_configured(&self) -> bool {
        self.key.lock().unwrap().is_some()
    }

    /// Drop the stored key. Returns true if a key was actually cleared.
    pub fn invalidate(&self) -> bool {
        self.key.lock().unwrap().take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_keys_count_as_absent() {
        assert!(!CredentialStore::new(None).is_configured());
        assert!(!CredentialStore::new(Some("".to_string())).is_configured());
        assert!(!CredentialStore::new(Some("   ".to_string())).is_configured());
        assert!(CredentialStore::new(Some("k-123".to_string())).is_configured());
    }

    #[test]
    fn invalidate_clears_once() {
        let store = CredentialStore::new(Some("k-123".to_string()));
        assert_eq!(store.get().as_deref(), Some("k-123"));
        assert!(store.invalidate());
        assert_eq!(store.get(), None);
        assert!(!store.invalidate());
    }
}
