//! End-of-session summary artifact.
//!
//! When a batch session shuts down, the merged prompt history is condensed
//! into a markdown file in the session working directory so the next run
//! can pick up where the party left off.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::credentials::CredentialStore;
use crate::merge::{PromptMerger, summary_fallback};

/// File name of the artifact written into the session working directory.
pub const SUMMARY_FILE: &str = "PARTY_SUMMARY.md";

const SUMMARY_HEADING: &str = "# Party Session Summary";

/// Write the session summary into `dir`. Best effort: failures are logged
/// and swallowed so shutdown keeps going. When the session produced no
/// merged prompts, no file is written at all.
pub async fn write_session_summary(
    dir: &Path,
    merged: &[String],
    merger: &dyn PromptMerger,
    credentials: &CredentialStore,
) {
    if merged.is_empty() {
        debug!("no merged prompts this session, skipping summary");
        return;
    }

    let body = match credentials.get() {
        Some(key) => match merger.summarize(&key, merged).await {
            Ok(text) => text,
            Err(err) => {
                warn!("summary generation failed, using fallback: {err}");
                summary_fallback(merged)
            }
        },
        None => summary_fallback(merged),
    };

    let path = dir.join(SUMMARY_FILE);
    let contents = format!("{SUMMARY_HEADING}\n\n{body}\n");
    match tokio::fs::write(&path, contents).await {
        Ok(()) => info!("wrote session summary to {}", path.display()),
        Err(err) => warn!("failed to write session summary to {}: {err}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::dedupe::PendingPrompt;
    use crate::error::PartyError;

    struct FixedSummarizer {
        fail: bool,
    }

    #[async_trait]
    impl PromptMerger for FixedSummarizer {
        async fn merge(
            &self,
            _api_key: &str,
            _prompts: &[PendingPrompt],
        ) -> Result<String, PartyError> {
            Err(PartyError::Collaborator("merge not under test".to_string()))
        }

        async fn summarize(&self, _api_key: &str, merged: &[String]) -> Result<String, PartyError> {
            if self.fail {
                Err(PartyError::Collaborator("summarizer offline".to_string()))
            } else {
                Ok(format!("condensed {} merged prompts", merged.len()))
            }
        }
    }

    #[tokio::test]
    async fn empty_history_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(None);
        let merger = FixedSummarizer { fail: false };

        write_session_summary(dir.path(), &[], &merger, &store).await;

        assert!(!dir.path().join(SUMMARY_FILE).exists());
    }

    #[tokio::test]
    async fn falls_back_without_credential() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(None);
        let merger = FixedSummarizer { fail: false };
        let merged = vec!["wire the parser to the new lexer".to_string()];

        write_session_summary(dir.path(), &merged, &merger, &store).await;

        let written = std::fs::read_to_string(dir.path().join(SUMMARY_FILE)).unwrap();
        let expected = format!("{SUMMARY_HEADING}\n\n{}\n", summary_fallback(&merged));
        assert_eq!(written, expected);
        assert!(written.contains("## Session Goals"));
    }

    #[tokio::test]
    async fn uses_collaborator_summary_when_credentialed() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(Some("key-123".to_string()));
        let merger = FixedSummarizer { fail: false };
        let merged = vec!["a".to_string(), "b".to_string()];

        write_session_summary(dir.path(), &merged, &merger, &store).await;

        let written = std::fs::read_to_string(dir.path().join(SUMMARY_FILE)).unwrap();
        assert!(written.starts_with(SUMMARY_HEADING));
        assert!(written.contains("condensed 2 merged prompts"));
    }

    #[tokio::test]
    async fn falls_back_when_collaborator_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(Some("key-123".to_string()));
        let merger = FixedSummarizer { fail: true };
        let merged = vec!["refactor the broadcast loop".to_string()];

        write_session_summary(dir.path(), &merged, &merger, &store).await;

        let written = std::fs::read_to_string(dir.path().join(SUMMARY_FILE)).unwrap();
        assert!(written.contains("## Session Goals"));
        assert!(written.contains("refactor the broadcast loop"));
    }
}
