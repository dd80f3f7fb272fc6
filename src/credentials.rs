//! Credential storage and checks.
//!
//! Credentials are opaque bearer strings held verbatim. Multi-credential
//! input is a single string delimited by newline or comma; splitting happens
//! at consumption time, not at storage time, so the stored value stays
//! exactly what the user entered.

use crate::client::MetadataClient;
use crate::config::ValidationRules;
use crate::resolver::ModelResolver;
use crate::{Error, Result};
use base64::{engine::general_purpose, Engine};
use std::path::PathBuf;
use tracing::{debug, info};

/// 1x1 transparent PNG used for the connectivity probe
const PROBE_IMAGE_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

/// Split a raw multi-credential string on newlines and commas, trimming and
/// dropping blanks. Order is preserved and nothing is deduplicated; the
/// round-robin in the batch runner depends on the order the user gave.
pub fn parse_credential_list(raw: &str) -> Vec<String> {
    raw.split(|c| c == '\n' || c == ',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// File-backed credential store
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            path: state_dir.join("credentials.txt"),
        }
    }

    /// Read the persisted value. Absence is not an error.
    pub async fn load(&self) -> Option<String> {
        let content = tokio::fs::read_to_string(&self.path).await.ok()?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// Trim and persist the raw credential string.
    pub async fn save(&self, raw: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
        }
        tokio::fs::write(&self.path, raw.trim())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        debug!("Credential saved");
        Ok(())
    }

    /// Clear the persisted value and the model resolutions tied to it.
    pub async fn remove(&self, resolver: &ModelResolver) -> Result<()> {
        if let Some(stored) = self.load().await {
            for credential in parse_credential_list(&stored) {
                let _ = resolver.invalidate(&credential).await;
            }
        }
        if self.path.exists() {
            tokio::fs::remove_file(&self.path)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
        }
        info!("Credential removed");
        Ok(())
    }

    /// Syntactic format check only, not an authority check.
    pub fn validate_format(raw: &str, rules: &ValidationRules) -> Result<()> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("credential is empty".to_string()));
        }
        if trimmed.len() < rules.credential_min_length {
            return Err(Error::Validation(format!(
                "credential looks too short ({} chars, minimum {})",
                trimmed.len(),
                rules.credential_min_length
            )));
        }
        Ok(())
    }

    /// One real round trip through the resolver and client with a trivial
    /// probe image. Returns the resolved model's display name on success;
    /// any non-success response or transport failure surfaces as the error.
    pub async fn test_connectivity(
        credential: &str,
        resolver: &ModelResolver,
        client: &dyn MetadataClient,
    ) -> Result<String> {
        let model = resolver.resolve(credential).await?;
        let probe = general_purpose::STANDARD
            .decode(PROBE_IMAGE_B64)
            .map_err(|e| Error::Validation(format!("probe image corrupt: {}", e)))?;

        client
            .generate(credential, &model, &probe, "image/png")
            .await?;
        Ok(model.display_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_splits_on_newline_and_comma() {
        let raw = "key-one\nkey-two, key-three";
        assert_eq!(
            parse_credential_list(raw),
            vec!["key-one", "key-two", "key-three"]
        );
    }

    #[test]
    fn test_parse_preserves_order_and_duplicates() {
        let raw = "same-key,other-key,same-key";
        assert_eq!(
            parse_credential_list(raw),
            vec!["same-key", "other-key", "same-key"]
        );
    }

    #[test]
    fn test_parse_drops_blanks() {
        let raw = " ,\n\n key-a ,, ";
        assert_eq!(parse_credential_list(raw), vec!["key-a"]);
    }

    #[test]
    fn test_validate_format() {
        let rules = ValidationRules::default();
        assert!(CredentialStore::validate_format("", &rules).is_err());
        assert!(CredentialStore::validate_format("   ", &rules).is_err());
        assert!(CredentialStore::validate_format("short", &rules).is_err());
        assert!(
            CredentialStore::validate_format("AIzaSy-long-enough-credential", &rules).is_ok()
        );
    }

    #[tokio::test]
    async fn test_save_load_remove_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().to_path_buf());
        let resolver = ModelResolver::new(
            crate::config::Config::default().api,
            dir.path().to_path_buf(),
        )
        .unwrap();

        assert!(store.load().await.is_none());

        store.save("  AIzaSy-test-credential-000  ").await.unwrap();
        assert_eq!(
            store.load().await.as_deref(),
            Some("AIzaSy-test-credential-000")
        );

        store.remove(&resolver).await.unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_probe_image_decodes() {
        let probe = general_purpose::STANDARD.decode(PROBE_IMAGE_B64).unwrap();
        // PNG signature
        assert_eq!(&probe[..8], &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
    }
}
