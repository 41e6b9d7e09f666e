// Secret extractor
//
// Best-effort salvage of credentials from a descriptor that may be invalid as a whole. Each line
// is judged on its own, so one bad line does not cost the others. Never fails.

use log::{debug, warn};
use std::path::Path;

use crate::descriptor::{contains_shell_metacharacters, read, split_assignment, unquote};
use crate::models::secrets::{SecretBundle, SecretKey};
use crate::security::crypto::secret_fingerprint;

pub fn extract_secrets(content: &str) -> SecretBundle {
    let mut bundle = SecretBundle::new();
    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, raw_value)) = split_assignment(trimmed) else {
            continue;
        };
        let Some(secret) = SecretKey::from_env_key(key) else {
            continue;
        };
        if contains_shell_metacharacters(raw_value) {
            warn!(
                "[PHASE: reconcile] [STEP: extract] Not salvaging {} from line {}: value contains shell metacharacters",
                secret,
                idx + 1
            );
            continue;
        }
        let value = unquote(raw_value).trim();
        if value.is_empty() {
            continue;
        }
        debug!(
            "[PHASE: reconcile] [STEP: extract] Salvaged {} from line {} ({})",
            secret,
            idx + 1,
            secret_fingerprint(value)
        );
        bundle.set(secret, value);
    }
    bundle
}

pub async fn extract_from_path(path: &Path) -> SecretBundle {
    match read(path).await {
        Ok(Some(content)) => extract_secrets(&content),
        Ok(None) => SecretBundle::new(),
        Err(e) => {
            warn!(
                "[PHASE: reconcile] [STEP: extract] Could not read {}: {:#}",
                path.display(),
                e
            );
            SecretBundle::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salvages_valid_lines_from_corrupted_file() {
        let content = "\
# broken file
DB_USER=u1
garbage line without equals
db_password = \"p1\"
CACHE_PASSWORD=$(cat /etc/shadow)
QUEUE_USER='queueuser'
SESSION_SECRET=
";
        let bundle = extract_secrets(content);
        assert_eq!(bundle.get(SecretKey::DbUser), "u1");
        assert_eq!(bundle.get(SecretKey::DbPassword), "p1");
        assert_eq!(bundle.get(SecretKey::QueueUser), "queueuser");
        assert_eq!(bundle.get(SecretKey::CachePassword), "");
        assert_eq!(bundle.get(SecretKey::SessionSecret), "");
        assert_eq!(bundle.len(), 3);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let bundle = extract_secrets("DOMAIN=x\nAPP_URL=https://x\n");
        assert!(bundle.is_empty());
    }

    #[test]
    fn binary_or_empty_input_yields_empty_bundle() {
        assert!(extract_secrets("").is_empty());
        assert!(extract_secrets("\u{0}\u{1}\u{2}").is_empty());
    }

    #[tokio::test]
    async fn missing_or_unreadable_path_yields_empty_bundle() {
        let dir = tempfile::tempdir().unwrap();
        assert!(extract_from_path(&dir.path().join("nope")).await.is_empty());
        // A directory cannot be read as a file.
        assert!(extract_from_path(dir.path()).await.is_empty());
    }
}
