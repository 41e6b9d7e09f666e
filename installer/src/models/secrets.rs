// Secret bundle model
//
// IMPORTANT: values held here are live credentials. `Debug` is redacted on purpose; log
// fingerprints (security::crypto::secret_fingerprint) instead of values.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// The fixed set of credentials every deployment needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKey {
    DbUser,
    DbPassword,
    CachePassword,
    QueueUser,
    QueuePassword,
    SessionSecret,
    EncryptionKey,
    SigningKey,
    AdminPassword,
}

impl SecretKey {
    pub const ALL: [SecretKey; 9] = [
        SecretKey::DbUser,
        SecretKey::DbPassword,
        SecretKey::CachePassword,
        SecretKey::QueueUser,
        SecretKey::QueuePassword,
        SecretKey::SessionSecret,
        SecretKey::EncryptionKey,
        SecretKey::SigningKey,
        SecretKey::AdminPassword,
    ];

    /// Descriptor key this secret is persisted under.
    pub fn env_key(self) -> &'static str {
        match self {
            SecretKey::DbUser => "DB_USER",
            SecretKey::DbPassword => "DB_PASSWORD",
            SecretKey::CachePassword => "CACHE_PASSWORD",
            SecretKey::QueueUser => "QUEUE_USER",
            SecretKey::QueuePassword => "QUEUE_PASSWORD",
            SecretKey::SessionSecret => "SESSION_SECRET",
            SecretKey::EncryptionKey => "ENCRYPTION_KEY",
            SecretKey::SigningKey => "SIGNING_KEY",
            SecretKey::AdminPassword => "ADMIN_PASSWORD",
        }
    }

    /// Case-insensitive lookup from a descriptor key.
    pub fn from_env_key(key: &str) -> Option<SecretKey> {
        let key = key.trim();
        SecretKey::ALL
            .iter()
            .copied()
            .find(|k| k.env_key().eq_ignore_ascii_case(key))
    }

    /// Whether this entry identifies an account rather than authenticating it.
    pub fn is_identifier(self) -> bool {
        matches!(self, SecretKey::DbUser | SecretKey::QueueUser)
    }

    pub fn requirement(self) -> SecretRequirement {
        match self {
            SecretKey::DbUser | SecretKey::QueueUser => SecretRequirement {
                class: CharClass::LowerAlphanumeric,
                min_len: 12,
                leading_letter: true,
            },
            SecretKey::DbPassword | SecretKey::CachePassword | SecretKey::QueuePassword => {
                SecretRequirement {
                    class: CharClass::Alphanumeric,
                    min_len: 32,
                    leading_letter: false,
                }
            }
            SecretKey::SessionSecret | SecretKey::SigningKey => SecretRequirement {
                class: CharClass::Alphanumeric,
                min_len: 64,
                leading_letter: false,
            },
            // 32 random bytes, hex encoded.
            SecretKey::EncryptionKey => SecretRequirement {
                class: CharClass::HexLower,
                min_len: 64,
                leading_letter: false,
            },
            SecretKey::AdminPassword => SecretRequirement {
                class: CharClass::Alphanumeric,
                min_len: 24,
                leading_letter: false,
            },
        }
    }
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.env_key())
    }
}

/// Character class a secret value must be drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharClass {
    Alphanumeric,
    LowerAlphanumeric,
    HexLower,
}

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const LOWER_ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const HEX_LOWER: &[u8] = b"0123456789abcdef";

impl CharClass {
    pub fn alphabet(self) -> &'static [u8] {
        match self {
            CharClass::Alphanumeric => ALPHANUMERIC,
            CharClass::LowerAlphanumeric => LOWER_ALPHANUMERIC,
            CharClass::HexLower => HEX_LOWER,
        }
    }

    /// Subset of the alphabet usable as a leading character.
    pub fn letters(self) -> &'static [u8] {
        match self {
            CharClass::Alphanumeric => &ALPHANUMERIC[..52],
            CharClass::LowerAlphanumeric => &LOWER_ALPHANUMERIC[..26],
            CharClass::HexLower => &HEX_LOWER[10..],
        }
    }

    pub fn contains(self, c: char) -> bool {
        c.is_ascii() && self.alphabet().contains(&(c as u8))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretRequirement {
    pub class: CharClass,
    pub min_len: usize,
    pub leading_letter: bool,
}

impl SecretRequirement {
    pub fn is_satisfied_by(&self, value: &str) -> bool {
        if value.len() < self.min_len || !value.chars().all(|c| self.class.contains(c)) {
            return false;
        }
        if self.leading_letter {
            return value
                .bytes()
                .next()
                .map(|b| self.class.letters().contains(&b))
                .unwrap_or(false);
        }
        true
    }
}

/// Credential values keyed by [`SecretKey`]. Missing entries read as empty strings.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretBundle {
    values: BTreeMap<SecretKey, String>,
}

impl SecretBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: SecretKey) -> &str {
        self.values.get(&key).map(String::as_str).unwrap_or("")
    }

    /// Empty values are treated as absent.
    pub fn set(&mut self, key: SecretKey, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            self.values.remove(&key);
        } else {
            self.values.insert(key, value);
        }
    }

    pub fn is_set(&self, key: SecretKey) -> bool {
        !self.get(key).is_empty()
    }

    pub fn missing_keys(&self) -> Vec<SecretKey> {
        SecretKey::ALL
            .iter()
            .copied()
            .filter(|k| !self.is_set(*k))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_keys().is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SecretKey, &str)> {
        self.values.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Keys whose stored value does not meet the generation requirement.
    pub fn nonconforming_keys(&self) -> Vec<SecretKey> {
        self.iter()
            .filter(|(k, v)| !k.requirement().is_satisfied_by(v))
            .map(|(k, _)| k)
            .collect()
    }
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.values.keys().map(|k| (k.env_key(), "***")))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_key_is_case_insensitive() {
        assert_eq!(SecretKey::from_env_key("db_user"), Some(SecretKey::DbUser));
        assert_eq!(SecretKey::from_env_key(" DB_PASSWORD "), Some(SecretKey::DbPassword));
        assert_eq!(SecretKey::from_env_key("DOMAIN"), None);
    }

    #[test]
    fn setting_empty_value_clears_the_key() {
        let mut bundle = SecretBundle::new();
        bundle.set(SecretKey::DbUser, "u1");
        assert!(bundle.is_set(SecretKey::DbUser));
        bundle.set(SecretKey::DbUser, "");
        assert!(!bundle.is_set(SecretKey::DbUser));
        assert_eq!(bundle.missing_keys().len(), SecretKey::ALL.len());
    }

    #[test]
    fn debug_output_never_contains_values() {
        let mut bundle = SecretBundle::new();
        bundle.set(SecretKey::DbPassword, "PASSWORD_SHOULD_BE_REDACTED");
        let rendered = format!("{:?}", bundle);
        assert!(rendered.contains("DB_PASSWORD"));
        assert!(!rendered.contains("PASSWORD_SHOULD_BE_REDACTED"));
    }

    #[test]
    fn username_requirement_needs_leading_letter() {
        let req = SecretKey::DbUser.requirement();
        assert!(req.is_satisfied_by("abcdef123456"));
        assert!(!req.is_satisfied_by("1bcdef123456"));
        assert!(!req.is_satisfied_by("ABCDEF123456"));
        assert!(!req.is_satisfied_by("abc"));
    }

    #[test]
    fn short_preserved_values_are_reported_nonconforming() {
        let mut bundle = SecretBundle::new();
        bundle.set(SecretKey::DbUser, "u1");
        bundle.set(SecretKey::EncryptionKey, "ab".repeat(32));
        assert_eq!(bundle.nonconforming_keys(), vec![SecretKey::DbUser]);
    }
}
