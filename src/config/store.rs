//! Persisted remote configuration
//!
//! Remotes live in an INI-style keyed store under the user config path.
//! The whole file may be obscured with an AEAD seal; the password comes
//! from the environment, or the terminal when permitted.

use crate::error::{IoResultExt, Result, SyncError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable supplying the config password
pub const CONFIG_PASSWORD_VAR: &str = "OMNISYNC_CONFIG_PASS";

/// Environment variable overriding the config file location
pub const CONFIG_PATH_VAR: &str = "OMNISYNC_CONFIG";

/// Header marking an obscured config file
const ENCRYPT_MAGIC: &str = "OMNISYNC_ENCRYPT_V1:";

/// Nonce length for the AEAD seal
const NONCE_LEN: usize = 24;

/// Keyed sections of remote definitions
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl ConfigStore {
    /// Resolve the config file location: explicit override, then the
    /// environment, then the user config directory.
    pub fn default_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            return PathBuf::from(path);
        }
        match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home)
                .join(".config")
                .join("omnisync")
                .join("omnisync.conf"),
            Err(_) => PathBuf::from("omnisync.conf"),
        }
    }

    /// Whether the file on disk is obscured and will need a password
    pub fn is_encrypted(path: &Path) -> bool {
        std::fs::read_to_string(path)
            .map(|text| text.trim_start().starts_with(ENCRYPT_MAGIC))
            .unwrap_or(false)
    }

    /// Load the store. A missing file is an empty store; an obscured
    /// file needs the password.
    pub fn load(path: &Path, password: Option<&str>) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_path(path)?;

        if let Some(sealed) = text.trim_start().strip_prefix(ENCRYPT_MAGIC) {
            let password = password.ok_or_else(|| {
                SyncError::config(format!(
                    "config file is encrypted; set {CONFIG_PASSWORD_VAR}"
                ))
            })?;
            let plain = unseal(sealed.trim(), password)?;
            return Self::parse(&plain);
        }

        Self::parse(&text)
    }

    /// Parse INI text: `[section]` headers, `key = value` lines, `#`
    /// and `;` comments.
    pub fn parse(text: &str) -> Result<Self> {
        let mut store = Self::default();
        let mut current: Option<String> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim();
                if name.is_empty() {
                    return Err(SyncError::config(format!(
                        "empty section name on line {}",
                        lineno + 1
                    )));
                }
                store.sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(SyncError::config(format!(
                    "expected key = value on line {}",
                    lineno + 1
                )));
            };
            let Some(section) = &current else {
                return Err(SyncError::config(format!(
                    "key outside any section on line {}",
                    lineno + 1
                )));
            };
            store
                .sections
                .get_mut(section)
                .expect("current section exists")
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(store)
    }

    /// Keys and values of one remote
    pub fn section(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.sections.get(name)
    }

    /// Configured remote names
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// Set one key, creating the section as needed
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    /// Render back to INI text
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (name, keys) in &self.sections {
            out.push_str(&format!("[{name}]\n"));
            for (key, value) in keys {
                out.push_str(&format!("{key} = {value}\n"));
            }
            out.push('\n');
        }
        out
    }

    /// Write the store to disk, obscured when a password is given
    pub fn save(&self, path: &Path, password: Option<&str>) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        let text = self.serialize();
        let contents = match password {
            Some(password) => format!("{ENCRYPT_MAGIC}{}\n", seal(&text, password)?),
            None => text,
        };
        std::fs::write(path, contents).with_path(path)
    }
}

fn derive_key(password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Seal config text with XChaCha20-Poly1305, returning base64
fn seal(plaintext: &str, password: &str) -> Result<String> {
    let key = derive_key(password);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill(&mut nonce);

    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| SyncError::config("config encryption failed"))?;

    let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&sealed);
    Ok(BASE64.encode(payload))
}

/// Reverse of [`seal`]
fn unseal(data: &str, password: &str) -> Result<String> {
    let payload = BASE64
        .decode(data)
        .map_err(|e| SyncError::config(format!("corrupt encrypted config: {e}")))?;
    if payload.len() < NONCE_LEN {
        return Err(SyncError::config("corrupt encrypted config: too short"));
    }
    let (nonce, sealed) = payload.split_at(NONCE_LEN);

    let key = derive_key(password);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let plain = cipher
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| SyncError::config("config password is wrong or the file is corrupt"))?;

    String::from_utf8(plain)
        .map_err(|_| SyncError::config("decrypted config is not valid text"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
# remotes
[backup]
type = local
path = /srv/backup

[scratch]
type = memory
; scratch space
"#;

    #[test]
    fn test_parse_sections() {
        let store = ConfigStore::parse(SAMPLE).unwrap();
        let backup = store.section("backup").unwrap();
        assert_eq!(backup.get("type").unwrap(), "local");
        assert_eq!(backup.get("path").unwrap(), "/srv/backup");
        assert!(store.section("scratch").is_some());
        assert!(store.section("absent").is_none());

        let names: Vec<&str> = store.sections().collect();
        assert_eq!(names, vec!["backup", "scratch"]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(ConfigStore::parse("key = value").is_err());
        assert!(ConfigStore::parse("[]\n").is_err());
        assert!(ConfigStore::parse("[a]\nnot a pair\n").is_err());
    }

    #[test]
    fn test_plaintext_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("omnisync.conf");

        let mut store = ConfigStore::default();
        store.set("drive", "type", "local");
        store.set("drive", "path", "/mnt/drive");
        store.save(&path, None).unwrap();

        let loaded = ConfigStore::load(&path, None).unwrap();
        assert_eq!(
            loaded.section("drive").unwrap().get("path").unwrap(),
            "/mnt/drive"
        );
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("omnisync.conf");

        let mut store = ConfigStore::default();
        store.set("secret", "type", "memory");
        store.save(&path, Some("hunter2")).unwrap();

        // on-disk form is sealed
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with(ENCRYPT_MAGIC));
        assert!(!raw.contains("memory"));

        let loaded = ConfigStore::load(&path, Some("hunter2")).unwrap();
        assert!(loaded.section("secret").is_some());
    }

    #[test]
    fn test_wrong_password_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("omnisync.conf");

        let store = ConfigStore::default();
        store.save(&path, Some("right")).unwrap();

        assert!(ConfigStore::load(&path, Some("wrong")).is_err());
        let err = ConfigStore::load(&path, None).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::load(&dir.path().join("nope.conf"), None).unwrap();
        assert_eq!(store.sections().count(), 0);
    }
}
