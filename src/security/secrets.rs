use crate::config::Config;
use anyhow::{Context, Result};
use chacha20poly1305::{
    ChaCha20Poly1305, KeyInit, Nonce,
    aead::{Aead, OsRng, rand_core::RngCore},
};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;
use zeroize::Zeroize;

const KEY_FILE: &str = ".campanile_key";
const ENC_PREFIX: &str = "ENC:";
const NONCE_LEN: usize = 12;

/// Symmetric cipher for credential material at rest.
///
/// The 256-bit key is derived from the configured process-wide secret; when
/// no secret is configured, a random key is generated once and kept in an
/// owner-only file in the workspace. Values are stored as
/// `ENC:` + hex(nonce || ciphertext).
pub struct SecretCipher {
    key: [u8; 32],
    encrypt: bool,
}

impl SecretCipher {
    pub fn from_config(config: &Config) -> Result<Self> {
        let key = if let Some(secret) = config
            .secrets
            .secret
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            derive_key(secret)
        } else {
            load_or_create_key(&config.state_dir())?
        };

        Ok(Self {
            key,
            encrypt: config.secrets.encrypt,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_key(key: [u8; 32], encrypt: bool) -> Self {
        Self { key, encrypt }
    }

    /// Returns `true` if the value has already been encrypted.
    #[must_use]
    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENC_PREFIX)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if !self.encrypt || plaintext.is_empty() || Self::is_encrypted(plaintext) {
            return Ok(plaintext.to_string());
        }

        let cipher = ChaCha20Poly1305::new_from_slice(&self.key).context("invalid key length")?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(format!("{ENC_PREFIX}{}", hex::encode(combined)))
    }

    pub fn decrypt(&self, value: &str) -> Result<String> {
        if !Self::is_encrypted(value) {
            return Ok(value.to_string());
        }

        let hex_str = &value[ENC_PREFIX.len()..];
        let combined = hex::decode(hex_str).context("invalid hex in encrypted value")?;

        if combined.len() < NONCE_LEN {
            anyhow::bail!("encrypted value too short");
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let cipher = ChaCha20Poly1305::new_from_slice(&self.key).context("invalid key length")?;

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("decryption failed: {e}"))?;

        String::from_utf8(plaintext).context("decrypted value is not valid UTF-8")
    }

    /// Decrypt, treating any failure as "value absent".
    ///
    /// A value written under a different key or scheme must read as missing,
    /// not take the process down.
    pub fn try_decrypt(&self, value: &str) -> Option<String> {
        match self.decrypt(value) {
            Ok(plaintext) => Some(plaintext),
            Err(error) => {
                tracing::debug!("treating undecryptable value as absent: {error}");
                None
            }
        }
    }
}

impl Drop for SecretCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

fn read_key_file(path: &Path) -> Result<[u8; 32]> {
    let hex_key = fs::read_to_string(path).context("failed to read key file")?;
    let mut raw = hex::decode(hex_key.trim()).context("invalid hex in key file")?;
    if raw.len() != 32 {
        raw.zeroize();
        anyhow::bail!("key file has invalid length (expected 32 bytes)");
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&raw);
    raw.zeroize();
    Ok(key)
}

fn write_new_key_file(path: &Path, key: &[u8]) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .context("failed to create key file")?;
        file.write_all(hex::encode(key).as_bytes())
            .context("failed to write key file")?;
        file.sync_all().context("failed to sync key file")?;
    }

    #[cfg(not(unix))]
    {
        fs::write(path, hex::encode(key)).context("failed to write key file")?;
    }

    enforce_key_permissions(path)
}

fn enforce_key_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("failed to set key file permissions")?;
    }
    Ok(())
}

fn load_or_create_key(state_dir: &Path) -> Result<[u8; 32]> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create state directory: {}", state_dir.display()))?;

    let path = state_dir.join(KEY_FILE);
    if path.exists() {
        enforce_key_permissions(&path)?;
        return read_key_file(&path);
    }

    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    match write_new_key_file(&path, &key) {
        Ok(()) => Ok(key),
        Err(error) => {
            // Another process may have raced us to the create.
            let is_already_exists = error
                .downcast_ref::<std::io::Error>()
                .is_some_and(|io| io.kind() == std::io::ErrorKind::AlreadyExists);
            if is_already_exists {
                enforce_key_permissions(&path)?;
                read_key_file(&path)
            } else {
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir, secret: Option<&str>) -> Config {
        let mut config = Config {
            workspace_dir: tmp.path().to_path_buf(),
            ..Config::default()
        };
        config.secrets.secret = secret.map(ToOwned::to_owned);
        config
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let tmp = TempDir::new().unwrap();
        let cipher = SecretCipher::from_config(&test_config(&tmp, Some("campus-secret"))).unwrap();

        let plaintext = r#"{"cookie":"CASTGC=TGT-12345"}"#;
        let encrypted = cipher.encrypt(plaintext).unwrap();
        assert!(SecretCipher::is_encrypted(&encrypted));
        assert_ne!(encrypted, plaintext);

        let decrypted = cipher.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn derived_key_is_stable_across_instances() {
        let tmp = TempDir::new().unwrap();
        let first = SecretCipher::from_config(&test_config(&tmp, Some("campus-secret"))).unwrap();
        let encrypted = first.encrypt("value").unwrap();
        drop(first);

        let second = SecretCipher::from_config(&test_config(&tmp, Some("campus-secret"))).unwrap();
        assert_eq!(second.decrypt(&encrypted).unwrap(), "value");
    }

    #[test]
    fn generated_key_file_is_reused() {
        let tmp = TempDir::new().unwrap();
        let first = SecretCipher::from_config(&test_config(&tmp, None)).unwrap();
        let encrypted = first.encrypt("value").unwrap();
        drop(first);

        let second = SecretCipher::from_config(&test_config(&tmp, None)).unwrap();
        assert_eq!(second.decrypt(&encrypted).unwrap(), "value");
    }

    #[cfg(unix)]
    #[test]
    fn key_file_permissions_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp, None);
        let _cipher = SecretCipher::from_config(&config).unwrap();

        let metadata = std::fs::metadata(config.state_dir().join(KEY_FILE)).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn wrong_key_reads_as_absent() {
        let one = SecretCipher::with_key([1u8; 32], true);
        let two = SecretCipher::with_key([2u8; 32], true);

        let encrypted = one.encrypt("secret-value").unwrap();
        assert!(two.decrypt(&encrypted).is_err());
        assert_eq!(two.try_decrypt(&encrypted), None);
        assert_eq!(one.try_decrypt(&encrypted).as_deref(), Some("secret-value"));
    }

    #[test]
    fn passthrough_when_encryption_disabled() {
        let cipher = SecretCipher::with_key([0u8; 32], false);

        let plaintext = "not-encrypted";
        assert_eq!(cipher.encrypt(plaintext).unwrap(), plaintext);
    }

    #[test]
    fn decrypt_plaintext_returns_as_is() {
        let cipher = SecretCipher::with_key([0u8; 32], true);
        assert_eq!(cipher.decrypt("plain-value").unwrap(), "plain-value");
    }

    #[test]
    fn is_encrypted_detects_prefix() {
        assert!(SecretCipher::is_encrypted("ENC:abcdef1234"));
        assert!(!SecretCipher::is_encrypted("plaintext"));
        assert!(!SecretCipher::is_encrypted(""));
    }
}
