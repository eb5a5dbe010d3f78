use crate::crypto::*;
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use zeroize::Zeroizing;

pub const VAULT_MAGIC: &[u8] = b"BRCORE02";
pub const VAULT_VERSION: u32 = 2;
pub const HEADER_SIZE: usize = 128;
pub const CURRENT_PAYLOAD_VERSION: u32 = 1;

/// The long-term identity held by this vault: one Ed25519 signing keypair
/// (used for KX/content signing) and one X25519 agreement keypair (the
/// ratchet's initial DH key), per §3's "each local identity also has a
/// UserID".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityPayload {
    pub vault_id: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub payload_version: u32,

    pub user_id_hex: String,
    pub signing_key_b64: String,
    pub verifying_key_b64: String,
    pub agreement_key_b64: String,
    pub agreement_public_b64: String,

    #[serde(default = "default_nick")]
    pub nick: String,
    #[serde(default = "random_secret")]
    pub ipc_shared_secret: String,
    #[serde(default)]
    pub kv: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Vault {
    pub header: VaultHeader,
    pub payload: IdentityPayload,
    path: PathBuf,
    key: Zeroizing<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct VaultHeader {
    pub vault_version: u32,
    pub payload_version: u32,
    pub kdf_time_cost: u32,
    pub kdf_memory_cost: u32,
    pub kdf_parallelism: u32,
    pub salt: [u8; 32],
    pub nonce: [u8; 24],
}

impl Vault {
    pub fn create_new<P: AsRef<Path>>(path: P, password: &str) -> Result<Self> {
        if Path::new(path.as_ref()).exists() {
            return Err(anyhow!("vault already exists"));
        }
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let salt = generate_salt();
        let nonce = generate_nonce();
        let key = derive_key(password, &salt)?;

        let signing_key = generate_signing_key();
        let verifying_key: VerifyingKey = signing_key.verifying_key();
        let user_id = user_id_from_public_key(&verifying_key);
        let (agreement_secret, agreement_public) = generate_dh_keypair();

        let payload = IdentityPayload {
            vault_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            last_modified: Utc::now(),
            payload_version: CURRENT_PAYLOAD_VERSION,
            user_id_hex: hex::encode(user_id),
            signing_key_b64: general_purpose::STANDARD.encode(signing_key.to_bytes()),
            verifying_key_b64: general_purpose::STANDARD.encode(verifying_key.to_bytes()),
            agreement_key_b64: general_purpose::STANDARD.encode(agreement_secret.to_bytes()),
            agreement_public_b64: general_purpose::STANDARD.encode(agreement_public.to_bytes()),
            nick: default_nick(),
            ipc_shared_secret: random_secret(),
            kv: HashMap::new(),
        };

        let header = VaultHeader {
            vault_version: VAULT_VERSION,
            payload_version: CURRENT_PAYLOAD_VERSION,
            kdf_time_cost: KDF_TIME_COST,
            kdf_memory_cost: KDF_MEMORY_COST,
            kdf_parallelism: KDF_PARALLELISM,
            salt,
            nonce,
        };

        let mut vault = Vault {
            header,
            payload,
            path: path.as_ref().to_path_buf(),
            key: key.clone(),
        };
        vault.save_with_key()?;
        Ok(vault)
    }

    pub fn open<P: AsRef<Path>>(path: P, password: &str) -> Result<Self> {
        let mut file = File::open(path.as_ref()).map_err(|e| anyhow!("open vault: {e}"))?;
        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = VaultHeader::from_bytes(&header_buf)?;
        let mut ciphertext = Vec::new();
        file.read_to_end(&mut ciphertext)?;

        let key = derive_key(password, &header.salt)?;
        let plaintext = decrypt(&key, &header.nonce, &ciphertext)
            .map_err(|_| anyhow!("incorrect passphrase or corrupted vault"))?;
        let mut payload: IdentityPayload =
            serde_json::from_slice(&plaintext).map_err(|e| anyhow!("parse vault: {e}"))?;
        migrate_payload(&mut payload)?;
        let vault = Vault {
            header: VaultHeader {
                payload_version: payload.payload_version,
                ..header
            },
            payload,
            path: path.as_ref().to_path_buf(),
            key: key.clone(),
        };
        Ok(vault)
    }

    /// Persist the vault, re-deriving the key from `password`. Generates a
    /// fresh random nonce every call — XChaCha20-Poly1305 nonces must never
    /// repeat under the same key.
    pub fn save(&mut self, password: &str) -> Result<()> {
        let key = derive_key(password, &self.header.salt)?;
        self.key = key;
        self.save_with_key()
    }

    /// Persist using the already-derived key (the common path once the
    /// vault is open; avoids re-running Argon2id on every write).
    pub fn save_with_key(&mut self) -> Result<()> {
        self.payload.last_modified = Utc::now();
        self.payload.payload_version = CURRENT_PAYLOAD_VERSION;
        let plaintext = serde_json::to_vec(&self.payload)?;

        let new_nonce = generate_nonce();
        self.header.nonce = new_nonce;
        let ciphertext = encrypt(&self.key, &self.header.nonce, &plaintext)?;

        let staging_path = self.path.with_extension("staging");
        {
            let mut file = File::create(&staging_path)?;
            file.write_all(&VaultHeader::to_bytes(&self.header)?)?;
            file.write_all(&ciphertext)?;
            file.sync_all()?;
        }
        std::fs::rename(&staging_path, &self.path)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.payload.kv.get(key) {
            let decoded = general_purpose::STANDARD
                .decode(value)
                .map_err(|e| anyhow!("decode kv value: {e}"))?;
            Ok(Some(decoded))
        } else {
            Ok(None)
        }
    }

    pub fn set(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let encoded = general_purpose::STANDARD.encode(value);
        self.payload.kv.insert(key.to_string(), encoded);
        self.save_with_key()
    }

    /// Remove a KV entry outright (as opposed to overwriting it with an
    /// empty value, which would leave a tombstone `UserRegistry::load`'s key
    /// scan would trip over).
    pub fn remove(&mut self, key: &str) -> Result<()> {
        self.payload.kv.remove(key);
        self.save_with_key()
    }

    pub fn signing_key(&self) -> Result<SigningKey> {
        let key_bytes = general_purpose::STANDARD
            .decode(&self.payload.signing_key_b64)
            .map_err(|e| anyhow!("decode signing key: {e}"))?;
        let key_bytes: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| anyhow!("signing key length invalid"))?;
        Ok(SigningKey::from_bytes(&key_bytes))
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        let key_bytes = general_purpose::STANDARD
            .decode(&self.payload.verifying_key_b64)
            .map_err(|e| anyhow!("decode verifying key: {e}"))?;
        let key_bytes: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| anyhow!("verifying key length invalid"))?;
        VerifyingKey::from_bytes(&key_bytes).map_err(|e| anyhow!("load verifying key: {e}"))
    }

    pub fn agreement_secret(&self) -> Result<x25519_dalek::StaticSecret> {
        let key_bytes = general_purpose::STANDARD
            .decode(&self.payload.agreement_key_b64)
            .map_err(|e| anyhow!("decode agreement key: {e}"))?;
        let key_bytes: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| anyhow!("agreement key length invalid"))?;
        Ok(x25519_dalek::StaticSecret::from(key_bytes))
    }

    /// The X25519 agreement public key (distinct from the Ed25519 identity
    /// key `verifying_key` returns): what KX invites/replies must carry as
    /// `long_term_pub`, since that's the curve the ratchet's DH steps run on.
    pub fn agreement_public(&self) -> Result<[u8; 32]> {
        let key_bytes = general_purpose::STANDARD
            .decode(&self.payload.agreement_public_b64)
            .map_err(|e| anyhow!("decode agreement public key: {e}"))?;
        key_bytes
            .try_into()
            .map_err(|_| anyhow!("agreement public key length invalid"))
    }

    pub fn user_id(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(&self.payload.user_id_hex)?;
        bytes
            .try_into()
            .map_err(|_| anyhow!("user id length invalid"))
    }

    pub fn ipc_shared_secret(&self) -> Result<Vec<u8>> {
        general_purpose::STANDARD
            .decode(&self.payload.ipc_shared_secret)
            .map_err(|e| anyhow!("decode ipc secret: {e}"))
    }
}

impl VaultHeader {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; HEADER_SIZE];
        if VAULT_MAGIC.len() > 8 {
            return Err(anyhow!("magic length invalid"));
        }
        buf[..VAULT_MAGIC.len()].copy_from_slice(VAULT_MAGIC);
        buf[8..12].copy_from_slice(&self.vault_version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_version.to_le_bytes());
        buf[16..20].copy_from_slice(&self.kdf_time_cost.to_le_bytes());
        buf[20..24].copy_from_slice(&self.kdf_memory_cost.to_le_bytes());
        buf[24..28].copy_from_slice(&self.kdf_parallelism.to_le_bytes());
        buf[28..60].copy_from_slice(&self.salt);
        buf[60..84].copy_from_slice(&self.nonce);
        // remaining bytes stay zero, reserved for future header fields
        Ok(buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEADER_SIZE {
            return Err(anyhow!("invalid header size"));
        }
        if &buf[..VAULT_MAGIC.len()] != VAULT_MAGIC {
            return Err(anyhow!("invalid magic"));
        }
        let vault_version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if vault_version != VAULT_VERSION {
            return Err(anyhow!("vault version mismatch"));
        }
        Ok(Self {
            vault_version,
            payload_version: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            kdf_time_cost: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            kdf_memory_cost: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            kdf_parallelism: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            salt: buf[28..60].try_into().unwrap(),
            nonce: buf[60..84].try_into().unwrap(),
        })
    }
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    general_purpose::STANDARD.encode(bytes)
}

fn default_nick() -> String {
    "anonymous".to_string()
}

fn migrate_payload(payload: &mut IdentityPayload) -> Result<()> {
    if payload.payload_version < 1 {
        if payload.ipc_shared_secret.is_empty() {
            payload.ipc_shared_secret = random_secret();
        }
        payload.payload_version = 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_and_open_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity");
        let password = "correct horse battery staple";
        let vault = Vault::create_new(&path, password).unwrap();
        assert_eq!(vault.payload.payload_version, CURRENT_PAYLOAD_VERSION);
        let opened = Vault::open(&path, password).unwrap();
        assert_eq!(opened.payload.user_id_hex, vault.payload.user_id_hex);
        assert_eq!(opened.user_id().unwrap(), vault.user_id().unwrap());
    }

    #[test]
    fn wrong_password_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity");
        let vault = Vault::create_new(&path, "pw1").unwrap();
        assert!(Vault::open(&path, "pw2").is_err());
        drop(vault);
    }

    #[test]
    fn kv_roundtrip_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity");
        let mut vault = Vault::create_new(&path, "pw").unwrap();
        vault.set("hello", b"world").unwrap();
        let reopened = Vault::open(&path, "pw").unwrap();
        assert_eq!(reopened.get("hello").unwrap().unwrap(), b"world");
    }

    #[test]
    fn kv_visible_in_payload_without_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity");
        let mut vault = Vault::create_new(&path, "pw").unwrap();
        vault.set("a.b", b"1").unwrap();
        assert!(vault.payload.kv.contains_key("a.b"));
        vault.remove("a.b").unwrap();
        assert!(!vault.payload.kv.contains_key("a.b"));
    }
}
