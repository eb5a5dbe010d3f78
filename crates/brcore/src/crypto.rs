use anyhow::{anyhow, Result};
use argon2::{Argon2, Params};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

pub const KDF_TIME_COST: u32 = 3;
pub const KDF_MEMORY_COST: u32 = 65536; // 64MB
pub const KDF_PARALLELISM: u32 = 4;
pub const DERIVED_KEY_LEN: usize = 32;

pub fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let params = Params::new(
        KDF_MEMORY_COST,
        KDF_TIME_COST,
        KDF_PARALLELISM,
        Some(DERIVED_KEY_LEN),
    )
    .map_err(|e| anyhow!("argon2 params: {e}"))?;
    let argon = Argon2::from(params);
    let mut key = Zeroizing::new(vec![0u8; DERIVED_KEY_LEN]);
    argon
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| anyhow!("argon2 derive: {e}"))?;
    Ok(key)
}

pub fn encrypt(key: &[u8], nonce: &[u8; 24], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow!("encrypt: {e}"))?;
    Ok(ciphertext)
}

pub fn decrypt(key: &[u8], nonce: &[u8; 24], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| anyhow!("decrypt: {e}"))?;
    Ok(plaintext)
}

pub fn generate_nonce() -> [u8; 24] {
    let mut nonce = [0u8; 24];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn public_key_hex(key: &VerifyingKey) -> String {
    hex::encode(key.to_bytes())
}

/// UserID: the Ed25519 identity public key's 32 bytes, used directly.
pub fn user_id_from_public_key(key: &VerifyingKey) -> [u8; 32] {
    key.to_bytes()
}

pub fn sign_bytes(key: &SigningKey, bytes: &[u8]) -> Signature {
    key.sign(bytes)
}

pub fn verify_signature(public: &VerifyingKey, bytes: &[u8], sig: &Signature) -> Result<()> {
    public
        .verify_strict(bytes, sig)
        .map_err(|e| anyhow!("signature verify failed: {e}"))
}

// ── Ratchet support: X25519 DH + HKDF-SHA256 + BLAKE3 ──────────────────────

/// Generate a fresh X25519 agreement keypair for a DH ratchet step.
pub fn generate_dh_keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Perform the DH ratchet's Diffie-Hellman step.
pub fn dh(secret: &StaticSecret, their_public: &PublicKey) -> [u8; 32] {
    secret.diffie_hellman(their_public).to_bytes()
}

/// Derive a new (root_key, chain_key) pair from the previous root key and a
/// freshly computed DH output, per the Signal-style double-ratchet KDF chain.
pub fn kdf_root(root_key: &[u8; 32], dh_output: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut okm = [0u8; 64];
    hk.expand(b"bisonrelay-ratchet-root", &mut okm)
        .expect("64 bytes is a valid HKDF output length");
    let mut new_root = [0u8; 32];
    let mut new_chain = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    new_chain.copy_from_slice(&okm[32..]);
    (new_root, new_chain)
}

/// Advance a symmetric chain key one step, producing the next chain key and a
/// message key derived via distinct BLAKE3 keyed-hash contexts.
pub fn kdf_chain(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let next_chain = *blake3::keyed_hash(chain_key, b"chain").as_bytes();
    let message_key = *blake3::keyed_hash(chain_key, b"message").as_bytes();
    (next_chain, message_key)
}

/// Derive the RV tag a message key rendezvouses at: deterministic, one-shot,
/// and unguessable without the chain state.
pub fn rv_tag_from_message_key(message_key: &[u8; 32]) -> [u8; 32] {
    *blake3::keyed_hash(message_key, b"rv-tag").as_bytes()
}

/// Bootstrap a freshly agreed ratchet from the X3DH shared secret into an
/// initial root key plus one chain key per role, so the initiator's send
/// chain is the responder's receive chain and vice versa, without either
/// side needing a DH step before the first message.
pub fn kdf_initial_chains(shared_secret: &[u8; 32]) -> ([u8; 32], [u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 96];
    hk.expand(b"bisonrelay-ratchet-init", &mut okm)
        .expect("96 bytes is a valid HKDF output length");
    let mut root_key = [0u8; 32];
    let mut chain_initiator = [0u8; 32];
    let mut chain_responder = [0u8; 32];
    root_key.copy_from_slice(&okm[..32]);
    chain_initiator.copy_from_slice(&okm[32..64]);
    chain_responder.copy_from_slice(&okm[64..]);
    (root_key, chain_initiator, chain_responder)
}

pub fn device_id_from_public_key(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_bytes());
    hex::encode(&digest[..8])
}
