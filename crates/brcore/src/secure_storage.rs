use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;

const SERVICE_NAME: &str = "BisonRelayCore";
const IPC_SECRET_KEY: &str = "ipc_secret";

/// The control plane's shared HMAC secret lives in the OS keychain, not the
/// vault, so `brctl` can authenticate without ever unlocking the identity
/// vault itself.
pub fn store_ipc_secret(user_id_hex: &str, secret: &[u8]) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, &format!("{}:{}", IPC_SECRET_KEY, user_id_hex))
        .map_err(|e| anyhow!("keyring init: {e}"))?;
    let encoded = general_purpose::STANDARD.encode(secret);
    entry
        .set_password(&encoded)
        .map_err(|e| anyhow!("store ipc secret: {e}"))?;
    Ok(())
}

pub fn get_ipc_secret(user_id_hex: &str) -> Result<Vec<u8>> {
    let entry = Entry::new(SERVICE_NAME, &format!("{}:{}", IPC_SECRET_KEY, user_id_hex))
        .map_err(|e| anyhow!("keyring init: {e}"))?;
    let encoded = entry
        .get_password()
        .map_err(|e| anyhow!("load ipc secret: {e}"))?;
    let decoded = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| anyhow!("decode ipc secret: {e}"))?;
    Ok(decoded)
}

pub fn delete_ipc_secret(user_id_hex: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, &format!("{}:{}", IPC_SECRET_KEY, user_id_hex))
        .map_err(|e| anyhow!("keyring init: {e}"))?;
    entry
        .delete_password()
        .map_err(|e| anyhow!("delete ipc secret: {e}"))?;
    Ok(())
}
