use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "bisonrelay";
pub const APP_NAME: &str = "brcore";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("BISONRELAY_APP_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn log_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("logs"))
}

/// `id/identity` — the encrypted vault holding the long-term identity key
/// material and client config (§6, §4.K).
pub fn identity_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("id").join("identity"))
}

/// `peers/<uid-hex>/ratchet`
pub fn peer_ratchet_path(uid_hex: &str) -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("peers").join(uid_hex).join("ratchet"))
}

/// `peers/<uid-hex>/meta`
pub fn peer_meta_path(uid_hex: &str) -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("peers").join(uid_hex).join("meta"))
}

/// `outbox/<uid-hex>/`
pub fn outbox_dir(uid_hex: &str) -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("outbox").join(uid_hex))
}

/// `streams/<stream>/`
pub fn stream_dir(stream: &str) -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("streams").join(stream))
}

/// The control-plane IPC transport path (§4.N).
pub fn control_socket_path() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("BISONRELAY_CONTROL_SOCKET") {
        return Ok(PathBuf::from(override_path));
    }
    #[cfg(unix)]
    {
        Ok(data_dir()?.join("control.sock"))
    }
    #[cfg(windows)]
    {
        Ok(PathBuf::from(r"\\.\pipe\BisonRelayControl"))
    }
}
