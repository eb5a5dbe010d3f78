use thiserror::Error;

/// Classified error kinds per the core's error-handling design (§7): transport
/// failures recover locally, protocol failures are logged/acted on, policy and
/// resource failures surface to the caller, fatal failures halt new work.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("resource: {0}")]
    Resource(#[from] ResourceError),

    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection lost")]
    ConnectionLost,
    #[error("operation timed out")]
    Timeout,
    #[error("authentication rejected by server")]
    AuthRejected,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown rendezvous tag")]
    UnknownTag,
    #[error("rendezvous tag already registered")]
    TagCollision,
    #[error("ratchet desynchronized with peer")]
    RatchetDesync,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("payment rejected")]
    PaymentRejected,
    #[error("rate limited")]
    RateLimited,
    #[error("paid push declined by user confirmation")]
    PaidPushDeclined,
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("disk full")]
    DiskFull,
    #[error("quota exceeded")]
    QuotaExceeded,
}

pub type CoreResult<T> = Result<T, CoreError>;
