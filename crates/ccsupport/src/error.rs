//! Error taxonomy of the chaincode support core.
//!
//! Collaborator traits return `anyhow::Result`; their errors are boxed into
//! the typed variants here with the source chain kept intact.

use std::time::Duration;

use ccwire::ChaincodeEvent;
use ccwire::FrameError;
use ccwire::MessageType;
use ccwire::WireError;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Registration rejected by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("duplicate chaincode {0} registered")]
    Duplicate(String),
    #[error("peer will not accept external chaincode connection {0} (except in dev mode)")]
    Unsolicited(String),
}

/// A failed launch. Every caller waiting on the same launch receives a clone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("failed to get code package for {name}: {message}")]
    Package { name: String, message: String },
    #[error("could not start chaincode {name}: {message}")]
    Start { name: String, message: String },
    #[error("timeout expired while starting chaincode {name} (waited {timeout:?})")]
    Timeout { name: String, timeout: Duration },
    #[error("chaincode {0} was deregistered while launching")]
    Deregistered(String),
}

/// Transport failures of a chaincode stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Failures of a stream handler, either while serving its connection or
/// while executing a transaction on it.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("timeout expired while executing transaction {txid} (waited {timeout:?})")]
    Timeout { txid: String, timeout: Duration },
    #[error("transaction {txid} cancelled by caller")]
    Cancelled { txid: String },
    #[error("transaction {txid} already in flight on channel {channel_id}")]
    DuplicateTransaction { channel_id: String, txid: String },
    #[error("chaincode {0} disconnected")]
    Disconnected(String),
    #[error("stream closed before registration")]
    ClosedBeforeRegister,
    #[error("expected REGISTER as first message, received {0}")]
    UnexpectedHandshake(MessageType),
    #[error("malformed registration payload")]
    MalformedRegistration(#[source] WireError),
    #[error(transparent)]
    Registration(#[from] RegistryError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config")]
    Parse(#[source] toml::de::Error),
}

/// Machine-checkable category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request itself was unusable (missing spec, unencodable input).
    Request,
    /// The chaincode or version is unknown.
    Resolution,
    /// The chaincode could not be started or did not become ready.
    Launch,
    /// No live handler to deliver the message to.
    Dispatch,
    /// The chaincode answered ERROR.
    Remote,
    /// The chaincode answered something other than a valid terminal message.
    Protocol,
    /// The chaincode did not answer in time.
    Timeout,
    /// The caller cancelled.
    Cancelled,
    /// The runtime failed an explicit stop.
    Runtime,
}

/// Errors surfaced by [`crate::ChaincodeSupport`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("chaincode spec is nil")]
    MissingChaincodeSpec,

    #[error("failed to create chaincode message")]
    Encode(#[source] WireError),

    #[error("[channel {channel_id}] failed to get chaincode container info for {name}")]
    Resolution {
        channel_id: String,
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("[channel {channel_id}] failed to launch chaincode {name}")]
    Launch {
        channel_id: String,
        name: String,
        #[source]
        source: LaunchError,
    },

    #[error("[channel {channel_id}] unable to invoke chaincode {name} for transaction {txid}")]
    Unreachable { channel_id: String, name: String, txid: String },

    #[error("[channel {channel_id}] error sending transaction {txid} to chaincode {name}")]
    Execute {
        channel_id: String,
        name: String,
        txid: String,
        #[source]
        source: HandlerError,
    },

    #[error("[channel {channel_id}] transaction {txid} cancelled")]
    Cancelled { channel_id: String, txid: String },

    #[error("transaction {txid} returned with failure: {message}")]
    Remote {
        txid: String,
        message: String,
        payload: Vec<u8>,
        event: Option<ChaincodeEvent>,
    },

    #[error("unexpected response type {message_type} for transaction {txid}")]
    UnexpectedResponse { txid: String, message_type: MessageType },

    #[error("response for transaction {received} does not match transaction {txid}")]
    MismatchedResponse { txid: String, received: String },

    #[error("failed to unmarshal response for transaction {txid}")]
    MalformedResponse {
        txid: String,
        #[source]
        source: WireError,
    },

    #[error("failed to stop chaincode {name}")]
    Stop {
        name: String,
        #[source]
        source: BoxError,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingChaincodeSpec | Self::Encode(_) => ErrorKind::Request,
            Self::Resolution { .. } => ErrorKind::Resolution,
            Self::Launch { .. } => ErrorKind::Launch,
            Self::Unreachable { .. } => ErrorKind::Dispatch,
            Self::Execute { source, .. } => match source {
                HandlerError::Timeout { .. } => ErrorKind::Timeout,
                HandlerError::Cancelled { .. } => ErrorKind::Cancelled,
                HandlerError::DuplicateTransaction { .. } => ErrorKind::Request,
                _ => ErrorKind::Dispatch,
            },
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::UnexpectedResponse { .. }
            | Self::MismatchedResponse { .. }
            | Self::MalformedResponse { .. } => ErrorKind::Protocol,
            Self::Stop { .. } => ErrorKind::Runtime,
        }
    }

    /// Whether repeating the same invocation could succeed. A remote failure
    /// is the chaincode's deterministic answer and never is.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Launch | ErrorKind::Dispatch | ErrorKind::Timeout)
    }
}
