//! Error types for the SecureGuard peer core

use thiserror::Error;

/// Main error type for SecureGuard
#[derive(Error, Debug)]
pub enum SecureGuardError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Peer registry errors
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    /// Packet queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("Handshake processing failed: {reason}")]
    Handshake { reason: String },
}

/// Protocol-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u8 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("Keypair exhausted its send counter")]
    KeyExhausted,

    #[error("Session expired")]
    SessionExpired,

    #[error("Invalid receiver index: {index}")]
    InvalidReceiverIndex { index: u32 },

    #[error("Handshake message arrived in state {state}")]
    UnexpectedHandshakeState { state: &'static str },

    #[error("Unknown peer")]
    UnknownPeer,
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("No socket bound")]
    NoBind,

    #[error("No known endpoint for peer")]
    NoEndpoint,

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
}

/// Peer creation errors raised by the registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Device closed")]
    DeviceClosed,

    #[error("Too many peers (limit {limit})")]
    PeerLimitExceeded { limit: usize },

    #[error("Adding existing peer {key}")]
    DuplicatePeer { key: String },
}

/// Packet queue errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue closed")]
    Closed,
}

impl SecureGuardError {
    /// Check if this error is recoverable
    ///
    /// Registry errors need a different key or a reopened device; transmission
    /// errors clear up once a bind or endpoint appears; exhausted keys are
    /// recovered by a fresh handshake.
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Fatal for the caller's request
            Self::Config(_) => false,
            Self::Peer(_) => false,
            Self::Queue(QueueError::Closed) => false,

            // Recoverable errors
            Self::Network(NetworkError::NoBind) => true,
            Self::Network(NetworkError::NoEndpoint) => true,
            Self::Network(_) => true,
            Self::Protocol(ProtocolError::KeyExhausted) => true,
            Self::Protocol(ProtocolError::SessionExpired) => true,
            Self::Crypto(CryptoError::Decryption) => true,

            // Default to non-recoverable for safety
            _ => false,
        }
    }
}

/// Result type alias for SecureGuard operations
pub type Result<T> = std::result::Result<T, SecureGuardError>;
