use thiserror::Error;

use otr_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Unexpected end of message")]
    UnexpectedEof,

    #[error("Trailing bytes after message")]
    TrailingBytes,

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("Unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("Fragment rejected: {0}")]
    FragmentRejected(String),

    #[error("Fragmentation impossible: {0}")]
    FragmentationFailed(String),

    #[error("Client profile invalid: {0}")]
    ProfileInvalid(String),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
