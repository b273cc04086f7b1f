use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid point encoding")]
    InvalidPoint,

    #[error("Invalid scalar encoding")]
    InvalidScalar,

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Ring signature verification failed")]
    RingSignatureVerification,

    #[error("Message authentication failed")]
    MacMismatch,

    #[error("Counter did not increase")]
    CounterRewind,

    #[error("No session keys for key ids ({0}, {1})")]
    UnknownKeyId(u32, u32),

    #[error("Message key for ratchet ({0}, {1}) is not available")]
    MissingMessageKey(u32, u32),

    #[error("Ratchet rotation limit exceeded")]
    RotationLimitation,

    #[error("Ratchet step failed: {0}")]
    RatchetStep(String),
}
