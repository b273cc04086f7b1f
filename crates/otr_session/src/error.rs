use thiserror::Error;

use otr_crypto::CryptoError;
use otr_proto::ProtoError;

#[derive(Debug, Error)]
pub enum OtrError {
    /// The operation needs a state the session is not in.
    #[error("Operation requires {required} but session is {actual}")]
    IncorrectState { required: &'static str, actual: &'static str },

    /// Message arrived for a version the policy disables; dropped silently.
    #[error("Message rejected by policy")]
    PolicyRejection,

    /// The message was dropped; the peer misbehaved or the wire is damaged.
    #[error("Message rejected: {0}")]
    MessageRejected(String),

    /// The host returned inconsistent data.
    #[error("Host failure: {0}")]
    HostFailure(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
