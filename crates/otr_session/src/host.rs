//! The host callback surface and event kinds.
//!
//! The library speaks no transport; every outgoing string goes through
//! [`Host::inject_message`] and every user-visible occurrence surfaces as an
//! [`Event`]. Host callbacks are invoked synchronously while the session
//! lock is held — a host MUST NOT re-enter the same session from a callback;
//! defer to another thread instead.

use otr_crypto::dsa::DsaKeyPair;
use otr_crypto::eddsa::Ed448KeyPair;

use crate::instance::InstanceTag;
use crate::policy::OtrPolicy;

/// Identifies one conversation: (account, peer, network). Equality is
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub account: String,
    pub peer: String,
    pub network: String,
}

impl SessionId {
    pub fn new(
        account: impl Into<String>,
        peer: impl Into<String>,
        network: impl Into<String>,
    ) -> Self {
        Self { account: account.into(), peer: peer.into(), network: network.into() }
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.account, self.peer, self.network)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Plaintext,
    Encrypted,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The user asked for the abort.
    User,
    /// A fresh run displaced one in progress.
    Interruption,
    /// The peer broke the protocol.
    Violation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmpResult {
    pub verified: bool,
    /// The peer's long-term fingerprint the result applies to.
    pub fingerprint: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraSymmetricKey(pub Vec<u8>);

/// User-visible occurrences, delivered through [`Host::on_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    MessageForAnotherInstanceReceived,
    UnencryptedMessageReceived(String),
    UnreadableMessageReceived,
    Error(String),
    SessionFinished,
    MultipleInstancesDetected,
    ExtraSymmetricKeyDiscovered(ExtraSymmetricKey),
    SmpRequestSecret(String),
    SmpAborted(AbortReason),
    SmpCompleted(SmpResult),
    EncryptedMessagesRequired(String),
}

/// Implemented by the embedding application.
pub trait Host: Send + Sync {
    /// Deliver a prepared transport string to the wire.
    fn inject_message(&self, session_id: &SessionId, message: &str);

    fn session_policy(&self, session_id: &SessionId) -> OtrPolicy;

    /// Upper bound on one transport message; `usize::MAX` disables
    /// fragmentation.
    fn max_fragment_size(&self, _session_id: &SessionId) -> usize {
        usize::MAX
    }

    /// v2/v3 long-term identity.
    fn local_dsa_key_pair(&self, session_id: &SessionId) -> DsaKeyPair;

    /// v4 long-term identity.
    fn long_term_key_pair(&self, session_id: &SessionId) -> Ed448KeyPair;

    /// v4 forging keypair, published to support deniability.
    fn forging_key_pair(&self, session_id: &SessionId) -> Ed448KeyPair;

    /// Persist the freshly signed client-profile payload.
    fn update_client_profile_payload(&self, payload: &[u8]);

    /// Previously persisted profile payload, or empty.
    fn restore_client_profile_payload(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Localized reply sent to a peer whose message we could not read.
    fn reply_for_unreadable_message(&self, _session_id: &SessionId, _identifier: &str) -> String {
        "An unreadable encrypted message was received.".to_string()
    }

    /// Human-readable tail appended to query messages.
    fn fallback_message(&self, _session_id: &SessionId) -> String {
        String::new()
    }

    fn on_event(&self, session_id: &SessionId, receiver_tag: InstanceTag, event: Event);
}
