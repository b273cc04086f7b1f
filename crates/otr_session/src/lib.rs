//! otr_session — the Off-the-Record protocol engine
//!
//! Layers end-to-end confidentiality, authentication, forward secrecy, and
//! deniability over an arbitrary text transport. The embedding application
//! implements [`Host`] (inject messages, supply keys and policy, receive
//! events); the library implements everything between two transport
//! strings: negotiation, the v2/v3 AKE and v4 DAKE, the rotating
//! session-key window and the Double Ratchet, SMP authentication, TLV
//! records, and fragment reassembly.
//!
//! # Quick shape
//! ```ignore
//! let session = Session::new(SessionId::new("alice", "bob", "net"), host)?;
//! session.start_session();                       // inject "?OTRv34?"
//! let result = session.transform_receiving(raw)?; // wire string in
//! let parts = session.transform_sending("hi", &[])?; // fragments out
//! ```
//!
//! # Modules
//! - `session`   — master/slave orchestrator, the public façade
//! - `messaging` — per-instance PLAINTEXT/ENCRYPTED/FINISHED states
//! - `ake`/`dake` — the interactive key exchanges
//! - `smp`/`smp4` — socialist-millionaires authentication
//! - `profiles`  — client-profile lifecycle
//! - `host`      — the callback surface and event kinds
//! - `policy`, `instance`, `error`

pub mod ake;
pub mod dake;
pub mod error;
pub mod host;
pub mod instance;
pub mod messaging;
pub mod policy;
pub mod profiles;
pub mod session;
pub mod smp;
pub mod smp4;

pub use error::OtrError;
pub use host::{
    AbortReason, Event, ExtraSymmetricKey, Host, SessionId, SessionStatus, SmpResult,
};
pub use instance::InstanceTag;
pub use policy::OtrPolicy;
pub use session::{ReceiveResult, RemoteInfo, Session};

pub use otr_proto::version::Version;
