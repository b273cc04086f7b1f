//! otr_proto — wire types and serialisation for OTR 2/3/4
//!
//! Everything that touches bytes-on-the-wire lives here: the big-endian
//! field codec, the encoded-message taxonomy, fragmentation and reassembly,
//! query/whitespace/error text forms, TLV records, and the OTRv4 client
//! profile. The crate is transport-free; it turns strings into typed
//! messages and back.
//!
//! # Modules
//! - `codec`    — big-endian encoder/decoder primitives (DATA, MPI, POINT...)
//! - `version`  — protocol versions and capability sets
//! - `message`  — encoded message taxonomy (`?OTR:` payloads)
//! - `fragment` — fragment syntax, in-order and out-of-order reassembly
//! - `tag`      — query strings, whitespace tags, error text, classification
//! - `tlv`      — typed records inside decrypted data payloads
//! - `profile`  — OTRv4 client profile (construct, sign, validate)

pub mod codec;
pub mod error;
pub mod fragment;
pub mod message;
pub mod profile;
pub mod tag;
pub mod tlv;
pub mod version;

pub use error::ProtoError;
pub use version::Version;
