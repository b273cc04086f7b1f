//! otr_crypto — cryptographic primitives and key schedules for OTR 2/3/4
//!
//! # Design principles
//! - NO custom primitives; AES, SHA, SHAKE and the Ed448 curve come from
//!   audited Rust crates. The protocol constructions built on top of them
//!   (DSA over raw wire components, ring signatures, the key schedules)
//!   live here because the wire format fixes them exactly.
//! - Zeroize all secret material on drop.
//! - MAC and authenticator comparison is constant time (`subtle`).
//!
//! # Module layout
//! - `dh`             — 1536-bit and 3072-bit MODP groups (AKE, SMP, brace key)
//! - `dsa`            — DSA over raw (p, q, g, y) wire components
//! - `ed448`          — Ed448-Goldilocks point/scalar wrapper, 57-byte encodings
//! - `eddsa`          — Ed448 Schnorr signatures (client profiles)
//! - `ring_sig`       — three-key ring signatures (DAKE deniability)
//! - `kdf`            — SHAKE-256 usage KDF (v4) + counted SHA hashes (v2/v3)
//! - `aes_ctr`        — AES-128/256 counter-mode helpers
//! - `session_keys`   — v2/v3 rotating 2×2 session-key window
//! - `double_ratchet` — v4 mixed ECDH/DH Double Ratchet
//! - `error`          — unified error type

pub mod aes_ctr;
pub mod dh;
pub mod double_ratchet;
pub mod dsa;
pub mod ed448;
pub mod eddsa;
pub mod error;
pub mod kdf;
pub mod ring_sig;
pub mod session_keys;

pub use error::CryptoError;
