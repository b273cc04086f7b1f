//! Key derivation functions.
//!
//! Two families, one per protocol generation:
//!
//! - v4: `shake_kdf` — SHAKE-256 over `"OTRv4" || usage || input`. Every
//!   derived value in the v4 key schedule has its own usage byte so that no
//!   two derivations can collide.
//! - v2/v3: counted hashes `h1` (SHA-1) and `h2` (SHA-256) over
//!   `byte || secbytes`, exactly as the legacy key schedule derives the AKE
//!   keys (`ssid, c, c', m1, m2, m1', m2'`) and the session-key window
//!   material.

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    Shake256,
};

/// Usage bytes for the SHAKE-256 KDF. One namespace for the whole v4
/// schedule; values are stable because they are mixed into every derived key.
pub mod usage {
    pub const FINGERPRINT: u8 = 0x00;
    pub const SHARED_SECRET: u8 = 0x01;
    pub const SSID: u8 = 0x02;
    pub const PROFILE_HASH: u8 = 0x03;
    pub const AUTH_R: u8 = 0x04;
    pub const AUTH_I: u8 = 0x05;
    pub const PHI: u8 = 0x06;
    pub const FIRST_ROOT_KEY: u8 = 0x07;
    pub const FIRST_BRACE_KEY: u8 = 0x08;
    pub const BRACE_KEY: u8 = 0x09;
    pub const THIRD_BRACE_KEY: u8 = 0x0a;
    pub const ROOT_KEY: u8 = 0x0b;
    pub const CHAIN_KEY: u8 = 0x0c;
    pub const NEXT_CHAIN_KEY: u8 = 0x0d;
    pub const MESSAGE_KEY: u8 = 0x0e;
    pub const MAC_KEY: u8 = 0x0f;
    pub const EXTRA_SYMMETRIC_KEY: u8 = 0x10;
    pub const EXTRA_SYMMETRIC_KEY_TLV: u8 = 0x11;
    pub const AUTHENTICATOR: u8 = 0x12;
    pub const SMP_SECRET: u8 = 0x13;
    pub const SMP_VALUE: u8 = 0x14;
    pub const AUTH_MAC: u8 = 0x15;
    pub const RING_SIGNATURE: u8 = 0x16;
    pub const EDDSA_CHALLENGE: u8 = 0x17;
    pub const EDDSA_NONCE: u8 = 0x18;
    pub const HASH_TO_SCALAR: u8 = 0x19;
}

const DOMAIN: &[u8] = b"OTRv4";

/// SHAKE-256 over `"OTRv4" || usage || input`, filling `out`.
pub fn shake_kdf(usage: u8, input: &[u8], out: &mut [u8]) {
    let mut shake = Shake256::default();
    shake.update(DOMAIN);
    shake.update(&[usage]);
    shake.update(input);
    shake.finalize_xof().read(out);
}

/// Fixed-width convenience wrappers; the key schedule reads better with the
/// width in the name.
pub fn shake_kdf_32(usage: u8, input: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    shake_kdf(usage, input, &mut out);
    out
}

pub fn shake_kdf_64(usage: u8, input: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    shake_kdf(usage, input, &mut out);
    out
}

// ── v2/v3 counted hashes ─────────────────────────────────────────────────────

/// h1(b) = SHA-1(b || secbytes). Source of the window AES keys.
pub fn h1(b: u8, secbytes: &[u8]) -> [u8; 20] {
    let mut h = Sha1::new();
    Digest::update(&mut h, [b]);
    Digest::update(&mut h, secbytes);
    h.finalize().into()
}

/// h2(b) = SHA-256(b || secbytes). Source of the AKE keys and the SSID.
pub fn h2(b: u8, secbytes: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    Digest::update(&mut h, [b]);
    Digest::update(&mut h, secbytes);
    h.finalize().into()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    Digest::update(&mut h, data);
    h.finalize().into()
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut h = Sha1::new();
    Digest::update(&mut h, data);
    h.finalize().into()
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256>>::new_from_slice(key).expect("HMAC accepts any key length");
    Mac::update(&mut mac, data);
    mac.finalize().into_bytes().into()
}

/// HMAC-SHA256 truncated to 160 bits, as the v2/v3 AKE MACs appear on the wire.
pub fn hmac_sha256_160(key: &[u8], data: &[u8]) -> [u8; 20] {
    let full = hmac_sha256(key, data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&full[..20]);
    out
}

pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = <Hmac<Sha1>>::new_from_slice(key).expect("HMAC accepts any key length");
    Mac::update(&mut mac, data);
    mac.finalize().into_bytes().into()
}
