//! AES counter-mode helpers.
//!
//! v2/v3 data messages encrypt with AES-128-CTR where the high 8 counter
//! bytes travel on the wire and the low 8 are zero. v4 message keys are
//! single-use, so the v4 path runs AES-256-CTR with an all-zero counter.

use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes256Ctr = Ctr128BE<Aes256>;

/// AES-128-CTR with the wire counter in the top half and a zero bottom half.
pub fn aes128_ctr(key: &[u8; 16], ctr_high: &[u8; 8], data: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(ctr_high);
    let mut cipher = Aes128Ctr::new(key.into(), &iv.into());
    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    out
}

/// AES-256-CTR with a zero counter. Only safe for single-use keys.
pub fn aes256_ctr_zero(key: &[u8; 32], data: &[u8]) -> Vec<u8> {
    let iv = [0u8; 16];
    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes128_roundtrip() {
        let key = [7u8; 16];
        let ctr = [0, 0, 0, 0, 0, 0, 0, 1];
        let ct = aes128_ctr(&key, &ctr, b"attack at dawn");
        assert_ne!(&ct[..], b"attack at dawn");
        assert_eq!(aes128_ctr(&key, &ctr, &ct), b"attack at dawn");
    }

    #[test]
    fn aes128_counter_matters() {
        let key = [7u8; 16];
        let a = aes128_ctr(&key, &[0, 0, 0, 0, 0, 0, 0, 1], b"same plaintext");
        let b = aes128_ctr(&key, &[0, 0, 0, 0, 0, 0, 0, 2], b"same plaintext");
        assert_ne!(a, b);
    }

    #[test]
    fn aes256_roundtrip() {
        let key = [9u8; 32];
        let ct = aes256_ctr_zero(&key, b"ratchet payload");
        assert_eq!(aes256_ctr_zero(&key, &ct), b"ratchet payload");
    }
}
