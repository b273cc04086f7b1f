//! Ed448 Schnorr signatures.
//!
//! Signs client profiles with the long-term identity key. Signature is
//! `R || s` (114 wire bytes); the challenge scalar comes from the shared
//! SHAKE-256 KDF over `R || A || message`, the nonce deterministically from
//! the secret and the message, so a broken RNG cannot leak the key.

use zeroize::Zeroize;

use crate::ed448::{hash_to_scalar, Point, Scalar, POINT_LEN, SCALAR_LEN};
use crate::error::CryptoError;
use crate::kdf::usage;

pub const SIGNATURE_LEN: usize = POINT_LEN + SCALAR_LEN;

/// Long-term Ed448 keypair (identity or forging role).
pub struct Ed448KeyPair {
    secret: Scalar,
    pub public: Point,
}

impl Ed448KeyPair {
    pub fn generate() -> Self {
        let secret = Scalar::random();
        let public = Point::base_mul(&secret);
        Self { secret, public }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut nonce_input = Vec::with_capacity(SCALAR_LEN + message.len());
        nonce_input.extend_from_slice(&self.secret.encode());
        nonce_input.extend_from_slice(message);
        let r = hash_to_scalar(usage::EDDSA_NONCE, &nonce_input);
        nonce_input.zeroize();

        let big_r = Point::base_mul(&r);
        let c = challenge(&big_r, &self.public, message);
        let s = r.add(&c.mul(&self.secret));

        let mut sig = [0u8; SIGNATURE_LEN];
        sig[..POINT_LEN].copy_from_slice(&big_r.encode());
        sig[POINT_LEN..].copy_from_slice(&s.encode());
        sig
    }

    /// Ring-sign `message` with this key occupying `known_index` of `keys`.
    pub fn ring_sign(
        &self,
        known_index: usize,
        keys: &[Point; 3],
        message: &[u8],
    ) -> Result<crate::ring_sig::RingSignature, CryptoError> {
        crate::ring_sig::sign(&self.secret, known_index, keys, message)
    }
}

impl Drop for Ed448KeyPair {
    fn drop(&mut self) {
        self.secret = Scalar::zero();
    }
}

impl Clone for Ed448KeyPair {
    fn clone(&self) -> Self {
        Self { secret: self.secret, public: self.public }
    }
}

pub fn verify(public: &Point, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(CryptoError::SignatureVerification);
    }
    let big_r = Point::decode(&signature[..POINT_LEN])
        .map_err(|_| CryptoError::SignatureVerification)?;
    let s = Scalar::decode(&signature[POINT_LEN..])
        .map_err(|_| CryptoError::SignatureVerification)?;
    let c = challenge(&big_r, public, message);
    // G*s == R + A*c
    if Point::base_mul(&s) == big_r.add(&public.mul(&c)) {
        Ok(())
    } else {
        Err(CryptoError::SignatureVerification)
    }
}

fn challenge(big_r: &Point, public: &Point, message: &[u8]) -> Scalar {
    let mut input = Vec::with_capacity(POINT_LEN * 2 + message.len());
    input.extend_from_slice(&big_r.encode());
    input.extend_from_slice(&public.encode());
    input.extend_from_slice(message);
    hash_to_scalar(usage::EDDSA_CHALLENGE, &input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = Ed448KeyPair::generate();
        let sig = kp.sign(b"client profile bytes");
        verify(&kp.public, b"client profile bytes", &sig).unwrap();
    }

    #[test]
    fn tampered_message_fails() {
        let kp = Ed448KeyPair::generate();
        let sig = kp.sign(b"original");
        assert!(verify(&kp.public, b"tampered", &sig).is_err());
    }

    #[test]
    fn wrong_public_key_fails() {
        let kp = Ed448KeyPair::generate();
        let other = Ed448KeyPair::generate();
        let sig = kp.sign(b"message");
        assert!(verify(&other.public, b"message", &sig).is_err());
    }

    #[test]
    fn signing_is_deterministic() {
        let kp = Ed448KeyPair::generate();
        assert_eq!(kp.sign(b"m")[..], kp.sign(b"m")[..]);
    }
}
