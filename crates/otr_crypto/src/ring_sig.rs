//! Three-key ring signatures (RSig).
//!
//! A non-interactive OR-proof over an ordered triple of Ed448 public keys:
//! the signer proves knowledge of the secret behind exactly one of them
//! without revealing which. The DAKE uses this for deniability — an Auth-R
//! could have been produced by the initiator's long-term key, the
//! responder's forging key, or the responder's own ephemeral.
//!
//! Wire form: six scalars `(c1, r1, c2, r2, c3, r3)`, 342 bytes. The
//! verification equation recomputes `T_i = G*r_i + A_i*c_i` and checks
//! `c1 + c2 + c3 == H(A1..A3 || T1..T3 || m)`.

use crate::ed448::{hash_to_scalar, Point, Scalar, SCALAR_LEN};
use crate::error::CryptoError;
use crate::kdf::usage;

pub const RING_SIGNATURE_LEN: usize = SCALAR_LEN * 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingSignature {
    pub c1: Scalar,
    pub r1: Scalar,
    pub c2: Scalar,
    pub r2: Scalar,
    pub c3: Scalar,
    pub r3: Scalar,
}

impl RingSignature {
    pub fn encode(&self) -> [u8; RING_SIGNATURE_LEN] {
        let mut out = [0u8; RING_SIGNATURE_LEN];
        for (i, s) in [self.c1, self.r1, self.c2, self.r2, self.c3, self.r3]
            .iter()
            .enumerate()
        {
            out[i * SCALAR_LEN..(i + 1) * SCALAR_LEN].copy_from_slice(&s.encode());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != RING_SIGNATURE_LEN {
            return Err(CryptoError::RingSignatureVerification);
        }
        let mut scalars = [Scalar::zero(); 6];
        for (i, slot) in scalars.iter_mut().enumerate() {
            *slot = Scalar::decode(&bytes[i * SCALAR_LEN..(i + 1) * SCALAR_LEN])?;
        }
        Ok(Self {
            c1: scalars[0],
            r1: scalars[1],
            c2: scalars[2],
            r2: scalars[3],
            c3: scalars[4],
            r3: scalars[5],
        })
    }
}

/// Sign `message` knowing the secret for `keys[known_index]`.
pub fn sign(
    secret: &Scalar,
    known_index: usize,
    keys: &[Point; 3],
    message: &[u8],
) -> Result<RingSignature, CryptoError> {
    if known_index > 2 {
        return Err(CryptoError::KeyGeneration("ring index out of range".into()));
    }
    if Point::base_mul(secret) != keys[known_index] {
        return Err(CryptoError::InvalidKey("ring secret does not match its slot".into()));
    }

    // simulated transcripts for the two unknown slots, real commitment for ours
    let t = Scalar::random();
    let mut c = [Scalar::zero(); 3];
    let mut r = [Scalar::zero(); 3];
    let mut commitments = [Point::identity(); 3];
    for i in 0..3 {
        if i == known_index {
            commitments[i] = Point::base_mul(&t);
        } else {
            c[i] = Scalar::random();
            r[i] = Scalar::random();
            commitments[i] = Point::base_mul(&r[i]).add(&keys[i].mul(&c[i]));
        }
    }

    let challenge = ring_challenge(keys, &commitments, message);
    c[known_index] = challenge
        .sub(&c[(known_index + 1) % 3])
        .sub(&c[(known_index + 2) % 3]);
    r[known_index] = t.sub(&c[known_index].mul(secret));

    Ok(RingSignature {
        c1: c[0],
        r1: r[0],
        c2: c[1],
        r2: r[1],
        c3: c[2],
        r3: r[2],
    })
}

pub fn verify(
    keys: &[Point; 3],
    message: &[u8],
    sig: &RingSignature,
) -> Result<(), CryptoError> {
    let c = [sig.c1, sig.c2, sig.c3];
    let r = [sig.r1, sig.r2, sig.r3];
    let mut commitments = [Point::identity(); 3];
    for i in 0..3 {
        commitments[i] = Point::base_mul(&r[i]).add(&keys[i].mul(&c[i]));
    }
    let expected = ring_challenge(keys, &commitments, message);
    let sum = sig.c1.add(&sig.c2).add(&sig.c3);
    if sum.ct_eq_bytes(&expected) {
        Ok(())
    } else {
        Err(CryptoError::RingSignatureVerification)
    }
}

fn ring_challenge(keys: &[Point; 3], commitments: &[Point; 3], message: &[u8]) -> Scalar {
    let mut input = Vec::with_capacity(57 * 6 + message.len());
    for k in keys {
        input.extend_from_slice(&k.encode());
    }
    for t in commitments {
        input.extend_from_slice(&t.encode());
    }
    input.extend_from_slice(message);
    hash_to_scalar(usage::RING_SIGNATURE, &input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ed448::EcdhKeyPair;

    fn ring() -> ([Point; 3], [EcdhKeyPair; 3]) {
        let kps = [
            EcdhKeyPair::generate(),
            EcdhKeyPair::generate(),
            EcdhKeyPair::generate(),
        ];
        ([kps[0].public, kps[1].public, kps[2].public], kps)
    }

    #[test]
    fn any_slot_signs_and_verifies() {
        let (keys, kps) = ring();
        for idx in 0..3 {
            let sig = sign(kps[idx].secret(), idx, &keys, b"transcript").unwrap();
            verify(&keys, b"transcript", &sig).unwrap();
        }
    }

    #[test]
    fn wrong_message_fails() {
        let (keys, kps) = ring();
        let sig = sign(kps[1].secret(), 1, &keys, b"transcript").unwrap();
        assert!(verify(&keys, b"other transcript", &sig).is_err());
    }

    #[test]
    fn wrong_ring_fails() {
        let (keys, kps) = ring();
        let (other_keys, _) = ring();
        let sig = sign(kps[0].secret(), 0, &keys, b"transcript").unwrap();
        assert!(verify(&other_keys, b"transcript", &sig).is_err());
    }

    #[test]
    fn mismatched_slot_rejected_at_signing() {
        let (keys, kps) = ring();
        assert!(sign(kps[0].secret(), 2, &keys, b"m").is_err());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let (keys, kps) = ring();
        let sig = sign(kps[2].secret(), 2, &keys, b"m").unwrap();
        let decoded = RingSignature::decode(&sig.encode()).unwrap();
        assert_eq!(sig, decoded);
        verify(&keys, b"m", &decoded).unwrap();
    }
}
