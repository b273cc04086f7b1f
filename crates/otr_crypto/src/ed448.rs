//! Ed448-Goldilocks wrapper.
//!
//! Pins the wire encodings the rest of the workspace speaks: 57-byte
//! compressed Edwards points, 57-byte RFC 8032-layout scalars. Every other
//! module goes through `Point`/`Scalar`, so the underlying crate's API
//! surface is confined to this file.

use ed448_goldilocks::{
    AffinePoint, CompressedEdwardsY, EdwardsPoint, EdwardsScalar as RawScalar,
    WideEdwardsScalarBytes,
};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::kdf::{self, usage};

pub const POINT_LEN: usize = 57;
pub const SCALAR_LEN: usize = 57;

/// A point on Ed448-Goldilocks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Point(EdwardsPoint);

/// A scalar mod the Ed448 group order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Scalar(RawScalar);

impl Point {
    pub fn generator() -> Self {
        Point(EdwardsPoint::GENERATOR)
    }

    pub fn identity() -> Self {
        Point(EdwardsPoint::IDENTITY)
    }

    pub fn is_identity(&self) -> bool {
        self.0 == EdwardsPoint::IDENTITY
    }

    pub fn encode(&self) -> [u8; POINT_LEN] {
        let compressed: CompressedEdwardsY = AffinePoint::from(self.0).compress();
        let mut out = [0u8; POINT_LEN];
        out.copy_from_slice(compressed.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != POINT_LEN {
            return Err(CryptoError::InvalidPoint);
        }
        let mut arr = [0u8; POINT_LEN];
        arr.copy_from_slice(bytes);
        let compressed = CompressedEdwardsY(arr);
        let point: Option<AffinePoint> = compressed.decompress().into();
        point.map(|p| Point(EdwardsPoint::from(p))).ok_or(CryptoError::InvalidPoint)
    }

    pub fn mul(&self, s: &Scalar) -> Point {
        Point(self.0 * s.0)
    }

    pub fn add(&self, other: &Point) -> Point {
        Point(self.0 + other.0)
    }

    pub fn sub(&self, other: &Point) -> Point {
        Point(self.0 - other.0)
    }

    /// Base-point multiplication.
    pub fn base_mul(s: &Scalar) -> Point {
        Point(EdwardsPoint::GENERATOR * s.0)
    }
}

impl Scalar {
    pub fn zero() -> Self {
        Scalar(RawScalar::ZERO)
    }

    pub fn random() -> Self {
        let mut wide = [0u8; 114];
        OsRng.fill_bytes(&mut wide);
        let s = Scalar(RawScalar::from_bytes_mod_order_wide(&WideEdwardsScalarBytes::from(wide)));
        wide.zeroize();
        s
    }

    /// RFC 8032 layout: 56 little-endian value bytes plus a zero pad byte.
    pub fn encode(&self) -> [u8; SCALAR_LEN] {
        let mut out = [0u8; SCALAR_LEN];
        let bytes = self.0.to_bytes_rfc_8032();
        out.copy_from_slice(bytes.as_slice());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SCALAR_LEN {
            return Err(CryptoError::InvalidScalar);
        }
        // reduce the 57-byte encoding; non-canonical encodings are folded
        // into the group order rather than rejected, matching the wire rule
        // that scalars are interpreted mod q.
        let mut wide = [0u8; 114];
        wide[..SCALAR_LEN].copy_from_slice(bytes);
        Ok(Scalar(RawScalar::from_bytes_mod_order_wide(&WideEdwardsScalarBytes::from(wide))))
    }

    pub fn add(&self, other: &Scalar) -> Scalar {
        Scalar(self.0 + other.0)
    }

    pub fn sub(&self, other: &Scalar) -> Scalar {
        Scalar(self.0 - other.0)
    }

    pub fn mul(&self, other: &Scalar) -> Scalar {
        Scalar(self.0 * other.0)
    }

    pub fn ct_eq_bytes(&self, other: &Scalar) -> bool {
        self.encode().ct_eq(&other.encode()).into()
    }
}

/// SHAKE-256 hash-to-scalar with the shared domain/usage prefix.
pub fn hash_to_scalar(usage_byte: u8, input: &[u8]) -> Scalar {
    let mut wide = [0u8; 114];
    kdf::shake_kdf(usage_byte, input, &mut wide);
    let s = Scalar(RawScalar::from_bytes_mod_order_wide(&WideEdwardsScalarBytes::from(wide)));
    wide.zeroize();
    s
}

/// ECDH keypair on Ed448 (the v4 ratchet/DAKE ephemerals).
pub struct EcdhKeyPair {
    secret: Scalar,
    pub public: Point,
}

impl EcdhKeyPair {
    pub fn generate() -> Self {
        let secret = Scalar::random();
        let public = Point::base_mul(&secret);
        Self { secret, public }
    }

    pub fn shared_secret(&self, their_public: &Point) -> Result<[u8; POINT_LEN], CryptoError> {
        if their_public.is_identity() {
            return Err(CryptoError::InvalidPoint);
        }
        Ok(their_public.mul(&self.secret).encode())
    }

    pub(crate) fn secret(&self) -> &Scalar {
        &self.secret
    }
}

impl Drop for EcdhKeyPair {
    fn drop(&mut self) {
        self.secret = Scalar::zero();
    }
}

impl Clone for EcdhKeyPair {
    fn clone(&self) -> Self {
        Self { secret: self.secret, public: self.public }
    }
}

/// 56-byte public fingerprint over a pair of long-term points.
pub fn fingerprint(identity: &Point, forging: &Point) -> [u8; 56] {
    let mut input = Vec::with_capacity(POINT_LEN * 2);
    input.extend_from_slice(&identity.encode());
    input.extend_from_slice(&forging.encode());
    let mut out = [0u8; 56];
    kdf::shake_kdf(usage::FINGERPRINT, &input, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_roundtrip() {
        let kp = EcdhKeyPair::generate();
        let encoded = kp.public.encode();
        assert_eq!(Point::decode(&encoded).unwrap(), kp.public);
    }

    #[test]
    fn scalar_roundtrip() {
        let s = Scalar::random();
        assert_eq!(Scalar::decode(&s.encode()).unwrap(), s);
    }

    #[test]
    fn ecdh_agreement() {
        let a = EcdhKeyPair::generate();
        let b = EcdhKeyPair::generate();
        assert_eq!(
            a.shared_secret(&b.public).unwrap(),
            b.shared_secret(&a.public).unwrap()
        );
    }

    #[test]
    fn identity_rejected_as_peer_key() {
        let a = EcdhKeyPair::generate();
        assert!(a.shared_secret(&Point::identity()).is_err());
    }

    #[test]
    fn hash_to_scalar_deterministic() {
        let a = hash_to_scalar(usage::HASH_TO_SCALAR, b"transcript");
        let b = hash_to_scalar(usage::HASH_TO_SCALAR, b"transcript");
        assert!(a.ct_eq_bytes(&b));
    }
}
