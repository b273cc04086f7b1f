//! DSA over raw wire components.
//!
//! The v2/v3 wire carries DSA keys as bare `(p, q, g, y)` MPIs and
//! signatures as two 20-byte halves `(r, s)`, so the implementation works on
//! raw big integers rather than an encoded key format. The host owns the
//! long-term keypair; `generate_parameters`/`DsaKeyPair::generate` exist for
//! hosts (and tests) that need to mint one.

use num_bigint::{BigInt, BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Signed, Zero};
use rand::rngs::OsRng;

use crate::error::CryptoError;

/// Public half, as it appears inside AKE signature payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsaPublicKey {
    pub p: BigUint,
    pub q: BigUint,
    pub g: BigUint,
    pub y: BigUint,
}

pub struct DsaKeyPair {
    pub public: DsaPublicKey,
    x: BigUint,
}

impl Drop for DsaKeyPair {
    fn drop(&mut self) {
        self.x.set_zero();
    }
}

impl Clone for DsaKeyPair {
    fn clone(&self) -> Self {
        Self { public: self.public.clone(), x: self.x.clone() }
    }
}

/// q is 160 bits: signature halves are 20 bytes each on the wire.
pub const SIGNATURE_HALF_LEN: usize = 20;

impl DsaKeyPair {
    /// Fresh keypair over freshly generated domain parameters.
    pub fn generate() -> Self {
        let params = generate_parameters(1024, 160);
        Self::generate_in(params)
    }

    pub fn generate_in(params: (BigUint, BigUint, BigUint)) -> Self {
        let (p, q, g) = params;
        let x = OsRng.gen_biguint_range(&BigUint::one(), &q);
        let y = g.modpow(&x, &p);
        Self { public: DsaPublicKey { p, q, g, y }, x }
    }

    /// Sign a digest. The digest is truncated to the bit length of q per
    /// FIPS 186; OTR always signs 32-byte SHA-256 outputs with a 160-bit q.
    pub fn sign(&self, digest: &[u8]) -> ([u8; SIGNATURE_HALF_LEN], [u8; SIGNATURE_HALF_LEN]) {
        let pk = &self.public;
        let z = truncate_digest(digest, &pk.q);
        loop {
            let k = OsRng.gen_biguint_range(&BigUint::one(), &pk.q);
            let r = pk.g.modpow(&k, &pk.p) % &pk.q;
            if r.is_zero() {
                continue;
            }
            let k_inv = match mod_inverse(&k, &pk.q) {
                Some(v) => v,
                None => continue,
            };
            let s = (&k_inv * (&z + &self.x * &r)) % &pk.q;
            if s.is_zero() {
                continue;
            }
            return (to_half(&r), to_half(&s));
        }
    }
}

/// Verify a raw (r, s) signature over a digest.
pub fn verify(
    public: &DsaPublicKey,
    digest: &[u8],
    r: &[u8],
    s: &[u8],
) -> Result<(), CryptoError> {
    let r = BigUint::from_bytes_be(r);
    let s = BigUint::from_bytes_be(s);
    if r.is_zero() || s.is_zero() || r >= public.q || s >= public.q {
        return Err(CryptoError::SignatureVerification);
    }
    let z = truncate_digest(digest, &public.q);
    let w = mod_inverse(&s, &public.q).ok_or(CryptoError::SignatureVerification)?;
    let u1 = (&z * &w) % &public.q;
    let u2 = (&r * &w) % &public.q;
    let v = (public.g.modpow(&u1, &public.p) * public.y.modpow(&u2, &public.p)) % &public.p
        % &public.q;
    if v == r {
        Ok(())
    } else {
        Err(CryptoError::SignatureVerification)
    }
}

fn to_half(n: &BigUint) -> [u8; SIGNATURE_HALF_LEN] {
    let bytes = n.to_bytes_be();
    let mut out = [0u8; SIGNATURE_HALF_LEN];
    out[SIGNATURE_HALF_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

fn truncate_digest(digest: &[u8], q: &BigUint) -> BigUint {
    let z = BigUint::from_bytes_be(digest);
    let excess = (digest.len() as u64 * 8).saturating_sub(q.bits());
    z >> excess
}

fn mod_inverse(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    let a = BigInt::from(a.clone());
    let m = BigInt::from(m.clone());
    let e = a.extended_gcd(&m);
    if !e.gcd.is_one() {
        return None;
    }
    let mut x = e.x % &m;
    if x.is_negative() {
        x += &m;
    }
    x.to_biguint()
}

// ── Domain parameter generation ──────────────────────────────────────────────

/// Generate (p, q, g) with |p| = l_bits, |q| = n_bits. Slow (seconds); meant
/// for host setup and tests, never on the message path.
pub fn generate_parameters(l_bits: u64, n_bits: u64) -> (BigUint, BigUint, BigUint) {
    let q = random_prime(n_bits);
    loop {
        // p = q * m + 1 of the requested width
        let m = OsRng.gen_biguint(l_bits - n_bits);
        let p = &q * &m + BigUint::one();
        if p.bits() != l_bits || !is_probable_prime(&p, 30) {
            continue;
        }
        // g = h^((p-1)/q) mod p with order q
        let exp = (&p - BigUint::one()) / &q;
        loop {
            let h = OsRng.gen_biguint_range(&BigUint::from(2u8), &(&p - BigUint::one()));
            let g = h.modpow(&exp, &p);
            if !g.is_one() {
                return (p, q, g);
            }
        }
    }
}

fn random_prime(bits: u64) -> BigUint {
    loop {
        let mut c = OsRng.gen_biguint(bits);
        c.set_bit(bits - 1, true);
        c.set_bit(0, true);
        if is_probable_prime(&c, 30) {
            return c;
        }
    }
}

/// Miller-Rabin with random bases.
fn is_probable_prime(n: &BigUint, rounds: u32) -> bool {
    let one = BigUint::one();
    let two = BigUint::from(2u8);
    if *n < two {
        return false;
    }
    if n.is_even() {
        return *n == two;
    }
    // small-prime sieve first
    for sp in [3u32, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47] {
        let sp = BigUint::from(sp);
        if *n == sp {
            return true;
        }
        if (n % &sp).is_zero() {
            return false;
        }
    }
    let n_minus_one = n - &one;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;
    'witness: for _ in 0..rounds {
        let a = OsRng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x.is_one() || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Shared fixed parameters for processes that want cheap test keys. Each
/// call to `generate_parameters` costs seconds, so tests reuse one set.
pub fn shared_parameters() -> (BigUint, BigUint, BigUint) {
    use std::sync::OnceLock;
    static PARAMS: OnceLock<(BigUint, BigUint, BigUint)> = OnceLock::new();
    PARAMS.get_or_init(|| generate_parameters(1024, 160)).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::sha256;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = DsaKeyPair::generate_in(shared_parameters());
        let digest = sha256(b"the AKE transcript");
        let (r, s) = kp.sign(&digest);
        verify(&kp.public, &digest, &r, &s).unwrap();
    }

    #[test]
    fn tampered_digest_fails() {
        let kp = DsaKeyPair::generate_in(shared_parameters());
        let (r, s) = kp.sign(&sha256(b"original"));
        assert!(verify(&kp.public, &sha256(b"forged"), &r, &s).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let kp1 = DsaKeyPair::generate_in(shared_parameters());
        let kp2 = DsaKeyPair::generate_in(shared_parameters());
        let digest = sha256(b"message");
        let (r, s) = kp1.sign(&digest);
        assert!(verify(&kp2.public, &digest, &r, &s).is_err());
    }

    #[test]
    fn miller_rabin_basics() {
        assert!(is_probable_prime(&BigUint::from(65537u32), 20));
        assert!(!is_probable_prime(&BigUint::from(65535u32), 20));
    }
}
