//! MODP Diffie-Hellman groups.
//!
//! Two fixed groups, both RFC 3526, generator 2:
//! - 1536-bit (group 5): v2/v3 AKE, v3 session keys, mod-p SMP.
//! - 3072-bit (group 15): the v4 brace-key DH mixed into the Double Ratchet.
//!
//! Private exponents are best-effort wiped on drop; `BigUint` reallocates
//! internally, so the wipe overwrites the value rather than guaranteeing the
//! old limbs never hit freed memory.

use std::sync::OnceLock;

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::rngs::OsRng;

use crate::error::CryptoError;

/// One fixed multiplicative group mod p, generator 2.
pub struct ModpGroup {
    pub p: BigUint,
    pub g: BigUint,
    /// Subgroup order (p - 1) / 2; exponents for proofs are taken mod q.
    pub q: BigUint,
    /// Private exponent width in bits.
    exp_bits: u64,
}

const MODP_1536_HEX: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
83655D23DCA3AD961C62F356208552BB9ED529077096966D\
670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF";

const MODP_3072_HEX: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
83655D23DCA3AD961C62F356208552BB9ED529077096966D\
670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
15728E5A8AAAC42DAD33170D04507A33A85521ABDF1CBA64\
ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6B\
F12FFA06D98A0864D87602733EC86A64521F2B18177B200C\
BBE117577A615D6C770988C0BAD946E208E24FA074E5AB31\
43DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

fn group_from_hex(hex: &str, exp_bits: u64) -> ModpGroup {
    let p = BigUint::parse_bytes(hex.as_bytes(), 16).expect("static group modulus parses");
    let q = (&p - BigUint::one()) >> 1;
    ModpGroup { p, g: BigUint::from(2u8), q, exp_bits }
}

/// The 1536-bit group (v2/v3).
pub fn modp1536() -> &'static ModpGroup {
    static GROUP: OnceLock<ModpGroup> = OnceLock::new();
    GROUP.get_or_init(|| group_from_hex(MODP_1536_HEX, 320))
}

/// The 3072-bit group (v4 brace key).
pub fn modp3072() -> &'static ModpGroup {
    static GROUP: OnceLock<ModpGroup> = OnceLock::new();
    GROUP.get_or_init(|| group_from_hex(MODP_3072_HEX, 640))
}

impl ModpGroup {
    /// Accept only public values in [2, p-2]. Values outside leak the
    /// session secret or force it to a known subgroup.
    pub fn valid_public(&self, y: &BigUint) -> bool {
        let two = BigUint::from(2u8);
        *y >= two && *y <= &self.p - two
    }

    pub fn random_exponent(&self) -> BigUint {
        OsRng.gen_biguint(self.exp_bits)
    }
}

/// DH keypair in one of the fixed groups.
pub struct DhKeyPair {
    secret: BigUint,
    pub public: BigUint,
    group: &'static ModpGroup,
}

impl DhKeyPair {
    pub fn generate(group: &'static ModpGroup) -> Self {
        let secret = group.random_exponent();
        let public = group.g.modpow(&secret, &group.p);
        Self { secret, public, group }
    }

    pub fn shared_secret(&self, their_public: &BigUint) -> Result<BigUint, CryptoError> {
        if !self.group.valid_public(their_public) {
            return Err(CryptoError::InvalidKey("DH public value out of range".into()));
        }
        Ok(their_public.modpow(&self.secret, &self.group.p))
    }

    pub fn group(&self) -> &'static ModpGroup {
        self.group
    }
}

impl Drop for DhKeyPair {
    fn drop(&mut self) {
        self.secret.set_zero();
    }
}

impl Clone for DhKeyPair {
    fn clone(&self) -> Self {
        Self { secret: self.secret.clone(), public: self.public.clone(), group: self.group }
    }
}

/// Big-endian magnitude without leading zeros — the MPI body as OTR frames it.
pub fn mpi_bytes(n: &BigUint) -> Vec<u8> {
    if n.is_zero() {
        return Vec::new();
    }
    n.to_bytes_be()
}
