//! v2/v3 four-flight authenticated key exchange.
//!
//! DH-Commit → DH-Key → Reveal-Signature → Signature, over the 1536-bit
//! group with DSA identity signatures. Every state carries a monotonic
//! timestamp so that master/slave reconciliation can pick the fresher
//! sub-state when a peer's instance tag is first observed.
//!
//! The DH-Commit race rule: a commit received while we ourselves are
//! committed is compared by hashed gx; the numerically larger commitment
//! wins and the loser's message is dropped (ours by abandoning, theirs by
//! resending ours).

use std::time::Instant;

use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::Zeroize;

use otr_crypto::aes_ctr::aes128_ctr;
use otr_crypto::dh::{modp1536, DhKeyPair};
use otr_crypto::dsa::{self, DsaKeyPair, DsaPublicKey};
use otr_crypto::kdf::{h2, hmac_sha256, hmac_sha256_160, sha256};
use otr_proto::codec::{Decoder, Encoder};
use otr_proto::message::{
    DhCommitMessage, DhKeyMessage, MessageBody, RevealSignatureMessage, SignatureMessage,
};
use otr_proto::version::Version;

use crate::error::OtrError;

/// Keys derived from the AKE shared secret, per the counted-hash schedule.
pub struct AkeKeys {
    pub ssid: [u8; 8],
    c: [u8; 16],
    cp: [u8; 16],
    m1: [u8; 32],
    m2: [u8; 32],
    m1p: [u8; 32],
    m2p: [u8; 32],
}

impl Drop for AkeKeys {
    fn drop(&mut self) {
        self.c.zeroize();
        self.cp.zeroize();
        self.m1.zeroize();
        self.m2.zeroize();
        self.m1p.zeroize();
        self.m2p.zeroize();
    }
}

impl Clone for AkeKeys {
    fn clone(&self) -> Self {
        Self {
            ssid: self.ssid,
            c: self.c,
            cp: self.cp,
            m1: self.m1,
            m2: self.m2,
            m1p: self.m1p,
            m2p: self.m2p,
        }
    }
}

fn derive_ake_keys(s: &BigUint) -> AkeKeys {
    let mut secbytes = Encoder::new();
    secbytes.write_mpi(s);
    let secbytes = secbytes.finish();
    let ssid_full = h2(0x00, &secbytes);
    let c_full = h2(0x01, &secbytes);
    AkeKeys {
        ssid: ssid_full[..8].try_into().unwrap(),
        c: c_full[..16].try_into().unwrap(),
        cp: c_full[16..].try_into().unwrap(),
        m1: h2(0x02, &secbytes),
        m2: h2(0x03, &secbytes),
        m1p: h2(0x04, &secbytes),
        m2p: h2(0x05, &secbytes),
    }
}

fn mpi_encoded(n: &BigUint) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.write_mpi(n);
    enc.finish()
}

#[derive(Clone)]
pub enum AuthState {
    None {
        timestamp: Instant,
    },
    AwaitingDhKey {
        our_dh: DhKeyPair,
        r: [u8; 16],
        our_commit: DhCommitMessage,
        timestamp: Instant,
    },
    AwaitingRevealSig {
        our_dh: DhKeyPair,
        their_commit: DhCommitMessage,
        timestamp: Instant,
    },
    AwaitingSig {
        our_dh: DhKeyPair,
        their_public: BigUint,
        keys: AkeKeys,
        last_reveal: RevealSignatureMessage,
        timestamp: Instant,
    },
}

impl AuthState {
    pub fn initial() -> Self {
        AuthState::None { timestamp: Instant::now() }
    }

    pub fn timestamp(&self) -> Instant {
        match self {
            AuthState::None { timestamp }
            | AuthState::AwaitingDhKey { timestamp, .. }
            | AuthState::AwaitingRevealSig { timestamp, .. }
            | AuthState::AwaitingSig { timestamp, .. } => *timestamp,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthState::None { .. } => "initial",
            AuthState::AwaitingDhKey { .. } => "awaiting-dhkey",
            AuthState::AwaitingRevealSig { .. } => "awaiting-revealsig",
            AuthState::AwaitingSig { .. } => "awaiting-sig",
        }
    }
}

/// Everything the messaging layer needs after a completed AKE.
pub struct AkeOutcome {
    pub version: Version,
    pub our_dh: DhKeyPair,
    pub our_key_id: u32,
    pub their_public: BigUint,
    pub their_key_id: u32,
    pub ssid: [u8; 8],
    pub their_dsa: DsaPublicKey,
}

/// Begin an exchange as initiator: commit to a fresh gx.
pub fn start(state: &mut AuthState) -> DhCommitMessage {
    let our_dh = DhKeyPair::generate(modp1536());
    let mut r = [0u8; 16];
    OsRng.fill_bytes(&mut r);
    let gx_mpi = mpi_encoded(&our_dh.public);
    let commit = DhCommitMessage {
        encrypted_gx: aes128_ctr(&r, &[0u8; 8], &gx_mpi),
        hashed_gx: sha256(&gx_mpi),
    };
    *state = AuthState::AwaitingDhKey {
        our_dh,
        r,
        our_commit: commit.clone(),
        timestamp: Instant::now(),
    };
    commit
}

/// DH-Commit resets to AwaitingRevealSig from any state, except when it
/// loses the race against our own outstanding commit.
pub fn handle_dh_commit(state: &mut AuthState, msg: &DhCommitMessage) -> Option<MessageBody> {
    if let AuthState::AwaitingDhKey { our_commit, .. } = state {
        let ours = BigUint::from_bytes_be(&our_commit.hashed_gx);
        let theirs = BigUint::from_bytes_be(&msg.hashed_gx);
        if ours > theirs {
            debug!("DH-Commit race won; resending our commit");
            return Some(MessageBody::DhCommit(our_commit.clone()));
        }
        debug!("DH-Commit race lost; abandoning our commit");
    }
    if let AuthState::AwaitingRevealSig { our_dh, their_commit, .. } = state {
        // replay with a refreshed commitment: keep gy, swap the stored commit
        *their_commit = msg.clone();
        return Some(MessageBody::DhKey(DhKeyMessage { gy: our_dh.public.clone() }));
    }
    let our_dh = DhKeyPair::generate(modp1536());
    let reply = DhKeyMessage { gy: our_dh.public.clone() };
    *state = AuthState::AwaitingRevealSig {
        our_dh,
        their_commit: msg.clone(),
        timestamp: Instant::now(),
    };
    Some(MessageBody::DhKey(reply))
}

/// DH-Key: produce the Reveal-Signature flight.
pub fn handle_dh_key(
    state: &mut AuthState,
    msg: &DhKeyMessage,
    local_dsa: &DsaKeyPair,
) -> Result<Option<MessageBody>, OtrError> {
    match state {
        AuthState::AwaitingDhKey { our_dh, r, .. } => {
            let s = our_dh.shared_secret(&msg.gy)?;
            let keys = derive_ake_keys(&s);
            let encrypted_signature =
                build_signature_payload(&keys.c, &keys.m1, &our_dh.public, &msg.gy, local_dsa);
            let reveal = RevealSignatureMessage {
                revealed_key: r.to_vec(),
                mac: mac_over_signature(&keys.m2, &encrypted_signature),
                encrypted_signature,
            };
            let our_dh = our_dh.clone();
            *state = AuthState::AwaitingSig {
                our_dh,
                their_public: msg.gy.clone(),
                keys,
                last_reveal: reveal.clone(),
                timestamp: Instant::now(),
            };
            Ok(Some(MessageBody::RevealSignature(reveal)))
        }
        AuthState::AwaitingSig { their_public, last_reveal, .. } if *their_public == msg.gy => {
            // retransmission of the same DH-Key: resend our reveal
            Ok(Some(MessageBody::RevealSignature(last_reveal.clone())))
        }
        _ => {
            debug!(state = state.name(), "ignoring DH-Key");
            Ok(None)
        }
    }
}

/// Reveal-Signature: verify the initiator, produce the final Signature
/// flight and the session outcome.
pub fn handle_reveal_signature(
    state: &mut AuthState,
    msg: &RevealSignatureMessage,
    local_dsa: &DsaKeyPair,
    version: Version,
) -> Result<Option<(MessageBody, AkeOutcome)>, OtrError> {
    let AuthState::AwaitingRevealSig { our_dh, their_commit, .. } = state else {
        debug!(state = state.name(), "ignoring Reveal-Signature");
        return Ok(None);
    };
    let r: [u8; 16] = msg
        .revealed_key
        .as_slice()
        .try_into()
        .map_err(|_| OtrError::MessageRejected("revealed key width".into()))?;
    let gx_mpi = aes128_ctr(&r, &[0u8; 8], &their_commit.encrypted_gx);
    if sha256(&gx_mpi) != their_commit.hashed_gx {
        return Err(OtrError::MessageRejected("gx commitment mismatch".into()));
    }
    let gx = Decoder::new(&gx_mpi)
        .read_mpi()
        .map_err(|_| OtrError::MessageRejected("gx not an MPI".into()))?;
    let s = our_dh.shared_secret(&gx)?;
    let keys = derive_ake_keys(&s);
    let (their_dsa, their_key_id) = verify_signature_payload(
        &keys.c,
        &keys.m1,
        &keys.m2,
        &gx,
        &our_dh.public,
        &msg.encrypted_signature,
        &msg.mac,
    )?;

    // our answering flight under the primed keys
    let encrypted_signature =
        build_signature_payload(&keys.cp, &keys.m1p, &our_dh.public, &gx, local_dsa);
    let reply = SignatureMessage {
        mac: mac_over_signature(&keys.m2p, &encrypted_signature),
        encrypted_signature,
    };
    let outcome = AkeOutcome {
        version,
        our_dh: our_dh.clone(),
        our_key_id: 1,
        their_public: gx,
        their_key_id,
        ssid: keys.ssid,
        their_dsa,
    };
    *state = AuthState::initial();
    Ok(Some((MessageBody::Signature(reply), outcome)))
}

/// Signature: verify the responder; the exchange completes.
pub fn handle_signature(
    state: &mut AuthState,
    msg: &SignatureMessage,
    version: Version,
) -> Result<Option<AkeOutcome>, OtrError> {
    let AuthState::AwaitingSig { our_dh, their_public, keys, .. } = state else {
        debug!(state = state.name(), "ignoring Signature");
        return Ok(None);
    };
    let (their_dsa, their_key_id) = verify_signature_payload(
        &keys.cp,
        &keys.m1p,
        &keys.m2p,
        their_public,
        &our_dh.public,
        &msg.encrypted_signature,
        &msg.mac,
    )?;
    let outcome = AkeOutcome {
        version,
        our_dh: our_dh.clone(),
        our_key_id: 1,
        their_public: their_public.clone(),
        their_key_id,
        ssid: keys.ssid,
        their_dsa,
    };
    *state = AuthState::initial();
    Ok(Some(outcome))
}

/// X = pub || keyid || sig(M), M = MAC_m1(our gx, their gy, pub, keyid),
/// AES-encrypted under `c`.
fn build_signature_payload(
    c: &[u8; 16],
    m1: &[u8; 32],
    our_public: &BigUint,
    their_public: &BigUint,
    local_dsa: &DsaKeyPair,
) -> Vec<u8> {
    const OUR_KEY_ID: u32 = 1;
    let mut m = Encoder::new();
    m.write_mpi(our_public);
    m.write_mpi(their_public);
    m.write_raw(&otr_proto::profile::encode_dsa_key(&local_dsa.public));
    m.write_u32(OUR_KEY_ID);
    let digest = hmac_sha256(m1, m.as_bytes());
    let (sig_r, sig_s) = local_dsa.sign(&digest);

    let mut x = Encoder::new();
    x.write_raw(&otr_proto::profile::encode_dsa_key(&local_dsa.public));
    x.write_u32(OUR_KEY_ID);
    x.write_raw(&sig_r);
    x.write_raw(&sig_s);
    aes128_ctr(c, &[0u8; 8], x.as_bytes())
}

fn mac_over_signature(m2: &[u8; 32], encrypted_signature: &[u8]) -> [u8; 20] {
    let mut framed = Encoder::new();
    framed.write_data(encrypted_signature);
    hmac_sha256_160(m2, framed.as_bytes())
}

/// Inverse of `build_signature_payload` for the peer's flight: their gx
/// comes first in M.
fn verify_signature_payload(
    c: &[u8; 16],
    m1: &[u8; 32],
    m2: &[u8; 32],
    their_public: &BigUint,
    our_public: &BigUint,
    encrypted_signature: &[u8],
    mac: &[u8; 20],
) -> Result<(DsaPublicKey, u32), OtrError> {
    let expected = mac_over_signature(m2, encrypted_signature);
    if !bool::from(expected.ct_eq(mac)) {
        return Err(OtrError::MessageRejected("AKE signature MAC mismatch".into()));
    }
    let x = aes128_ctr(c, &[0u8; 8], encrypted_signature);
    let mut dec = Decoder::new(&x);
    let their_dsa = otr_proto::profile::decode_dsa_key(&mut dec)
        .map_err(|_| OtrError::MessageRejected("bad DSA key in AKE payload".into()))?;
    let key_id = dec
        .read_u32()
        .map_err(|_| OtrError::MessageRejected("missing key id".into()))?;
    let sig_r = dec
        .read_raw(20)
        .map_err(|_| OtrError::MessageRejected("missing signature".into()))?
        .to_vec();
    let sig_s = dec
        .read_raw(20)
        .map_err(|_| OtrError::MessageRejected("missing signature".into()))?
        .to_vec();

    let mut m = Encoder::new();
    m.write_mpi(their_public);
    m.write_mpi(our_public);
    m.write_raw(&otr_proto::profile::encode_dsa_key(&their_dsa));
    m.write_u32(key_id);
    let digest = hmac_sha256(m1, m.as_bytes());
    dsa::verify(&their_dsa, &digest, &sig_r, &sig_s)
        .map_err(|_| OtrError::MessageRejected("AKE identity signature invalid".into()))?;
    Ok((their_dsa, key_id))
}
