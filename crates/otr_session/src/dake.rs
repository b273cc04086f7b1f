//! v4 three-flight deniable AKE.
//!
//! Identity → Auth-R → Auth-I over Ed448 plus the 3072-bit group. Auth
//! flights carry ring signatures over an ordered triple of keys
//! (peer forging, own long-term, peer ephemeral), so a transcript proves
//! nothing about who produced it: the peer's forger or anyone holding the
//! ephemeral could have signed equally well.
//!
//! The query sender is the DAKE *initiator* (it sends Auth-R); the query
//! receiver *responds* with Identity. Both parties finish with the mixed
//! shared secret and a Double Ratchet rooted in it, seeded with the
//! first-ratchet keys exchanged in the flights.

use std::time::Instant;

use chrono::Utc;
use num_bigint::BigUint;
use tracing::debug;
use zeroize::Zeroize;

use otr_crypto::dh::{modp3072, mpi_bytes, DhKeyPair};
use otr_crypto::double_ratchet::DoubleRatchet;
use otr_crypto::ed448::{EcdhKeyPair, Point};
use otr_crypto::eddsa::Ed448KeyPair;
use otr_crypto::kdf::{shake_kdf, shake_kdf_64, usage};
use otr_crypto::ring_sig;
use otr_proto::codec::Encoder;
use otr_proto::message::{AuthIMessage, AuthRMessage, IdentityMessage};
use otr_proto::profile::ClientProfile;

use crate::error::OtrError;

#[derive(Clone)]
pub enum DakeState {
    None {
        timestamp: Instant,
    },
    AwaitingAuthR {
        y: EcdhKeyPair,
        b: DhKeyPair,
        first_ecdh: EcdhKeyPair,
        first_dh: DhKeyPair,
        our_profile: ClientProfile,
        timestamp: Instant,
    },
    AwaitingAuthI {
        shared_secret: [u8; 64],
        ssid: [u8; 8],
        our_first_ecdh: EcdhKeyPair,
        our_first_dh: DhKeyPair,
        their_first_ecdh: Point,
        their_first_dh: BigUint,
        their_profile: ClientProfile,
        transcript_i: Vec<u8>,
        ring_keys_i: [Point; 3],
        timestamp: Instant,
    },
}

impl Drop for DakeState {
    fn drop(&mut self) {
        if let DakeState::AwaitingAuthI { shared_secret, .. } = self {
            shared_secret.zeroize();
        }
    }
}

impl DakeState {
    pub fn initial() -> Self {
        DakeState::None { timestamp: Instant::now() }
    }

    pub fn timestamp(&self) -> Instant {
        match self {
            DakeState::None { timestamp }
            | DakeState::AwaitingAuthR { timestamp, .. }
            | DakeState::AwaitingAuthI { timestamp, .. } => *timestamp,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DakeState::None { .. } => "initial",
            DakeState::AwaitingAuthR { .. } => "awaiting-authr",
            DakeState::AwaitingAuthI { .. } => "awaiting-authi",
        }
    }
}

/// Session facts both parties can compute identically, mixed into the
/// transcripts: instance tags, account identifiers, first-ratchet keys.
pub struct Phi<'a> {
    pub initiator_tag: u32,
    pub responder_tag: u32,
    pub initiator_account: &'a str,
    pub responder_account: &'a str,
}

pub struct DakeOutcome {
    pub ssid: [u8; 8],
    pub ratchet: DoubleRatchet,
    pub their_profile: ClientProfile,
}

/// Respond to a query/tag: offer our profile and ephemerals.
pub fn start_identity(state: &mut DakeState, our_profile: ClientProfile) -> IdentityMessage {
    let y = EcdhKeyPair::generate();
    let b = DhKeyPair::generate(modp3072());
    let first_ecdh = EcdhKeyPair::generate();
    let first_dh = DhKeyPair::generate(modp3072());
    let msg = IdentityMessage {
        profile: our_profile.clone(),
        y: y.public,
        b: b.public.clone(),
        first_ecdh: first_ecdh.public,
        first_dh: first_dh.public.clone(),
    };
    *state = DakeState::AwaitingAuthR {
        y,
        b,
        first_ecdh,
        first_dh,
        our_profile,
        timestamp: Instant::now(),
    };
    msg
}

/// Initiator side: Identity arrived, produce Auth-R.
pub fn handle_identity(
    state: &mut DakeState,
    msg: &IdentityMessage,
    our_profile: &ClientProfile,
    longterm: &Ed448KeyPair,
    phi: &Phi<'_>,
) -> Result<AuthRMessage, OtrError> {
    msg.profile
        .validate(Utc::now())
        .map_err(|e| OtrError::MessageRejected(format!("peer profile: {e}")))?;

    let x = EcdhKeyPair::generate();
    let a = DhKeyPair::generate(modp3072());
    let first_ecdh = EcdhKeyPair::generate();
    let first_dh = DhKeyPair::generate(modp3072());

    let mut k_ecdh = x.shared_secret(&msg.y)?;
    let k_dh = a.shared_secret(&msg.b)?;
    let (shared_secret, ssid) = mix_shared_secret(&k_ecdh, &k_dh);
    k_ecdh.zeroize();

    let transcript_r = transcript(
        0x00,
        &msg.profile,
        our_profile,
        &msg.y,
        &x.public,
        &msg.b,
        &a.public,
        (&msg.first_ecdh, &msg.first_dh),
        (&first_ecdh.public, &first_dh.public),
        phi,
    );
    // ring: responder forging key, our long-term key, responder ephemeral
    let ring_r = [msg.profile.forging_key, our_profile.identity_key, msg.y];
    let sigma = longterm.ring_sign(1, &ring_r, &transcript_r)?;

    let transcript_i = transcript(
        0x01,
        &msg.profile,
        our_profile,
        &msg.y,
        &x.public,
        &msg.b,
        &a.public,
        (&msg.first_ecdh, &msg.first_dh),
        (&first_ecdh.public, &first_dh.public),
        phi,
    );
    let ring_keys_i = [our_profile.forging_key, msg.profile.identity_key, x.public];

    let reply = AuthRMessage {
        profile: our_profile.clone(),
        x: x.public,
        a: a.public.clone(),
        first_ecdh: first_ecdh.public,
        first_dh: first_dh.public.clone(),
        sigma,
    };
    *state = DakeState::AwaitingAuthI {
        shared_secret,
        ssid,
        our_first_ecdh: first_ecdh,
        our_first_dh: first_dh,
        their_first_ecdh: msg.first_ecdh,
        their_first_dh: msg.first_dh.clone(),
        their_profile: msg.profile.clone(),
        transcript_i,
        ring_keys_i,
        timestamp: Instant::now(),
    };
    Ok(reply)
}

/// Responder side: Auth-R arrived, verify and close with Auth-I.
pub fn handle_auth_r(
    state: &mut DakeState,
    msg: &AuthRMessage,
    longterm: &Ed448KeyPair,
    phi: &Phi<'_>,
) -> Result<Option<(AuthIMessage, DakeOutcome)>, OtrError> {
    let DakeState::AwaitingAuthR { y, b, first_ecdh, first_dh, our_profile, .. } = state else {
        debug!(state = state.name(), "ignoring Auth-R");
        return Ok(None);
    };
    msg.profile
        .validate(Utc::now())
        .map_err(|e| OtrError::MessageRejected(format!("peer profile: {e}")))?;

    let transcript_r = transcript(
        0x00,
        our_profile,
        &msg.profile,
        &y.public,
        &msg.x,
        &b.public,
        &msg.a,
        (&first_ecdh.public, &first_dh.public),
        (&msg.first_ecdh, &msg.first_dh),
        phi,
    );
    let ring_r = [our_profile.forging_key, msg.profile.identity_key, y.public];
    ring_sig::verify(&ring_r, &transcript_r, &msg.sigma)
        .map_err(|_| OtrError::MessageRejected("Auth-R ring signature invalid".into()))?;

    let mut k_ecdh = y.shared_secret(&msg.x)?;
    let k_dh = b.shared_secret(&msg.a)?;
    let (shared_secret, ssid) = mix_shared_secret(&k_ecdh, &k_dh);
    k_ecdh.zeroize();

    let transcript_i = transcript(
        0x01,
        our_profile,
        &msg.profile,
        &y.public,
        &msg.x,
        &b.public,
        &msg.a,
        (&first_ecdh.public, &first_dh.public),
        (&msg.first_ecdh, &msg.first_dh),
        phi,
    );
    let ring_i = [msg.profile.forging_key, our_profile.identity_key, msg.x];
    let sigma = longterm.ring_sign(1, &ring_i, &transcript_i)?;

    let ratchet = DoubleRatchet::responder(
        &shared_secret,
        first_ecdh.clone(),
        first_dh.clone(),
        msg.first_ecdh,
        msg.first_dh.clone(),
    );
    let outcome =
        DakeOutcome { ssid, ratchet, their_profile: msg.profile.clone() };
    *state = DakeState::initial();
    Ok(Some((AuthIMessage { sigma }, outcome)))
}

/// Initiator side: Auth-I arrived, verify and finish.
pub fn handle_auth_i(
    state: &mut DakeState,
    msg: &AuthIMessage,
) -> Result<Option<DakeOutcome>, OtrError> {
    let DakeState::AwaitingAuthI {
        shared_secret,
        ssid,
        our_first_ecdh,
        our_first_dh,
        their_first_ecdh,
        their_first_dh,
        their_profile,
        transcript_i,
        ring_keys_i,
        ..
    } = state
    else {
        debug!(state = state.name(), "ignoring Auth-I");
        return Ok(None);
    };
    ring_sig::verify(ring_keys_i, transcript_i, &msg.sigma)
        .map_err(|_| OtrError::MessageRejected("Auth-I ring signature invalid".into()))?;

    let ratchet = DoubleRatchet::initiator(
        shared_secret,
        our_first_ecdh.clone(),
        our_first_dh.clone(),
        *their_first_ecdh,
        their_first_dh.clone(),
    );
    let outcome = DakeOutcome { ssid: *ssid, ratchet, their_profile: their_profile.clone() };
    shared_secret.zeroize();
    *state = DakeState::initial();
    Ok(Some(outcome))
}

fn mix_shared_secret(k_ecdh: &[u8; 57], k_dh: &BigUint) -> ([u8; 64], [u8; 8]) {
    let mut input = Vec::with_capacity(57 + 384);
    input.extend_from_slice(k_ecdh);
    input.extend_from_slice(&mpi_bytes(k_dh));
    let shared = shake_kdf_64(usage::SHARED_SECRET, &input);
    input.zeroize();
    let mut ssid = [0u8; 8];
    shake_kdf(usage::SSID, &shared, &mut ssid);
    (shared, ssid)
}

/// `prefix || H(responder profile) || H(initiator profile) || Y || X ||
/// B || A || first-ratchet keys || phi`.
#[allow(clippy::too_many_arguments)]
fn transcript(
    prefix: u8,
    responder_profile: &ClientProfile,
    initiator_profile: &ClientProfile,
    y: &Point,
    x: &Point,
    b: &BigUint,
    a: &BigUint,
    responder_first: (&Point, &BigUint),
    initiator_first: (&Point, &BigUint),
    phi: &Phi<'_>,
) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.write_u8(prefix);
    enc.write_raw(&profile_hash(responder_profile));
    enc.write_raw(&profile_hash(initiator_profile));
    enc.write_point(y);
    enc.write_point(x);
    enc.write_mpi(b);
    enc.write_mpi(a);
    enc.write_point(responder_first.0);
    enc.write_mpi(responder_first.1);
    enc.write_point(initiator_first.0);
    enc.write_mpi(initiator_first.1);
    enc.write_raw(&phi_hash(phi));
    enc.finish()
}

fn profile_hash(profile: &ClientProfile) -> [u8; 64] {
    let mut enc = Encoder::new();
    profile.encode(&mut enc);
    shake_kdf_64(usage::PROFILE_HASH, enc.as_bytes())
}

fn phi_hash(phi: &Phi<'_>) -> [u8; 64] {
    let mut enc = Encoder::new();
    enc.write_u32(phi.initiator_tag);
    enc.write_u32(phi.responder_tag);
    enc.write_data(phi.initiator_account.as_bytes());
    enc.write_data(phi.responder_account.as_bytes());
    shake_kdf_64(usage::PHI, enc.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use otr_proto::version::Version;

    struct Party {
        longterm: Ed448KeyPair,
        profile: ClientProfile,
    }

    fn party(tag: u32) -> Party {
        let longterm = Ed448KeyPair::generate();
        let forging = Ed448KeyPair::generate();
        let profile = ClientProfile::new_signed(
            tag,
            &longterm,
            forging.public,
            vec![Version::Four],
            ClientProfile::default_expiry(Utc::now()),
            None,
        );
        Party { longterm, profile }
    }

    fn run_dake() -> (DakeOutcome, DakeOutcome) {
        let alice = party(0x1aaa);
        let bob = party(0x1bbb);
        let phi = Phi {
            initiator_tag: 0x1aaa,
            responder_tag: 0x1bbb,
            initiator_account: "alice@net",
            responder_account: "bob@net",
        };
        let mut alice_state = DakeState::initial();
        let mut bob_state = DakeState::initial();

        let identity = start_identity(&mut bob_state, bob.profile.clone());
        let auth_r =
            handle_identity(&mut alice_state, &identity, &alice.profile, &alice.longterm, &phi)
                .unwrap();
        let (auth_i, bob_outcome) =
            handle_auth_r(&mut bob_state, &auth_r, &bob.longterm, &phi)
                .unwrap()
                .expect("responder completes");
        let alice_outcome = handle_auth_i(&mut alice_state, &auth_i)
            .unwrap()
            .expect("initiator completes");
        (alice_outcome, bob_outcome)
    }

    #[test]
    fn three_flights_agree_on_ssid() {
        let (alice, bob) = run_dake();
        assert_eq!(alice.ssid, bob.ssid);
    }

    #[test]
    fn ratchets_interoperate_after_dake() {
        let (mut alice, mut bob) = run_dake();
        let (header, keys) = alice.ratchet.prepare_send().unwrap();
        let ct = otr_crypto::double_ratchet::encrypt_payload(&keys, b"first message");
        let mut region = b"region".to_vec();
        region.extend_from_slice(&ct);
        let auth = otr_crypto::double_ratchet::authenticator(&keys, &region);
        let (pt, _) = bob
            .ratchet
            .open(
                header.ratchet_id,
                header.message_id,
                header.prev_chain_len,
                &header.ecdh,
                header.dh.as_ref(),
                &region,
                &ct,
                &auth,
            )
            .unwrap();
        assert_eq!(pt, b"first message");
    }

    #[test]
    fn mismatched_signer_cannot_produce_auth_r() {
        let alice = party(0x1aaa);
        let bob = party(0x1bbb);
        let mallory = party(0x1ccc);
        let phi = Phi {
            initiator_tag: 0x1aaa,
            responder_tag: 0x1bbb,
            initiator_account: "alice@net",
            responder_account: "bob@net",
        };
        let mut alice_state = DakeState::initial();
        let mut bob_state = DakeState::initial();
        let identity = start_identity(&mut bob_state, bob.profile.clone());
        // the ring slot names alice's long-term key; mallory's secret does
        // not fit the slot and signing fails outright
        assert!(handle_identity(
            &mut alice_state,
            &identity,
            &alice.profile,
            &mallory.longterm,
            &phi
        )
        .is_err());
    }

    #[test]
    fn tampered_sigma_rejected() {
        let alice = party(0x1aaa);
        let bob = party(0x1bbb);
        let phi = Phi {
            initiator_tag: 0x1aaa,
            responder_tag: 0x1bbb,
            initiator_account: "alice@net",
            responder_account: "bob@net",
        };
        let mut alice_state = DakeState::initial();
        let mut bob_state = DakeState::initial();
        let identity = start_identity(&mut bob_state, bob.profile.clone());
        let mut auth_r =
            handle_identity(&mut alice_state, &identity, &alice.profile, &alice.longterm, &phi)
                .unwrap();
        auth_r.sigma.c1 = auth_r.sigma.c2;
        assert!(handle_auth_r(&mut bob_state, &auth_r, &bob.longterm, &phi).is_err());
    }

    #[test]
    fn stray_auth_i_ignored() {
        let alice = party(0x1aaa);
        let bob = party(0x1bbb);
        let phi = Phi {
            initiator_tag: 0x1aaa,
            responder_tag: 0x1bbb,
            initiator_account: "alice@net",
            responder_account: "bob@net",
        };
        let mut alice_state = DakeState::initial();
        let mut bob_state = DakeState::initial();
        let identity = start_identity(&mut bob_state, bob.profile.clone());
        let auth_r =
            handle_identity(&mut alice_state, &identity, &alice.profile, &alice.longterm, &phi)
                .unwrap();
        let (auth_i, _) = handle_auth_r(&mut bob_state, &auth_r, &bob.longterm, &phi)
            .unwrap()
            .unwrap();
        // an Auth-I delivered to a fresh state is dropped without effect
        let mut stray = DakeState::initial();
        assert!(handle_auth_i(&mut stray, &auth_i).unwrap().is_none());
        assert!(matches!(stray, DakeState::None { .. }));
    }
}
