//! v4 Double Ratchet with mixed ECDH/DH rotations.
//!
//! State separation:
//!   root key        — updated on every rotation
//!   sending chain   — advanced per outbound message (index `j`)
//!   receiving chain — advanced per inbound message (index `k`)
//!   brace key       — 3072-bit DH contribution; refreshed from a fresh DH
//!                     pair on every third ratchet, hashed forward otherwise
//!
//! Rotation direction strictly alternates. A receiving rotation is performed
//! on a clone of the state and committed only once the message's
//! authenticator verifies, so a forged header can never desynchronize the
//! ratchet. Skipped message keys are stored under `(ratchet, message)` in a
//! bounded map; every used or evicted receiving key contributes its MAC half
//! to the reveal set.

use std::collections::BTreeMap;

use num_bigint::BigUint;
use num_traits::Zero;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::aes_ctr::aes256_ctr_zero;
use crate::dh::{modp3072, mpi_bytes, DhKeyPair};
use crate::ed448::{EcdhKeyPair, Point};
use crate::error::CryptoError;
use crate::kdf::{shake_kdf_32, shake_kdf_64, usage};

/// Total skipped keys retained; eldest evicted first.
pub const MAX_SKIPPED_KEYS: usize = 256;
/// Largest forward jump inside one chain a single message may demand.
pub const MAX_CHAIN_SKIP: u32 = 256;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Sending,
    Receiving,
}

/// Keys for exactly one message. Zeroized on drop.
pub struct MessageKeys {
    pub enc: [u8; 32],
    pub mac: [u8; 64],
    pub extra: [u8; 32],
}

impl Drop for MessageKeys {
    fn drop(&mut self) {
        self.enc.zeroize();
        self.mac.zeroize();
        self.extra.zeroize();
    }
}

impl Clone for MessageKeys {
    fn clone(&self) -> Self {
        Self { enc: self.enc, mac: self.mac, extra: self.extra }
    }
}

/// Header fields the ratchet dictates for an outbound message.
pub struct RatchetHeader {
    pub ratchet_id: u32,
    pub message_id: u32,
    pub prev_chain_len: u32,
    pub ecdh: Point,
    /// Present exactly on every-third-ratchet chains.
    pub dh: Option<BigUint>,
}

pub struct DoubleRatchet {
    root_key: [u8; 64],
    our_ecdh: EcdhKeyPair,
    our_dh: DhKeyPair,
    their_ecdh: Point,
    their_dh: BigUint,
    brace_key: [u8; 32],
    sending_chain: [u8; 64],
    receiving_chain: [u8; 64],
    /// Completed rotations; the chain created by rotation n has id n.
    i: u32,
    j: u32,
    k: u32,
    pn: u32,
    recv_chain_id: Option<u32>,
    next_rotation: Direction,
    skipped: BTreeMap<(u32, u32), MessageKeys>,
    reveals: Vec<[u8; 64]>,
}

impl Clone for DoubleRatchet {
    fn clone(&self) -> Self {
        Self {
            root_key: self.root_key,
            our_ecdh: self.our_ecdh.clone(),
            our_dh: self.our_dh.clone(),
            their_ecdh: self.their_ecdh,
            their_dh: self.their_dh.clone(),
            brace_key: self.brace_key,
            sending_chain: self.sending_chain,
            receiving_chain: self.receiving_chain,
            i: self.i,
            j: self.j,
            k: self.k,
            pn: self.pn,
            recv_chain_id: self.recv_chain_id,
            next_rotation: self.next_rotation,
            skipped: self.skipped.clone(),
            reveals: self.reveals.clone(),
        }
    }
}

impl DoubleRatchet {
    /// Chain 0 is derived straight from the handshake secret and belongs to
    /// the handshake responder, so either party may speak first: the
    /// responder sends on chain 0 without rotating, the initiator's first
    /// send creates chain 1. From there rotation direction strictly
    /// alternates.
    fn new(
        shared_secret: &[u8; 64],
        our_ecdh: EcdhKeyPair,
        our_dh: DhKeyPair,
        their_ecdh: Point,
        their_dh: BigUint,
        next_rotation: Direction,
    ) -> Self {
        let chain0 = shake_kdf_64(usage::CHAIN_KEY, shared_secret);
        let mut ratchet = Self {
            root_key: shake_kdf_64(usage::FIRST_ROOT_KEY, shared_secret),
            brace_key: shake_kdf_32(usage::FIRST_BRACE_KEY, shared_secret),
            our_ecdh,
            our_dh,
            their_ecdh,
            their_dh,
            sending_chain: [0u8; 64],
            receiving_chain: [0u8; 64],
            i: 1,
            j: 0,
            k: 0,
            pn: 0,
            recv_chain_id: None,
            next_rotation,
            skipped: BTreeMap::new(),
            reveals: Vec::new(),
        };
        match next_rotation {
            // handshake initiator: chain 0 is the peer's sending chain
            Direction::Sending => {
                ratchet.receiving_chain = chain0;
                ratchet.recv_chain_id = Some(0);
            }
            // handshake responder: chain 0 is ours
            Direction::Receiving => ratchet.sending_chain = chain0,
        }
        ratchet
    }

    /// The handshake initiator (Auth-R sender); its first send creates
    /// chain 1.
    pub fn initiator(
        shared_secret: &[u8; 64],
        our_ecdh: EcdhKeyPair,
        our_dh: DhKeyPair,
        their_ecdh: Point,
        their_dh: BigUint,
    ) -> Self {
        Self::new(shared_secret, our_ecdh, our_dh, their_ecdh, their_dh, Direction::Sending)
    }

    /// The handshake responder (Identity sender); it owns chain 0 and may
    /// send on it immediately.
    pub fn responder(
        shared_secret: &[u8; 64],
        our_ecdh: EcdhKeyPair,
        our_dh: DhKeyPair,
        their_ecdh: Point,
        their_dh: BigUint,
    ) -> Self {
        Self::new(shared_secret, our_ecdh, our_dh, their_ecdh, their_dh, Direction::Receiving)
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Header and keys for the next outbound message; rotates first when it
    /// is our turn.
    pub fn prepare_send(&mut self) -> Result<(RatchetHeader, MessageKeys), CryptoError> {
        if self.next_rotation == Direction::Sending {
            self.rotate_sending()?;
        }
        let chain_id = self.i - 1;
        let keys = advance_chain(&mut self.sending_chain);
        let header = RatchetHeader {
            ratchet_id: chain_id,
            message_id: self.j,
            prev_chain_len: self.pn,
            ecdh: self.our_ecdh.public,
            // chain 0 is handshake-derived and needs no DH contribution
            dh: (chain_id % 3 == 0 && chain_id != 0).then(|| self.our_dh.public.clone()),
        };
        self.j += 1;
        Ok((header, keys))
    }

    fn rotate_sending(&mut self) -> Result<(), CryptoError> {
        let chain_id = self.i;
        if chain_id % 3 == 0 {
            self.our_dh = DhKeyPair::generate(modp3072());
            let k_dh = self.our_dh.shared_secret(&self.their_dh)?;
            self.brace_key = shake_kdf_32(usage::THIRD_BRACE_KEY, &mpi_bytes(&k_dh));
        } else {
            self.brace_key = shake_kdf_32(usage::BRACE_KEY, &self.brace_key);
        }
        self.our_ecdh = EcdhKeyPair::generate();
        let k_ecdh = self.our_ecdh.shared_secret(&self.their_ecdh)?;
        self.mix_root(&k_ecdh, Direction::Sending);
        self.pn = self.j;
        self.j = 0;
        self.i += 1;
        self.next_rotation = Direction::Receiving;
        Ok(())
    }

    fn mix_root(&mut self, k_ecdh: &[u8; 57], direction: Direction) {
        let mut shared = Vec::with_capacity(57 + 32);
        shared.extend_from_slice(k_ecdh);
        shared.extend_from_slice(&self.brace_key);
        let mixed = shake_kdf_64(usage::SHARED_SECRET, &shared);
        shared.zeroize();

        let mut root_input = Vec::with_capacity(64 + 64);
        root_input.extend_from_slice(&self.root_key);
        root_input.extend_from_slice(&mixed);
        let chain = shake_kdf_64(usage::CHAIN_KEY, &root_input);
        self.root_key = shake_kdf_64(usage::ROOT_KEY, &root_input);
        root_input.zeroize();
        match direction {
            Direction::Sending => self.sending_chain = chain,
            Direction::Receiving => self.receiving_chain = chain,
        }
    }

    /// Extra symmetric key of the current sending chain (TLV use).
    pub fn extra_symmetric_key(&self) -> [u8; 32] {
        shake_kdf_32(usage::EXTRA_SYMMETRIC_KEY, &self.sending_chain)
    }

    // ── Receiving ────────────────────────────────────────────────────────

    /// Authenticate and decrypt an inbound message. All state mutation is
    /// committed only after the authenticator verifies; a failed message
    /// leaves the ratchet untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &mut self,
        ratchet_id: u32,
        message_id: u32,
        prev_chain_len: u32,
        ecdh: &Point,
        dh: Option<&BigUint>,
        region: &[u8],
        ciphertext: &[u8],
        auth: &[u8; 64],
    ) -> Result<(Vec<u8>, [u8; 32]), CryptoError> {
        if ratchet_id > self.i {
            return Err(CryptoError::RatchetStep(format!(
                "ratchet {ratchet_id} skips ahead of {}",
                self.i
            )));
        }
        if ratchet_id == self.i {
            // a chain we have not adopted yet: requires a receiving rotation
            if self.next_rotation != Direction::Receiving {
                return Err(CryptoError::RatchetStep("rotation direction mismatch".into()));
            }
            let mut provisional = self.clone();
            provisional.skip_current_chain(prev_chain_len)?;
            provisional.rotate_receiving(ratchet_id, ecdh, dh)?;
            let keys = provisional.advance_receiving_to(ratchet_id, message_id)?;
            let plaintext = verify_and_decrypt(&keys, region, ciphertext, auth)?;
            provisional.reveals.push(keys.mac);
            *self = provisional;
            return Ok((plaintext, keys.extra));
        }
        if self.recv_chain_id == Some(ratchet_id) && message_id >= self.k {
            let mut provisional = self.clone();
            let keys = provisional.advance_receiving_to(ratchet_id, message_id)?;
            let plaintext = verify_and_decrypt(&keys, region, ciphertext, auth)?;
            provisional.reveals.push(keys.mac);
            *self = provisional;
            return Ok((plaintext, keys.extra));
        }
        // an older chain, or an already-passed index: stored keys only
        let keys = self
            .skipped
            .get(&(ratchet_id, message_id))
            .cloned()
            .ok_or(CryptoError::MissingMessageKey(ratchet_id, message_id))?;
        let plaintext = verify_and_decrypt(&keys, region, ciphertext, auth)?;
        // single use: the key is gone the moment it decrypts something
        self.skipped.remove(&(ratchet_id, message_id));
        self.reveals.push(keys.mac);
        Ok((plaintext, keys.extra))
    }

    fn rotate_receiving(
        &mut self,
        ratchet_id: u32,
        ecdh: &Point,
        dh: Option<&BigUint>,
    ) -> Result<(), CryptoError> {
        if ratchet_id % 3 == 0 {
            let dh = dh.ok_or_else(|| {
                CryptoError::RatchetStep("missing DH contribution on third ratchet".into())
            })?;
            if !modp3072().valid_public(dh) {
                return Err(CryptoError::InvalidKey("ratchet DH public out of range".into()));
            }
            self.their_dh = dh.clone();
            let k_dh = self.our_dh.shared_secret(&self.their_dh)?;
            self.brace_key = shake_kdf_32(usage::THIRD_BRACE_KEY, &mpi_bytes(&k_dh));
        } else {
            self.brace_key = shake_kdf_32(usage::BRACE_KEY, &self.brace_key);
        }
        self.their_ecdh = *ecdh;
        let k_ecdh = self.our_ecdh.shared_secret(ecdh)?;
        self.mix_root(&k_ecdh, Direction::Receiving);
        self.k = 0;
        self.recv_chain_id = Some(ratchet_id);
        self.i += 1;
        self.next_rotation = Direction::Sending;
        Ok(())
    }

    /// Store keys for the unconsumed tail of the current receiving chain
    /// before rotating past it.
    fn skip_current_chain(&mut self, prev_chain_len: u32) -> Result<(), CryptoError> {
        let chain_id = match self.recv_chain_id {
            Some(id) => id,
            None => return Ok(()),
        };
        if prev_chain_len > self.k && prev_chain_len - self.k > MAX_CHAIN_SKIP {
            return Err(CryptoError::RotationLimitation);
        }
        while self.k < prev_chain_len {
            let keys = advance_chain(&mut self.receiving_chain);
            self.store_skipped(chain_id, self.k, keys);
            self.k += 1;
        }
        Ok(())
    }

    /// Advance the receiving chain up to `message_id`, storing intermediate
    /// keys, and return the keys for `message_id` itself.
    fn advance_receiving_to(
        &mut self,
        chain_id: u32,
        message_id: u32,
    ) -> Result<MessageKeys, CryptoError> {
        if message_id < self.k {
            return Err(CryptoError::MissingMessageKey(chain_id, message_id));
        }
        if message_id - self.k > MAX_CHAIN_SKIP {
            return Err(CryptoError::RotationLimitation);
        }
        while self.k < message_id {
            let keys = advance_chain(&mut self.receiving_chain);
            self.store_skipped(chain_id, self.k, keys);
            self.k += 1;
        }
        let keys = advance_chain(&mut self.receiving_chain);
        self.k += 1;
        Ok(keys)
    }

    fn store_skipped(&mut self, chain_id: u32, message_id: u32, keys: MessageKeys) {
        self.skipped.insert((chain_id, message_id), keys);
        while self.skipped.len() > MAX_SKIPPED_KEYS {
            // eldest (smallest ratchet/message pair) goes first; its MAC half
            // is revealed so dropped traffic stays deniable
            if let Some((_, evicted)) = self.skipped.pop_first() {
                self.reveals.push(evicted.mac);
            }
        }
    }

    // ── Reveal bookkeeping ───────────────────────────────────────────────

    /// Drain MAC reveals to attach to the next outbound message.
    pub fn collect_reveals(&mut self) -> Vec<[u8; 64]> {
        std::mem::take(&mut self.reveals)
    }

    /// Remaining reveals plus all stored skipped-key MACs; for the
    /// disconnect message when the session ends.
    pub fn drain_all_reveals(&mut self) -> Vec<[u8; 64]> {
        let mut out = std::mem::take(&mut self.reveals);
        let skipped = std::mem::take(&mut self.skipped);
        for (_, keys) in skipped {
            out.push(keys.mac);
        }
        out
    }
}

impl Drop for DoubleRatchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.brace_key.zeroize();
        self.sending_chain.zeroize();
        self.receiving_chain.zeroize();
        self.their_dh.set_zero();
        for r in &mut self.reveals {
            r.zeroize();
        }
    }
}

/// One symmetric step: message keys out, chain key replaced.
fn advance_chain(chain: &mut [u8; 64]) -> MessageKeys {
    let enc = shake_kdf_32(usage::MESSAGE_KEY, chain);
    let mac = shake_kdf_64(usage::MAC_KEY, &enc);
    let extra = shake_kdf_32(usage::EXTRA_SYMMETRIC_KEY, chain);
    *chain = shake_kdf_64(usage::NEXT_CHAIN_KEY, chain);
    MessageKeys { enc, mac, extra }
}

/// AES-256-CTR under the single-use message key.
pub fn encrypt_payload(keys: &MessageKeys, plaintext: &[u8]) -> Vec<u8> {
    aes256_ctr_zero(&keys.enc, plaintext)
}

/// SHAKE authenticator over the authenticated message region (header fields
/// through ciphertext, as the wire lays them out).
pub fn authenticator(keys: &MessageKeys, region: &[u8]) -> [u8; 64] {
    let mut input = Vec::with_capacity(64 + region.len());
    input.extend_from_slice(&keys.mac);
    input.extend_from_slice(region);
    shake_kdf_64(usage::AUTHENTICATOR, &input)
}

fn verify_and_decrypt(
    keys: &MessageKeys,
    region: &[u8],
    ciphertext: &[u8],
    auth: &[u8; 64],
) -> Result<Vec<u8>, CryptoError> {
    let expected = authenticator(keys, region);
    if expected.ct_eq(auth).into() {
        Ok(aes256_ctr_zero(&keys.enc, ciphertext))
    } else {
        Err(CryptoError::MacMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ed448::EcdhKeyPair;

    fn pair() -> (DoubleRatchet, DoubleRatchet) {
        let shared = [0x5au8; 64];
        let alice_ecdh = EcdhKeyPair::generate();
        let alice_dh = DhKeyPair::generate(modp3072());
        let bob_ecdh = EcdhKeyPair::generate();
        let bob_dh = DhKeyPair::generate(modp3072());
        let alice = DoubleRatchet::initiator(
            &shared,
            alice_ecdh.clone(),
            alice_dh.clone(),
            bob_ecdh.public,
            bob_dh.public.clone(),
        );
        let bob = DoubleRatchet::responder(
            &shared,
            bob_ecdh,
            bob_dh,
            alice_ecdh.public,
            alice_dh.public,
        );
        (alice, bob)
    }

    /// The region covers header bytes and ciphertext, as the wire does.
    fn region_for(ct: &[u8]) -> Vec<u8> {
        let mut region = b"hdr".to_vec();
        region.extend_from_slice(ct);
        region
    }

    fn send(r: &mut DoubleRatchet, plaintext: &[u8]) -> (RatchetHeader, Vec<u8>, [u8; 64]) {
        let (header, keys) = r.prepare_send().unwrap();
        let ct = encrypt_payload(&keys, plaintext);
        let auth = authenticator(&keys, &region_for(&ct));
        (header, ct, auth)
    }

    fn recv(
        r: &mut DoubleRatchet,
        (header, ct, auth): &(RatchetHeader, Vec<u8>, [u8; 64]),
    ) -> Result<Vec<u8>, CryptoError> {
        r.open(
            header.ratchet_id,
            header.message_id,
            header.prev_chain_len,
            &header.ecdh,
            header.dh.as_ref(),
            &region_for(ct),
            ct,
            auth,
        )
        .map(|(pt, _)| pt)
    }

    #[test]
    fn conversation_roundtrip() {
        let (mut alice, mut bob) = pair();
        for turn in 0..4 {
            for n in 0..3 {
                let text = format!("turn {turn} msg {n}");
                let m = send(&mut alice, text.as_bytes());
                assert_eq!(recv(&mut bob, &m).unwrap(), text.as_bytes());
            }
            std::mem::swap(&mut alice, &mut bob);
        }
    }

    #[test]
    fn out_of_order_within_chain() {
        let (mut alice, mut bob) = pair();
        let m0 = send(&mut alice, b"zero");
        let m1 = send(&mut alice, b"one");
        let m2 = send(&mut alice, b"two");
        assert_eq!(recv(&mut bob, &m2).unwrap(), b"two");
        assert_eq!(recv(&mut bob, &m0).unwrap(), b"zero");
        assert_eq!(recv(&mut bob, &m1).unwrap(), b"one");
    }

    #[test]
    fn message_key_is_single_use() {
        let (mut alice, mut bob) = pair();
        let m0 = send(&mut alice, b"zero");
        let m1 = send(&mut alice, b"one");
        assert_eq!(recv(&mut bob, &m1).unwrap(), b"one");
        assert_eq!(recv(&mut bob, &m0).unwrap(), b"zero");
        // replay of a consumed skipped key must fail
        assert!(matches!(
            recv(&mut bob, &m0),
            Err(CryptoError::MissingMessageKey(_, _))
        ));
    }

    #[test]
    fn forged_message_leaves_state_untouched() {
        let (mut alice, mut bob) = pair();
        let good = send(&mut alice, b"legit");
        // forgery pointing at the same rotation with random keys
        let forged_ecdh = EcdhKeyPair::generate().public;
        let forged_dh = DhKeyPair::generate(modp3072()).public;
        let err = bob.open(
            good.0.ratchet_id,
            good.0.message_id,
            good.0.prev_chain_len,
            &forged_ecdh,
            Some(&forged_dh),
            &region_for(b"garbage ciphertext"),
            b"garbage ciphertext",
            &[0u8; 64],
        );
        assert!(matches!(err, Err(CryptoError::MacMismatch)));
        // the legitimate message still decrypts
        assert_eq!(recv(&mut bob, &good).unwrap(), b"legit");
    }

    #[test]
    fn reveals_accumulate_for_used_keys() {
        let (mut alice, mut bob) = pair();
        let m0 = send(&mut alice, b"zero");
        recv(&mut bob, &m0).unwrap();
        assert_eq!(bob.collect_reveals().len(), 1);
        assert!(bob.collect_reveals().is_empty());
    }

    #[test]
    fn responder_can_send_first_on_chain_zero() {
        let (mut alice, mut bob) = pair();
        // bob is the handshake responder in pair(): chain 0 is his
        let m = send(&mut bob, b"responder speaks first");
        assert_eq!(m.0.ratchet_id, 0);
        assert!(m.0.dh.is_none());
        assert_eq!(recv(&mut alice, &m).unwrap(), b"responder speaks first");
    }

    #[test]
    fn simultaneous_first_sends_cross_safely() {
        let (mut alice, mut bob) = pair();
        let from_alice = send(&mut alice, b"from alice");
        let from_bob = send(&mut bob, b"from bob");
        assert_eq!(recv(&mut bob, &from_alice).unwrap(), b"from alice");
        assert_eq!(recv(&mut alice, &from_bob).unwrap(), b"from bob");
    }

    #[test]
    fn every_third_chain_carries_dh() {
        let (mut alice, mut bob) = pair();
        // chain 1 (alice's first) has no DH contribution
        let m = send(&mut alice, b"a");
        assert_eq!((m.0.ratchet_id, m.0.dh.is_some()), (1, false));
        recv(&mut bob, &m).unwrap();
        // chain 2 (bob)
        let m = send(&mut bob, b"b");
        assert_eq!((m.0.ratchet_id, m.0.dh.is_some()), (2, false));
        recv(&mut alice, &m).unwrap();
        // chain 3 (alice) refreshes the brace key with a fresh DH
        let m = send(&mut alice, b"c");
        assert_eq!((m.0.ratchet_id, m.0.dh.is_some()), (3, true));
        recv(&mut bob, &m).unwrap();
        // chain 4 (bob) hashes the brace key forward again
        let m = send(&mut bob, b"d");
        assert_eq!((m.0.ratchet_id, m.0.dh.is_some()), (4, false));
        recv(&mut alice, &m).unwrap();
    }

    #[test]
    fn drain_takes_stored_skipped_macs_too() {
        let (mut alice, mut bob) = pair();
        let _m0 = send(&mut alice, b"never delivered");
        let m1 = send(&mut alice, b"delivered");
        recv(&mut bob, &m1).unwrap();
        // one reveal for the used key, one for the stored skipped key
        let reveals = bob.drain_all_reveals();
        assert_eq!(reveals.len(), 2);
        // nothing left afterwards
        assert!(bob.drain_all_reveals().is_empty());
    }

    #[test]
    fn chain_jump_beyond_horizon_is_limited() {
        let (mut alice, mut bob) = pair();
        let m0 = send(&mut alice, b"anchor");
        recv(&mut bob, &m0).unwrap();
        // fabricate a header far beyond the skip horizon on the same chain
        let mut far = send(&mut alice, b"far");
        far.0.message_id += MAX_CHAIN_SKIP + 10;
        assert!(matches!(
            recv(&mut bob, &far),
            Err(CryptoError::RotationLimitation)
        ));
    }
}
