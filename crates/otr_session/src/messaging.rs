//! Per-instance messaging state.
//!
//! Tagged variants with explicit transitions: each variant owns exactly the
//! key material valid in that state, so replacing the variant drops (and
//! thereby zeroes) everything the new state must not retain.

use subtle::ConstantTimeEq;

use otr_crypto::double_ratchet::{self, DoubleRatchet};
use otr_crypto::kdf::{hmac_sha1, shake_kdf, usage};
use otr_crypto::session_keys::SessionKeyWindow;
use otr_proto::message::{DataMessage3, DataMessage4, MessageHeader};
use otr_proto::profile::{dsa_fingerprint, ClientProfile};
use otr_proto::tlv::{assemble_payload, split_payload, Tlv};
use otr_proto::version::Version;

use crate::ake::AkeOutcome;
use crate::dake::DakeOutcome;
use crate::error::OtrError;
use crate::host::SessionStatus;
use crate::smp::Smp3;
use crate::smp4::Smp4;

pub enum MessagingState {
    Plaintext,
    Encrypted3(Box<Encrypted3>),
    Encrypted4(Box<Encrypted4>),
    Finished,
}

impl MessagingState {
    pub fn status(&self) -> SessionStatus {
        match self {
            MessagingState::Plaintext => SessionStatus::Plaintext,
            MessagingState::Encrypted3(_) | MessagingState::Encrypted4(_) => {
                SessionStatus::Encrypted
            }
            MessagingState::Finished => SessionStatus::Finished,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessagingState::Plaintext => "plaintext",
            MessagingState::Encrypted3(_) => "encrypted-v3",
            MessagingState::Encrypted4(_) => "encrypted-v4",
            MessagingState::Finished => "finished",
        }
    }

    pub fn version(&self) -> Version {
        match self {
            MessagingState::Encrypted3(e) => e.version,
            MessagingState::Encrypted4(_) => Version::Four,
            _ => Version::None,
        }
    }
}

// ── v2/v3 ────────────────────────────────────────────────────────────────────

pub struct Encrypted3 {
    pub version: Version,
    window: SessionKeyWindow,
    pub ssid: [u8; 8],
    pub their_fingerprint: [u8; 20],
    pub smp: Smp3,
}

impl Encrypted3 {
    pub fn from_ake(
        outcome: AkeOutcome,
        our_dsa: &otr_crypto::dsa::DsaPublicKey,
    ) -> Result<Self, OtrError> {
        let our_fingerprint = dsa_fingerprint(our_dsa);
        let their_fingerprint = dsa_fingerprint(&outcome.their_dsa);
        let window = SessionKeyWindow::new(
            outcome.our_dh,
            outcome.our_key_id,
            outcome.their_public,
            outcome.their_key_id,
        )?;
        Ok(Self {
            version: outcome.version,
            window,
            ssid: outcome.ssid,
            their_fingerprint,
            smp: Smp3::new(outcome.ssid, our_fingerprint, their_fingerprint),
        })
    }

    pub fn encrypt_message(
        &mut self,
        header: &MessageHeader,
        text: &[u8],
        tlvs: &[Tlv],
        flags: u8,
    ) -> DataMessage3 {
        let out = self.window.outbound();
        let payload = assemble_payload(text, tlvs);
        let encrypted =
            otr_crypto::aes_ctr::aes128_ctr(&out.aes_key, &out.ctr.to_be_bytes(), &payload);
        let revealed_macs: Vec<u8> =
            self.window.collect_reveals().into_iter().flatten().collect();
        let mut msg = DataMessage3 {
            flags,
            sender_key_id: out.sender_key_id,
            recipient_key_id: out.recipient_key_id,
            next_dh: out.next_dh_public,
            ctr: out.ctr,
            encrypted,
            mac: [0u8; 20],
            revealed_macs,
        };
        msg.mac = hmac_sha1(&out.mac_key, &msg.mac_region(header));
        msg
    }

    pub fn decrypt_message(
        &mut self,
        header: &MessageHeader,
        msg: &DataMessage3,
    ) -> Result<(Vec<u8>, Vec<Tlv>), OtrError> {
        let region = msg.mac_region(header);
        let cell = self
            .window
            .inbound_cell(msg.sender_key_id, msg.recipient_key_id)?;
        let expected = hmac_sha1(&cell.receiving_mac, &region);
        if !bool::from(expected.ct_eq(&msg.mac)) {
            return Err(OtrError::MessageRejected("data message MAC mismatch".into()));
        }
        cell.check_recv_ctr(msg.ctr)?;
        let payload = otr_crypto::aes_ctr::aes128_ctr(
            &cell.receiving_aes,
            &msg.ctr.to_be_bytes(),
            &msg.encrypted,
        );
        cell.note_received(msg.ctr);
        self.window
            .rotate_after_receive(msg.sender_key_id, msg.recipient_key_id, &msg.next_dh)?;
        let (text, tlvs) = split_payload(&payload)?;
        Ok((text, tlvs))
    }

    /// TLV 8 payload: the raw derived key, as the legacy wire reports it.
    pub fn extra_symmetric_key(&self) -> Vec<u8> {
        self.window.extra_symmetric_key().to_vec()
    }
}

// ── v4 ───────────────────────────────────────────────────────────────────────

pub struct Encrypted4 {
    ratchet: DoubleRatchet,
    pub ssid: [u8; 8],
    pub their_profile: ClientProfile,
    pub their_fingerprint: [u8; 56],
    pub smp: Smp4,
}

impl Encrypted4 {
    pub fn from_dake(outcome: DakeOutcome, our_profile: &ClientProfile) -> Self {
        let our_fingerprint = our_profile.fingerprint();
        let their_fingerprint = outcome.their_profile.fingerprint();
        Self {
            ratchet: outcome.ratchet,
            ssid: outcome.ssid,
            their_fingerprint,
            smp: Smp4::new(outcome.ssid, our_fingerprint, their_fingerprint),
            their_profile: outcome.their_profile,
        }
    }

    pub fn encrypt_message(
        &mut self,
        header: &MessageHeader,
        text: &[u8],
        tlvs: &[Tlv],
        flags: u8,
    ) -> Result<DataMessage4, OtrError> {
        let (rheader, keys) = self.ratchet.prepare_send()?;
        let payload = assemble_payload(text, tlvs);
        let encrypted = double_ratchet::encrypt_payload(&keys, &payload);
        let revealed_macs: Vec<u8> =
            self.ratchet.collect_reveals().into_iter().flatten().collect();
        let mut msg = DataMessage4 {
            flags,
            prev_chain_len: rheader.prev_chain_len,
            ratchet_id: rheader.ratchet_id,
            message_id: rheader.message_id,
            ecdh: rheader.ecdh,
            dh: rheader.dh,
            encrypted,
            authenticator: [0u8; 64],
            revealed_macs,
        };
        msg.authenticator = double_ratchet::authenticator(&keys, &msg.authenticated_region(header));
        Ok(msg)
    }

    /// Returns the message text, records, and the per-message extra key.
    pub fn decrypt_message(
        &mut self,
        header: &MessageHeader,
        msg: &DataMessage4,
    ) -> Result<(Vec<u8>, Vec<Tlv>, [u8; 32]), OtrError> {
        let region = msg.authenticated_region(header);
        let (payload, extra) = self.ratchet.open(
            msg.ratchet_id,
            msg.message_id,
            msg.prev_chain_len,
            &msg.ecdh,
            msg.dh.as_ref(),
            &region,
            &msg.encrypted,
            &msg.authenticator,
        )?;
        let (text, tlvs) = split_payload(&payload)?;
        Ok((text, tlvs, extra))
    }

    /// Base extra symmetric key for the current sending chain.
    pub fn extra_symmetric_key(&self) -> Vec<u8> {
        self.ratchet.extra_symmetric_key().to_vec()
    }

    /// Per-TLV key: 4-byte context prefix plus the record index byte mixed
    /// over the base key.
    pub fn extra_symmetric_key_for_tlv(&self, context: [u8; 4], index: u8) -> Vec<u8> {
        let base = self.ratchet.extra_symmetric_key();
        let mut input = Vec::with_capacity(32 + 5);
        input.extend_from_slice(&base);
        input.extend_from_slice(&context);
        input.push(index);
        let mut out = [0u8; 32];
        shake_kdf(usage::EXTRA_SYMMETRIC_KEY_TLV, &input, &mut out);
        out.to_vec()
    }

    /// MAC keys to reveal with the disconnect message.
    pub fn drain_reveals(&mut self) -> Vec<u8> {
        self.ratchet.drain_all_reveals().into_iter().flatten().collect()
    }

    pub fn collect_reveals(&mut self) -> Vec<u8> {
        self.ratchet.collect_reveals().into_iter().flatten().collect()
    }
}
