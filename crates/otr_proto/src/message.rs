//! Encoded message taxonomy.
//!
//! An encoded message travels as `?OTR:` + base64(body) + `.`. The body is
//! a version/type header followed by a type-specific payload. v3 and v4
//! headers carry sender and receiver instance tags; v2 headers carry none.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use num_bigint::BigUint;
use num_traits::Zero;

use otr_crypto::ed448::Point;
use otr_crypto::ring_sig::RingSignature;

use crate::codec::{Decoder, Encoder};
use crate::error::ProtoError;
use crate::profile::ClientProfile;
use crate::version::Version;

pub const ENCODED_PREFIX: &str = "?OTR:";
pub const ENCODED_SUFFIX: &str = ".";

/// Wire message-type bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    DhCommit = 0x02,
    Data = 0x03,
    DhKey = 0x0a,
    RevealSignature = 0x11,
    Signature = 0x12,
    Identity = 0x35,
    AuthR = 0x36,
    AuthI = 0x37,
}

impl MessageType {
    pub fn from_wire(b: u8) -> Result<Self, ProtoError> {
        match b {
            0x02 => Ok(Self::DhCommit),
            0x03 => Ok(Self::Data),
            0x0a => Ok(Self::DhKey),
            0x11 => Ok(Self::RevealSignature),
            0x12 => Ok(Self::Signature),
            0x35 => Ok(Self::Identity),
            0x36 => Ok(Self::AuthR),
            0x37 => Ok(Self::AuthI),
            other => Err(ProtoError::UnknownMessageType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: Version,
    pub sender_tag: u32,
    pub receiver_tag: u32,
}

impl MessageHeader {
    fn encode(&self, message_type: MessageType, enc: &mut Encoder) {
        enc.write_u16(self.version.wire());
        enc.write_u8(message_type as u8);
        if self.version.has_instance_tags() {
            enc.write_u32(self.sender_tag);
            enc.write_u32(self.receiver_tag);
        }
    }
}

// ── AKE messages (v2/v3) ─────────────────────────────────────────────────────

/// Flight 1: commitment to gx.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhCommitMessage {
    pub encrypted_gx: Vec<u8>,
    pub hashed_gx: [u8; 32],
}

/// Flight 2: bare gy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhKeyMessage {
    pub gy: BigUint,
}

/// Flight 3: reveal r, prove identity under the derived keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealSignatureMessage {
    pub revealed_key: Vec<u8>,
    pub encrypted_signature: Vec<u8>,
    pub mac: [u8; 20],
}

/// Flight 4: the responder's symmetric proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMessage {
    pub encrypted_signature: Vec<u8>,
    pub mac: [u8; 20],
}

/// v2/v3 data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage3 {
    pub flags: u8,
    pub sender_key_id: u32,
    pub recipient_key_id: u32,
    pub next_dh: BigUint,
    pub ctr: u64,
    pub encrypted: Vec<u8>,
    pub mac: [u8; 20],
    pub revealed_macs: Vec<u8>,
}

// ── DAKE messages (v4) ───────────────────────────────────────────────────────

/// Flight 1: the responder identifies itself and offers ephemerals plus its
/// first-ratchet public keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityMessage {
    pub profile: ClientProfile,
    pub y: Point,
    pub b: BigUint,
    pub first_ecdh: Point,
    pub first_dh: BigUint,
}

/// Flight 2: the initiator's ephemerals, profile, first-ratchet keys, and
/// ring signature over the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRMessage {
    pub profile: ClientProfile,
    pub x: Point,
    pub a: BigUint,
    pub first_ecdh: Point,
    pub first_dh: BigUint,
    pub sigma: RingSignature,
}

/// Flight 3: the responder's ring signature over the symmetric transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthIMessage {
    pub sigma: RingSignature,
}

/// v4 data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage4 {
    pub flags: u8,
    pub prev_chain_len: u32,
    pub ratchet_id: u32,
    pub message_id: u32,
    pub ecdh: Point,
    /// Present on every-third-ratchet chains, encoded as a zero-length MPI
    /// otherwise.
    pub dh: Option<BigUint>,
    pub encrypted: Vec<u8>,
    pub authenticator: [u8; 64],
    pub revealed_macs: Vec<u8>,
}

/// Flag on data messages whose loss should not alarm the user.
pub const FLAG_IGNORE_UNREADABLE: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    DhCommit(DhCommitMessage),
    DhKey(DhKeyMessage),
    RevealSignature(RevealSignatureMessage),
    Signature(SignatureMessage),
    Data3(DataMessage3),
    Identity(IdentityMessage),
    AuthR(AuthRMessage),
    AuthI(AuthIMessage),
    Data4(DataMessage4),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::DhCommit(_) => MessageType::DhCommit,
            MessageBody::DhKey(_) => MessageType::DhKey,
            MessageBody::RevealSignature(_) => MessageType::RevealSignature,
            MessageBody::Signature(_) => MessageType::Signature,
            MessageBody::Data3(_) => MessageType::Data,
            MessageBody::Identity(_) => MessageType::Identity,
            MessageBody::AuthR(_) => MessageType::AuthR,
            MessageBody::AuthI(_) => MessageType::AuthI,
            MessageBody::Data4(_) => MessageType::Data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl EncodedMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.header.encode(self.body.message_type(), &mut enc);
        match &self.body {
            MessageBody::DhCommit(m) => {
                enc.write_data(&m.encrypted_gx);
                enc.write_data(&m.hashed_gx);
            }
            MessageBody::DhKey(m) => {
                enc.write_mpi(&m.gy);
            }
            MessageBody::RevealSignature(m) => {
                enc.write_data(&m.revealed_key);
                enc.write_data(&m.encrypted_signature);
                enc.write_raw(&m.mac);
            }
            MessageBody::Signature(m) => {
                enc.write_data(&m.encrypted_signature);
                enc.write_raw(&m.mac);
            }
            MessageBody::Data3(m) => {
                encode_data3(&mut enc, self.header.version, m, true);
            }
            MessageBody::Identity(m) => {
                m.profile.encode(&mut enc);
                enc.write_point(&m.y);
                enc.write_mpi(&m.b);
                enc.write_point(&m.first_ecdh);
                enc.write_mpi(&m.first_dh);
            }
            MessageBody::AuthR(m) => {
                m.profile.encode(&mut enc);
                enc.write_point(&m.x);
                enc.write_mpi(&m.a);
                enc.write_point(&m.first_ecdh);
                enc.write_mpi(&m.first_dh);
                enc.write_raw(&m.sigma.encode());
            }
            MessageBody::AuthI(m) => {
                enc.write_raw(&m.sigma.encode());
            }
            MessageBody::Data4(m) => {
                encode_data4(&mut enc, m, true);
            }
        }
        enc.finish()
    }

    /// The `?OTR:base64.` transport form.
    pub fn encode_text(&self) -> String {
        format!("{}{}{}", ENCODED_PREFIX, BASE64.encode(self.to_bytes()), ENCODED_SUFFIX)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        let mut dec = Decoder::new(bytes);
        let version = Version::from_wire(dec.read_u16()?)?;
        let message_type = MessageType::from_wire(dec.read_u8()?)?;
        let (sender_tag, receiver_tag) = if version.has_instance_tags() {
            (dec.read_u32()?, dec.read_u32()?)
        } else {
            (0, 0)
        };
        let header = MessageHeader { version, sender_tag, receiver_tag };
        let body = match (message_type, version) {
            (MessageType::DhCommit, Version::Two | Version::Three) => {
                let encrypted_gx = dec.read_data()?;
                let hashed = dec.read_data()?;
                let hashed_gx: [u8; 32] = hashed
                    .as_slice()
                    .try_into()
                    .map_err(|_| ProtoError::Malformed("gx hash width".into()))?;
                MessageBody::DhCommit(DhCommitMessage { encrypted_gx, hashed_gx })
            }
            (MessageType::DhKey, Version::Two | Version::Three) => {
                MessageBody::DhKey(DhKeyMessage { gy: dec.read_mpi()? })
            }
            (MessageType::RevealSignature, Version::Two | Version::Three) => {
                MessageBody::RevealSignature(RevealSignatureMessage {
                    revealed_key: dec.read_data()?,
                    encrypted_signature: dec.read_data()?,
                    mac: dec.read_mac20()?,
                })
            }
            (MessageType::Signature, Version::Two | Version::Three) => {
                MessageBody::Signature(SignatureMessage {
                    encrypted_signature: dec.read_data()?,
                    mac: dec.read_mac20()?,
                })
            }
            (MessageType::Data, Version::Two | Version::Three) => {
                let flags = if version == Version::Three { dec.read_u8()? } else { 0 };
                MessageBody::Data3(DataMessage3 {
                    flags,
                    sender_key_id: dec.read_u32()?,
                    recipient_key_id: dec.read_u32()?,
                    next_dh: dec.read_mpi()?,
                    ctr: dec.read_ctr()?,
                    encrypted: dec.read_data()?,
                    mac: dec.read_mac20()?,
                    revealed_macs: dec.read_data()?,
                })
            }
            (MessageType::Identity, Version::Four) => MessageBody::Identity(IdentityMessage {
                profile: ClientProfile::decode(&mut dec)?,
                y: dec.read_point()?,
                b: dec.read_mpi()?,
                first_ecdh: dec.read_point()?,
                first_dh: dec.read_mpi()?,
            }),
            (MessageType::AuthR, Version::Four) => {
                let profile = ClientProfile::decode(&mut dec)?;
                let x = dec.read_point()?;
                let a = dec.read_mpi()?;
                let first_ecdh = dec.read_point()?;
                let first_dh = dec.read_mpi()?;
                let sigma =
                    RingSignature::decode(dec.read_raw(otr_crypto::ring_sig::RING_SIGNATURE_LEN)?)?;
                MessageBody::AuthR(AuthRMessage { profile, x, a, first_ecdh, first_dh, sigma })
            }
            (MessageType::AuthI, Version::Four) => {
                let sigma =
                    RingSignature::decode(dec.read_raw(otr_crypto::ring_sig::RING_SIGNATURE_LEN)?)?;
                MessageBody::AuthI(AuthIMessage { sigma })
            }
            (MessageType::Data, Version::Four) => {
                let flags = dec.read_u8()?;
                let prev_chain_len = dec.read_u32()?;
                let ratchet_id = dec.read_u32()?;
                let message_id = dec.read_u32()?;
                let ecdh = dec.read_point()?;
                let dh_mpi = dec.read_mpi()?;
                let dh = if dh_mpi.is_zero() { None } else { Some(dh_mpi) };
                MessageBody::Data4(DataMessage4 {
                    flags,
                    prev_chain_len,
                    ratchet_id,
                    message_id,
                    ecdh,
                    dh,
                    encrypted: dec.read_data()?,
                    authenticator: dec.read_auth64()?,
                    revealed_macs: dec.read_data()?,
                })
            }
            (t, v) => {
                return Err(ProtoError::Malformed(format!(
                    "message type {t:?} not defined for version {v:?}"
                )))
            }
        };
        dec.expect_end()?;
        Ok(EncodedMessage { header, body })
    }

    /// Parse the `?OTR:base64.` transport form.
    pub fn parse_text(raw: &str) -> Result<Self, ProtoError> {
        let stripped = raw
            .strip_prefix(ENCODED_PREFIX)
            .ok_or_else(|| ProtoError::Malformed("missing encoded prefix".into()))?;
        let stripped = stripped.trim_end();
        let stripped = stripped.strip_suffix(ENCODED_SUFFIX).unwrap_or(stripped);
        let bytes = BASE64.decode(stripped)?;
        Self::from_bytes(&bytes)
    }
}

fn encode_data3(enc: &mut Encoder, version: Version, m: &DataMessage3, with_trailer: bool) {
    if version == Version::Three {
        enc.write_u8(m.flags);
    }
    enc.write_u32(m.sender_key_id);
    enc.write_u32(m.recipient_key_id);
    enc.write_mpi(&m.next_dh);
    enc.write_ctr(m.ctr);
    enc.write_data(&m.encrypted);
    if with_trailer {
        enc.write_raw(&m.mac);
        enc.write_data(&m.revealed_macs);
    }
}

fn encode_data4(enc: &mut Encoder, m: &DataMessage4, with_trailer: bool) {
    enc.write_u8(m.flags);
    enc.write_u32(m.prev_chain_len);
    enc.write_u32(m.ratchet_id);
    enc.write_u32(m.message_id);
    enc.write_point(&m.ecdh);
    match &m.dh {
        Some(dh) => enc.write_mpi(dh),
        None => enc.write_data(&[]),
    };
    enc.write_data(&m.encrypted);
    if with_trailer {
        enc.write_raw(&m.authenticator);
        enc.write_data(&m.revealed_macs);
    }
}

impl DataMessage3 {
    /// The byte region covered by the data-message MAC: header through
    /// encrypted payload.
    pub fn mac_region(&self, header: &MessageHeader) -> Vec<u8> {
        let mut enc = Encoder::new();
        header.encode(MessageType::Data, &mut enc);
        encode_data3(&mut enc, header.version, self, false);
        enc.finish()
    }
}

impl DataMessage4 {
    /// The byte region covered by the authenticator: header through
    /// encrypted payload.
    pub fn authenticated_region(&self, header: &MessageHeader) -> Vec<u8> {
        let mut enc = Encoder::new();
        header.encode(MessageType::Data, &mut enc);
        encode_data4(&mut enc, self, false);
        enc.finish()
    }
}
