//! TLV records inside decrypted data payloads.
//!
//! A decrypted payload is `message bytes || 0x00 || TLV*`. Each record is a
//! u16 type, u16 length, and the value bytes. Type 7 is generation-split:
//! SMP1Q on a v3 session, extra-symmetric-key on v4.

use crate::codec::{Decoder, Encoder};
use crate::error::ProtoError;

pub const TLV_PADDING: u16 = 0;
pub const TLV_DISCONNECT: u16 = 1;
pub const TLV_SMP1: u16 = 2;
pub const TLV_SMP2: u16 = 3;
pub const TLV_SMP3: u16 = 4;
pub const TLV_SMP4: u16 = 5;
pub const TLV_SMP_ABORT: u16 = 6;
/// SMP1 with question (v3) / extra symmetric key (v4).
pub const TLV_SMP1Q_OR_EXTRA_KEY: u16 = 7;
/// Extra symmetric key (v3).
pub const TLV_EXTRA_KEY_V3: u16 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub typ: u16,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(typ: u16, value: Vec<u8>) -> Self {
        Self { typ, value }
    }

    pub fn is_smp(&self) -> bool {
        matches!(self.typ, TLV_SMP1..=TLV_SMP_ABORT)
    }
}

/// `message || 0x00 || records`.
pub fn assemble_payload(message: &[u8], tlvs: &[Tlv]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.write_raw(message);
    if !tlvs.is_empty() {
        enc.write_u8(0);
        for tlv in tlvs {
            enc.write_u16(tlv.typ);
            enc.write_u16(tlv.value.len() as u16);
            enc.write_raw(&tlv.value);
        }
    }
    enc.finish()
}

/// Split a decrypted payload into message bytes and records. A payload
/// without a NUL is all message. Truncated records are an error.
pub fn split_payload(payload: &[u8]) -> Result<(Vec<u8>, Vec<Tlv>), ProtoError> {
    let Some(nul) = payload.iter().position(|&b| b == 0) else {
        return Ok((payload.to_vec(), Vec::new()));
    };
    let message = payload[..nul].to_vec();
    let mut tlvs = Vec::new();
    let mut dec = Decoder::new(&payload[nul + 1..]);
    while dec.remaining() > 0 {
        let typ = dec.read_u16()?;
        let len = dec.read_u16()? as usize;
        let value = dec.read_raw(len)?.to_vec();
        tlvs.push(Tlv { typ, value });
    }
    Ok((message, tlvs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrip() {
        let tlvs = vec![
            Tlv::new(TLV_SMP1, vec![1, 2, 3]),
            Tlv::new(TLV_DISCONNECT, vec![]),
        ];
        let payload = assemble_payload(b"hello", &tlvs);
        let (msg, parsed) = split_payload(&payload).unwrap();
        assert_eq!(msg, b"hello");
        assert_eq!(parsed, tlvs);
    }

    #[test]
    fn bare_message_has_no_records() {
        let (msg, tlvs) = split_payload(b"no records here").unwrap();
        assert_eq!(msg, b"no records here");
        assert!(tlvs.is_empty());
    }

    #[test]
    fn empty_message_with_records() {
        let payload = assemble_payload(b"", &[Tlv::new(TLV_SMP_ABORT, vec![])]);
        let (msg, tlvs) = split_payload(&payload).unwrap();
        assert!(msg.is_empty());
        assert_eq!(tlvs[0].typ, TLV_SMP_ABORT);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut payload = assemble_payload(b"m", &[Tlv::new(TLV_SMP1, vec![1, 2, 3, 4])]);
        payload.truncate(payload.len() - 2);
        assert!(split_payload(&payload).is_err());
    }

    #[test]
    fn smp_range_check() {
        assert!(Tlv::new(TLV_SMP1, vec![]).is_smp());
        assert!(Tlv::new(TLV_SMP_ABORT, vec![]).is_smp());
        assert!(!Tlv::new(TLV_PADDING, vec![]).is_smp());
        assert!(!Tlv::new(TLV_SMP1Q_OR_EXTRA_KEY, vec![]).is_smp());
    }
}
