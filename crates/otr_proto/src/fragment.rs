//! Fragment syntax, reassembly, and outgoing fragmentation.
//!
//! Wire forms:
//!   v2: `?OTR,k,n,piece,`
//!   v3: `?OTR|sender|receiver,k,n,piece,`
//!   v4: `?OTR|id|sender|receiver,k,n,piece,`
//!
//! Tags and identifiers are 8-digit lowercase hex; `k`/`n` are 5-digit
//! zero-padded decimals (any decimal is accepted on parse). v2/v3 series
//! arrive in order and a single out-of-sequence index voids the series; v4
//! series are keyed by identifier and slots fill in any order, write-once.

use std::collections::HashMap;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use crate::error::ProtoError;
use crate::version::Version;

/// In-progress v4 series beyond this count: evict the eldest.
pub const MAX_MESSAGES_IN_ASSEMBLY: usize = 100;
/// Any single in-flight message beyond this size is evicted eagerly.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub version: Version,
    pub identifier: Option<u32>,
    pub sender_tag: u32,
    pub receiver_tag: u32,
    pub index: u16,
    pub total: u16,
    pub payload: String,
}

pub fn is_fragment(raw: &str) -> bool {
    raw.starts_with("?OTR|") || raw.starts_with("?OTR,")
}

pub fn parse(raw: &str) -> Result<Fragment, ProtoError> {
    let rest = raw
        .strip_prefix("?OTR")
        .ok_or_else(|| malformed("missing fragment prefix"))?;
    let (version, identifier, sender_tag, receiver_tag, tail) = if let Some(tail) =
        rest.strip_prefix(',')
    {
        (Version::Two, None, 0, 0, tail)
    } else if let Some(piped) = rest.strip_prefix('|') {
        let (head, tail) = piped
            .split_once(',')
            .ok_or_else(|| malformed("fragment head unterminated"))?;
        let parts: Vec<&str> = head.split('|').collect();
        match parts.as_slice() {
            [sender, receiver] => {
                (Version::Three, None, parse_hex(sender)?, parse_hex(receiver)?, tail)
            }
            [id, sender, receiver] => (
                Version::Four,
                Some(parse_hex(id)?),
                parse_hex(sender)?,
                parse_hex(receiver)?,
                tail,
            ),
            _ => return Err(malformed("fragment head arity")),
        }
    } else {
        return Err(malformed("not a fragment"));
    };

    let mut fields = tail.splitn(3, ',');
    let index: u16 = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed("fragment index"))?;
    let total: u16 = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed("fragment total"))?;
    let payload = fields
        .next()
        .and_then(|s| s.strip_suffix(','))
        .ok_or_else(|| malformed("fragment payload unterminated"))?;

    if index == 0 || total == 0 || index > total {
        return Err(ProtoError::FragmentRejected(format!("index {index} of {total}")));
    }
    Ok(Fragment {
        version,
        identifier,
        sender_tag,
        receiver_tag,
        index,
        total,
        payload: payload.to_string(),
    })
}

fn parse_hex(s: &str) -> Result<u32, ProtoError> {
    u32::from_str_radix(s, 16).map_err(|_| malformed("hex field"))
}

fn malformed(what: &str) -> ProtoError {
    ProtoError::Malformed(format!("fragment: {what}"))
}

// ── In-order reassembly (v2/v3) ──────────────────────────────────────────────

/// v2/v3 keep a single series per peer; fragments must arrive as
/// 1, 2, ... n with a constant total.
#[derive(Default)]
pub struct InOrderAssembler {
    buffer: String,
    last_index: u16,
    total: u16,
}

impl InOrderAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; `Ok(Some(text))` once the series completes.
    pub fn accept(&mut self, frag: &Fragment) -> Result<Option<String>, ProtoError> {
        if frag.index == 1 {
            // a new series always resets whatever was in flight
            self.buffer.clear();
            self.buffer.push_str(&frag.payload);
            self.last_index = 1;
            self.total = frag.total;
        } else if frag.index == self.last_index + 1 && frag.total == self.total {
            self.buffer.push_str(&frag.payload);
            self.last_index = frag.index;
        } else {
            let got = frag.index;
            self.reset();
            return Err(ProtoError::FragmentRejected(format!("out-of-sequence index {got}")));
        }
        if self.last_index == self.total {
            let complete = std::mem::take(&mut self.buffer);
            self.reset();
            return Ok(Some(complete));
        }
        Ok(None)
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.last_index = 0;
        self.total = 0;
    }
}

// ── Out-of-order reassembly (v4) ─────────────────────────────────────────────

struct Series {
    parts: Vec<Option<String>>,
    filled: usize,
    size: usize,
    /// Insertion order for eldest-first eviction.
    seq: u64,
}

/// v4 series are identified explicitly and fill in any order.
#[derive(Default)]
pub struct OutOfOrderAssembler {
    series: HashMap<u32, Series>,
    next_seq: u64,
}

impl OutOfOrderAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, frag: &Fragment) -> Result<Option<String>, ProtoError> {
        let id = frag
            .identifier
            .ok_or_else(|| ProtoError::FragmentRejected("v4 fragment without identifier".into()))?;
        let seq = self.next_seq;
        self.next_seq += 1;
        let series = self.series.entry(id).or_insert_with(|| Series {
            parts: vec![None; frag.total as usize],
            filled: 0,
            size: 0,
            seq,
        });
        if series.parts.len() != frag.total as usize {
            let expected = series.parts.len();
            self.series.remove(&id);
            return Err(ProtoError::FragmentRejected(format!(
                "total changed mid-series ({expected} to {})",
                frag.total
            )));
        }
        let slot = &mut series.parts[frag.index as usize - 1];
        if slot.is_some() {
            return Err(ProtoError::FragmentRejected(format!(
                "duplicate fragment {} of series {id:08x}",
                frag.index
            )));
        }
        *slot = Some(frag.payload.clone());
        series.filled += 1;
        series.size += frag.payload.len();

        if series.size > MAX_MESSAGE_SIZE {
            debug!(id, size = series.size, "evicting oversized fragment series");
            self.series.remove(&id);
            return Err(ProtoError::FragmentRejected("series exceeds size cap".into()));
        }
        if series.filled == series.parts.len() {
            let series = self.series.remove(&id).expect("series present");
            let mut out = String::with_capacity(series.size);
            for part in series.parts {
                out.push_str(&part.expect("all slots filled"));
            }
            return Ok(Some(out));
        }
        self.evict_overflow();
        Ok(None)
    }

    fn evict_overflow(&mut self) {
        while self.series.len() > MAX_MESSAGES_IN_ASSEMBLY {
            let eldest = self
                .series
                .iter()
                .min_by_key(|(_, s)| s.seq)
                .map(|(&id, _)| id);
            match eldest {
                Some(id) => {
                    debug!(id, "evicting eldest fragment series");
                    self.series.remove(&id);
                }
                None => break,
            }
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.series.len()
    }
}

// ── Outgoing fragmentation ───────────────────────────────────────────────────

/// Split an encoded message into fragments of at most `max_size` transport
/// characters. A message that already fits is passed through untouched.
/// Non-encoded messages (plaintext, query) must not be fragmented and are
/// the caller's responsibility.
pub fn fragment_outgoing(
    message: &str,
    version: Version,
    sender_tag: u32,
    receiver_tag: u32,
    max_size: usize,
) -> Result<Vec<String>, ProtoError> {
    if message.len() <= max_size {
        return Ok(vec![message.to_string()]);
    }
    let overhead = match version {
        // "?OTR," + "k,n,piece," with 5-digit k/n
        Version::Two => "?OTR,".len() + 5 + 1 + 5 + 1 + 1,
        // "?OTR|sender|receiver," + "k,n,piece,"
        Version::Three => "?OTR|".len() + 8 + 1 + 8 + 1 + 5 + 1 + 5 + 1 + 1,
        // "?OTR|id|sender|receiver," + "k,n,piece,"
        Version::Four => "?OTR|".len() + 8 + 1 + 8 + 1 + 8 + 1 + 5 + 1 + 5 + 1 + 1,
        Version::None => return Err(ProtoError::FragmentationFailed("no version".into())),
    };
    if max_size <= overhead {
        return Err(ProtoError::FragmentationFailed(format!(
            "max fragment size {max_size} cannot carry any payload"
        )));
    }
    let chunk = max_size - overhead;
    let pieces: Vec<&[u8]> = message.as_bytes().chunks(chunk).collect();
    if pieces.len() > u16::MAX as usize {
        return Err(ProtoError::FragmentationFailed("too many fragments".into()));
    }
    let total = pieces.len();
    let identifier = OsRng.next_u32();
    let mut out = Vec::with_capacity(total);
    for (idx, piece) in pieces.iter().enumerate() {
        // chunks of a str on ascii boundaries: encoded messages are base64
        let piece = std::str::from_utf8(piece)
            .map_err(|_| ProtoError::FragmentationFailed("non-ascii encoded message".into()))?;
        let k = idx + 1;
        let frag = match version {
            Version::Two => format!("?OTR,{k:05},{total:05},{piece},"),
            Version::Three => {
                format!("?OTR|{sender_tag:08x}|{receiver_tag:08x},{k:05},{total:05},{piece},")
            }
            Version::Four => format!(
                "?OTR|{identifier:08x}|{sender_tag:08x}|{receiver_tag:08x},{k:05},{total:05},{piece},"
            ),
            Version::None => unreachable!(),
        };
        out.push(frag);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_frag(id: u32, index: u16, total: u16, payload: &str) -> Fragment {
        Fragment {
            version: Version::Four,
            identifier: Some(id),
            sender_tag: 0x100,
            receiver_tag: 0x200,
            index,
            total,
            payload: payload.into(),
        }
    }

    #[test]
    fn parse_each_version() {
        let v2 = parse("?OTR,1,3,abc,").unwrap();
        assert_eq!((v2.version, v2.index, v2.total), (Version::Two, 1, 3));

        let v3 = parse("?OTR|0000100|00000200,2,3,def,").unwrap();
        assert_eq!(v3.version, Version::Three);
        assert_eq!((v3.sender_tag, v3.receiver_tag), (0x100, 0x200));

        let v4 = parse("?OTR|deadbeef|00000100|00000200,3,3,ghi,").unwrap();
        assert_eq!(v4.version, Version::Four);
        assert_eq!(v4.identifier, Some(0xdeadbeef));
    }

    #[test]
    fn index_beyond_total_rejected() {
        assert!(parse("?OTR,4,3,abc,").is_err());
        assert!(parse("?OTR,0,3,abc,").is_err());
    }

    #[test]
    fn in_order_assembly() {
        let mut asm = InOrderAssembler::new();
        let f = |i| Fragment {
            version: Version::Three,
            identifier: None,
            sender_tag: 1,
            receiver_tag: 2,
            index: i,
            total: 3,
            payload: format!("p{i}"),
        };
        assert_eq!(asm.accept(&f(1)).unwrap(), None);
        assert_eq!(asm.accept(&f(2)).unwrap(), None);
        assert_eq!(asm.accept(&f(3)).unwrap(), Some("p1p2p3".into()));
    }

    #[test]
    fn in_order_rejects_gap_and_recovers() {
        let mut asm = InOrderAssembler::new();
        let f = |i| Fragment {
            version: Version::Three,
            identifier: None,
            sender_tag: 1,
            receiver_tag: 2,
            index: i,
            total: 2,
            payload: format!("p{i}"),
        };
        assert_eq!(asm.accept(&f(1)).unwrap(), None);
        let mut wrong_total = f(2);
        wrong_total.total = 9;
        assert!(asm.accept(&wrong_total).is_err());
        // a fresh series still works
        assert_eq!(asm.accept(&f(1)).unwrap(), None);
        assert_eq!(asm.accept(&f(2)).unwrap(), Some("p1p2".into()));
    }

    #[test]
    fn out_of_order_assembly_any_order() {
        let mut asm = OutOfOrderAssembler::new();
        assert_eq!(asm.accept(&v4_frag(7, 3, 3, "c")).unwrap(), None);
        assert_eq!(asm.accept(&v4_frag(7, 1, 3, "a")).unwrap(), None);
        assert_eq!(asm.accept(&v4_frag(7, 2, 3, "b")).unwrap(), Some("abc".into()));
        assert_eq!(asm.in_flight(), 0);
    }

    #[test]
    fn duplicate_slot_rejected() {
        let mut asm = OutOfOrderAssembler::new();
        asm.accept(&v4_frag(7, 1, 2, "a")).unwrap();
        assert!(asm.accept(&v4_frag(7, 1, 2, "x")).is_err());
    }

    #[test]
    fn inconsistent_total_rejected() {
        let mut asm = OutOfOrderAssembler::new();
        asm.accept(&v4_frag(7, 1, 3, "a")).unwrap();
        assert!(asm.accept(&v4_frag(7, 2, 4, "b")).is_err());
    }

    #[test]
    fn eldest_series_evicted_on_overflow() {
        let mut asm = OutOfOrderAssembler::new();
        for id in 0..=MAX_MESSAGES_IN_ASSEMBLY as u32 {
            asm.accept(&v4_frag(id, 1, 2, "x")).unwrap();
        }
        assert_eq!(asm.in_flight(), MAX_MESSAGES_IN_ASSEMBLY);
        // series 0 was evicted; completing it now restarts instead
        assert_eq!(asm.accept(&v4_frag(0, 2, 2, "y")).unwrap(), None);
    }

    #[test]
    fn single_fragment_series_completes() {
        let mut asm = OutOfOrderAssembler::new();
        assert_eq!(asm.accept(&v4_frag(9, 1, 1, "solo")).unwrap(), Some("solo".into()));
    }

    #[test]
    fn fragment_roundtrip_via_parser() {
        let msg = format!("?OTR:{}.", "A".repeat(500));
        let frags = fragment_outgoing(&msg, Version::Four, 0x100, 0x200, 150).unwrap();
        assert!(frags.len() >= 4);
        assert!(frags.iter().all(|f| f.len() <= 150));
        let mut asm = OutOfOrderAssembler::new();
        let mut result = None;
        for f in &frags {
            result = asm.accept(&parse(f).unwrap()).unwrap();
        }
        assert_eq!(result.unwrap(), msg);
    }

    #[test]
    fn fragmentation_boundary() {
        let msg = format!("?OTR:{}.", "A".repeat(500));
        let overhead = "?OTR|00000000|00000000|00000000,00000,00000,,".len();
        // one payload byte fits
        assert!(fragment_outgoing(&msg, Version::Four, 0, 0, overhead + 1).is_ok());
        // none does
        assert!(fragment_outgoing(&msg, Version::Four, 0, 0, overhead).is_err());
    }

    #[test]
    fn small_message_passes_through() {
        let frags = fragment_outgoing("?OTR:abc.", Version::Four, 1, 2, 1000).unwrap();
        assert_eq!(frags, vec!["?OTR:abc.".to_string()]);
    }

}
