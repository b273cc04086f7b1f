//! v2/v3 rotating session-key window.
//!
//! A 2×2 matrix of key cells indexed by (local PREV/CURR, remote PREV/CURR).
//! Each data message names the cell it was built with by key id; the window
//! rotates a row when the peer acknowledges our newest key and a column when
//! the peer advances theirs. Receiving MAC keys that authenticated at least
//! one message are queued for public reveal once their cell leaves the
//! window.
//!
//! Counter discipline: the sending counter per cell strictly increases and
//! the receiving high-water mark must strictly increase; either violation is
//! a protocol error, never a state change.

use num_bigint::BigUint;
use zeroize::Zeroize;

use crate::dh::{modp1536, mpi_bytes, DhKeyPair};
use crate::error::CryptoError;
use crate::kdf::{h1, h2, sha1};

pub const PREV: usize = 0;
pub const CURR: usize = 1;

/// One cell: everything needed to move data messages under a fixed
/// (local key, remote key) pair.
pub struct SessionKeys {
    pub sending_aes: [u8; 16],
    pub receiving_aes: [u8; 16],
    pub sending_mac: [u8; 20],
    pub receiving_mac: [u8; 20],
    pub extra_key: [u8; 32],
    /// Last counter value we sent under this cell.
    pub send_ctr: u64,
    /// Highest counter value received under this cell.
    pub recv_ctr: u64,
    pub recv_mac_used: bool,
}

impl SessionKeys {
    fn derive(ours: &DhKeyPair, theirs: &BigUint) -> Result<Self, CryptoError> {
        let s = ours.shared_secret(theirs)?;
        // secbytes is the full MPI framing of s, length prefix included
        let magnitude = mpi_bytes(&s);
        let mut secbytes = Vec::with_capacity(4 + magnitude.len());
        secbytes.extend_from_slice(&(magnitude.len() as u32).to_be_bytes());
        secbytes.extend_from_slice(&magnitude);

        let (sendbyte, recvbyte) = if ours.public > *theirs { (0x01, 0x02) } else { (0x02, 0x01) };

        let mut sending_aes = [0u8; 16];
        sending_aes.copy_from_slice(&h1(sendbyte, &secbytes)[..16]);
        let mut receiving_aes = [0u8; 16];
        receiving_aes.copy_from_slice(&h1(recvbyte, &secbytes)[..16]);
        let keys = SessionKeys {
            sending_mac: sha1(&sending_aes),
            receiving_mac: sha1(&receiving_aes),
            extra_key: h2(0xff, &secbytes),
            sending_aes,
            receiving_aes,
            send_ctr: 0,
            recv_ctr: 0,
            recv_mac_used: false,
        };
        secbytes.zeroize();
        Ok(keys)
    }

    /// Next outbound counter value. Monotonic by construction.
    fn next_send_ctr(&mut self) -> u64 {
        self.send_ctr += 1;
        self.send_ctr
    }

    /// Record an inbound counter; rejects any value at or below the high water.
    pub fn check_recv_ctr(&self, ctr: u64) -> Result<(), CryptoError> {
        if ctr > self.recv_ctr {
            Ok(())
        } else {
            Err(CryptoError::CounterRewind)
        }
    }

    pub fn note_received(&mut self, ctr: u64) {
        self.recv_ctr = ctr;
        self.recv_mac_used = true;
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.sending_aes.zeroize();
        self.receiving_aes.zeroize();
        self.sending_mac.zeroize();
        self.receiving_mac.zeroize();
        self.extra_key.zeroize();
    }
}

/// Material for one outbound data message.
pub struct OutboundKeys {
    pub sender_key_id: u32,
    pub recipient_key_id: u32,
    pub next_dh_public: BigUint,
    pub ctr: u64,
    pub aes_key: [u8; 16],
    pub mac_key: [u8; 20],
}

pub struct SessionKeyWindow {
    local: [DhKeyPair; 2],
    local_ids: [u32; 2],
    remote: [BigUint; 2],
    remote_ids: [u32; 2],
    cells: [[SessionKeys; 2]; 2],
    pending_reveals: Vec<[u8; 20]>,
}

impl SessionKeyWindow {
    /// Build the window from the AKE outcome. Our next key is generated
    /// immediately: data messages are sent under the acknowledged key and
    /// advertise the fresh one.
    pub fn new(
        our_ake_pair: DhKeyPair,
        our_key_id: u32,
        their_public: BigUint,
        their_key_id: u32,
    ) -> Result<Self, CryptoError> {
        let next = DhKeyPair::generate(modp1536());
        let cells = [
            [
                SessionKeys::derive(&our_ake_pair, &their_public)?,
                SessionKeys::derive(&our_ake_pair, &their_public)?,
            ],
            [
                SessionKeys::derive(&next, &their_public)?,
                SessionKeys::derive(&next, &their_public)?,
            ],
        ];
        Ok(Self {
            local: [our_ake_pair, next],
            local_ids: [our_key_id, our_key_id + 1],
            remote: [their_public.clone(), their_public],
            remote_ids: [their_key_id, their_key_id],
            cells,
            pending_reveals: Vec::new(),
        })
    }

    /// Keys for the next outbound message: our acknowledged (PREV) key with
    /// their newest, advertising our CURR public value.
    pub fn outbound(&mut self) -> OutboundKeys {
        let cell = &mut self.cells[PREV][CURR];
        let ctr = cell.next_send_ctr();
        OutboundKeys {
            sender_key_id: self.local_ids[PREV],
            recipient_key_id: self.remote_ids[CURR],
            next_dh_public: self.local[CURR].public.clone(),
            ctr,
            aes_key: cell.sending_aes,
            mac_key: cell.sending_mac,
        }
    }

    fn local_index(&self, key_id: u32) -> Option<usize> {
        // prefer CURR when ids collide right after initialization
        if self.local_ids[CURR] == key_id {
            Some(CURR)
        } else if self.local_ids[PREV] == key_id {
            Some(PREV)
        } else {
            None
        }
    }

    fn remote_index(&self, key_id: u32) -> Option<usize> {
        if self.remote_ids[CURR] == key_id {
            Some(CURR)
        } else if self.remote_ids[PREV] == key_id {
            Some(PREV)
        } else {
            None
        }
    }

    /// Cell for an inbound message, by the ids carried on the wire.
    pub fn inbound_cell(
        &mut self,
        sender_key_id: u32,
        recipient_key_id: u32,
    ) -> Result<&mut SessionKeys, CryptoError> {
        let li = self
            .local_index(recipient_key_id)
            .ok_or(CryptoError::UnknownKeyId(sender_key_id, recipient_key_id))?;
        let ri = self
            .remote_index(sender_key_id)
            .ok_or(CryptoError::UnknownKeyId(sender_key_id, recipient_key_id))?;
        Ok(&mut self.cells[li][ri])
    }

    /// Rotate after a successfully authenticated inbound message.
    /// `next_dh` is the sender's advertised next public key.
    pub fn rotate_after_receive(
        &mut self,
        sender_key_id: u32,
        recipient_key_id: u32,
        next_dh: &BigUint,
    ) -> Result<(), CryptoError> {
        if recipient_key_id == self.local_ids[CURR] {
            self.rotate_local()?;
        }
        if sender_key_id == self.remote_ids[CURR] {
            self.rotate_remote(next_dh)?;
        }
        Ok(())
    }

    /// Peer acknowledged our newest key: retire the old row.
    fn rotate_local(&mut self) -> Result<(), CryptoError> {
        for cell in &self.cells[PREV] {
            if cell.recv_mac_used {
                self.pending_reveals.push(cell.receiving_mac);
            }
        }
        let fresh = DhKeyPair::generate(modp1536());
        self.local.swap(PREV, CURR);
        self.local[CURR] = fresh;
        self.local_ids[PREV] = self.local_ids[CURR];
        self.local_ids[CURR] += 1;
        self.cells.swap(PREV, CURR);
        self.cells[CURR] = [
            SessionKeys::derive(&self.local[CURR], &self.remote[PREV])?,
            SessionKeys::derive(&self.local[CURR], &self.remote[CURR])?,
        ];
        Ok(())
    }

    /// Peer advanced their key: retire the old column.
    fn rotate_remote(&mut self, next_dh: &BigUint) -> Result<(), CryptoError> {
        if !modp1536().valid_public(next_dh) {
            return Err(CryptoError::InvalidKey("next_dh out of range".into()));
        }
        for row in &self.cells {
            if row[PREV].recv_mac_used {
                self.pending_reveals.push(row[PREV].receiving_mac);
            }
        }
        self.remote.swap(PREV, CURR);
        self.remote[CURR] = next_dh.clone();
        self.remote_ids[PREV] = self.remote_ids[CURR];
        self.remote_ids[CURR] += 1;
        for li in [PREV, CURR] {
            self.cells[li].swap(PREV, CURR);
            self.cells[li][CURR] = SessionKeys::derive(&self.local[li], &self.remote[CURR])?;
        }
        Ok(())
    }

    /// Drain MAC keys queued for public reveal.
    pub fn collect_reveals(&mut self) -> Vec<[u8; 20]> {
        std::mem::take(&mut self.pending_reveals)
    }

    /// The extra symmetric key of the current sending cell (TLV 8).
    pub fn extra_symmetric_key(&self) -> [u8; 32] {
        self.cells[PREV][CURR].extra_key
    }
}

impl Drop for SessionKeyWindow {
    fn drop(&mut self) {
        for r in &mut self.pending_reveals {
            r.zeroize();
        }
    }
}
