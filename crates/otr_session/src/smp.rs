//! Socialist Millionaires Protocol over the 1536-bit group (v2/v3).
//!
//! Four flights SMP1..SMP4 plus abort. Every flight carries zero-knowledge
//! proofs (exponent knowledge, coordinate equality, log equality) that are
//! checked before any state advances; one failed check aborts the run. The
//! compared value binds the user secret to both fingerprints and the SSID,
//! so a middle-man relaying SMP cannot pass it.

use num_bigint::{BigUint, RandBigInt};
use rand::rngs::OsRng;
use tracing::debug;

use otr_crypto::dh::{modp1536, ModpGroup};
use otr_crypto::kdf::sha256;
use otr_proto::codec::{Decoder, Encoder};
use otr_proto::tlv::{
    Tlv, TLV_SMP1, TLV_SMP1Q_OR_EXTRA_KEY, TLV_SMP2, TLV_SMP3, TLV_SMP4, TLV_SMP_ABORT,
};

use crate::host::AbortReason;

/// What a processed flight means for the session layer.
pub struct SmpProgress {
    pub reply: Option<Tlv>,
    pub update: SmpUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpUpdate {
    None,
    /// Ask the host for the secret; payload is the peer's question.
    RequestSecret(String),
    Completed(bool),
    Aborted(AbortReason),
}

enum SmpState {
    Expect1,
    WaitingForSecret {
        g2a: BigUint,
        g3a: BigUint,
        question: Option<String>,
    },
    Expect2 {
        x: BigUint,
        a2: BigUint,
        a3: BigUint,
    },
    Expect3 {
        g3a: BigUint,
        g2: BigUint,
        g3: BigUint,
        b3: BigUint,
        pb: BigUint,
        qb: BigUint,
    },
    Expect4 {
        a3: BigUint,
        g3b: BigUint,
        pa_pb: BigUint,
        qa_qb: BigUint,
    },
}

pub struct Smp3 {
    state: SmpState,
    ssid: [u8; 8],
    our_fingerprint: [u8; 20],
    their_fingerprint: [u8; 20],
}

struct Violation(&'static str);

impl Smp3 {
    pub fn new(ssid: [u8; 8], our_fingerprint: [u8; 20], their_fingerprint: [u8; 20]) -> Self {
        Self { state: SmpState::Expect1, ssid, our_fingerprint, their_fingerprint }
    }

    pub fn in_progress(&self) -> bool {
        !matches!(self.state, SmpState::Expect1)
    }

    /// Begin a run as initiator. Returns the TLVs to send: an abort first
    /// when a previous run was still live.
    pub fn initiate(&mut self, question: Option<&str>, answer: &[u8]) -> Vec<Tlv> {
        let mut out = Vec::new();
        if self.in_progress() {
            self.state = SmpState::Expect1;
            out.push(Tlv::new(TLV_SMP_ABORT, Vec::new()));
        }
        let group = modp1536();
        let a2 = rand_exp(group);
        let a3 = rand_exp(group);
        let g2a = group.g.modpow(&a2, &group.p);
        let g3a = group.g.modpow(&a3, &group.p);
        let (c2, d2) = prove_exp(group, 1, &a2);
        let (c3, d3) = prove_exp(group, 2, &a3);
        let x = self.secret_value(true, answer);
        let mpis = encode_mpis(&[&g2a, &c2, &d2, &g3a, &c3, &d3]);
        let tlv = match question {
            Some(q) => {
                let mut value = q.as_bytes().to_vec();
                value.push(0);
                value.extend_from_slice(&mpis);
                Tlv::new(TLV_SMP1Q_OR_EXTRA_KEY, value)
            }
            None => Tlv::new(TLV_SMP1, mpis),
        };
        self.state = SmpState::Expect2 { x, a2, a3 };
        out.push(tlv);
        out
    }

    /// Provide the secret for a received SMP1; produces SMP2.
    pub fn respond(&mut self, answer: &[u8]) -> Option<Tlv> {
        let SmpState::WaitingForSecret { g2a, g3a, .. } = &self.state else {
            return None;
        };
        let group = modp1536();
        let g2a = g2a.clone();
        let g3a = g3a.clone();
        let y = self.secret_value(false, answer);
        let b2 = rand_exp(group);
        let b3 = rand_exp(group);
        let r4 = rand_exp(group);
        let g2b = group.g.modpow(&b2, &group.p);
        let g3b = group.g.modpow(&b3, &group.p);
        let (c2, d2) = prove_exp(group, 3, &b2);
        let (c3, d3) = prove_exp(group, 4, &b3);
        let g2 = g2a.modpow(&b2, &group.p);
        let g3 = g3a.modpow(&b3, &group.p);
        let pb = g3.modpow(&r4, &group.p);
        let qb = group.g.modpow(&r4, &group.p) * g2.modpow(&y, &group.p) % &group.p;
        let (cp, d5, d6) = prove_pq(group, 5, &g2, &g3, &r4, &y);
        let payload = encode_mpis(&[&g2b, &c2, &d2, &g3b, &c3, &d3, &pb, &qb, &cp, &d5, &d6]);
        self.state = SmpState::Expect3 { g3a, g2, g3, b3, pb, qb };
        Some(Tlv::new(TLV_SMP2, payload))
    }

    /// Abort locally (user request). Resets and returns the abort TLV.
    pub fn abort(&mut self) -> Tlv {
        self.state = SmpState::Expect1;
        Tlv::new(TLV_SMP_ABORT, Vec::new())
    }

    /// Process an inbound SMP TLV.
    pub fn handle_tlv(&mut self, tlv: &Tlv) -> SmpProgress {
        if tlv.typ == TLV_SMP_ABORT {
            let was_live = self.in_progress();
            self.state = SmpState::Expect1;
            return SmpProgress {
                reply: None,
                update: if was_live {
                    SmpUpdate::Aborted(AbortReason::Interruption)
                } else {
                    SmpUpdate::None
                },
            };
        }
        match self.step(tlv) {
            Ok(progress) => progress,
            Err(Violation(what)) => {
                debug!(what, "SMP check failed; aborting");
                self.state = SmpState::Expect1;
                SmpProgress {
                    reply: Some(Tlv::new(TLV_SMP_ABORT, Vec::new())),
                    update: SmpUpdate::Aborted(AbortReason::Violation),
                }
            }
        }
    }

    fn step(&mut self, tlv: &Tlv) -> Result<SmpProgress, Violation> {
        let group = modp1536();
        // consume the state; every arm installs its successor, and the
        // violation path leaves the reset state in place
        let state = std::mem::replace(&mut self.state, SmpState::Expect1);
        match (tlv.typ, state) {
            (TLV_SMP1 | TLV_SMP1Q_OR_EXTRA_KEY, SmpState::Expect1) => {
                let (question, mpi_bytes) = if tlv.typ == TLV_SMP1Q_OR_EXTRA_KEY {
                    let nul = tlv
                        .value
                        .iter()
                        .position(|&b| b == 0)
                        .ok_or(Violation("SMP1Q without question terminator"))?;
                    let question = String::from_utf8_lossy(&tlv.value[..nul]).into_owned();
                    (Some(question), &tlv.value[nul + 1..])
                } else {
                    (None, &tlv.value[..])
                };
                let v = decode_mpis(mpi_bytes, 6)?;
                let [g2a, c2, d2, g3a, c3, d3] = v.try_into().map_err(|_| Violation("arity"))?;
                check_element(group, &g2a)?;
                check_element(group, &g3a)?;
                verify_exp(group, 1, &g2a, &c2, &d2)?;
                verify_exp(group, 2, &g3a, &c3, &d3)?;
                let question_text = question.clone().unwrap_or_default();
                self.state = SmpState::WaitingForSecret { g2a, g3a, question };
                Ok(SmpProgress {
                    reply: None,
                    update: SmpUpdate::RequestSecret(question_text),
                })
            }
            (TLV_SMP2, SmpState::Expect2 { x, a2, a3 }) => {
                let v = decode_mpis(&tlv.value, 11)?;
                let [g2b, c2, d2, g3b, c3, d3, pb, qb, cp, d5, d6] =
                    v.try_into().map_err(|_| Violation("arity"))?;
                for e in [&g2b, &g3b, &pb, &qb] {
                    check_element(group, e)?;
                }
                verify_exp(group, 3, &g2b, &c2, &d2)?;
                verify_exp(group, 4, &g3b, &c3, &d3)?;
                let g2 = g2b.modpow(&a2, &group.p);
                let g3 = g3b.modpow(&a3, &group.p);
                verify_pq(group, 5, &g2, &g3, &pb, &qb, &cp, &d5, &d6)?;

                let r4 = rand_exp(group);
                let pa = g3.modpow(&r4, &group.p);
                let qa = group.g.modpow(&r4, &group.p) * g2.modpow(&x, &group.p) % &group.p;
                let (cp2, d52, d62) = prove_pq(group, 6, &g2, &g3, &r4, &x);
                let qa_qb = &qa * invert(group, &qb) % &group.p;
                let ra = qa_qb.modpow(&a3, &group.p);
                let (cr, d7) = prove_log_eq(group, 7, &qa_qb, &a3);
                let payload = encode_mpis(&[&pa, &qa, &cp2, &d52, &d62, &ra, &cr, &d7]);
                let pa_pb = &pa * invert(group, &pb) % &group.p;
                self.state = SmpState::Expect4 { a3, g3b, pa_pb, qa_qb };
                Ok(SmpProgress { reply: Some(Tlv::new(TLV_SMP3, payload)), update: SmpUpdate::None })
            }
            (TLV_SMP3, SmpState::Expect3 { g3a, g2, g3, b3, pb, qb }) => {
                let v = decode_mpis(&tlv.value, 8)?;
                let [pa, qa, cp, d5, d6, ra, cr, d7] =
                    v.try_into().map_err(|_| Violation("arity"))?;
                for e in [&pa, &qa, &ra] {
                    check_element(group, e)?;
                }
                verify_pq(group, 6, &g2, &g3, &pa, &qa, &cp, &d5, &d6)?;
                let qa_qb = &qa * invert(group, &qb) % &group.p;
                verify_log_eq(group, 7, &g3a, &qa_qb, &ra, &cr, &d7)?;

                let rb = qa_qb.modpow(&b3, &group.p);
                let (cr2, d72) = prove_log_eq(group, 8, &qa_qb, &b3);
                let payload = encode_mpis(&[&rb, &cr2, &d72]);
                let rab = ra.modpow(&b3, &group.p);
                let verified = rab == &pa * invert(group, &pb) % &group.p;
                Ok(SmpProgress {
                    reply: Some(Tlv::new(TLV_SMP4, payload)),
                    update: SmpUpdate::Completed(verified),
                })
            }
            (TLV_SMP4, SmpState::Expect4 { a3, g3b, pa_pb, qa_qb }) => {
                let v = decode_mpis(&tlv.value, 3)?;
                let [rb, cr, d7] = v.try_into().map_err(|_| Violation("arity"))?;
                check_element(group, &rb)?;
                verify_log_eq(group, 8, &g3b, &qa_qb, &rb, &cr, &d7)?;
                let rab = rb.modpow(&a3, &group.p);
                let verified = rab == pa_pb;
                Ok(SmpProgress { reply: None, update: SmpUpdate::Completed(verified) })
            }
            _ => Err(Violation("TLV does not fit the current SMP state")),
        }
    }

    /// x = SHA-256(0x01 || initiator fpr || responder fpr || ssid || answer).
    fn secret_value(&self, we_initiate: bool, answer: &[u8]) -> BigUint {
        let (first, second) = if we_initiate {
            (&self.our_fingerprint, &self.their_fingerprint)
        } else {
            (&self.their_fingerprint, &self.our_fingerprint)
        };
        let mut input = Vec::with_capacity(1 + 20 + 20 + 8 + answer.len());
        input.push(0x01);
        input.extend_from_slice(first);
        input.extend_from_slice(second);
        input.extend_from_slice(&self.ssid);
        input.extend_from_slice(answer);
        BigUint::from_bytes_be(&sha256(&input))
    }
}

// ── Group and proof helpers ──────────────────────────────────────────────────

fn rand_exp(group: &ModpGroup) -> BigUint {
    OsRng.gen_biguint_below(&group.q)
}

fn check_element(group: &ModpGroup, e: &BigUint) -> Result<(), Violation> {
    if group.valid_public(e) {
        Ok(())
    } else {
        Err(Violation("group element out of range"))
    }
}

fn invert(group: &ModpGroup, e: &BigUint) -> BigUint {
    // p is prime: e^(p-2) mod p
    let exp = &group.p - BigUint::from(2u8);
    e.modpow(&exp, &group.p)
}

fn hash_ints(version: u8, values: &[&BigUint]) -> BigUint {
    let mut enc = Encoder::new();
    enc.write_u8(version);
    for v in values {
        enc.write_mpi(v);
    }
    BigUint::from_bytes_be(&sha256(enc.as_bytes()))
}

/// d = (r - x*c) mod q.
fn response(group: &ModpGroup, r: &BigUint, x: &BigUint, c: &BigUint) -> BigUint {
    let xc = x * (c % &group.q) % &group.q;
    ((r % &group.q) + &group.q - xc) % &group.q
}

/// Knowledge of the exponent behind `g^x`.
fn prove_exp(group: &ModpGroup, version: u8, x: &BigUint) -> (BigUint, BigUint) {
    let r = rand_exp(group);
    let c = hash_ints(version, &[&group.g.modpow(&r, &group.p)]);
    let d = response(group, &r, x, &c);
    (c, d)
}

fn verify_exp(
    group: &ModpGroup,
    version: u8,
    public: &BigUint,
    c: &BigUint,
    d: &BigUint,
) -> Result<(), Violation> {
    let t = group.g.modpow(d, &group.p) * public.modpow(&(c % &group.q), &group.p) % &group.p;
    if hash_ints(version, &[&t]) == *c {
        Ok(())
    } else {
        Err(Violation("exponent proof"))
    }
}

/// pb/qb (or pa/qa) well-formedness: pb = g3^r, qb = g^r * g2^secret.
fn prove_pq(
    group: &ModpGroup,
    version: u8,
    g2: &BigUint,
    g3: &BigUint,
    r: &BigUint,
    secret: &BigUint,
) -> (BigUint, BigUint, BigUint) {
    let w5 = rand_exp(group);
    let w6 = rand_exp(group);
    let t1 = g3.modpow(&w5, &group.p);
    let t2 = group.g.modpow(&w5, &group.p) * g2.modpow(&w6, &group.p) % &group.p;
    let cp = hash_ints(version, &[&t1, &t2]);
    let d5 = response(group, &w5, r, &cp);
    let d6 = response(group, &w6, secret, &cp);
    (cp, d5, d6)
}

#[allow(clippy::too_many_arguments)]
fn verify_pq(
    group: &ModpGroup,
    version: u8,
    g2: &BigUint,
    g3: &BigUint,
    p_val: &BigUint,
    q_val: &BigUint,
    cp: &BigUint,
    d5: &BigUint,
    d6: &BigUint,
) -> Result<(), Violation> {
    let cq = cp % &group.q;
    let t1 = g3.modpow(d5, &group.p) * p_val.modpow(&cq, &group.p) % &group.p;
    let t2 = group.g.modpow(d5, &group.p)
        * g2.modpow(d6, &group.p)
        % &group.p
        * q_val.modpow(&cq, &group.p)
        % &group.p;
    if hash_ints(version, &[&t1, &t2]) == *cp {
        Ok(())
    } else {
        Err(Violation("coordinate proof"))
    }
}

/// Equality of logs: public = g^x and r_val = base^x.
fn prove_log_eq(group: &ModpGroup, version: u8, base: &BigUint, x: &BigUint) -> (BigUint, BigUint) {
    let w = rand_exp(group);
    let t1 = group.g.modpow(&w, &group.p);
    let t2 = base.modpow(&w, &group.p);
    let cr = hash_ints(version, &[&t1, &t2]);
    let d = response(group, &w, x, &cr);
    (cr, d)
}

fn verify_log_eq(
    group: &ModpGroup,
    version: u8,
    public: &BigUint,
    base: &BigUint,
    r_val: &BigUint,
    cr: &BigUint,
    d: &BigUint,
) -> Result<(), Violation> {
    let cq = cr % &group.q;
    let t1 = group.g.modpow(d, &group.p) * public.modpow(&cq, &group.p) % &group.p;
    let t2 = base.modpow(d, &group.p) * r_val.modpow(&cq, &group.p) % &group.p;
    if hash_ints(version, &[&t1, &t2]) == *cr {
        Ok(())
    } else {
        Err(Violation("log-equality proof"))
    }
}

fn encode_mpis(values: &[&BigUint]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.write_u32(values.len() as u32);
    for v in values {
        enc.write_mpi(v);
    }
    enc.finish()
}

fn decode_mpis(bytes: &[u8], expected: usize) -> Result<Vec<BigUint>, Violation> {
    let mut dec = Decoder::new(bytes);
    let count = dec.read_u32().map_err(|_| Violation("MPI count"))? as usize;
    if count != expected {
        return Err(Violation("MPI count mismatch"));
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(dec.read_mpi().map_err(|_| Violation("MPI body"))?);
    }
    if dec.remaining() != 0 {
        return Err(Violation("trailing SMP bytes"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Smp3, Smp3) {
        let ssid = [7u8; 8];
        let fpr_a = [0xaa; 20];
        let fpr_b = [0xbb; 20];
        (Smp3::new(ssid, fpr_a, fpr_b), Smp3::new(ssid, fpr_b, fpr_a))
    }

    fn run(answer_a: &[u8], answer_b: &[u8], question: Option<&str>) -> (bool, bool) {
        let (mut alice, mut bob) = pair();
        let tlvs = alice.initiate(question, answer_a);
        assert_eq!(tlvs.len(), 1);
        let p1 = bob.handle_tlv(&tlvs[0]);
        assert!(matches!(p1.update, SmpUpdate::RequestSecret(_)));
        let smp2 = bob.respond(answer_b).expect("SMP2");
        let p2 = alice.handle_tlv(&smp2);
        let smp3 = p2.reply.expect("SMP3");
        let p3 = bob.handle_tlv(&smp3);
        let SmpUpdate::Completed(bob_ok) = p3.update else {
            panic!("bob must complete")
        };
        let smp4 = p3.reply.expect("SMP4");
        let p4 = alice.handle_tlv(&smp4);
        let SmpUpdate::Completed(alice_ok) = p4.update else {
            panic!("alice must complete")
        };
        (alice_ok, bob_ok)
    }

    #[test]
    fn matching_secrets_verify() {
        let (a, b) = run(b"Nobody knows!", b"Nobody knows!", Some("What's the secret?"));
        assert!(a && b);
    }

    #[test]
    fn mismatched_secrets_fail() {
        let (a, b) = run(b"Nobody knows!", b"Everybody knows!", None);
        assert!(!a && !b);
    }

    #[test]
    fn question_is_surfaced() {
        let (mut alice, mut bob) = pair();
        let tlvs = alice.initiate(Some("Favourite colour?"), b"teal");
        let progress = bob.handle_tlv(&tlvs[0]);
        assert_eq!(
            progress.update,
            SmpUpdate::RequestSecret("Favourite colour?".into())
        );
    }

    #[test]
    fn out_of_state_tlv_aborts() {
        let (mut alice, _) = pair();
        let progress = alice.handle_tlv(&Tlv::new(TLV_SMP3, encode_mpis(&[])));
        assert!(matches!(progress.update, SmpUpdate::Aborted(AbortReason::Violation)));
        assert!(progress.reply.is_some());
        assert!(!alice.in_progress());
    }

    #[test]
    fn reinitiate_aborts_previous_run() {
        let (mut alice, _) = pair();
        alice.initiate(None, b"first");
        assert!(alice.in_progress());
        let tlvs = alice.initiate(None, b"second");
        assert_eq!(tlvs.len(), 2);
        assert_eq!(tlvs[0].typ, TLV_SMP_ABORT);
        assert_eq!(tlvs[1].typ, TLV_SMP1);
    }

    #[test]
    fn peer_abort_interrupts() {
        let (mut alice, mut bob) = pair();
        let tlvs = alice.initiate(None, b"secret");
        bob.handle_tlv(&tlvs[0]);
        let progress = bob.handle_tlv(&Tlv::new(TLV_SMP_ABORT, Vec::new()));
        assert!(matches!(progress.update, SmpUpdate::Aborted(AbortReason::Interruption)));
        assert!(!bob.in_progress());
    }

    #[test]
    fn tampered_flight_aborts() {
        let (mut alice, mut bob) = pair();
        let tlvs = alice.initiate(None, b"secret");
        bob.handle_tlv(&tlvs[0]);
        let mut smp2 = bob.respond(b"secret").unwrap();
        // flip a byte inside the MPI region
        let len = smp2.value.len();
        smp2.value[len - 1] ^= 0x01;
        let progress = alice.handle_tlv(&smp2);
        assert!(matches!(progress.update, SmpUpdate::Aborted(AbortReason::Violation)));
    }
}
