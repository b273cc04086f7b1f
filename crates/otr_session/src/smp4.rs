//! Socialist Millionaires Protocol over Ed448 (v4).
//!
//! Same four-flight shape as the mod-p variant, rewritten additively:
//! commitments are curve points, responses are scalars, and the Fiat-Shamir
//! challenges come from the SHAKE-256 hash-to-scalar. The v4 SMP1 always
//! carries the question as a length-prefixed field (empty when the
//! initiator asked none).

use tracing::debug;

use otr_crypto::ed448::{hash_to_scalar, Point, Scalar};
use otr_crypto::kdf::usage;
use otr_proto::codec::{Decoder, Encoder};
use otr_proto::tlv::{Tlv, TLV_SMP1, TLV_SMP2, TLV_SMP3, TLV_SMP4, TLV_SMP_ABORT};

use crate::host::AbortReason;
use crate::smp::{SmpProgress, SmpUpdate};

enum SmpState {
    Expect1,
    WaitingForSecret {
        g2a: Point,
        g3a: Point,
        question: String,
    },
    Expect2 {
        x: Scalar,
        a2: Scalar,
        a3: Scalar,
    },
    Expect3 {
        g3a: Point,
        g2: Point,
        g3: Point,
        b3: Scalar,
        pb: Point,
        qb: Point,
    },
    Expect4 {
        a3: Scalar,
        g3b: Point,
        pa_pb: Point,
        qa_qb: Point,
    },
}

pub struct Smp4 {
    state: SmpState,
    ssid: [u8; 8],
    our_fingerprint: [u8; 56],
    their_fingerprint: [u8; 56],
}

struct Violation(&'static str);

impl Smp4 {
    pub fn new(ssid: [u8; 8], our_fingerprint: [u8; 56], their_fingerprint: [u8; 56]) -> Self {
        Self { state: SmpState::Expect1, ssid, our_fingerprint, their_fingerprint }
    }

    pub fn in_progress(&self) -> bool {
        !matches!(self.state, SmpState::Expect1)
    }

    pub fn initiate(&mut self, question: Option<&str>, answer: &[u8]) -> Vec<Tlv> {
        let mut out = Vec::new();
        if self.in_progress() {
            self.state = SmpState::Expect1;
            out.push(Tlv::new(TLV_SMP_ABORT, Vec::new()));
        }
        let a2 = Scalar::random();
        let a3 = Scalar::random();
        let g2a = Point::base_mul(&a2);
        let g3a = Point::base_mul(&a3);
        let (c2, d2) = prove_exp(1, &a2);
        let (c3, d3) = prove_exp(2, &a3);
        let x = self.secret_value(true, answer);

        let mut enc = Encoder::new();
        enc.write_data(question.unwrap_or("").as_bytes());
        enc.write_point(&g2a);
        enc.write_scalar(&c2);
        enc.write_scalar(&d2);
        enc.write_point(&g3a);
        enc.write_scalar(&c3);
        enc.write_scalar(&d3);
        self.state = SmpState::Expect2 { x, a2, a3 };
        out.push(Tlv::new(TLV_SMP1, enc.finish()));
        out
    }

    pub fn respond(&mut self, answer: &[u8]) -> Option<Tlv> {
        let SmpState::WaitingForSecret { g2a, g3a, .. } = &self.state else {
            return None;
        };
        let g2a = *g2a;
        let g3a = *g3a;
        let y = self.secret_value(false, answer);
        let b2 = Scalar::random();
        let b3 = Scalar::random();
        let r4 = Scalar::random();
        let g2b = Point::base_mul(&b2);
        let g3b = Point::base_mul(&b3);
        let (c2, d2) = prove_exp(3, &b2);
        let (c3, d3) = prove_exp(4, &b3);
        let g2 = g2a.mul(&b2);
        let g3 = g3a.mul(&b3);
        let pb = g3.mul(&r4);
        let qb = Point::base_mul(&r4).add(&g2.mul(&y));
        let (cp, d5, d6) = prove_pq(5, &g2, &g3, &r4, &y);

        let mut enc = Encoder::new();
        for p in [&g2b, &g3b] {
            enc.write_point(p);
        }
        for s in [&c2, &d2, &c3, &d3] {
            enc.write_scalar(s);
        }
        enc.write_point(&pb);
        enc.write_point(&qb);
        for s in [&cp, &d5, &d6] {
            enc.write_scalar(s);
        }
        self.state = SmpState::Expect3 { g3a, g2, g3, b3, pb, qb };
        Some(Tlv::new(TLV_SMP2, enc.finish()))
    }

    pub fn abort(&mut self) -> Tlv {
        self.state = SmpState::Expect1;
        Tlv::new(TLV_SMP_ABORT, Vec::new())
    }

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
                debug!(what, "SMP4 check failed; aborting");
                self.state = SmpState::Expect1;
                SmpProgress {
                    reply: Some(Tlv::new(TLV_SMP_ABORT, Vec::new())),
                    update: SmpUpdate::Aborted(AbortReason::Violation),
                }
            }
        }
    }

    fn step(&mut self, tlv: &Tlv) -> Result<SmpProgress, Violation> {
        let state = std::mem::replace(&mut self.state, SmpState::Expect1);
        match (tlv.typ, state) {
            (TLV_SMP1, SmpState::Expect1) => {
                let mut dec = Decoder::new(&tlv.value);
                let question = String::from_utf8_lossy(
                    &dec.read_data().map_err(|_| Violation("question"))?,
                )
                .into_owned();
                let g2a = read_point(&mut dec)?;
                let c2 = read_scalar(&mut dec)?;
                let d2 = read_scalar(&mut dec)?;
                let g3a = read_point(&mut dec)?;
                let c3 = read_scalar(&mut dec)?;
                let d3 = read_scalar(&mut dec)?;
                end(&dec)?;
                check_point(&g2a)?;
                check_point(&g3a)?;
                verify_exp(1, &g2a, &c2, &d2)?;
                verify_exp(2, &g3a, &c3, &d3)?;
                let question_text = question.clone();
                self.state = SmpState::WaitingForSecret { g2a, g3a, question };
                Ok(SmpProgress {
                    reply: None,
                    update: SmpUpdate::RequestSecret(question_text),
                })
            }
            (TLV_SMP2, SmpState::Expect2 { x, a2, a3 }) => {
                let mut dec = Decoder::new(&tlv.value);
                let g2b = read_point(&mut dec)?;
                let g3b = read_point(&mut dec)?;
                let c2 = read_scalar(&mut dec)?;
                let d2 = read_scalar(&mut dec)?;
                let c3 = read_scalar(&mut dec)?;
                let d3 = read_scalar(&mut dec)?;
                let pb = read_point(&mut dec)?;
                let qb = read_point(&mut dec)?;
                let cp = read_scalar(&mut dec)?;
                let d5 = read_scalar(&mut dec)?;
                let d6 = read_scalar(&mut dec)?;
                end(&dec)?;
                for p in [&g2b, &g3b, &pb, &qb] {
                    check_point(p)?;
                }
                verify_exp(3, &g2b, &c2, &d2)?;
                verify_exp(4, &g3b, &c3, &d3)?;
                let g2 = g2b.mul(&a2);
                let g3 = g3b.mul(&a3);
                verify_pq(5, &g2, &g3, &pb, &qb, &cp, &d5, &d6)?;

                let r4 = Scalar::random();
                let pa = g3.mul(&r4);
                let qa = Point::base_mul(&r4).add(&g2.mul(&x));
                let (cp2, d52, d62) = prove_pq(6, &g2, &g3, &r4, &x);
                let qa_qb = qa.sub(&qb);
                let ra = qa_qb.mul(&a3);
                let (cr, d7) = prove_log_eq(7, &qa_qb, &a3);

                let mut enc = Encoder::new();
                enc.write_point(&pa);
                enc.write_point(&qa);
                for s in [&cp2, &d52, &d62] {
                    enc.write_scalar(s);
                }
                enc.write_point(&ra);
                enc.write_scalar(&cr);
                enc.write_scalar(&d7);
                let pa_pb = pa.sub(&pb);
                self.state = SmpState::Expect4 { a3, g3b, pa_pb, qa_qb };
                Ok(SmpProgress {
                    reply: Some(Tlv::new(TLV_SMP3, enc.finish())),
                    update: SmpUpdate::None,
                })
            }
            (TLV_SMP3, SmpState::Expect3 { g3a, g2, g3, b3, pb, qb }) => {
                let mut dec = Decoder::new(&tlv.value);
                let pa = read_point(&mut dec)?;
                let qa = read_point(&mut dec)?;
                let cp = read_scalar(&mut dec)?;
                let d5 = read_scalar(&mut dec)?;
                let d6 = read_scalar(&mut dec)?;
                let ra = read_point(&mut dec)?;
                let cr = read_scalar(&mut dec)?;
                let d7 = read_scalar(&mut dec)?;
                end(&dec)?;
                for p in [&pa, &qa, &ra] {
                    check_point(p)?;
                }
                verify_pq(6, &g2, &g3, &pa, &qa, &cp, &d5, &d6)?;
                let qa_qb = qa.sub(&qb);
                verify_log_eq(7, &g3a, &qa_qb, &ra, &cr, &d7)?;

                let rb = qa_qb.mul(&b3);
                let (cr2, d72) = prove_log_eq(8, &qa_qb, &b3);
                let mut enc = Encoder::new();
                enc.write_point(&rb);
                enc.write_scalar(&cr2);
                enc.write_scalar(&d72);
                let rab = ra.mul(&b3);
                let verified = rab == pa.sub(&pb);
                Ok(SmpProgress {
                    reply: Some(Tlv::new(TLV_SMP4, enc.finish())),
                    update: SmpUpdate::Completed(verified),
                })
            }
            (TLV_SMP4, SmpState::Expect4 { a3, g3b, pa_pb, qa_qb }) => {
                let mut dec = Decoder::new(&tlv.value);
                let rb = read_point(&mut dec)?;
                let cr = read_scalar(&mut dec)?;
                let d7 = read_scalar(&mut dec)?;
                end(&dec)?;
                check_point(&rb)?;
                verify_log_eq(8, &g3b, &qa_qb, &rb, &cr, &d7)?;
                let rab = rb.mul(&a3);
                let verified = rab == pa_pb;
                Ok(SmpProgress { reply: None, update: SmpUpdate::Completed(verified) })
            }
            _ => Err(Violation("TLV does not fit the current SMP state")),
        }
    }

    /// Secret scalar bound to both fingerprints and the SSID.
    fn secret_value(&self, we_initiate: bool, answer: &[u8]) -> Scalar {
        let (first, second) = if we_initiate {
            (&self.our_fingerprint, &self.their_fingerprint)
        } else {
            (&self.their_fingerprint, &self.our_fingerprint)
        };
        let mut input = Vec::with_capacity(1 + 56 + 56 + 8 + answer.len());
        input.push(0x01);
        input.extend_from_slice(first);
        input.extend_from_slice(second);
        input.extend_from_slice(&self.ssid);
        input.extend_from_slice(answer);
        hash_to_scalar(usage::SMP_SECRET, &input)
    }
}

// ── Proof helpers ────────────────────────────────────────────────────────────

fn challenge(version: u8, points: &[&Point]) -> Scalar {
    let mut input = Vec::with_capacity(1 + points.len() * 57);
    input.push(version);
    for p in points {
        input.extend_from_slice(&p.encode());
    }
    hash_to_scalar(usage::SMP_VALUE, &input)
}

fn check_point(p: &Point) -> Result<(), Violation> {
    if p.is_identity() {
        Err(Violation("identity point"))
    } else {
        Ok(())
    }
}

fn read_point(dec: &mut Decoder<'_>) -> Result<Point, Violation> {
    dec.read_point().map_err(|_| Violation("point encoding"))
}

fn read_scalar(dec: &mut Decoder<'_>) -> Result<Scalar, Violation> {
    dec.read_scalar().map_err(|_| Violation("scalar encoding"))
}

fn end(dec: &Decoder<'_>) -> Result<(), Violation> {
    dec.expect_end().map_err(|_| Violation("trailing SMP bytes"))
}

/// Knowledge of the scalar behind `G * x`.
fn prove_exp(version: u8, x: &Scalar) -> (Scalar, Scalar) {
    let r = Scalar::random();
    let c = challenge(version, &[&Point::base_mul(&r)]);
    let d = r.sub(&x.mul(&c));
    (c, d)
}

fn verify_exp(version: u8, public: &Point, c: &Scalar, d: &Scalar) -> Result<(), Violation> {
    let t = Point::base_mul(d).add(&public.mul(c));
    if challenge(version, &[&t]).ct_eq_bytes(c) {
        Ok(())
    } else {
        Err(Violation("exponent proof"))
    }
}

/// P = G3 * r and Q = G * r + G2 * secret share the same r.
fn prove_pq(
    version: u8,
    g2: &Point,
    g3: &Point,
    r: &Scalar,
    secret: &Scalar,
) -> (Scalar, Scalar, Scalar) {
    let w5 = Scalar::random();
    let w6 = Scalar::random();
    let t1 = g3.mul(&w5);
    let t2 = Point::base_mul(&w5).add(&g2.mul(&w6));
    let cp = challenge(version, &[&t1, &t2]);
    let d5 = w5.sub(&r.mul(&cp));
    let d6 = w6.sub(&secret.mul(&cp));
    (cp, d5, d6)
}

#[allow(clippy::too_many_arguments)]
fn verify_pq(
    version: u8,
    g2: &Point,
    g3: &Point,
    p_val: &Point,
    q_val: &Point,
    cp: &Scalar,
    d5: &Scalar,
    d6: &Scalar,
) -> Result<(), Violation> {
    let t1 = g3.mul(d5).add(&p_val.mul(cp));
    let t2 = Point::base_mul(d5).add(&g2.mul(d6)).add(&q_val.mul(cp));
    if challenge(version, &[&t1, &t2]).ct_eq_bytes(cp) {
        Ok(())
    } else {
        Err(Violation("coordinate proof"))
    }
}

/// public = G * x and r_val = base * x share x.
fn prove_log_eq(version: u8, base: &Point, x: &Scalar) -> (Scalar, Scalar) {
    let w = Scalar::random();
    let t1 = Point::base_mul(&w);
    let t2 = base.mul(&w);
    let cr = challenge(version, &[&t1, &t2]);
    let d = w.sub(&x.mul(&cr));
    (cr, d)
}

fn verify_log_eq(
    version: u8,
    public: &Point,
    base: &Point,
    r_val: &Point,
    cr: &Scalar,
    d: &Scalar,
) -> Result<(), Violation> {
    let t1 = Point::base_mul(d).add(&public.mul(cr));
    let t2 = base.mul(d).add(&r_val.mul(cr));
    if challenge(version, &[&t1, &t2]).ct_eq_bytes(cr) {
        Ok(())
    } else {
        Err(Violation("log-equality proof"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Smp4, Smp4) {
        let ssid = [9u8; 8];
        let fpr_a = [0xaa; 56];
        let fpr_b = [0xbb; 56];
        (Smp4::new(ssid, fpr_a, fpr_b), Smp4::new(ssid, fpr_b, fpr_a))
    }

    fn run(answer_a: &[u8], answer_b: &[u8]) -> (bool, bool) {
        let (mut alice, mut bob) = pair();
        let tlvs = alice.initiate(Some("What's the secret?"), answer_a);
        let p1 = bob.handle_tlv(&tlvs[0]);
        assert!(matches!(p1.update, SmpUpdate::RequestSecret(_)));
        let smp2 = bob.respond(answer_b).expect("SMP2");
        let p2 = alice.handle_tlv(&smp2);
        let smp3 = p2.reply.expect("SMP3");
        let p3 = bob.handle_tlv(&smp3);
        let SmpUpdate::Completed(bob_ok) = p3.update else {
            panic!("bob must complete")
        };
        let p4 = alice.handle_tlv(&p3.reply.expect("SMP4"));
        let SmpUpdate::Completed(alice_ok) = p4.update else {
            panic!("alice must complete")
        };
        (alice_ok, bob_ok)
    }

    #[test]
    fn matching_secrets_verify() {
        let (a, b) = run(b"Nobody knows!", b"Nobody knows!");
        assert!(a && b);
    }

    #[test]
    fn mismatched_secrets_fail() {
        let (a, b) = run(b"Nobody knows!", b"Everybody knows!");
        assert!(!a && !b);
    }

    #[test]
    fn question_travels_in_smp1() {
        let (mut alice, mut bob) = pair();
        let tlvs = alice.initiate(Some("Where did we meet?"), b"library");
        let progress = bob.handle_tlv(&tlvs[0]);
        assert_eq!(
            progress.update,
            SmpUpdate::RequestSecret("Where did we meet?".into())
        );
    }

    #[test]
    fn out_of_state_tlv_aborts() {
        let (mut alice, _) = pair();
        let progress = alice.handle_tlv(&Tlv::new(TLV_SMP3, vec![]));
        assert!(matches!(progress.update, SmpUpdate::Aborted(AbortReason::Violation)));
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
        let len = smp2.value.len();
        smp2.value[len - 1] ^= 0x01;
        let progress = alice.handle_tlv(&smp2);
        assert!(matches!(progress.update, SmpUpdate::Aborted(AbortReason::Violation)));
    }
}
