//! End-to-end session scenarios, driven through the host callback surface.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use otr_crypto::dsa::{shared_parameters, DsaKeyPair};
use otr_crypto::eddsa::Ed448KeyPair;
use otr_session::{
    Event, Host, InstanceTag, OtrPolicy, Session, SessionId, SessionStatus, Version,
};

// ── Test host ────────────────────────────────────────────────────────────────

struct TestHost {
    policy: OtrPolicy,
    max_fragment: usize,
    dsa: DsaKeyPair,
    longterm: Ed448KeyPair,
    forging: Ed448KeyPair,
    outbox: Mutex<VecDeque<String>>,
    events: Mutex<Vec<(InstanceTag, Event)>>,
    profile_payload: Mutex<Vec<u8>>,
}

impl TestHost {
    fn new(policy: OtrPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            max_fragment: usize::MAX,
            dsa: DsaKeyPair::generate_in(shared_parameters()),
            longterm: Ed448KeyPair::generate(),
            forging: Ed448KeyPair::generate(),
            outbox: Mutex::new(VecDeque::new()),
            events: Mutex::new(Vec::new()),
            profile_payload: Mutex::new(Vec::new()),
        })
    }

    fn with_fragmentation(policy: OtrPolicy, max_fragment: usize) -> Arc<Self> {
        let mut host = Self::new(policy);
        Arc::get_mut(&mut host).unwrap().max_fragment = max_fragment;
        host
    }

    fn pop(&self) -> Option<String> {
        self.outbox.lock().pop_front()
    }

    fn drain(&self) -> Vec<String> {
        self.outbox.lock().drain(..).collect()
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    fn has_event(&self, pred: impl Fn(&Event) -> bool) -> bool {
        self.events().iter().any(|e| pred(e))
    }
}

impl Host for TestHost {
    fn inject_message(&self, _id: &SessionId, message: &str) {
        self.outbox.lock().push_back(message.to_string());
    }

    fn session_policy(&self, _id: &SessionId) -> OtrPolicy {
        self.policy
    }

    fn max_fragment_size(&self, _id: &SessionId) -> usize {
        self.max_fragment
    }

    fn local_dsa_key_pair(&self, _id: &SessionId) -> DsaKeyPair {
        self.dsa.clone()
    }

    fn long_term_key_pair(&self, _id: &SessionId) -> Ed448KeyPair {
        self.longterm.clone()
    }

    fn forging_key_pair(&self, _id: &SessionId) -> Ed448KeyPair {
        self.forging.clone()
    }

    fn update_client_profile_payload(&self, payload: &[u8]) {
        *self.profile_payload.lock() = payload.to_vec();
    }

    fn restore_client_profile_payload(&self) -> Vec<u8> {
        self.profile_payload.lock().clone()
    }

    fn on_event(&self, _id: &SessionId, receiver_tag: InstanceTag, event: Event) {
        self.events.lock().push((receiver_tag, event));
    }
}

fn alice_id() -> SessionId {
    SessionId::new("alice", "bob", "testnet")
}

fn bob_id() -> SessionId {
    SessionId::new("bob", "alice", "testnet")
}

/// Shuttle queued wire traffic until both directions go quiet.
fn pump(alice: &Session, alice_host: &TestHost, bob: &Session, bob_host: &TestHost) {
    loop {
        let mut moved = false;
        while let Some(m) = alice_host.pop() {
            bob.transform_receiving(&m).unwrap();
            moved = true;
        }
        while let Some(m) = bob_host.pop() {
            alice.transform_receiving(&m).unwrap();
            moved = true;
        }
        if !moved {
            break;
        }
    }
}

fn encrypted_v4_pair() -> (Session, Arc<TestHost>, Session, Arc<TestHost>) {
    let alice_host = TestHost::new(OtrPolicy::ALLOW_V4);
    let bob_host = TestHost::new(OtrPolicy::ALLOW_V4);
    let alice = Session::new(alice_id(), alice_host.clone()).unwrap();
    let bob = Session::new(bob_id(), bob_host.clone()).unwrap();
    alice.start_session();
    pump(&alice, &alice_host, &bob, &bob_host);
    assert_eq!(alice.status(), SessionStatus::Encrypted);
    assert_eq!(bob.status(), SessionStatus::Encrypted);
    (alice, alice_host, bob, bob_host)
}

fn deliver_sent(
    from: &Session,
    text: &str,
    to: &Session,
) -> Vec<otr_session::ReceiveResult> {
    from.transform_sending(text, &[])
        .unwrap()
        .iter()
        .map(|part| to.transform_receiving(part).unwrap())
        .collect()
}

// ── Scenario 1: v4 handshake + single message ────────────────────────────────

#[test]
fn v4_handshake_and_single_message() {
    let (alice, alice_host, bob, bob_host) = encrypted_v4_pair();
    assert_eq!(alice.get_remote_info().version, Version::Four);
    assert_eq!(bob.get_remote_info().version, Version::Four);

    let results = deliver_sent(&alice, "Hello Bob!", &bob);
    let content: Vec<_> = results.iter().filter_map(|r| r.content.clone()).collect();
    assert_eq!(content, vec!["Hello Bob!".to_string()]);
    assert!(results.iter().all(|r| r.confidential && !r.rejected));

    assert!(!alice_host.has_event(|e| matches!(e, Event::UnencryptedMessageReceived(_))));
    assert!(!bob_host.has_event(|e| matches!(e, Event::UnencryptedMessageReceived(_))));
}

#[test]
fn v4_conversation_both_directions() {
    let (alice, _ah, bob, _bh) = encrypted_v4_pair();
    for round in 0..3 {
        let a_text = format!("alice round {round}");
        let results = deliver_sent(&alice, &a_text, &bob);
        assert!(results.iter().any(|r| r.content.as_deref() == Some(a_text.as_str())));
        let b_text = format!("bob round {round}");
        let results = deliver_sent(&bob, &b_text, &alice);
        assert!(results.iter().any(|r| r.content.as_deref() == Some(b_text.as_str())));
    }
}

// ── Scenario 2: mixed-version coexistence ────────────────────────────────────

#[test]
fn mixed_version_instances() {
    let alice_host = TestHost::new(
        OtrPolicy::ALLOW_V2 | OtrPolicy::ALLOW_V3 | OtrPolicy::ALLOW_V4,
    );
    let bob1_host = TestHost::new(OtrPolicy::ALLOW_V3 | OtrPolicy::ALLOW_V4);
    let bob2_host = TestHost::new(OtrPolicy::ALLOW_V2 | OtrPolicy::ALLOW_V3);
    let alice = Session::new(alice_id(), alice_host.clone()).unwrap();
    let bob1 = Session::new(bob_id(), bob1_host.clone()).unwrap();
    let bob2 = Session::new(bob_id(), bob2_host.clone()).unwrap();

    // the query reaches both of bob's clients
    alice.start_session();
    let query = alice_host.pop().unwrap();
    bob1.transform_receiving(&query).unwrap();
    bob2.transform_receiving(&query).unwrap();

    // run both handshakes to quiescence, broadcasting alice's traffic
    loop {
        let mut moved = false;
        for m in bob1_host.drain() {
            alice.transform_receiving(&m).unwrap();
            moved = true;
        }
        for m in bob2_host.drain() {
            alice.transform_receiving(&m).unwrap();
            moved = true;
        }
        for m in alice_host.drain() {
            bob1.transform_receiving(&m).unwrap();
            bob2.transform_receiving(&m).unwrap();
            moved = true;
        }
        if !moved {
            break;
        }
    }
    assert_eq!(bob1.status(), SessionStatus::Encrypted);
    assert_eq!(bob1.get_remote_info().version, Version::Four);
    assert_eq!(bob2.status(), SessionStatus::Encrypted);
    assert_eq!(bob2.get_remote_info().version, Version::Three);

    // address bob1 explicitly; bob2 sees traffic for another instance
    alice.set_outgoing_instance(bob1.sender_tag()).unwrap();
    for part in alice.transform_sending("hello bob one", &[]).unwrap() {
        let r1 = bob1.transform_receiving(&part).unwrap();
        assert_eq!(r1.content.as_deref(), Some("hello bob one"));
        let r2 = bob2.transform_receiving(&part).unwrap();
        assert!(r2.rejected);
    }
    assert!(bob2_host.has_event(|e| matches!(e, Event::MessageForAnotherInstanceReceived)));

    // and the other way round
    alice.set_outgoing_instance(bob2.sender_tag()).unwrap();
    for part in alice.transform_sending("hello bob two", &[]).unwrap() {
        let r2 = bob2.transform_receiving(&part).unwrap();
        assert_eq!(r2.content.as_deref(), Some("hello bob two"));
        let r1 = bob1.transform_receiving(&part).unwrap();
        assert!(r1.rejected);
    }
    assert!(bob1_host.has_event(|e| matches!(e, Event::MessageForAnotherInstanceReceived)));

    // alice saw two distinct remote instances under one account
    assert!(alice_host.has_event(|e| matches!(e, Event::MultipleInstancesDetected)));
}

#[test]
fn v2_session_runs_entirely_on_the_master_instance() {
    let alice_host = TestHost::new(OtrPolicy::ALLOW_V2);
    let bob_host = TestHost::new(OtrPolicy::ALLOW_V2);
    let alice = Session::new(alice_id(), alice_host.clone()).unwrap();
    let bob = Session::new(bob_id(), bob_host.clone()).unwrap();
    alice.start_session();
    pump(&alice, &alice_host, &bob, &bob_host);
    assert_eq!(alice.status(), SessionStatus::Encrypted);
    assert_eq!(bob.status(), SessionStatus::Encrypted);
    assert_eq!(alice.get_remote_info().version, Version::Two);
    // v2 carries no instance tags; traffic stays on the master
    assert_eq!(alice.get_remote_info().tag, InstanceTag::ZERO);

    let results = deliver_sent(&alice, "legacy but private", &bob);
    assert!(results.iter().any(|r| r.content.as_deref() == Some("legacy but private")));
    let results = deliver_sent(&bob, "still works", &alice);
    assert!(results.iter().any(|r| r.content.as_deref() == Some("still works")));
}

// ── Scenario 3: SMP success and failure ──────────────────────────────────────

fn smp_outcomes(host: &TestHost) -> Vec<bool> {
    host.events()
        .iter()
        .filter_map(|e| match e {
            Event::SmpCompleted(r) => Some(r.verified),
            _ => None,
        })
        .collect()
}

#[test]
fn smp_with_matching_answers_verifies() {
    let (alice, alice_host, bob, bob_host) = encrypted_v4_pair();
    alice
        .init_smp(Some("What's the secret?"), "Nobody knows!")
        .unwrap();
    pump(&alice, &alice_host, &bob, &bob_host);
    assert!(bob_host.has_event(
        |e| matches!(e, Event::SmpRequestSecret(q) if q == "What's the secret?")
    ));
    bob.respond_smp("Nobody knows!").unwrap();
    pump(&alice, &alice_host, &bob, &bob_host);
    assert_eq!(smp_outcomes(&alice_host), vec![true]);
    assert_eq!(smp_outcomes(&bob_host), vec![true]);
    assert!(!alice.is_smp_in_progress());
}

#[test]
fn smp_with_mismatched_answers_fails() {
    let (alice, alice_host, bob, bob_host) = encrypted_v4_pair();
    alice
        .init_smp(Some("What's the secret?"), "Nobody knows!")
        .unwrap();
    pump(&alice, &alice_host, &bob, &bob_host);
    bob.respond_smp("Everybody knows!").unwrap();
    pump(&alice, &alice_host, &bob, &bob_host);
    assert_eq!(smp_outcomes(&alice_host), vec![false]);
    assert_eq!(smp_outcomes(&bob_host), vec![false]);
}

#[test]
fn smp_works_over_v3_too() {
    let alice_host = TestHost::new(OtrPolicy::ALLOW_V3);
    let bob_host = TestHost::new(OtrPolicy::ALLOW_V3);
    let alice = Session::new(alice_id(), alice_host.clone()).unwrap();
    let bob = Session::new(bob_id(), bob_host.clone()).unwrap();
    alice.start_session();
    pump(&alice, &alice_host, &bob, &bob_host);
    assert_eq!(alice.status(), SessionStatus::Encrypted);
    assert_eq!(alice.get_remote_info().version, Version::Three);

    alice.init_smp(None, "shared secret").unwrap();
    pump(&alice, &alice_host, &bob, &bob_host);
    bob.respond_smp("shared secret").unwrap();
    pump(&alice, &alice_host, &bob, &bob_host);
    assert_eq!(smp_outcomes(&alice_host), vec![true]);
    assert_eq!(smp_outcomes(&bob_host), vec![true]);
}

// ── Scenario 4: fragmented out-of-order reassembly ───────────────────────────

#[test]
fn shuffled_fragments_reassemble() {
    let alice_host = TestHost::with_fragmentation(OtrPolicy::ALLOW_V4, 150);
    let bob_host = TestHost::with_fragmentation(OtrPolicy::ALLOW_V4, 150);
    let alice = Session::new(alice_id(), alice_host.clone()).unwrap();
    let bob = Session::new(bob_id(), bob_host.clone()).unwrap();
    alice.start_session();
    pump(&alice, &alice_host, &bob, &bob_host);
    assert_eq!(bob.status(), SessionStatus::Encrypted);

    let text = "a rather long confidential message ".repeat(8);
    let mut fragments = alice.transform_sending(&text, &[]).unwrap();
    assert!(fragments.len() >= 4, "expected >= 4 fragments, got {}", fragments.len());

    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    fragments.shuffle(&mut rng);
    let mut delivered = None;
    for part in &fragments {
        let r = bob.transform_receiving(part).unwrap();
        assert!(!r.rejected);
        if let Some(content) = r.content {
            delivered = Some(content);
        }
    }
    assert_eq!(delivered.as_deref(), Some(text.as_str()));
}

// ── Scenario 5: dropped fragment ─────────────────────────────────────────────

#[test]
fn dropped_fragment_does_not_wedge_the_session() {
    let alice_host = TestHost::with_fragmentation(OtrPolicy::ALLOW_V4, 150);
    let bob_host = TestHost::with_fragmentation(OtrPolicy::ALLOW_V4, 150);
    let alice = Session::new(alice_id(), alice_host.clone()).unwrap();
    let bob = Session::new(bob_id(), bob_host.clone()).unwrap();
    alice.start_session();
    pump(&alice, &alice_host, &bob, &bob_host);

    let text = "a rather long confidential message ".repeat(8);
    let mut fragments = alice.transform_sending(&text, &[]).unwrap();
    assert!(fragments.len() >= 4);
    fragments.remove(2);
    for part in &fragments {
        let r = bob.transform_receiving(part).unwrap();
        assert_eq!(r.content, None);
    }

    // the next full message still decrypts
    let results = deliver_sent(&alice, "short follow-up", &bob);
    assert!(results.iter().any(|r| r.content.as_deref() == Some("short follow-up")));
}

// ── Scenario 6: malicious ratchet interference ───────────────────────────────

#[test]
fn forged_ratchet_messages_are_rejected_without_state_damage() {
    use otr_proto::message::{
        DataMessage4, EncodedMessage, MessageBody, MessageHeader,
    };

    let (alice, _alice_host, bob, bob_host) = encrypted_v4_pair();

    // a legitimate message, prepared but not yet delivered
    let legit = alice.transform_sending("the real message", &[]).unwrap();

    // two forgeries pointing at the current ratchet with random keys
    for n in 0..2u8 {
        let forged = EncodedMessage {
            header: MessageHeader {
                version: Version::Four,
                sender_tag: alice.sender_tag().0,
                receiver_tag: bob.sender_tag().0,
            },
            body: MessageBody::Data4(DataMessage4 {
                flags: 0,
                prev_chain_len: 0,
                ratchet_id: 1,
                message_id: n as u32,
                ecdh: otr_crypto::ed448::EcdhKeyPair::generate().public,
                dh: Some(
                    otr_crypto::dh::DhKeyPair::generate(otr_crypto::dh::modp3072())
                        .public
                        .clone(),
                ),
                encrypted: vec![n; 48],
                authenticator: [n; 64],
                revealed_macs: vec![],
            }),
        };
        let r = bob.transform_receiving(&forged.encode_text()).unwrap();
        assert!(r.rejected);
    }
    assert!(bob_host.has_event(|e| matches!(e, Event::UnreadableMessageReceived)));

    // the legitimate message decrypts right after
    let results: Vec<_> = legit
        .iter()
        .map(|part| bob.transform_receiving(part).unwrap())
        .collect();
    assert!(results.iter().any(|r| r.content.as_deref() == Some("the real message")));
}

// ── Boundary behaviors ───────────────────────────────────────────────────────

#[test]
fn data_message_with_zero_sender_tag_is_dropped() {
    use otr_proto::message::{
        DataMessage4, EncodedMessage, MessageBody, MessageHeader,
    };
    let (_alice, _ah, bob, _bh) = encrypted_v4_pair();
    let msg = EncodedMessage {
        header: MessageHeader {
            version: Version::Four,
            sender_tag: 0,
            receiver_tag: bob.sender_tag().0,
        },
        body: MessageBody::Data4(DataMessage4 {
            flags: 0,
            prev_chain_len: 0,
            ratchet_id: 0,
            message_id: 0,
            ecdh: otr_crypto::ed448::EcdhKeyPair::generate().public,
            dh: None,
            encrypted: vec![1, 2, 3],
            authenticator: [0; 64],
            revealed_macs: vec![],
        }),
    };
    let r = bob.transform_receiving(&msg.encode_text()).unwrap();
    assert!(r.rejected);
}

#[test]
fn plaintext_while_encrypted_raises_event() {
    let (_alice, _ah, bob, bob_host) = encrypted_v4_pair();
    let r = bob.transform_receiving("just some plaintext").unwrap();
    assert_eq!(r.content.as_deref(), Some("just some plaintext"));
    assert!(!r.confidential);
    assert!(bob_host.has_event(|e| matches!(e, Event::UnencryptedMessageReceived(_))));
}

#[test]
fn require_encryption_holds_back_plaintext() {
    let host = TestHost::new(OtrPolicy::ALLOW_V4 | OtrPolicy::REQUIRE_ENCRYPTION);
    let session = Session::new(alice_id(), host.clone()).unwrap();
    let sent = session.transform_sending("secret thought", &[]).unwrap();
    assert!(sent.is_empty());
    assert!(host.has_event(
        |e| matches!(e, Event::EncryptedMessagesRequired(t) if t == "secret thought")
    ));
    // a query went out instead
    assert!(host.drain().iter().any(|m| m.starts_with("?OTRv")));
}

#[test]
fn end_session_finishes_peer() {
    let (alice, alice_host, bob, bob_host) = encrypted_v4_pair();
    alice.end_session().unwrap();
    pump(&alice, &alice_host, &bob, &bob_host);
    assert_eq!(bob.status(), SessionStatus::Finished);
    assert!(bob_host.has_event(|e| matches!(e, Event::SessionFinished)));
    assert_eq!(alice.status(), SessionStatus::Plaintext);
    // sending on a finished session is rejected
    assert!(bob.transform_sending("too late", &[]).is_err());
}

#[test]
fn whitespace_tagged_plaintext_starts_negotiation() {
    let alice_host = TestHost::new(
        OtrPolicy::ALLOW_V4 | OtrPolicy::SEND_WHITESPACE_TAG,
    );
    let bob_host = TestHost::new(
        OtrPolicy::ALLOW_V4 | OtrPolicy::WHITESPACE_START_AKE,
    );
    let alice = Session::new(alice_id(), alice_host.clone()).unwrap();
    let bob = Session::new(bob_id(), bob_host.clone()).unwrap();

    let tagged = alice.transform_sending("hi there", &[]).unwrap();
    assert_eq!(tagged.len(), 1);
    let r = bob.transform_receiving(&tagged[0]).unwrap();
    assert_eq!(r.content.as_deref(), Some("hi there"));
    // bob reacted to the tag with an Identity message; finish the handshake
    pump(&alice, &alice_host, &bob, &bob_host);
    assert_eq!(alice.status(), SessionStatus::Encrypted);
    assert_eq!(bob.status(), SessionStatus::Encrypted);
}

#[test]
fn error_message_surfaces_and_optionally_restarts() {
    let host = TestHost::new(OtrPolicy::ALLOW_V4 | OtrPolicy::ERROR_START_AKE);
    let session = Session::new(alice_id(), host.clone()).unwrap();
    let r = session
        .transform_receiving("?OTR Error: something went wrong")
        .unwrap();
    assert!(!r.rejected);
    assert!(host.has_event(|e| matches!(e, Event::Error(t) if t == "something went wrong")));
    // ERROR_START_AKE is the sole gate for the rekey attempt
    assert!(host.drain().iter().any(|m| m.starts_with("?OTRv")));

    let quiet_host = TestHost::new(OtrPolicy::ALLOW_V4);
    let quiet = Session::new(alice_id(), quiet_host.clone()).unwrap();
    quiet.transform_receiving("?OTR Error: nope").unwrap();
    assert!(quiet_host.drain().is_empty());
}

#[test]
fn refresh_session_renegotiates() {
    let (alice, alice_host, bob, bob_host) = encrypted_v4_pair();
    alice.refresh_session().unwrap();
    // the disconnect and the fresh query are both on the wire
    pump(&alice, &alice_host, &bob, &bob_host);
    assert_eq!(alice.status(), SessionStatus::Encrypted);
    assert_eq!(bob.status(), SessionStatus::Encrypted);
    let results = deliver_sent(&alice, "after refresh", &bob);
    assert!(results.iter().any(|r| r.content.as_deref() == Some("after refresh")));
}

#[test]
fn smp_abort_notifies_both_sides() {
    let (alice, alice_host, bob, bob_host) = encrypted_v4_pair();
    alice.init_smp(None, "secret").unwrap();
    pump(&alice, &alice_host, &bob, &bob_host);
    assert!(bob.is_smp_in_progress());
    alice.abort_smp().unwrap();
    pump(&alice, &alice_host, &bob, &bob_host);
    assert!(!bob.is_smp_in_progress());
    assert!(alice_host.has_event(|e| matches!(
        e,
        Event::SmpAborted(otr_session::AbortReason::User)
    )));
    assert!(bob_host.has_event(|e| matches!(
        e,
        Event::SmpAborted(otr_session::AbortReason::Interruption)
    )));
}

#[test]
fn extra_symmetric_keys_match() {
    let (alice, _ah, bob, _bh) = encrypted_v4_pair();
    // alice's next outbound chain is bob's next inbound chain; send one
    // message so both sides sit on the same chain
    deliver_sent(&alice, "sync", &bob);
    let key = alice.get_extra_symmetric_key().unwrap();
    assert_eq!(key.len(), 32);
}
