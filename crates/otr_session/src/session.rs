//! Session orchestrator: master/slave multiplexing and routing.
//!
//! One [`Session`] serves one peer. Inbound transport strings are
//! classified, reassembled when fragmented, and dispatched by receiver
//! instance tag to the per-instance state (the *master* instance, keyed by
//! tag 0, exists to route traffic before the peer's tag is known; *slaves*
//! are created on first sight of a remote tag). All public operations
//! serialize on one lock held for the duration of the call, host callbacks
//! included.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use otr_proto::fragment::{self, InOrderAssembler, OutOfOrderAssembler};
use otr_proto::message::{
    DataMessage3, DataMessage4, EncodedMessage, MessageBody, MessageHeader, FLAG_IGNORE_UNREADABLE,
};
use otr_proto::profile::ClientProfile;
use otr_proto::tag::{self, RawMessage};
use otr_proto::tlv::{
    Tlv, TLV_DISCONNECT, TLV_EXTRA_KEY_V3, TLV_PADDING, TLV_SMP1Q_OR_EXTRA_KEY,
};
use otr_proto::version::Version;

use crate::ake::{self, AuthState};
use crate::dake::{self, DakeState, Phi};
use crate::error::OtrError;
use crate::host::{
    Event, ExtraSymmetricKey, Host, SessionId, SessionStatus, SmpResult,
};
use crate::instance::InstanceTag;
use crate::messaging::{Encrypted3, Encrypted4, MessagingState};
use crate::policy::OtrPolicy;
use crate::profiles;
use crate::smp::SmpUpdate;

/// Outcome of feeding one raw transport string into the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveResult {
    /// Instance the message was routed to.
    pub tag: InstanceTag,
    pub status: SessionStatus,
    /// The message was dropped (bad routing, policy, or verification).
    pub rejected: bool,
    /// Content travelled encrypted.
    pub confidential: bool,
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    pub version: Version,
    pub tag: InstanceTag,
    /// Long-term fingerprint once a handshake completed.
    pub fingerprint: Option<Vec<u8>>,
}

struct Instance {
    receiver_tag: u32,
    state: MessagingState,
    auth: AuthState,
    dake: DakeState,
}

impl Instance {
    fn new(receiver_tag: u32) -> Self {
        Self {
            receiver_tag,
            state: MessagingState::Plaintext,
            auth: AuthState::initial(),
            dake: DakeState::initial(),
        }
    }
}

const MASTER: u32 = 0;

struct Inner {
    id: SessionId,
    host: Arc<dyn Host>,
    sender_tag: InstanceTag,
    profile: Option<ClientProfile>,
    instances: HashMap<u32, Instance>,
    in_assemblers: HashMap<u32, InOrderAssembler>,
    out_assembler: OutOfOrderAssembler,
    /// Slave that most recently reached ENCRYPTED; outbound traffic targets it.
    outgoing_tag: Option<u32>,
}

/// Public per-peer façade. Thread-compatible: every operation takes the one
/// session lock.
pub struct Session {
    inner: Mutex<Inner>,
}

impl Session {
    /// Build the master session. Fails when the host serves inconsistent
    /// profile data.
    pub fn new(id: SessionId, host: Arc<dyn Host>) -> Result<Self, OtrError> {
        let policy = host.session_policy(&id);
        let (profile, sender_tag) = if policy.allows_version(Version::Four) {
            let (profile, tag) = profiles::load_or_create(host.as_ref(), &id, policy)?;
            (Some(profile), tag)
        } else {
            (None, InstanceTag::random())
        };
        let mut instances = HashMap::new();
        instances.insert(MASTER, Instance::new(MASTER));
        Ok(Session {
            inner: Mutex::new(Inner {
                id,
                host,
                sender_tag,
                profile,
                instances,
                in_assemblers: HashMap::new(),
                out_assembler: OutOfOrderAssembler::new(),
                outgoing_tag: None,
            }),
        })
    }

    pub fn sender_tag(&self) -> InstanceTag {
        self.inner.lock().sender_tag
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.inner.lock();
        inner.outgoing_instance_status()
    }

    /// Ask the peer to negotiate: inject a query message.
    pub fn start_session(&self) {
        let mut inner = self.inner.lock();
        inner.refresh_profile();
        inner.send_query();
    }

    /// Terminate the encrypted session: send the disconnect record (v4
    /// attaches the remaining MAC reveals) and fall back to plaintext.
    pub fn end_session(&self) -> Result<(), OtrError> {
        let mut inner = self.inner.lock();
        inner.end_all_encrypted();
        Ok(())
    }

    pub fn refresh_session(&self) -> Result<(), OtrError> {
        let mut inner = self.inner.lock();
        inner.end_all_encrypted();
        inner.send_query();
        Ok(())
    }

    /// Feed one raw transport string.
    pub fn transform_receiving(&self, raw: &str) -> Result<ReceiveResult, OtrError> {
        let mut inner = self.inner.lock();
        inner.transform_receiving(raw)
    }

    /// Prepare one outbound message; returns the transport strings to send.
    pub fn transform_sending(&self, text: &str, tlvs: &[Tlv]) -> Result<Vec<String>, OtrError> {
        let mut inner = self.inner.lock();
        inner.transform_sending(text, tlvs)
    }

    pub fn init_smp(&self, question: Option<&str>, secret: &str) -> Result<(), OtrError> {
        let mut inner = self.inner.lock();
        inner.init_smp(question, secret)
    }

    pub fn respond_smp(&self, secret: &str) -> Result<(), OtrError> {
        let mut inner = self.inner.lock();
        inner.respond_smp(secret)
    }

    pub fn abort_smp(&self) -> Result<(), OtrError> {
        let mut inner = self.inner.lock();
        inner.abort_smp()
    }

    pub fn is_smp_in_progress(&self) -> bool {
        let inner = self.inner.lock();
        match inner.outgoing_instance() {
            Some(instance) => match &instance.state {
                MessagingState::Encrypted3(e) => e.smp.in_progress(),
                MessagingState::Encrypted4(e) => e.smp.in_progress(),
                _ => false,
            },
            None => false,
        }
    }

    pub fn get_extra_symmetric_key(&self) -> Result<Vec<u8>, OtrError> {
        let inner = self.inner.lock();
        let instance = inner
            .outgoing_instance()
            .ok_or(OtrError::IncorrectState { required: "encrypted", actual: "plaintext" })?;
        match &instance.state {
            MessagingState::Encrypted3(e) => Ok(e.extra_symmetric_key()),
            MessagingState::Encrypted4(e) => Ok(e.extra_symmetric_key()),
            other => Err(OtrError::IncorrectState { required: "encrypted", actual: other.name() }),
        }
    }

    /// Direct outbound traffic at a specific remote instance.
    pub fn set_outgoing_instance(&self, tag: InstanceTag) -> Result<(), OtrError> {
        let mut inner = self.inner.lock();
        if !inner.instances.contains_key(&tag.0) {
            return Err(OtrError::MessageRejected(format!("unknown instance {tag}")));
        }
        inner.outgoing_tag = Some(tag.0);
        Ok(())
    }

    pub fn get_remote_info(&self) -> RemoteInfo {
        let inner = self.inner.lock();
        match inner.outgoing_instance() {
            Some(instance) => RemoteInfo {
                version: instance.state.version(),
                tag: InstanceTag(instance.receiver_tag),
                fingerprint: match &instance.state {
                    MessagingState::Encrypted3(e) => Some(e.their_fingerprint.to_vec()),
                    MessagingState::Encrypted4(e) => Some(e.their_fingerprint.to_vec()),
                    _ => None,
                },
            },
            None => RemoteInfo { version: Version::None, tag: InstanceTag::ZERO, fingerprint: None },
        }
    }
}

impl Inner {
    fn policy(&self) -> OtrPolicy {
        self.host.session_policy(&self.id)
    }

    fn event(&self, receiver_tag: u32, event: Event) {
        self.host.on_event(&self.id, InstanceTag(receiver_tag), event);
    }

    fn outgoing_key(&self) -> u32 {
        self.outgoing_tag.unwrap_or(MASTER)
    }

    fn outgoing_instance(&self) -> Option<&Instance> {
        self.instances.get(&self.outgoing_key())
    }

    fn outgoing_instance_status(&self) -> SessionStatus {
        self.outgoing_instance()
            .map(|i| i.state.status())
            .unwrap_or(SessionStatus::Plaintext)
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    fn send_query(&self) {
        let versions = self.policy().allowed_versions();
        if versions.is_empty() {
            warn!("policy allows no version; query not sent");
            return;
        }
        let fallback = self.host.fallback_message(&self.id);
        let query = tag::build_query(&versions, &fallback);
        self.host.inject_message(&self.id, &query);
    }

    /// Refresh the published client profile when it nears expiry.
    fn refresh_profile(&mut self) {
        if let Some(profile) = &self.profile {
            match profiles::refresh_if_needed(self.host.as_ref(), &self.id, profile, self.policy())
            {
                Ok(Some(fresh)) => self.profile = Some(fresh),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "profile refresh failed"),
            }
        }
    }

    /// Encode, fragment, and hand every piece to the host.
    fn inject_encoded(&self, receiver_tag: u32, version: Version, body: MessageBody) {
        match self.encoded_fragments(receiver_tag, version, body) {
            Ok(fragments) => {
                for f in &fragments {
                    self.host.inject_message(&self.id, f);
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to prepare outbound message");
                self.event(receiver_tag, Event::Error(format!("cannot send message: {e}")));
            }
        }
    }

    fn encoded_fragments(
        &self,
        receiver_tag: u32,
        version: Version,
        body: MessageBody,
    ) -> Result<Vec<String>, OtrError> {
        let header = MessageHeader {
            version,
            sender_tag: self.sender_tag.0,
            receiver_tag,
        };
        let text = EncodedMessage { header, body }.encode_text();
        let max = self.host.max_fragment_size(&self.id);
        Ok(fragment::fragment_outgoing(
            &text,
            version,
            self.sender_tag.0,
            receiver_tag,
            max,
        )?)
    }

    fn transform_sending(&mut self, text: &str, tlvs: &[Tlv]) -> Result<Vec<String>, OtrError> {
        enum Plan {
            Plain(String),
            RequireEncryption(u32),
            Encoded(u32, Version, MessageBody),
            Finished(u32),
        }
        let key = self.outgoing_key();
        let policy = self.policy();
        let sender_tag = self.sender_tag.0;
        let plan = {
            let instance = self
                .instances
                .get_mut(&key)
                .expect("outgoing instance exists");
            let receiver_tag = instance.receiver_tag;
            match &mut instance.state {
                MessagingState::Plaintext => {
                    if policy.contains(OtrPolicy::REQUIRE_ENCRYPTION) {
                        Plan::RequireEncryption(receiver_tag)
                    } else {
                        let mut out = text.to_string();
                        if policy.contains(OtrPolicy::SEND_WHITESPACE_TAG) {
                            out.push_str(&tag::build_whitespace_tag(&policy.allowed_versions()));
                        }
                        Plan::Plain(out)
                    }
                }
                MessagingState::Encrypted3(e) => {
                    let header = MessageHeader { version: e.version, sender_tag, receiver_tag };
                    let msg = e.encrypt_message(&header, text.as_bytes(), tlvs, 0);
                    Plan::Encoded(receiver_tag, e.version, MessageBody::Data3(msg))
                }
                MessagingState::Encrypted4(e) => {
                    let header =
                        MessageHeader { version: Version::Four, sender_tag, receiver_tag };
                    let flags = if text.is_empty() && tlvs.iter().all(control_tlv) {
                        FLAG_IGNORE_UNREADABLE
                    } else {
                        0
                    };
                    let msg = e.encrypt_message(&header, text.as_bytes(), tlvs, flags)?;
                    Plan::Encoded(receiver_tag, Version::Four, MessageBody::Data4(msg))
                }
                MessagingState::Finished => Plan::Finished(receiver_tag),
            }
        };
        match plan {
            Plan::Plain(out) => Ok(vec![out]),
            Plan::RequireEncryption(receiver_tag) => {
                self.event(receiver_tag, Event::EncryptedMessagesRequired(text.to_string()));
                self.send_query();
                Ok(Vec::new())
            }
            Plan::Encoded(receiver_tag, version, body) => {
                self.encoded_fragments(receiver_tag, version, body)
            }
            Plan::Finished(receiver_tag) => {
                self.event(
                    receiver_tag,
                    Event::Error("the session is finished; message not sent".into()),
                );
                Err(OtrError::IncorrectState {
                    required: "encrypted or plaintext",
                    actual: "finished",
                })
            }
        }
    }

    /// Send a control data message (SMP, disconnect) on an encrypted
    /// instance, straight through the host.
    fn inject_control(&mut self, key: u32, tlvs: Vec<Tlv>) {
        let sender_tag = self.sender_tag.0;
        let Some(instance) = self.instances.get_mut(&key) else { return };
        let receiver_tag = instance.receiver_tag;
        let body = match &mut instance.state {
            MessagingState::Encrypted3(e) => {
                let header = MessageHeader { version: e.version, sender_tag, receiver_tag };
                Some((e.version, MessageBody::Data3(e.encrypt_message(&header, b"", &tlvs, 0))))
            }
            MessagingState::Encrypted4(e) => {
                let header = MessageHeader { version: Version::Four, sender_tag, receiver_tag };
                match e.encrypt_message(&header, b"", &tlvs, FLAG_IGNORE_UNREADABLE) {
                    Ok(msg) => Some((Version::Four, MessageBody::Data4(msg))),
                    Err(e) => {
                        warn!(error = %e, "control message not sent");
                        None
                    }
                }
            }
            _ => None,
        };
        if let Some((version, body)) = body {
            self.inject_encoded(receiver_tag, version, body);
        }
    }

    fn end_all_encrypted(&mut self) {
        let sender_tag = self.sender_tag.0;
        let keys: Vec<u32> = self.instances.keys().copied().collect();
        for key in keys {
            let plan = {
                let Some(instance) = self.instances.get_mut(&key) else { continue };
                let receiver_tag = instance.receiver_tag;
                match &mut instance.state {
                    MessagingState::Encrypted3(e) => {
                        let header =
                            MessageHeader { version: e.version, sender_tag, receiver_tag };
                        let msg = e.encrypt_message(
                            &header,
                            b"",
                            &[Tlv::new(TLV_DISCONNECT, Vec::new())],
                            0,
                        );
                        Some((receiver_tag, e.version, MessageBody::Data3(msg)))
                    }
                    MessagingState::Encrypted4(e) => {
                        // remaining reveals ride along with the disconnect;
                        // they sit outside the authenticated region
                        let header =
                            MessageHeader { version: Version::Four, sender_tag, receiver_tag };
                        match e.encrypt_message(
                            &header,
                            b"",
                            &[Tlv::new(TLV_DISCONNECT, Vec::new())],
                            FLAG_IGNORE_UNREADABLE,
                        ) {
                            Ok(mut msg) => {
                                msg.revealed_macs.extend_from_slice(&e.drain_reveals());
                                Some((receiver_tag, Version::Four, MessageBody::Data4(msg)))
                            }
                            Err(err) => {
                                warn!(error = %err, "disconnect message not sent");
                                None
                            }
                        }
                    }
                    MessagingState::Finished => None,
                    MessagingState::Plaintext => continue,
                }
            };
            if let Some((receiver_tag, version, body)) = plan {
                self.inject_encoded(receiver_tag, version, body);
            }
            if let Some(instance) = self.instances.get_mut(&key) {
                instance.state = MessagingState::Plaintext;
            }
        }
        self.outgoing_tag = None;
    }

    // ── SMP operations ───────────────────────────────────────────────────

    fn init_smp(&mut self, question: Option<&str>, secret: &str) -> Result<(), OtrError> {
        let key = self.outgoing_key();
        let instance = self.instances.get_mut(&key).expect("outgoing instance");
        let tlvs = match &mut instance.state {
            MessagingState::Encrypted3(e) => e.smp.initiate(question, secret.as_bytes()),
            MessagingState::Encrypted4(e) => e.smp.initiate(question, secret.as_bytes()),
            other => {
                return Err(OtrError::IncorrectState {
                    required: "encrypted",
                    actual: other.name(),
                })
            }
        };
        self.inject_control(key, tlvs);
        Ok(())
    }

    fn respond_smp(&mut self, secret: &str) -> Result<(), OtrError> {
        let key = self.outgoing_key();
        let instance = self.instances.get_mut(&key).expect("outgoing instance");
        let tlv = match &mut instance.state {
            MessagingState::Encrypted3(e) => e.smp.respond(secret.as_bytes()),
            MessagingState::Encrypted4(e) => e.smp.respond(secret.as_bytes()),
            other => {
                return Err(OtrError::IncorrectState {
                    required: "encrypted",
                    actual: other.name(),
                })
            }
        };
        match tlv {
            Some(tlv) => {
                self.inject_control(key, vec![tlv]);
                Ok(())
            }
            None => Err(OtrError::IncorrectState {
                required: "awaiting SMP secret",
                actual: "no SMP run waiting",
            }),
        }
    }

    fn abort_smp(&mut self) -> Result<(), OtrError> {
        let key = self.outgoing_key();
        let instance = self.instances.get_mut(&key).expect("outgoing instance");
        let receiver_tag = instance.receiver_tag;
        let tlv = match &mut instance.state {
            MessagingState::Encrypted3(e) => e.smp.abort(),
            MessagingState::Encrypted4(e) => e.smp.abort(),
            other => {
                return Err(OtrError::IncorrectState {
                    required: "encrypted",
                    actual: other.name(),
                })
            }
        };
        self.inject_control(key, vec![tlv]);
        self.event(receiver_tag, Event::SmpAborted(crate::host::AbortReason::User));
        Ok(())
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    fn transform_receiving(&mut self, raw: &str) -> Result<ReceiveResult, OtrError> {
        match tag::classify(raw) {
            RawMessage::Fragment => self.handle_fragment(raw),
            RawMessage::Encoded => self.handle_encoded_text(raw),
            RawMessage::Query(versions) => {
                debug!(?versions, "query received");
                self.negotiate(&versions);
                Ok(self.routing_result(MASTER, false, None))
            }
            RawMessage::Error(text) => {
                self.event(MASTER, Event::Error(text));
                if self.policy().contains(OtrPolicy::ERROR_START_AKE) {
                    self.send_query();
                }
                Ok(self.routing_result(MASTER, false, None))
            }
            RawMessage::Plaintext { content, tag_versions } => {
                if !tag_versions.is_empty()
                    && self.policy().contains(OtrPolicy::WHITESPACE_START_AKE)
                {
                    self.negotiate(&tag_versions);
                }
                let status = self.outgoing_instance_status();
                if status != SessionStatus::Plaintext
                    || self.policy().contains(OtrPolicy::REQUIRE_ENCRYPTION)
                {
                    self.event(MASTER, Event::UnencryptedMessageReceived(content.clone()));
                }
                Ok(ReceiveResult {
                    tag: InstanceTag(MASTER),
                    status,
                    rejected: false,
                    confidential: false,
                    content: Some(content),
                })
            }
        }
    }

    fn routing_result(&self, key: u32, rejected: bool, content: Option<String>) -> ReceiveResult {
        let status = self
            .instances
            .get(&key)
            .map(|i| i.state.status())
            .unwrap_or(SessionStatus::Plaintext);
        ReceiveResult {
            tag: InstanceTag(key),
            status,
            rejected,
            confidential: false,
            content,
        }
    }

    /// Start a handshake for the best mutually allowed version. The flight
    /// goes out on the outgoing instance: the master while the peer's tag is
    /// still unknown, the established slave on a renegotiation.
    fn negotiate(&mut self, offered: &[Version]) {
        let allowed = self.policy().allowed_versions();
        let Some(best) = tag::select_version(offered, &allowed) else {
            debug!("no mutually allowed version");
            return;
        };
        let key = self.outgoing_key();
        match best {
            Version::Four => {
                let Some(profile) = self.profile.clone() else {
                    warn!("v4 negotiation without a client profile");
                    return;
                };
                let instance = self.instances.get_mut(&key).expect("outgoing instance exists");
                let receiver_tag = instance.receiver_tag;
                let identity = dake::start_identity(&mut instance.dake, profile);
                self.inject_encoded(receiver_tag, Version::Four, MessageBody::Identity(identity));
            }
            Version::Two | Version::Three => {
                let instance = self.instances.get_mut(&key).expect("outgoing instance exists");
                let receiver_tag = instance.receiver_tag;
                let commit = ake::start(&mut instance.auth);
                self.inject_encoded(receiver_tag, best, MessageBody::DhCommit(commit));
            }
            Version::None => {}
        }
    }

    fn handle_fragment(&mut self, raw: &str) -> Result<ReceiveResult, OtrError> {
        let frag = match fragment::parse(raw) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "fragment rejected");
                return Ok(self.routing_result(MASTER, true, None));
            }
        };
        if frag.version.has_instance_tags() {
            if frag.sender_tag == 0 {
                debug!("fragment with zero sender tag dropped");
                return Ok(self.routing_result(MASTER, true, None));
            }
            if frag.receiver_tag != 0 && frag.receiver_tag != self.sender_tag.0 {
                self.event(MASTER, Event::MessageForAnotherInstanceReceived);
                return Ok(self.routing_result(MASTER, true, None));
            }
        }
        let completed = match frag.version {
            Version::Four => self.out_assembler.accept(&frag),
            _ => self
                .in_assemblers
                .entry(frag.sender_tag)
                .or_default()
                .accept(&frag),
        };
        match completed {
            Ok(Some(message)) => self.handle_encoded_text(&message),
            Ok(None) => Ok(self.routing_result(MASTER, false, None)),
            Err(e) => {
                debug!(error = %e, "reassembly rejected");
                Ok(self.routing_result(MASTER, true, None))
            }
        }
    }

    fn handle_encoded_text(&mut self, raw: &str) -> Result<ReceiveResult, OtrError> {
        let msg = match EncodedMessage::parse_text(raw) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "malformed encoded message");
                return Ok(self.routing_result(MASTER, true, None));
            }
        };
        if !self.policy().allows_version(msg.header.version) {
            debug!(version = ?msg.header.version, "message for disabled version dropped");
            return Ok(self.routing_result(MASTER, true, None));
        }
        let key = if msg.header.version.has_instance_tags() {
            if msg.header.sender_tag == 0 {
                debug!("encoded message with zero sender tag dropped");
                return Ok(self.routing_result(MASTER, true, None));
            }
            if msg.header.receiver_tag != 0 && msg.header.receiver_tag != self.sender_tag.0 {
                self.event(MASTER, Event::MessageForAnotherInstanceReceived);
                return Ok(self.routing_result(MASTER, true, None));
            }
            msg.header.sender_tag
        } else {
            MASTER
        };
        self.ensure_instance(key, &msg.body);
        self.dispatch(key, msg)
    }

    /// Create the slave on first sight. When created in response to a
    /// DH-Key or Auth-R, the fresher master sub-state is copied over so the
    /// exchange the master started (with receiver tag 0) continues here.
    fn ensure_instance(&mut self, key: u32, body: &MessageBody) {
        if key == MASTER || self.instances.contains_key(&key) {
            return;
        }
        let mut instance = Instance::new(key);
        let master = self.instances.get(&MASTER).expect("master exists");
        // the slave's untouched initial state never outranks progress the
        // master made; between two advanced states the fresher one wins
        if matches!(body, MessageBody::DhKey(_)) {
            let master_advanced = !matches!(master.auth, AuthState::None { .. });
            let slave_initial = matches!(instance.auth, AuthState::None { .. });
            if master_advanced
                && (slave_initial || master.auth.timestamp() > instance.auth.timestamp())
            {
                instance.auth = master.auth.clone();
            }
        }
        if matches!(body, MessageBody::AuthR(_)) {
            let master_advanced = !matches!(master.dake, DakeState::None { .. });
            let slave_initial = matches!(instance.dake, DakeState::None { .. });
            if master_advanced
                && (slave_initial || master.dake.timestamp() > instance.dake.timestamp())
            {
                instance.dake = master.dake.clone();
            }
        }
        let existing_slaves = self.instances.len() - 1;
        self.instances.insert(key, instance);
        if existing_slaves >= 1 {
            self.event(key, Event::MultipleInstancesDetected);
        }
    }

    fn dispatch(&mut self, key: u32, msg: EncodedMessage) -> Result<ReceiveResult, OtrError> {
        let version = msg.header.version;
        match msg.body {
            MessageBody::DhCommit(m) => {
                let instance = self.instances.get_mut(&key).expect("instance exists");
                if let Some(reply) = ake::handle_dh_commit(&mut instance.auth, &m) {
                    self.inject_encoded(key, version, reply);
                }
                Ok(self.routing_result(key, false, None))
            }
            MessageBody::DhKey(m) => {
                let local_dsa = self.host.local_dsa_key_pair(&self.id);
                let instance = self.instances.get_mut(&key).expect("instance exists");
                match ake::handle_dh_key(&mut instance.auth, &m, &local_dsa) {
                    Ok(Some(reply)) => self.inject_encoded(key, version, reply),
                    Ok(None) => {}
                    Err(e) => {
                        debug!(error = %e, "DH-Key rejected");
                        return Ok(self.routing_result(key, true, None));
                    }
                }
                Ok(self.routing_result(key, false, None))
            }
            MessageBody::RevealSignature(m) => {
                let local_dsa = self.host.local_dsa_key_pair(&self.id);
                let instance = self.instances.get_mut(&key).expect("instance exists");
                match ake::handle_reveal_signature(&mut instance.auth, &m, &local_dsa, version) {
                    Ok(Some((reply, outcome))) => {
                        let encrypted = Encrypted3::from_ake(outcome, &local_dsa.public)?;
                        let instance = self.instances.get_mut(&key).expect("instance exists");
                        instance.state = MessagingState::Encrypted3(Box::new(encrypted));
                        self.outgoing_tag = Some(key);
                        self.inject_encoded(key, version, reply);
                        debug!(key, "session encrypted (v3 responder)");
                        Ok(self.routing_result(key, false, None))
                    }
                    Ok(None) => Ok(self.routing_result(key, false, None)),
                    Err(e) => {
                        debug!(error = %e, "Reveal-Signature rejected");
                        Ok(self.routing_result(key, true, None))
                    }
                }
            }
            MessageBody::Signature(m) => {
                let instance = self.instances.get_mut(&key).expect("instance exists");
                match ake::handle_signature(&mut instance.auth, &m, version) {
                    Ok(Some(outcome)) => {
                        let local_dsa = self.host.local_dsa_key_pair(&self.id);
                        let encrypted = Encrypted3::from_ake(outcome, &local_dsa.public)?;
                        let instance = self.instances.get_mut(&key).expect("instance exists");
                        instance.state = MessagingState::Encrypted3(Box::new(encrypted));
                        self.outgoing_tag = Some(key);
                        debug!(key, "session encrypted (v3 initiator)");
                        Ok(self.routing_result(key, false, None))
                    }
                    Ok(None) => Ok(self.routing_result(key, false, None)),
                    Err(e) => {
                        debug!(error = %e, "Signature rejected");
                        Ok(self.routing_result(key, true, None))
                    }
                }
            }
            MessageBody::Identity(m) => {
                let Some(profile) = self.profile.clone() else {
                    return Ok(self.routing_result(key, true, None));
                };
                if m.profile.owner_tag != msg.header.sender_tag {
                    debug!("Identity profile tag does not match header");
                    return Ok(self.routing_result(key, true, None));
                }
                let longterm = self.host.long_term_key_pair(&self.id);
                let account = self.id.account.clone();
                let peer = self.id.peer.clone();
                let phi = Phi {
                    initiator_tag: self.sender_tag.0,
                    responder_tag: msg.header.sender_tag,
                    initiator_account: &account,
                    responder_account: &peer,
                };
                let instance = self.instances.get_mut(&key).expect("instance exists");
                match dake::handle_identity(&mut instance.dake, &m, &profile, &longterm, &phi) {
                    Ok(reply) => {
                        self.inject_encoded(key, Version::Four, MessageBody::AuthR(reply));
                        Ok(self.routing_result(key, false, None))
                    }
                    Err(e) => {
                        debug!(error = %e, "Identity rejected");
                        Ok(self.routing_result(key, true, None))
                    }
                }
            }
            MessageBody::AuthR(m) => {
                let Some(profile) = self.profile.clone() else {
                    return Ok(self.routing_result(key, true, None));
                };
                if m.profile.owner_tag != msg.header.sender_tag {
                    debug!("Auth-R profile tag does not match header");
                    return Ok(self.routing_result(key, true, None));
                }
                let longterm = self.host.long_term_key_pair(&self.id);
                let account = self.id.account.clone();
                let peer = self.id.peer.clone();
                let phi = Phi {
                    initiator_tag: msg.header.sender_tag,
                    responder_tag: self.sender_tag.0,
                    initiator_account: &peer,
                    responder_account: &account,
                };
                let instance = self.instances.get_mut(&key).expect("instance exists");
                match dake::handle_auth_r(&mut instance.dake, &m, &longterm, &phi) {
                    Ok(Some((reply, outcome))) => {
                        let encrypted = Encrypted4::from_dake(outcome, &profile);
                        let instance = self.instances.get_mut(&key).expect("instance exists");
                        instance.state = MessagingState::Encrypted4(Box::new(encrypted));
                        self.outgoing_tag = Some(key);
                        self.inject_encoded(key, Version::Four, MessageBody::AuthI(reply));
                        debug!(key, "session encrypted (v4 responder)");
                        Ok(self.routing_result(key, false, None))
                    }
                    Ok(None) => Ok(self.routing_result(key, false, None)),
                    Err(e) => {
                        debug!(error = %e, "Auth-R rejected");
                        Ok(self.routing_result(key, true, None))
                    }
                }
            }
            MessageBody::AuthI(m) => {
                let Some(profile) = self.profile.clone() else {
                    return Ok(self.routing_result(key, true, None));
                };
                let instance = self.instances.get_mut(&key).expect("instance exists");
                match dake::handle_auth_i(&mut instance.dake, &m) {
                    Ok(Some(outcome)) => {
                        let encrypted = Encrypted4::from_dake(outcome, &profile);
                        let instance = self.instances.get_mut(&key).expect("instance exists");
                        instance.state = MessagingState::Encrypted4(Box::new(encrypted));
                        self.outgoing_tag = Some(key);
                        debug!(key, "session encrypted (v4 initiator)");
                        Ok(self.routing_result(key, false, None))
                    }
                    Ok(None) => Ok(self.routing_result(key, false, None)),
                    Err(e) => {
                        debug!(error = %e, "Auth-I rejected");
                        Ok(self.routing_result(key, true, None))
                    }
                }
            }
            MessageBody::Data3(m) => self.handle_data3(key, &msg.header, m),
            MessageBody::Data4(m) => self.handle_data4(key, &msg.header, m),
        }
    }

    fn handle_data3(
        &mut self,
        key: u32,
        header: &MessageHeader,
        msg: DataMessage3,
    ) -> Result<ReceiveResult, OtrError> {
        let instance = self.instances.get_mut(&key).expect("instance exists");
        let MessagingState::Encrypted3(encrypted) = &mut instance.state else {
            self.unreadable(key, msg.flags);
            return Ok(self.routing_result(key, true, None));
        };
        let (text, tlvs) = match encrypted.decrypt_message(header, &msg) {
            Ok(out) => out,
            Err(e) => {
                debug!(error = %e, "v3 data message rejected");
                self.unreadable(key, msg.flags);
                return Ok(self.routing_result(key, true, None));
            }
        };
        self.process_tlvs(key, Version::Three, tlvs);
        let status = self
            .instances
            .get(&key)
            .map(|i| i.state.status())
            .unwrap_or(SessionStatus::Plaintext);
        Ok(ReceiveResult {
            tag: InstanceTag(key),
            status,
            rejected: false,
            confidential: true,
            content: non_empty_text(text),
        })
    }

    fn handle_data4(
        &mut self,
        key: u32,
        header: &MessageHeader,
        msg: DataMessage4,
    ) -> Result<ReceiveResult, OtrError> {
        let instance = self.instances.get_mut(&key).expect("instance exists");
        let MessagingState::Encrypted4(encrypted) = &mut instance.state else {
            self.unreadable(key, msg.flags);
            return Ok(self.routing_result(key, true, None));
        };
        let (text, tlvs) = match encrypted.decrypt_message(header, &msg) {
            Ok((text, tlvs, _extra)) => (text, tlvs),
            Err(e) => {
                debug!(error = %e, "v4 data message rejected");
                self.unreadable(key, msg.flags);
                return Ok(self.routing_result(key, true, None));
            }
        };
        self.process_tlvs(key, Version::Four, tlvs);
        let status = self
            .instances
            .get(&key)
            .map(|i| i.state.status())
            .unwrap_or(SessionStatus::Plaintext);
        Ok(ReceiveResult {
            tag: InstanceTag(key),
            status,
            rejected: false,
            confidential: true,
            content: non_empty_text(text),
        })
    }

    /// Route decrypted records: SMP to its machine, disconnect to FINISHED,
    /// extra-key TLVs to the host.
    fn process_tlvs(&mut self, key: u32, version: Version, tlvs: Vec<Tlv>) {
        let mut smp_replies = Vec::new();
        let mut finish = false;
        for (index, tlv) in tlvs.iter().enumerate() {
            match tlv.typ {
                TLV_PADDING => {}
                TLV_DISCONNECT => finish = true,
                TLV_EXTRA_KEY_V3 if version != Version::Four => {
                    if let Some(MessagingState::Encrypted3(e)) =
                        self.instances.get_mut(&key).map(|i| &mut i.state)
                    {
                        let key_bytes = e.extra_symmetric_key();
                        self.event(
                            key,
                            Event::ExtraSymmetricKeyDiscovered(ExtraSymmetricKey(key_bytes)),
                        );
                    }
                }
                TLV_SMP1Q_OR_EXTRA_KEY if version == Version::Four => {
                    if let Some(MessagingState::Encrypted4(e)) =
                        self.instances.get_mut(&key).map(|i| &mut i.state)
                    {
                        let context: [u8; 4] =
                            tlv.value.get(..4).and_then(|s| s.try_into().ok()).unwrap_or([0; 4]);
                        let key_bytes = e.extra_symmetric_key_for_tlv(context, index as u8);
                        self.event(
                            key,
                            Event::ExtraSymmetricKeyDiscovered(ExtraSymmetricKey(key_bytes)),
                        );
                    }
                }
                _ if tlv.is_smp()
                    || (tlv.typ == TLV_SMP1Q_OR_EXTRA_KEY && version != Version::Four) =>
                {
                    let (progress, fingerprint) = {
                        let Some(instance) = self.instances.get_mut(&key) else { continue };
                        match &mut instance.state {
                            MessagingState::Encrypted3(e) => {
                                (e.smp.handle_tlv(tlv), e.their_fingerprint.to_vec())
                            }
                            MessagingState::Encrypted4(e) => {
                                (e.smp.handle_tlv(tlv), e.their_fingerprint.to_vec())
                            }
                            _ => continue,
                        }
                    };
                    if let Some(reply) = progress.reply {
                        smp_replies.push(reply);
                    }
                    match progress.update {
                        SmpUpdate::None => {}
                        SmpUpdate::RequestSecret(question) => {
                            self.event(key, Event::SmpRequestSecret(question));
                        }
                        SmpUpdate::Completed(verified) => {
                            self.event(
                                key,
                                Event::SmpCompleted(SmpResult { verified, fingerprint }),
                            );
                        }
                        SmpUpdate::Aborted(reason) => {
                            self.event(key, Event::SmpAborted(reason));
                        }
                    }
                }
                other => {
                    debug!(tlv = other, "unrecognized TLV ignored");
                }
            }
        }
        if !smp_replies.is_empty() {
            self.inject_control(key, smp_replies);
        }
        if finish {
            if let Some(instance) = self.instances.get_mut(&key) {
                instance.state = MessagingState::Finished;
            }
            self.event(key, Event::SessionFinished);
        }
    }

    /// A data message we could not read: notify unless the sender flagged
    /// it ignorable, and tell the peer.
    fn unreadable(&mut self, key: u32, flags: u8) {
        if flags & FLAG_IGNORE_UNREADABLE != 0 {
            return;
        }
        self.event(key, Event::UnreadableMessageReceived);
        let reply = self.host.reply_for_unreadable_message(&self.id, "");
        let error = tag::build_error(&reply);
        self.host.inject_message(&self.id, &error);
    }
}

fn control_tlv(tlv: &Tlv) -> bool {
    tlv.is_smp() || tlv.typ == TLV_DISCONNECT || tlv.typ == TLV_PADDING
}

fn non_empty_text(text: Vec<u8>) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&text).into_owned())
    }
}
