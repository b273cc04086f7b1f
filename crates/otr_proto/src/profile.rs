//! OTRv4 client profile.
//!
//! A signed, publicly publishable record binding an instance tag to the
//! owner's long-term Ed448 identity and forging keys, the versions the
//! client speaks, and an expiration date. Publication is what makes offline
//! deniability work: anyone can observe every forging key, so a transcript
//! naming one proves nothing.
//!
//! Wire form: u32 field count, then `(u16 field type, value)` pairs, then a
//! 114-byte Ed448 signature over the field block. A DSA public key plus a
//! transitional DSA signature tie the profile to a v3 identity during
//! migration.

use chrono::{DateTime, Duration, Utc};

use otr_crypto::dsa::{self, DsaKeyPair, DsaPublicKey};
use otr_crypto::ed448::{self, Point};
use otr_crypto::eddsa::{self, Ed448KeyPair, SIGNATURE_LEN};
use otr_crypto::kdf::sha256;

use crate::codec::{Decoder, Encoder};
use crate::error::ProtoError;
use crate::version::Version;

const FIELD_OWNER_TAG: u16 = 0x0001;
const FIELD_IDENTITY_KEY: u16 = 0x0002;
const FIELD_FORGING_KEY: u16 = 0x0003;
const FIELD_VERSIONS: u16 = 0x0004;
const FIELD_EXPIRES: u16 = 0x0005;
const FIELD_DSA_KEY: u16 = 0x0006;
const FIELD_TRANSITIONAL_SIG: u16 = 0x0007;

/// Default validity of a freshly signed profile.
pub const PROFILE_LIFETIME_DAYS: i64 = 14;
/// Refresh when expiry is closer than this.
pub const RENEWAL_HORIZON_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub owner_tag: u32,
    pub identity_key: Point,
    pub forging_key: Point,
    pub versions: Vec<Version>,
    /// Unix seconds.
    pub expires_at: i64,
    pub legacy_key: Option<DsaPublicKey>,
    pub transitional_signature: Option<[u8; 40]>,
    pub signature: [u8; SIGNATURE_LEN],
}

impl ClientProfile {
    /// Construct and sign. The transitional DSA signature is produced
    /// whenever a legacy keypair is supplied, binding the v3 identity to
    /// this profile.
    pub fn new_signed(
        owner_tag: u32,
        identity: &Ed448KeyPair,
        forging_key: Point,
        versions: Vec<Version>,
        expires: DateTime<Utc>,
        legacy: Option<&DsaKeyPair>,
    ) -> Self {
        let mut profile = ClientProfile {
            owner_tag,
            identity_key: identity.public,
            forging_key,
            versions,
            expires_at: expires.timestamp(),
            legacy_key: legacy.map(|kp| kp.public.clone()),
            transitional_signature: None,
            signature: [0u8; SIGNATURE_LEN],
        };
        if let Some(kp) = legacy {
            let digest = sha256(&profile.transitional_region());
            let (r, s) = kp.sign(&digest);
            let mut sig = [0u8; 40];
            sig[..20].copy_from_slice(&r);
            sig[20..].copy_from_slice(&s);
            profile.transitional_signature = Some(sig);
        }
        profile.signature = identity.sign(&profile.signable_region());
        profile
    }

    pub fn default_expiry(now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::days(PROFILE_LIFETIME_DAYS)
    }

    /// Fields covered by the transitional DSA signature: everything except
    /// the transitional signature itself (and the Ed448 signature).
    fn transitional_region(&self) -> Vec<u8> {
        self.encode_fields(false)
    }

    /// Fields covered by the Ed448 signature: the full field block.
    fn signable_region(&self) -> Vec<u8> {
        self.encode_fields(true)
    }

    fn encode_fields(&self, with_transitional: bool) -> Vec<u8> {
        let mut count = 5u32;
        if self.legacy_key.is_some() {
            count += 1;
        }
        if with_transitional && self.transitional_signature.is_some() {
            count += 1;
        }
        let mut enc = Encoder::new();
        enc.write_u32(count);
        enc.write_u16(FIELD_OWNER_TAG).write_u32(self.owner_tag);
        enc.write_u16(FIELD_IDENTITY_KEY).write_point(&self.identity_key);
        enc.write_u16(FIELD_FORGING_KEY).write_point(&self.forging_key);
        let digits: String = self.versions.iter().filter_map(|v| v.digit()).collect();
        enc.write_u16(FIELD_VERSIONS).write_data(digits.as_bytes());
        enc.write_u16(FIELD_EXPIRES).write_u64(self.expires_at as u64);
        if let Some(key) = &self.legacy_key {
            enc.write_u16(FIELD_DSA_KEY);
            write_dsa_key(&mut enc, key);
        }
        if with_transitional {
            if let Some(sig) = &self.transitional_signature {
                enc.write_u16(FIELD_TRANSITIONAL_SIG).write_raw(sig);
            }
        }
        enc.finish()
    }

    pub fn encode(&self, enc: &mut Encoder) {
        enc.write_raw(&self.signable_region());
        enc.write_raw(&self.signature);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, ProtoError> {
        let count = dec.read_u32()?;
        if count > 16 {
            return Err(ProtoError::ProfileInvalid(format!("{count} fields")));
        }
        let mut owner_tag = None;
        let mut identity_key = None;
        let mut forging_key = None;
        let mut versions = None;
        let mut expires_at = None;
        let mut legacy_key = None;
        let mut transitional_signature = None;
        for _ in 0..count {
            match dec.read_u16()? {
                FIELD_OWNER_TAG => owner_tag = Some(dec.read_u32()?),
                FIELD_IDENTITY_KEY => identity_key = Some(dec.read_point()?),
                FIELD_FORGING_KEY => forging_key = Some(dec.read_point()?),
                FIELD_VERSIONS => {
                    let raw = dec.read_data()?;
                    let digits = String::from_utf8(raw)
                        .map_err(|_| ProtoError::ProfileInvalid("versions not utf-8".into()))?;
                    versions = Some(digits.chars().filter_map(Version::from_digit).collect());
                }
                FIELD_EXPIRES => expires_at = Some(dec.read_u64()? as i64),
                FIELD_DSA_KEY => legacy_key = Some(read_dsa_key(dec)?),
                FIELD_TRANSITIONAL_SIG => {
                    let raw: [u8; 40] = dec
                        .read_raw(40)?
                        .try_into()
                        .expect("fixed-width read");
                    transitional_signature = Some(raw);
                }
                other => {
                    return Err(ProtoError::ProfileInvalid(format!(
                        "unknown field 0x{other:04x}"
                    )))
                }
            }
        }
        let signature: [u8; SIGNATURE_LEN] =
            dec.read_raw(SIGNATURE_LEN)?.try_into().expect("fixed-width read");
        Ok(ClientProfile {
            owner_tag: owner_tag.ok_or_else(|| missing("owner tag"))?,
            identity_key: identity_key.ok_or_else(|| missing("identity key"))?,
            forging_key: forging_key.ok_or_else(|| missing("forging key"))?,
            versions: versions.ok_or_else(|| missing("versions"))?,
            expires_at: expires_at.ok_or_else(|| missing("expiry"))?,
            legacy_key,
            transitional_signature,
            signature,
        })
    }

    /// Full validation: signature, expiry, tag range, version set, and the
    /// transitional signature when a legacy key is attached.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ProtoError> {
        eddsa::verify(&self.identity_key, &self.signable_region(), &self.signature)
            .map_err(|_| ProtoError::ProfileInvalid("bad signature".into()))?;
        if self.expired(now) {
            return Err(ProtoError::ProfileInvalid("expired".into()));
        }
        if self.owner_tag != 0 && self.owner_tag < 0x100 {
            return Err(ProtoError::ProfileInvalid("reserved instance tag".into()));
        }
        if self.owner_tag == 0 {
            return Err(ProtoError::ProfileInvalid("unassigned instance tag".into()));
        }
        if !self.versions.contains(&Version::Four) {
            return Err(ProtoError::ProfileInvalid("profile does not offer v4".into()));
        }
        match (&self.legacy_key, &self.transitional_signature) {
            (Some(key), Some(sig)) => {
                let digest = sha256(&self.transitional_region());
                dsa::verify(key, &digest, &sig[..20], &sig[20..])
                    .map_err(|_| ProtoError::ProfileInvalid("bad transitional signature".into()))?;
            }
            (Some(_), None) => {
                return Err(ProtoError::ProfileInvalid(
                    "legacy key without transitional signature".into(),
                ))
            }
            _ => {}
        }
        Ok(())
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.expires_at
    }

    pub fn expiring_soon(&self, now: DateTime<Utc>) -> bool {
        (now + Duration::hours(RENEWAL_HORIZON_HOURS)).timestamp() >= self.expires_at
    }

    /// 56-byte fingerprint over the long-term keys.
    pub fn fingerprint(&self) -> [u8; 56] {
        ed448::fingerprint(&self.identity_key, &self.forging_key)
    }
}

fn missing(what: &str) -> ProtoError {
    ProtoError::ProfileInvalid(format!("missing {what}"))
}

fn write_dsa_key(enc: &mut Encoder, key: &DsaPublicKey) {
    enc.write_u16(0x0000);
    enc.write_mpi(&key.p);
    enc.write_mpi(&key.q);
    enc.write_mpi(&key.g);
    enc.write_mpi(&key.y);
}

fn read_dsa_key(dec: &mut Decoder<'_>) -> Result<DsaPublicKey, ProtoError> {
    let kind = dec.read_u16()?;
    if kind != 0x0000 {
        return Err(ProtoError::ProfileInvalid(format!("DSA key type 0x{kind:04x}")));
    }
    Ok(DsaPublicKey {
        p: dec.read_mpi()?,
        q: dec.read_mpi()?,
        g: dec.read_mpi()?,
        y: dec.read_mpi()?,
    })
}

/// The legacy v2/v3 fingerprint: SHA-1 over the DSA public key body
/// (without the leading key-type short).
pub fn dsa_fingerprint(key: &DsaPublicKey) -> [u8; 20] {
    let mut enc = Encoder::new();
    enc.write_mpi(&key.p);
    enc.write_mpi(&key.q);
    enc.write_mpi(&key.g);
    enc.write_mpi(&key.y);
    otr_crypto::kdf::sha1(enc.as_bytes())
}

/// DSA public key framing used inside AKE signature payloads.
pub fn encode_dsa_key(key: &DsaPublicKey) -> Vec<u8> {
    let mut enc = Encoder::new();
    write_dsa_key(&mut enc, key);
    enc.finish()
}

pub fn decode_dsa_key(dec: &mut Decoder<'_>) -> Result<DsaPublicKey, ProtoError> {
    read_dsa_key(dec)
}
