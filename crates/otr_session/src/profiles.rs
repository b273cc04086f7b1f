//! Client-profile lifecycle: restore, validate against the host's keys,
//! refresh near expiry, publish.

use chrono::Utc;
use tracing::debug;

use otr_proto::codec::{Decoder, Encoder};
use otr_proto::profile::ClientProfile;
use otr_proto::version::Version;

use crate::error::OtrError;
use crate::host::{Host, SessionId};
use crate::instance::InstanceTag;
use crate::policy::OtrPolicy;

/// Restore the published profile, or mint a fresh one. The returned tag is
/// the session's sender tag for its whole lifetime.
///
/// A restored profile must match the keypairs the host currently reports;
/// any mismatch is a host failure, not a peer problem.
pub fn load_or_create(
    host: &dyn Host,
    id: &SessionId,
    policy: OtrPolicy,
) -> Result<(ClientProfile, InstanceTag), OtrError> {
    let longterm = host.long_term_key_pair(id);
    let forging = host.forging_key_pair(id);

    let payload = host.restore_client_profile_payload();
    if !payload.is_empty() {
        let profile = ClientProfile::decode(&mut Decoder::new(&payload))
            .map_err(|e| OtrError::HostFailure(format!("stored profile: {e}")))?;
        if profile.identity_key != longterm.public || profile.forging_key != forging.public {
            return Err(OtrError::HostFailure(
                "stored profile does not match the host keypairs".into(),
            ));
        }
        let tag = InstanceTag(profile.owner_tag);
        if profile.validate(Utc::now()).is_ok() && !profile.expiring_soon(Utc::now()) {
            return Ok((profile, tag));
        }
        debug!("stored profile expired or expiring; refreshing");
        let refreshed = create_and_publish(host, id, tag, policy)?;
        return Ok((refreshed, tag));
    }

    let tag = InstanceTag::random();
    let profile = create_and_publish(host, id, tag, policy)?;
    Ok((profile, tag))
}

fn create_and_publish(
    host: &dyn Host,
    id: &SessionId,
    tag: InstanceTag,
    policy: OtrPolicy,
) -> Result<ClientProfile, OtrError> {
    let longterm = host.long_term_key_pair(id);
    let forging = host.forging_key_pair(id);
    let mut versions = policy.allowed_versions();
    if !versions.contains(&Version::Four) {
        versions.push(Version::Four);
    }
    // the transitional DSA signature ties the profile to a v3 identity when
    // the policy still speaks v3
    let legacy = policy
        .allows_version(Version::Three)
        .then(|| host.local_dsa_key_pair(id));
    let profile = ClientProfile::new_signed(
        tag.0,
        &longterm,
        forging.public,
        versions,
        ClientProfile::default_expiry(Utc::now()),
        legacy.as_ref(),
    );
    let mut enc = Encoder::new();
    profile.encode(&mut enc);
    host.update_client_profile_payload(enc.as_bytes());
    Ok(profile)
}

/// Refresh the published profile when it is within the renewal horizon.
pub fn refresh_if_needed(
    host: &dyn Host,
    id: &SessionId,
    current: &ClientProfile,
    policy: OtrPolicy,
) -> Result<Option<ClientProfile>, OtrError> {
    if !current.expiring_soon(Utc::now()) {
        return Ok(None);
    }
    let tag = InstanceTag(current.owner_tag);
    Ok(Some(create_and_publish(host, id, tag, policy)?))
}
