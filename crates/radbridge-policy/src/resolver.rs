//! Attribute resolution rules

use radbridge_common::{BandwidthPolicy, BurstSettings, Subscriber};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Attribute names understood by the shared store and the NAS fleet.
pub const ATTR_PASSWORD: &str = "Cleartext-Password";
pub const ATTR_AUTH_TYPE: &str = "Auth-Type";
pub const ATTR_EXPIRATION: &str = "Expiration";
pub const ATTR_SIMULTANEOUS_USE: &str = "Simultaneous-Use";
pub const ATTR_RATE_LIMIT: &str = "Mikrotik-Rate-Limit";
pub const ATTR_SESSION_TIMEOUT: &str = "Session-Timeout";
pub const ATTR_IDLE_TIMEOUT: &str = "Idle-Timeout";
pub const ATTR_INTERIM_INTERVAL: &str = "Acct-Interim-Interval";
pub const ATTR_FRAMED_IP: &str = "Framed-IP-Address";

/// Marker value that makes a credential non-authorizable.
pub const REJECT_VALUE: &str = "Reject";

/// Expiration format the store's date comparison expects.
const EXPIRATION_FORMAT: &str = "%b %d %Y %H:%M:%S";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid policy {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Attribute operator as written into the store rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeOp {
    /// `:=` set/override
    Set,
    /// `=` add if not present
    Add,
    /// `+=` append
    Append,
}

impl AttributeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Set => ":=",
            Self::Add => "=",
            Self::Append => "+=",
        }
    }
}

/// One (name, operator, value) triple ready for projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeTriple {
    pub name: String,
    pub op: AttributeOp,
    pub value: String,
}

impl AttributeTriple {
    pub fn set(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            op: AttributeOp::Set,
            value: value.into(),
        }
    }
}

/// Resolver output: ordered check and reply sets plus group references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAttributes {
    /// Check attributes; the credential is always first
    pub checks: Vec<AttributeTriple>,
    /// Reply attributes pushed to the NAS on authentication
    pub replies: Vec<AttributeTriple>,
    /// Policy group the subscriber is a member of
    pub group: String,
    /// Fair-use fallback group, present only when the policy caps volume
    pub fallback_group: Option<String>,
}

/// Resolve a subscriber + policy pair into concrete attributes.
pub fn resolve(
    subscriber: &Subscriber,
    policy: &BandwidthPolicy,
) -> Result<ResolvedAttributes, PolicyError> {
    validate(policy)?;

    let mut checks = vec![AttributeTriple::set(ATTR_PASSWORD, subscriber.secret.clone())];
    if subscriber.is_disabled() {
        checks.push(AttributeTriple::set(ATTR_AUTH_TYPE, REJECT_VALUE));
    }
    if let Some(expires) = subscriber.expires_at {
        checks.push(AttributeTriple::set(
            ATTR_EXPIRATION,
            expires.format(EXPIRATION_FORMAT).to_string(),
        ));
    }
    checks.push(AttributeTriple::set(
        ATTR_SIMULTANEOUS_USE,
        policy.simultaneous_use.to_string(),
    ));

    let mut replies = vec![AttributeTriple::set(ATTR_RATE_LIMIT, rate_limit_string(policy))];
    if let Some(timeout) = policy.session_timeout_secs {
        replies.push(AttributeTriple::set(ATTR_SESSION_TIMEOUT, timeout.to_string()));
    }
    if let Some(idle) = policy.idle_timeout_secs {
        replies.push(AttributeTriple::set(ATTR_IDLE_TIMEOUT, idle.to_string()));
    }
    replies.push(AttributeTriple::set(
        ATTR_INTERIM_INTERVAL,
        policy.interim_interval_secs.to_string(),
    ));
    if let Some(ip) = subscriber.static_ip {
        replies.push(AttributeTriple::set(ATTR_FRAMED_IP, ip.to_string()));
    }

    Ok(ResolvedAttributes {
        checks,
        replies,
        group: policy.group_name(),
        // Cap enforcement is evaluated by the AAA server against interim
        // accounting, so a cap resolves to a group reference, not a raw
        // attribute.
        fallback_group: policy.volume_cap.as_ref().map(|_| policy.fallback_group_name()),
    })
}

/// Render the device rate-limit string.
///
/// Format: `up/down` in kbps, optionally followed by burst rate, burst
/// threshold, burst time and queue priority. Burst is emitted only when the
/// threshold is non-zero.
pub fn rate_limit_string(policy: &BandwidthPolicy) -> String {
    let base = format!("{}k/{}k", policy.upload_kbps, policy.download_kbps);

    match &policy.burst {
        Some(b) if b.threshold_kbps > 0 => format!(
            "{} {}k/{}k {}k/{}k {}/{} {}",
            base,
            b.upload_kbps,
            b.download_kbps,
            b.threshold_kbps,
            b.threshold_kbps,
            b.duration_secs,
            b.duration_secs,
            b.priority,
        ),
        _ => base,
    }
}

/// Reply attributes materialized on the policy's group.
pub fn group_attributes(policy: &BandwidthPolicy) -> Result<Vec<AttributeTriple>, PolicyError> {
    validate(policy)?;

    let mut attrs = vec![AttributeTriple::set(ATTR_RATE_LIMIT, rate_limit_string(policy))];
    if let Some(timeout) = policy.session_timeout_secs {
        attrs.push(AttributeTriple::set(ATTR_SESSION_TIMEOUT, timeout.to_string()));
    }
    if let Some(idle) = policy.idle_timeout_secs {
        attrs.push(AttributeTriple::set(ATTR_IDLE_TIMEOUT, idle.to_string()));
    }
    Ok(attrs)
}

/// Reply attributes for the fair-use fallback group, if the policy caps volume.
pub fn fallback_group_attributes(
    policy: &BandwidthPolicy,
) -> Result<Option<Vec<AttributeTriple>>, PolicyError> {
    validate(policy)?;

    Ok(policy.volume_cap.as_ref().map(|cap| {
        vec![AttributeTriple::set(
            ATTR_RATE_LIMIT,
            format!("{}k/{}k", cap.fallback_upload_kbps, cap.fallback_download_kbps),
        )]
    }))
}

fn validate(policy: &BandwidthPolicy) -> Result<(), PolicyError> {
    let invalid = |reason: &str| PolicyError::Invalid {
        name: policy.name.clone(),
        reason: reason.to_string(),
    };

    if policy.download_kbps == 0 || policy.upload_kbps == 0 {
        return Err(invalid("rate must be non-zero"));
    }
    if policy.simultaneous_use == 0 {
        return Err(invalid("simultaneous-use must be at least 1"));
    }
    if policy.interim_interval_secs == 0 {
        return Err(invalid("interim interval must be non-zero"));
    }
    if policy.session_timeout_secs == Some(0) || policy.idle_timeout_secs == Some(0) {
        return Err(invalid("timeout must be non-zero when set"));
    }
    if let Some(burst) = &policy.burst {
        validate_burst(policy, burst).map_err(|reason| invalid(&reason))?;
    }
    if let Some(cap) = &policy.volume_cap {
        if cap.monthly_mb == 0 {
            return Err(invalid("volume cap must be non-zero"));
        }
        if cap.fallback_download_kbps > policy.download_kbps
            || cap.fallback_upload_kbps > policy.upload_kbps
        {
            return Err(invalid("fair-use fallback rate exceeds base rate"));
        }
        if cap.fallback_download_kbps == 0 || cap.fallback_upload_kbps == 0 {
            return Err(invalid("fair-use fallback rate must be non-zero"));
        }
    }
    Ok(())
}

fn validate_burst(policy: &BandwidthPolicy, burst: &BurstSettings) -> Result<(), String> {
    if burst.download_kbps < policy.download_kbps || burst.upload_kbps < policy.upload_kbps {
        return Err("burst rate below base rate".to_string());
    }
    if !(1..=8).contains(&burst.priority) {
        return Err("queue priority out of range 1-8".to_string());
    }
    Ok(())
}
