//! Policy Resolver
//!
//! Turns a subscriber and its bandwidth policy into the concrete attribute
//! set the shared AAA store expects. Pure and deterministic: no I/O, no
//! clock reads, and contradictory policies are rejected rather than clamped.

mod resolver;

pub use resolver::{
    fallback_group_attributes, group_attributes, rate_limit_string, resolve, AttributeOp,
    AttributeTriple, PolicyError, ResolvedAttributes, ATTR_AUTH_TYPE, ATTR_EXPIRATION,
    ATTR_FRAMED_IP, ATTR_IDLE_TIMEOUT, ATTR_INTERIM_INTERVAL, ATTR_PASSWORD, ATTR_RATE_LIMIT,
    ATTR_SESSION_TIMEOUT, ATTR_SIMULTANEOUS_USE, REJECT_VALUE,
};
