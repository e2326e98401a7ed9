//! Error types for the gateway orchestrator.
//!
//! Almost everything here is absorbed where it is detected and only logged:
//! the alternation loop keeps running no matter which of these show up.

use std::time::Duration;
use thiserror::Error;

use crate::radio::Radio;
use crate::subsystem::SubsystemKind;

/// Lifecycle outcomes of `enable()` / `disable()` that are not plain success.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubsystemError {
    /// Idempotent no-op: a worker is already alive
    #[error("{0} subsystem already active")]
    AlreadyActive(SubsystemKind),

    /// Worker did not report ready within the bounded wait
    #[error("{kind} subsystem did not become active within {waited:?}")]
    StartTimeout { kind: SubsystemKind, waited: Duration },

    /// Worker ended before it ever reported ready
    #[error("{0} worker exited before becoming active")]
    StartFailed(SubsystemKind),

    /// Worker ignored the shutdown request and was aborted
    #[error("{kind} worker still running after {grace:?}; aborted")]
    ForcedTermination { kind: SubsystemKind, grace: Duration },
}

/// Reasons an inbound mesh datagram is dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngressError {
    #[error("empty payload")]
    EmptyPayload,

    #[error("malformed json: {0}")]
    MalformedJson(String),

    #[error("missing required field \"{0}\"")]
    MissingField(&'static str),

    #[error("datagram for unknown resource /{0}")]
    UnknownResource(String),
}

/// Per-entry send failures; the rest of the batch still goes out.
#[derive(Debug, Error)]
pub enum EgressError {
    #[error("http client setup failed: {0}")]
    Client(#[source] reqwest::Error),

    #[error("could not reach {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} did not answer within {after:?}")]
    Timeout { url: String, after: Duration },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request is {size} bytes, limit is {limit}")]
    RequestTooLarge { size: usize, limit: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("rf front-end busy: {wanted} requested while {holder} holds it")]
    Busy { wanted: Radio, holder: Radio },
}

/// Mesh frame decoding errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),

    #[error("unsupported version {0}")]
    Version(u8),

    #[error("token length {0} out of range")]
    TokenLength(u8),

    #[error("truncated option")]
    TruncatedOption,

    #[error("reserved option nibble 15")]
    ReservedNibble,
}
