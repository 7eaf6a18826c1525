//! Type-safe identifiers using the TypeID specification
//!
//! Built on the [TypeID Specification](https://github.com/jetpack-io/typeid/blob/main/spec/SPEC.md).
//! Flow and rule identifiers combine the uniqueness of UUIDs with a readable,
//! type-checked prefix, so a log line or counter label can never confuse a
//! flow id for a rule id.

use http::Request;
use mti::prelude::*;
use std::fmt;
use std::str::FromStr;
use tower_http::request_id::{MakeRequestId, RequestId as TowerRequestId};

macro_rules! typed_id {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(MagicTypeId);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            #[must_use]
            pub fn new() -> Self {
                Self(Self::PREFIX.create_type_id::<V7>())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mti = MagicTypeId::from_str(s).map_err(IdParseError::Parse)?;
                if mti.prefix().as_str() != Self::PREFIX {
                    return Err(IdParseError::InvalidPrefix {
                        expected: Self::PREFIX.to_string(),
                        actual: mti.prefix().as_str().to_string(),
                    });
                }
                Ok(Self(mti))
            }
        }
    };
}

typed_id!(FlowId, "flow", "A live connection's identifier.");
typed_id!(RuleId, "rule", "A policy rule's identifier, as assigned by the control plane.");
typed_id!(EventId, "evt", "An audit/telemetry event identifier.");

/// A `MakeRequestId` implementation for the admin surface, generating an
/// `EventId` per inbound request so `/healthz` and `/metrics` hits carry the
/// same time-sortable, type-checked correlation id as everything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeTypedRequestId;

impl MakeRequestId for MakeTypedRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<TowerRequestId> {
        let id = EventId::new();
        let header_value = http::HeaderValue::from_str(id.as_str()).ok()?;
        Some(TowerRequestId::new(header_value))
    }
}

/// Error type for typed-id parsing.
#[derive(Debug, thiserror::Error)]
pub enum IdParseError {
    #[error("failed to parse id: {0}")]
    Parse(#[from] MagicTypeIdError),

    #[error("invalid prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix { expected: String, actual: String },
}
