//! Admin-surface middleware
//!
//! Only the request-tracking layer is needed here: a `/healthz` +
//! `/metrics` scrape surface has no external callers to authenticate, so
//! auth/governor/resilience layers would have nothing to do. Kept in its
//! own module rather than folded into `admin.rs` for symmetry with the
//! data-plane module layout.

pub mod request_tracking;

pub use request_tracking::{
    request_id_layer, request_id_propagation_layer, sensitive_headers_layer, RequestTrackingConfig,
    PROPAGATE_HEADERS, SENSITIVE_HEADERS,
};
