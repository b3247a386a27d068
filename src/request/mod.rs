//! Bounded synchronous requests
//!
//! A requester blocks (asynchronously) on a single outstanding request until
//! the responder answers or the fixed timeout expires; it never hangs.

mod bounded;

pub use bounded::{bounded_request, RequestConfig};
