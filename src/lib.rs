//! Sitelink - two-party peer session manager
//!
//! Pairs an initiator and a responder through a rendezvous service by a
//! shared code, then keeps one bidirectional media call and one ordered data
//! link alive between them. The data link carries floor plan images, marks
//! and live measurements as a coalesced overlay feed.

pub mod call;
pub mod config;
pub mod datalink;
pub mod error;
pub mod events;
pub mod identity;
pub mod measure;
pub mod media;
pub mod payload;
pub mod session;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod testing;

pub use error::{Result, SessionError};
pub use session::{ActionResult, SessionManager, SessionSnapshot, SessionState};
