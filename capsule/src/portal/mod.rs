//! Host-side portal for talking to the guest agent over tonic/gRPC.

pub mod connection;
pub mod interfaces;
pub mod session;

pub use session::GuestSession;
