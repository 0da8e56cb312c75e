//! End-to-end and property-based test suite for Kasmix.
//!
//! The integration tests drive the real engine against the in-memory
//! mock node: sessions are created through the public API, monitors are
//! ticked by hand, and "block acceptance" is simulated by confirming the
//! mock node's pending transactions and advancing its DAA score.

pub mod helpers;
