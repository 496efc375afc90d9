//! Integration test entry point for adblink-client.
//!
//! Every test drives a real `AdbConnection` against a scripted device on the
//! other end of an in-memory pipe.

mod harness;
mod handshake;
mod manager;
mod pairing;
mod streams;
