//! # Gardi
//!
//! `gardi` is the authentication and session lifecycle service for
//! zero-knowledge clients. Passwords never reach the server: the client runs
//! its KDF over a server-distributed salt and submits only the derived
//! authentication hash, which the server peppers and re-hashes with Argon2id
//! before storing.
//!
//! ## Enumeration resistance
//!
//! The salt endpoint answers for any syntactically valid email. Unknown
//! addresses receive a deterministic HMAC-derived synthetic salt with the
//! same shape as a real one, and failed logins cost a full Argon2id
//! verification whether or not the account exists.
//!
//! ## Sessions and tokens
//!
//! Access tokens are short-lived Ed25519-signed JWTs carrying the session id;
//! refresh tokens are opaque 256-bit values stored only as SHA-256 hashes.
//! Refreshing rotates the stored hash atomically, so a replayed old token
//! loses the race and reads as an expired session.
//!
//! ## Stores
//!
//! All persistence goes through store traits with two backends: `PostgreSQL`
//! for production and an in-memory store for tests and single-instance
//! deployments.

pub mod api;
pub mod auth;
pub mod cli;
pub mod error;
pub mod store;

pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
