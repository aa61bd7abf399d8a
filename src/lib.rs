//! # Libernet Core Library
//!
//! Content-addressed block storage and a versioned backup engine built on
//! top of it.
//!
//! Directory trees shred into deduplicated, encrypted, fixed-size blocks
//! identified by the SHA-256 digest of their stored form. Snapshots are
//! described by JSON "bundles" that are themselves blocks. Blocks live on
//! local disk or behind an HTTP peer, and a user's multi-machine backup
//! history is hidden at predictable digest prefixes, discovered with
//! nearest-digest ("like") queries and merged by timestamp.
//!
//! ## Key Modules
//!
//! - [`hash`]: SHA-256 identifiers and the leading-bit match score.
//! - [`url`]: the four-kind `/sha256/…` URL grammar bundles embed.
//! - [`block`]: the codec — deflate, AES-256-CBC, digest-prefix padding.
//! - [`store`]: the [`store::BlockStore`] trait with disk, HTTP-proxy, and
//!   in-memory backends.
//! - [`server`]: the HTTP block server the proxy talks to.
//! - [`bundle`]: directory ↔ bundle conversion, splitting, restore.
//! - [`backup`]: discovery, history merging, and the backup actions.

pub mod backup;
pub mod block;
pub mod bundle;
pub mod cli;
pub mod error;
pub use error::LibernetError;

pub mod hash;
pub mod message;
pub mod server;
pub mod settings;
pub mod store;
pub mod timestamp;
pub mod url;
