//! Multi-tenant chain node multiplexer.
//!
//! A single process runs N independent replicated chains, each with its
//! own databases, stores, event bus, indexer, and signer, partitioned by
//! a scope hash derived from `(user address, scope name)`. The
//! [`reactor::MultiplexReactor`] supervises the per-chain subsystems:
//! it owns their lifecycle, assigns non-colliding listen ports from a
//! configurable base, and routes every lookup by scope hash through its
//! provider surface.
//!
//! Applications typically build a [`config::NodeConfig`], hand it to
//! [`reactor::MultiplexReactor::new`], and drive the reactor's
//! `start`/`stop` lifecycle.

pub mod config;
pub mod db;
pub mod errors;
pub mod fs;
pub mod genesis;
pub mod mempool;
pub mod privval;
pub mod reactor;
pub mod scope;
pub mod services;
pub mod state;
pub mod store;
pub mod types;

pub use errors::{MultiplexError, MultiplexResult};
pub use reactor::MultiplexReactor;
