//! 🌲 forestry: bulk data movement for a REST document database.
//!
//! 🎬 *[somewhere, a cluster holds a million documents spread over a dozen forests.
//! one crate dares to move them all at once.]*
//!
//! The pieces, bottom up:
//!
//! - [`transport`]: one HTTP request against one host, with basic or digest auth
//!   and a cancellation token riding along.
//! - [`handles`]: the payload shapes (raw, URI list, multipart, JSON, map, text).
//! - [`topology`]: which forests exist, where they live, and one client per host.
//! - [`datamovement`]: the write batcher and the snapshot-consistent query batcher.
//! - [`dataservices`]: call a server-side endpoint once, or in bulk until it runs dry.
//!
//! Every batcher is a builder. `run()` spawns the workers and hands back a job
//! with `cancel()`, `phase()` and `wait()`. Results stream to bounded
//! `async_channel` listeners, so a slow consumer slows the job instead of
//! eating your RAM. 🦆

pub mod app_config;
pub mod clients;
pub mod common;
pub mod datamovement;
pub mod dataservices;
pub mod error;
pub mod handles;
mod listeners;
mod phase;
mod services;
pub mod topology;
pub mod transport;
mod workers;

#[cfg(test)]
mod test_support;

pub use app_config::{AppConfig, load_config};
pub use clients::{AuthKind, Connection, HostClient};
pub use common::{Capability, DocumentDescriptor, Format, Metadata, Permission, Transaction, Transform};
pub use datamovement::DataMovement;
pub use dataservices::DataServices;
pub use error::{Error, Result};
pub use handles::{Handle, ResponseHandle};
pub use phase::{JobCanceller, WorkPhase};
pub use topology::{ForestInfo, Topology};
