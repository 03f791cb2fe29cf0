//! # lbsync-sync
//!
//! Change accumulation and reconciliation passes.
//!
//! Producers write cluster objects into a [`ClusterCache`]; each call to
//! [`Orchestrator::sync`] swaps out what changed since the previous pass and
//! runs the stage table against the shared [`ProxyConfig`], rebuilding it
//! from scratch when any stage asks for a full sync.

pub mod accumulator;
pub mod cache;
pub mod converter;
pub mod converters;
pub mod error;
pub mod pipeline;
pub mod proxy;
pub mod stage;
pub mod timer;

pub use accumulator::ChangeAccumulator;
pub use cache::{ClusterCache, ResourceStore};
pub use converter::{Converter, PassContext};
pub use error::SyncError;
pub use pipeline::{volume_summary, Orchestrator, PassReport};
pub use proxy::{BackendId, ConfigTarget, ProxyConfig};
pub use stage::{Construction, Gate, Stage};
pub use timer::StageTimer;
