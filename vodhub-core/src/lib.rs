//! Media-source aggregation engine
//!
//! Queries heterogeneous third-party video sites in parallel, normalizes
//! their responses into a common schema, and resolves playable stream URLs.
//!
//! Layout:
//! - [`config`] — document model and the priority config resolver
//! - [`fetcher`] — shared HTTP client (per-site headers, DoH, hooks)
//! - [`cache`] — two-tier cache with single-flight loads
//! - [`script`] — script-host seam and native bridges
//! - [`spider`] — polymorphic site adapters and their manager
//! - [`extractor`] — scheme-dispatched play-URL resolution
//! - [`searcher`] — concurrent multi-site search
//! - [`orchestrator`] — the public five-operation facade

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod extractor;
pub mod fetcher;
pub mod hooks;
pub mod logging;
pub mod orchestrator;
pub mod script;
pub mod searcher;
pub mod spider;

pub use error::{Error, Result};
pub use orchestrator::{ExtractorBackends, HookOptions, NoopUserDataSink, Orchestrator, UserDataSink};
