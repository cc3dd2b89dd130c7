//! Business logic layer. Every service takes `Arc<dyn Store>` plus whatever
//! collaborators it needs (notification gateway, config) and exposes plain
//! async functions returning `EngineResult<T>` — the HTTP boundary and the
//! scheduler are the only places concurrency enters, per the synchronous
//! service design this engine follows.

pub mod approval;
pub mod deployment;
pub mod metrics;
pub mod regression;
pub mod version_graph;
