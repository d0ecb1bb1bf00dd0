//! # Knowledge Relay Core
//!
//! Runtime-agnostic logic for knowledge-relay: the partition registry,
//! intent scoping, scoring policy and ranking, context budget assembly,
//! PII scrubbing, and the capability traits for embedding providers and
//! vector indexes.
//!
//! This crate contains no tokio, HTTP clients, or other I/O. The
//! application crate supplies concrete collaborators and deadlines.

pub mod budget;
pub mod embedding;
pub mod index;
pub mod intent;
pub mod models;
pub mod partition;
pub mod privacy;
pub mod ranking;
