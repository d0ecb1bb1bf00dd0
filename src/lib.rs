//! # Knowledge Relay
//!
//! Retrieval-augmented generation relay. Knowledge Relay turns a free-text
//! query into a token-budgeted context block drawn from access-controlled
//! knowledge partitions, runs generation turns against an interchangeable
//! backend, bridges streamed output to clients through short-lived
//! sessions, and fans research lookups out to unreliable sources while
//! still returning a usable aggregate.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!   client ──────▶│  HTTP / CLI  │
//!                 └──────┬───────┘
//!          ┌─────────────┼──────────────┬──────────────┐
//!          ▼             ▼              ▼              ▼
//!     ┌─────────┐  ┌───────────┐  ┌──────────┐  ┌───────────┐
//!     │  Turn   │─▶│ Retriever │  │ Sessions │  │ Research  │
//!     └────┬────┘  └─────┬─────┘  └────▲─────┘  └─────┬─────┘
//!          │       embed │ query       │ events       │ lookups
//!          ▼             ▼             │              ▼
//!     ┌─────────────────────────┐      │        ┌───────────┐
//!     │  Generation provider    │──────┘        │  Sources  │
//!     └─────────────────────────┘               └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! krelay --config ./config/krelay.toml partitions
//! krelay --config ./config/krelay.toml retrieve "detention pay" --role driver
//! krelay --config ./config/krelay.toml serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`telemetry`] | Tracing subscriber setup |
//! | [`error`] | Request-level error taxonomy |
//! | [`embedding`] | Embedding providers |
//! | [`index_rest`] | Vector index construction and the REST client |
//! | [`retrieval`] | Retrieval engine and ingestion |
//! | [`intent`] | Intent classification for retrieval scoping |
//! | [`provider`] | Generation backends |
//! | [`events`] | Stream event model |
//! | [`session`] | Stream sessions |
//! | [`research`] | Research orchestrator |
//! | [`turn`] | Turn orchestrator |
//! | [`server`] | HTTP server |
//!
//! Partition, intent, ranking, budgeting, and PII logic live in the
//! `knowledge-relay-core` crate.

pub mod config;
pub mod embedding;
pub mod error;
pub mod events;
pub mod index_rest;
pub mod intent;
pub mod provider;
pub mod research;
pub mod retrieval;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod turn;
