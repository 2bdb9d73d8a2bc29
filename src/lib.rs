//! # Catalog Harvester
//!
//! Harvests metadata about third-party server packages from code hosts,
//! package registries, container registries and plain HTTP manifests into
//! a normalized SQLite catalog. Every entry is statically inspected for
//! risky constructs (never executed), given a composite health score, and
//! kept fresh by a background scheduler.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │   Adapters   │──▶│ parse: risk  │──▶│    SQLite     │
//! │ GH/npm/PyPI/ │   │   + health   │   │ servers+logs  │
//! │ Docker/HTTP  │   └──────────────┘   └───────┬───────┘
//! └──────▲───────┘                              │
//!        │ harvest (checkpoint + retry)         │
//! ┌──────┴───────┐   ┌──────────────┐           │
//! │ Orchestrator │◀──│   Catalog    │◀──────────┘
//! └──────────────┘   │   Updater    │
//!                    └──────▲───────┘
//!                           │ jobs
//!                    ┌──────┴───────┐
//!                    │  Scheduler   │
//!                    └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvester init                                   # create database
//! harvester harvest github https://github.com/o/r  # one-off harvest
//! harvester stats                                  # catalog summary
//! harvester run                                    # start the scheduler
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Entities, enums, filters and patches |
//! | [`risk`] | Static risk analyzer |
//! | [`health`] | Health scorer |
//! | [`retry`] | Backoff policy and retry combinator |
//! | [`adapters`] | Source adapters and their registry |
//! | [`harvest`] | Checkpointed harvest orchestrator |
//! | [`catalog`] | Catalog updater: CRUD, sweeps, statistics |
//! | [`scheduler`] | Background scheduler and standard jobs |
//! | [`store`] | Storage trait, SQLite and in-memory backends |
//! | [`db`] | Database connection |
//! | [`migrate`] | Versioned schema migrations |
//! | [`metrics`] | Metrics sink |
//! | [`cache`] | Statistics cache |
//! | [`logging`] | Tracing subscriber setup |
//! | [`error`] | Error types |

pub mod adapters;
pub mod app;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod harvest;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod retry;
pub mod risk;
pub mod scheduler;
pub mod stats;
pub mod store;
