//! Persistence layer for the conductor engine.
//!
//! Everything the engine knows lives in PostgreSQL: tickets, tasks and
//! their dependency edges, phase definitions and history, agents, resource
//! locks, the append-only event log, discoveries, and guardian state.
//! This crate owns the schema (ordered migrations under `migrations/`),
//! the row models, and one query module per table group. No business
//! logic lives here; the engine crate composes these queries.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
