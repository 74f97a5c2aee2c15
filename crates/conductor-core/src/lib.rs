//! Core orchestration engine for fleets of autonomous AI agents.
//!
//! Tickets enter a phased workflow (requirements through deployment),
//! each phase materializes tasks from templates, a dependency-aware
//! scheduler computes ready batches, and the dispatcher binds ready tasks
//! to the best-fit registered agent under resource-lock constraints. A
//! guardian watches running agents for drift, constraint violations, and
//! stuck workflows, issuing steering interventions over the event bus.
//!
//! The engine never executes task logic itself; agent workers are
//! external processes that consume assigned tasks and report status back
//! through the public operations on these components.

pub mod bus;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod guardian;
pub mod lock;
pub mod phase;
pub mod registry;
pub mod sched;

pub use engine::Engine;
pub use error::EngineError;
