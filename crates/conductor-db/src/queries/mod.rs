//! One query module per table group. Functions that participate in
//! multi-statement transactions are generic over [`sqlx::PgExecutor`] so
//! callers can pass either a pool or an open transaction.

pub mod agents;
pub mod discoveries;
pub mod events;
pub mod interventions;
pub mod locks;
pub mod phases;
pub mod tasks;
pub mod tickets;
