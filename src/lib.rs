// ABOUTME: Library root for table-changes: change tracking for tracked tables
// ABOUTME: Exposes the table model, PostgreSQL engine, in-memory store, and configuration

pub mod change;
pub mod commands;
pub mod config;
pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod sequencer;
pub mod sql;
pub mod value;

pub use change::{ApplyStats, ChangeRow, DiffStats, Operation, TransactionSummary};
pub use config::{Config, ModelCatalog};
pub use error::{ChangeError, Result};
pub use memory::MemoryStore;
pub use model::{Column, DeriveStep, TableModel};
pub use sequencer::Sequencer;
pub use sql::Relation;
pub use value::{Row, Value};
