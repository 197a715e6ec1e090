//! converge apply (Supervisor): drives an apply/destroy engine, turns its event
//! stream into per-object status and typed errors, and keeps the inventory.

#![forbid(unsafe_code)]

pub mod classify;
pub mod client_engine;
pub mod engine;
pub mod event;
pub mod inventory;
pub mod processor;
pub mod stats;
pub mod supervisor;

pub use classify::{classify, Phase};
pub use client_engine::{ClientEngine, EngineConfig};
pub use engine::{ApplyEngine, RunMode, RunOptions};
pub use event::{ActuationEvent, ErrorEvent, Event, OpStatus, Operation, WaitEvent, WaitStatus};
pub use inventory::Inventory;
pub use processor::{EventProcessor, Flow, Processed};
pub use stats::SyncStats;
pub use supervisor::{Supervisor, SupervisorConfig};
