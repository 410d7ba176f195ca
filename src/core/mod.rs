//! Core orchestration logic.
//!
//! This module contains:
//! - Runner: external step execution with captured or streamed output
//! - Broker: fan-out of live output to observers
//! - Supervisor: the per-run state machine
//! - Registry: process-wide run lookup
//! - Orchestrator: the facade consumed by transport layers

pub mod broker;
pub mod orchestrator;
pub mod registry;
pub mod runner;
pub mod supervisor;

// Re-export commonly used types
pub use broker::{LogBroker, LogStream};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use registry::RunRegistry;
pub use runner::{ProcessRunner, StepError, StepRunner, StreamSink};
pub use supervisor::{RunSupervisor, SupervisorError};
