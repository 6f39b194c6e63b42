//! FlowDesk core: process publishing, instance orchestration and human-task
//! routing on top of a pluggable BPMN execution engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 ProcessService (public surface)               │
//! │     identity resolution · boundary retries · request ids      │
//! └──────────────────────────────────────────────────────────────┘
//!        │              │              │             │
//!        ▼              ▼              ▼             ▼
//!  DeploymentManager  InstanceOrch.  TaskManager  DiagramRenderer
//!        │              │              │             │
//!        │              └──────┬───────┘       HistoryReader
//!        ▼                     ▼                     │
//!   ModelStore          EngineClient (deadline) ◄────┘
//!                              │
//!                              ▼
//!                 ExecutionEngine (MemoryEngine for POC)
//! ```
//!
//! The engine, model store, identity provider and diagram encoder are traits;
//! in-memory implementations are provided for tests and the CLI.

pub mod authoring;
pub mod bpmn_xml;
pub mod config;
pub mod deployment;
pub mod diagram;
pub mod engine;
pub mod engine_client;
pub mod engine_memory;
pub mod error;
pub mod expr;
pub mod history;
pub mod identity;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod service;
pub mod tasks;
pub mod types;

pub use config::FlowDeskConfig;
pub use diagram::{DiagramEncoder, DiagramRenderer, SvgDiagramEncoder};
pub use engine::ExecutionEngine;
pub use engine_memory::MemoryEngine;
pub use error::{EngineError, EntityKind, OrchestratorError};
pub use identity::{IdentityProvider, StaticIdentityProvider};
pub use models::{MemoryModelStore, ModelStore};
pub use service::ProcessService;
pub use types::*;
