//! Reactive Rule Engine over a Versioned Contract Store
//!
//! Every write made through a [`Worker`] runs through a commit pipeline that
//! reacts to it: triggered actions derive new action requests, transformers
//! spawn tasks for contracts that start matching their input filter, events
//! are attached to the contract's timeline, and types carrying `$$formula`
//! fields get triggers that keep those fields fresh when linked contracts
//! change.
//!
//! Cascades are never recursive. Derived work goes back through the
//! [`ActionQueue`] and is picked up by the worker loop.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use reactor::{MemoryQueue, MemoryStore, Worker, WorkerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let worker = Worker::builder(Arc::new(MemoryStore::new()), Arc::new(MemoryQueue::new()))
//!     .config(WorkerConfig::from_env()?)
//!     .build();
//! worker.initialize().await?;
//!
//! let shutdown = CancellationToken::new();
//! worker.run(shutdown.clone()).await?;
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Store and queue abstractions
//! - [`stores`] / [`queues`] - In-memory implementations
//! - [`schema`] - JSON schema matching with the `$$links` extension
//! - [`expression`] - Template and `$$formula` expression evaluation
//! - [`triggers`] / [`registry`] - Triggered actions and the rule registries
//! - [`pipeline`] - The commit pipeline
//! - [`dispatch`] / [`actions`] - Action dispatch and the built-in actions
//! - [`transformers`] - Transformer evaluation
//! - [`formulas`] - Formula evaluation and link-trigger generation
//! - [`scheduler`] - Interval triggers

pub mod actions;
pub mod bootstrap;
pub mod config;
pub mod contract;
pub mod dispatch;
pub mod duration;
pub mod error;
pub mod expression;
pub mod formulas;
pub mod patch;
pub mod pipeline;
pub mod queues;
pub mod registry;
pub mod scheduler;
pub mod schema;
pub mod side_effects;
pub mod stores;
pub mod subscriptions;
pub mod traits;
pub mod transformers;
pub mod triggers;
pub mod worker;

// Re-export core types at crate root
pub use config::WorkerConfig;
pub use contract::{
    types, ActionRequest, ActionResult, Contract, ContractDraft, ExecutionEvent, LogContext,
    PendingRequest,
};
pub use dispatch::{ActionContext, ActionHandler, ActionLibrary};
pub use error::{ErrorCategory, ReactorError, Result};
pub use patch::PatchOperation;
pub use pipeline::WriteOptions;
pub use queues::MemoryQueue;
pub use side_effects::{SideEffect, SideEffects};
pub use stores::MemoryStore;
pub use subscriptions::{NoSubscriptions, SubscriptionEvaluator};
pub use traits::{ActionQueue, ContractStore, QueryOptions, SortDirection};
pub use triggers::{TriggerMode, TriggeredAction};
pub use worker::{Worker, WorkerBuilder};
