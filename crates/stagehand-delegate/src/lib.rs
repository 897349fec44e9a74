//! Delegate implementations for stagehand.
//!
//! This crate provides in-process implementations of the boundary traits
//! defined in `stagehand-abstraction`.
//!
//! # Components
//!
//! - **InMemoryDelegateService**: runs task handlers on the tokio runtime
//! - **InMemoryActivityStore**: map-backed activity store with sticky terminal statuses
//! - **TemplateEvaluator**: `${path}` rendering over JSON variables
//! - **DelegateFactory**: builds delegate services by name

pub mod evaluator;
pub mod factory;
pub mod service;
pub mod store;

pub use evaluator::TemplateEvaluator;
pub use factory::{DelegateConfig, DelegateFactory, DelegateType, OfflineDelegateService};
pub use service::{
    DEFAULT_TASK_TIMEOUT, FnHandler, InMemoryDelegateService, TaskHandler, handler_fn,
};
pub use store::InMemoryActivityStore;
