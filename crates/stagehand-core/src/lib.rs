//! Core of the stagehand workflow state runtime.
//!
//! A workflow step implements [`State`]. Its `execute` call either finishes
//! synchronously or queues remote work on a delegate and suspends on the
//! correlation ids of that work. When every id has reported, the
//! [`CorrelationRegistry`] resumes the state through `handle_async_response`.
//!
//! # Components
//!
//! - **CorrelationRegistry**: correlation-keyed notification join
//! - **DelegateTaskDispatcher**: queues async tasks and runs sync ones
//! - **ActivityRecorder**: RUNNING-then-terminal activity records
//! - **RepeatState**: SERIAL / PARALLEL fan-out over a collection
//! - **StateMachineExecutor**: reference scheduler driving instances
//! - **states**: command, Jenkins, HTTP, service resize and log analysis states

pub mod activity;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod poller;
pub mod progress;
pub mod registry;
pub mod repeat;
pub mod response;
pub mod state;
pub mod states;
pub mod telemetry;

pub use activity::ActivityRecorder;
pub use config::{ConfigError, EngineConfig, EngineConfigLoader};
pub use context::{ExecutionContext, ExecutionIds};
pub use dispatcher::{DelegateTaskDispatcher, QueuedTask};
pub use engine::Engine;
pub use error::{RegistryError, Result, StateError};
pub use executor::{InstanceOutcome, StartRequest, StateMachineExecutor};
pub use poller::LocalPoller;
pub use progress::{ProgressEvent, ProgressMetrics, ProgressReporter};
pub use registry::{Continuation, CorrelationRegistry, ResponseMap};
pub use repeat::{ExecutionStrategy, RepeatState, RepeatStateExecutionData};
pub use response::{ChildInstance, ExecutionResponse, StateExecutionData};
pub use state::{State, StateType, guard};
pub use telemetry::{LogFormat, init_tracing};
