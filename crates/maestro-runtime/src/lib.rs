//! Maestro runtime — durable plan execution over a message broker.
//!
//! The [`runtime::PlanRuntime`] submits plan steps onto the step topic,
//! consumes tool completions, drives the per-step state machine and
//! publishes lifecycle events through the kernel's
//! [`PlanEventBus`](maestro_kernel::bus::PlanEventBus). Broker access goes
//! through the [`queue::QueueAdapter`] seam with in-memory, AMQP (`amqp`
//! feature) and log-based (`kafka` feature) variants.

pub mod backoff;
pub mod error;
pub mod messages;
pub mod queue;
pub mod runtime;
pub mod tool;

pub use backoff::BackoffPolicy;
pub use error::{RuntimeError, RuntimeResult};
pub use messages::{StepCompletionMessage, StepTaskMessage};
pub use queue::{Delivery, EnqueueOptions, MemoryQueue, QueueAdapter, QueueError, QueueMetrics};
pub use runtime::{ApprovalDecision, PlanRuntime, RuntimeOptions, COMPLETION_QUEUE, STEP_QUEUE};
pub use tool::{ToolAgent, ToolError, ToolEvent, ToolEventState, ToolInvocation};
