//! Workflow Engine: DAGs of tool invocations with conditions, loops,
//! parallel fan-out, retries and failure policies.
//!
//! Definitions are plain YAML/JSON documents:
//! ```yaml
//! id: triage
//! steps:
//!   - id: search
//!     type: tool_call
//!     provider: tracker
//!     tool: search_issues
//!     arguments:
//!       query: "${inputs.query}"
//!   - id: label
//!     type: tool_call
//!     depends_on: [search]
//!     when: "len(steps.search.items) > 0"
//!     provider: tracker
//!     tool: add_label
//!     arguments:
//!       id: "${steps.search.items[0].id}"
//!       label: triaged
//! ```

pub mod context;
pub mod engine;
pub mod execution;
pub mod expr;
pub mod invoker;
pub(crate) mod runner;
pub mod schema;
pub mod template;
pub mod validate;

pub use context::ExecutionContext;
pub use engine::{EngineConfig, ExecutionHandle, WorkflowEngine};
pub use execution::{ExecutionStatus, StepStatus, WorkflowExecution};
pub use expr::ExprError;
pub use invoker::ToolInvoker;
pub use schema::{
    ErrorPolicy, RetryPolicy, StepKind, WorkflowDefinition, WorkflowInput, WorkflowStep,
};
pub use validate::validate_definition;
