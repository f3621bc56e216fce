//! Trading module for order construction and execution.
//!
//! This module handles:
//! - Validated Fill-or-Kill order requests
//! - Order submission with retry and dry-run simulation

pub mod execution;
pub mod order;

pub use execution::{
    ClobSubmitter, ExecutionError, ExecutionMode, ExecutionResult, ExecutionStatus, OrderExecutor,
    OrderSubmitter, RetryPolicy, SubmitFill,
};
pub use order::{OrderRequest, Side, TimeInForce};
