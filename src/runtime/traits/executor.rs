//! Executor trait: runs one planned step

use crate::runtime::{CompletionHandle, Placement, Stream};
use crate::copy::CopyStep;
use crate::dtype::DType;
use crate::error::Result;

/// A step operand resolved to a concrete address
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BoundOperand {
    /// Address of the element at iteration index (0, ..., 0)
    pub addr: u64,
    /// Element type
    pub dtype: DType,
    /// Where the memory lives
    pub placement: Placement,
}

/// A planned step together with its bound operands
#[derive(Debug)]
pub struct BoundStep<'p> {
    /// The planned step
    pub step: &'p CopyStep,
    /// Source operand
    pub src: BoundOperand,
    /// Destination operand
    pub dst: BoundOperand,
}

/// Runs copy steps at one kind of venue
pub trait Executor {
    /// Execute or enqueue `step`
    ///
    /// `stream` is the queue chosen by the engine for device venues and is
    /// ignored by host executors. The returned handle is ready once every
    /// destination element of the step has been written.
    fn execute(&self, step: &BoundStep<'_>, stream: Option<Stream>) -> Result<CompletionHandle>;
}
