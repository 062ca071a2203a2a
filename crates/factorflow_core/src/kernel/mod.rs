//! Contract between stages and the code that computes them.
//!
//! The scheduler never looks inside a kernel. It only hands it slices of
//! buffer memory in one of two shapes:
//!
//! - A stock block: every input and output is a `[time][lane]` slice holding
//!   `num_time` steps of `lanes` stocks. Used for stages sliced by stock.
//! - A column: one value per stock for a single time step. Used for stages
//!   sliced by time and for streaming, through a [`KernelStepper`] that
//!   carries rolling history from one step to the next.
//!
//! Input and output slices are ordered like the Input and Output operators
//! of the stage's function.
pub mod interpreted;

use std::fmt::Debug;
use std::sync::Arc;

use factorflow_error::Result;

use crate::buffer::BufferRegistry;
use crate::config::CompilerConfig;
use crate::ir::Function;

pub use interpreted::InterpretedKernelGenerator;

pub trait StageKernel: Debug + Sync + Send {
    /// Compute all outputs for one block of stocks over `num_time` steps.
    fn run_stock_block(
        &self,
        inputs: &[&[f64]],
        outputs: &mut [&mut [f64]],
        lanes: usize,
        num_time: usize,
    ) -> Result<()>;

    /// Create a fresh step-at-a-time evaluator with empty history.
    fn new_stepper(&self, num_stocks: usize) -> Result<Box<dyn KernelStepper>>;
}

pub trait KernelStepper: Debug + Send {
    /// Compute one time step for all stocks.
    fn step(&mut self, inputs: &[&[f64]], outputs: &mut [&mut [f64]]) -> Result<()>;
}

/// Everything a generator gets to know about one stage.
#[derive(Debug)]
pub struct KernelRequest<'a> {
    pub func: &'a Function,
    /// Buffer ids read by the stage, in Input operator order.
    pub input_buffers: &'a [usize],
    /// Buffer ids written by the stage, in Output operator order.
    pub output_buffers: &'a [usize],
    pub registry: &'a BufferRegistry,
    pub config: &'a CompilerConfig,
}

/// Turns a stage's function into something callable.
pub trait KernelGenerator: Debug + Sync + Send {
    fn generate(&self, req: &KernelRequest) -> Result<Arc<dyn StageKernel>>;
}
