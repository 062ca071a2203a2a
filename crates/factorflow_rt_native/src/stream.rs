//! Tick by tick execution of a streaming module.
use std::sync::Arc;

use factorflow_core::buffer::{Buffer, BufferKind};
use factorflow_core::kernel::KernelStepper;
use factorflow_core::layout::{DataType, Element};
use factorflow_core::module::Module;
use factorflow_core::stage::Stage;
use factorflow_error::{DbError, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::executor::NativeExecutor;
use crate::profile::ExecutionProfile;
use crate::scheduler::{StageRunner, execute_stages};

/// Stable reference to one of a module's buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(usize);

impl BufferHandle {
    pub fn id(&self) -> usize {
        self.0
    }
}

/// Persistent execution state for a streaming module.
///
/// Every buffer holds the values of the current tick, one per stock. Each
/// stage keeps a stepper carrying its rolling history across ticks.
///
/// A context must be driven from one logical sequence of calls; all
/// mutating operations take `&mut self`.
#[derive(Debug)]
pub struct StreamContext {
    executor: NativeExecutor,
    module: Arc<Module>,
    num_stocks: usize,
    state: StreamState,
    /// Inputs pushed since the last successful run.
    pushed: Vec<bool>,
    num_ticks: usize,
}

#[derive(Debug)]
struct StreamState {
    buffers: Vec<RwLock<Vec<f64>>>,
    steppers: Vec<Mutex<Box<dyn KernelStepper>>>,
}

impl StreamContext {
    pub fn try_new(
        executor: &NativeExecutor,
        module: Arc<Module>,
        num_stocks: usize,
    ) -> Result<Self> {
        if !module.config().is_streaming() {
            return Err(DbError::shape("Module doesn't use the streaming layout")
                .with_field("module", module.name().to_string())
                .with_field("output_layout", module.output_layout()));
        }
        if num_stocks == 0 {
            return Err(DbError::shape("Streaming context needs at least one stock"));
        }

        let steppers = module
            .stages()
            .iter()
            .map(|s| s.kernel.new_stepper(num_stocks).map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;
        let buffers = module
            .buffers()
            .iter()
            .map(|_| RwLock::new(vec![f64::NAN; num_stocks]))
            .collect();

        debug!(module = module.name(), num_stocks, "opened stream context");

        Ok(StreamContext {
            executor: executor.clone(),
            pushed: vec![false; module.buffers().len()],
            module,
            num_stocks,
            state: StreamState { buffers, steppers },
            num_ticks: 0,
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn num_stocks(&self) -> usize {
        self.num_stocks
    }

    /// Number of ticks successfully run so far.
    pub fn num_ticks(&self) -> usize {
        self.num_ticks
    }

    pub fn query_buffer_handle(&self, name: &str) -> Result<BufferHandle> {
        self.module
            .buffer_by_name(name)
            .map(|b| BufferHandle(b.id))
            .ok_or_else(|| {
                DbError::stream_misuse("Unknown buffer").with_field("buffer", name.to_string())
            })
    }

    /// Set the values of an input buffer for the next tick.
    pub fn push_data<T: Element>(&mut self, handle: BufferHandle, values: &[T]) -> Result<()> {
        let buffer = self.buffer(handle)?;
        if buffer.kind != BufferKind::Input {
            return Err(DbError::stream_misuse("Can only push data to inputs")
                .with_field("buffer", buffer.name.clone())
                .with_field("kind", buffer.kind));
        }
        self.check_values(buffer, T::DTYPE, values.len())?;

        let mut dst = self.state.buffers[handle.0].write();
        for (d, v) in dst.iter_mut().zip(values) {
            *d = v.to_f64_lossy();
        }
        self.pushed[handle.0] = true;
        Ok(())
    }

    /// Execute every stage once for the pushed tick.
    ///
    /// Fails without touching any rolling state if an input wasn't pushed
    /// since the previous run.
    pub fn run(&mut self) -> Result<ExecutionProfile> {
        for buffer in self.module.buffers() {
            if buffer.kind == BufferKind::Input && !self.pushed[buffer.id] {
                return Err(DbError::stream_misuse("Input not pushed for this tick")
                    .with_field("buffer", buffer.name.clone())
                    .with_field("tick", self.num_ticks));
            }
        }

        let profile = execute_stages(&self.executor, &self.module, &self.state)?;

        self.pushed.iter_mut().for_each(|p| *p = false);
        self.num_ticks += 1;
        trace!(tick = self.num_ticks, "ran stream tick");
        Ok(profile)
    }

    /// Values of a buffer as of the most recent run.
    pub fn get_current_buffer<T: Element>(&self, handle: BufferHandle) -> Result<Vec<T>> {
        let buffer = self.buffer(handle)?;
        self.check_values(buffer, T::DTYPE, self.num_stocks)?;
        let values = self.state.buffers[handle.0].read();
        Ok(values.iter().map(|v| T::from_f64_lossy(*v)).collect())
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&Buffer> {
        self.module.buffers().get(handle.0).ok_or_else(|| {
            DbError::stream_misuse("Buffer handle doesn't belong to this module")
                .with_field("handle", handle.0)
        })
    }

    fn check_values(&self, buffer: &Buffer, dtype: DataType, len: usize) -> Result<()> {
        if dtype != self.module.dtype() {
            return Err(DbError::shape("Buffer dtype doesn't match module")
                .with_field("buffer", buffer.name.clone())
                .with_field("module_dtype", self.module.dtype())
                .with_field("dtype", dtype));
        }
        if len != self.num_stocks {
            return Err(DbError::stream_misuse("Expected one value per stock")
                .with_field("buffer", buffer.name.clone())
                .with_field("num_stocks", self.num_stocks)
                .with_field("len", len));
        }
        Ok(())
    }
}

impl StageRunner for StreamState {
    fn run_stage(&self, stage: &Stage) -> Result<()> {
        let mut stepper = self.steppers[stage.id].lock();
        let inputs: Vec<_> = stage.inputs.iter().map(|&id| self.buffers[id].read()).collect();
        let mut outputs: Vec<_> = stage
            .outputs
            .iter()
            .map(|&id| self.buffers[id].write())
            .collect();

        let inputs: Vec<&[f64]> = inputs.iter().map(|g| g.as_slice()).collect();
        let mut outputs: Vec<&mut [f64]> = outputs.iter_mut().map(|g| g.as_mut_slice()).collect();
        stepper.step(&inputs, &mut outputs)
    }
}
