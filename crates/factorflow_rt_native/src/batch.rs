//! One-shot execution of a module over a range of time.
//!
//! All buffers are held as `[block][time][lane]` f64 storage for the duration
//! of the run. Each block sits behind its own lock so stock sliced stages can
//! work on blocks in parallel, and so a buffer is only ever handed out
//! mutably to the single stage writing it.
use std::collections::HashMap;

use factorflow_core::buffer::BufferKind;
use factorflow_core::layout::{Array, Element, Layout, num_blocks};
use factorflow_core::module::Module;
use factorflow_core::stage::{Stage, TaskKind};
use factorflow_error::{DbError, OptionExt, Result};
use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::executor::NativeExecutor;
use crate::profile::ExecutionProfile;
use crate::scheduler::{StageRunner, execute_stages};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Skip checking dtype, buffer names and caller provided output shapes
    /// before running. Shapes needed to read inputs are always checked.
    pub skip_check: bool,
    /// Number of real stocks. Defaults to the stock axis of TS inputs, or to
    /// every lane of STs inputs.
    pub num_stocks: Option<usize>,
}

/// Run `module` for time steps `[start, start + length)`.
///
/// Inputs cover the whole time axis starting at zero, and enough history
/// before `start` is recomputed for rolling operators to produce the same
/// values as a run over the full axis. Outputs missing from `outputs` are
/// allocated. Outputs are only written once every stage succeeded and every
/// output shape checked out, so on error `outputs` is left untouched.
pub fn run_graph<T: Element>(
    executor: &NativeExecutor,
    module: &Module,
    inputs: &HashMap<String, Array<T>>,
    start: usize,
    length: usize,
    outputs: &mut HashMap<String, Array<T>>,
    options: RunOptions,
) -> Result<ExecutionProfile> {
    if module.input_layout() == Layout::Stream || module.output_layout() == Layout::Stream {
        return Err(DbError::shape("Streaming module cannot be run in batch mode")
            .with_field("module", module.name().to_string()));
    }

    let blocking_len = module.blocking_len();
    let dims = input_dims(module, inputs, options)?;
    let end = start.checked_add(length);
    if end.is_none_or(|end| end > dims.num_time) {
        return Err(DbError::shape("Time range exceeds the input time axis")
            .with_field("start", start)
            .with_field("length", length)
            .with_field("num_time", dims.num_time));
    }

    let out_shape = match module.output_layout() {
        Layout::TS => vec![length, dims.num_stocks],
        _ => vec![num_blocks(dims.num_stocks, blocking_len), length, blocking_len],
    };
    if !options.skip_check {
        validate(module, inputs, outputs, &out_shape)?;
    }

    let compute_start = start.saturating_sub(module.max_lookback());
    let num_time = start + length - compute_start;
    let storage = BatchStorage::new(module, dims.num_stocks, num_time);
    for buffer in module.buffers() {
        if buffer.kind != BufferKind::Input {
            continue;
        }
        let arr = inputs.get(&buffer.name).required("input array")?;
        storage.load_input(buffer.id, arr, module.input_layout(), dims, compute_start)?;
    }

    debug!(
        module = module.name(),
        start,
        length,
        compute_start,
        num_stocks = dims.num_stocks,
        "running batch"
    );
    let profile = execute_stages(executor, module, &storage)?;

    // Check every output before writing any of them.
    let mut targets = Vec::new();
    for name in module.output_names() {
        let buffer = module.buffer_by_name(name).required("output buffer")?;
        if let Some(out) = outputs.get(name) {
            if out.shape() != out_shape.as_slice() {
                return Err(DbError::shape("Output array has wrong shape")
                    .with_field("output", name.to_string())
                    .with_field("expected", out_shape.clone())
                    .with_field("actual", out.shape().to_vec()));
            }
        }
        targets.push((name, buffer.id));
    }

    let mut stored = HashMap::with_capacity(targets.len());
    for (name, id) in targets {
        let mut out = Array::filled(out_shape.clone(), T::zero());
        storage.store_output(id, &mut out, module.output_layout(), start - compute_start)?;
        stored.insert(name.to_string(), out);
    }
    outputs.extend(stored);

    Ok(profile)
}

#[derive(Debug, Clone, Copy)]
struct InputDims {
    num_time: usize,
    num_stocks: usize,
}

/// Time and stock extents shared by every input.
fn input_dims<T: Element>(
    module: &Module,
    inputs: &HashMap<String, Array<T>>,
    options: RunOptions,
) -> Result<InputDims> {
    let blocking_len = module.blocking_len();
    let mut dims: Option<InputDims> = None;

    for name in module.input_names() {
        let arr = inputs.get(name).ok_or_else(|| {
            DbError::shape("Missing input array").with_field("input", name.clone())
        })?;
        let these = match (module.input_layout(), arr.shape()) {
            (Layout::TS, &[num_time, num_stocks]) => {
                if options.num_stocks.is_some_and(|n| n != num_stocks) {
                    return Err(DbError::shape("Stock count doesn't match TS input")
                        .with_field("input", name.clone())
                        .with_field("num_stocks", num_stocks));
                }
                InputDims {
                    num_time,
                    num_stocks,
                }
            }
            (Layout::STs, &[blocks, num_time, lanes]) if lanes == blocking_len => {
                let num_stocks = options.num_stocks.unwrap_or(blocks * blocking_len);
                if num_blocks(num_stocks, blocking_len) != blocks {
                    return Err(DbError::shape("Stock count doesn't match STs blocks")
                        .with_field("input", name.clone())
                        .with_field("blocks", blocks)
                        .with_field("num_stocks", num_stocks));
                }
                InputDims {
                    num_time,
                    num_stocks,
                }
            }
            (layout, shape) => {
                return Err(DbError::shape("Input array doesn't match module layout")
                    .with_field("input", name.clone())
                    .with_field("layout", layout)
                    .with_field("shape", shape.to_vec())
                    .with_field("blocking_len", blocking_len));
            }
        };

        match dims {
            None => dims = Some(these),
            Some(prev)
                if prev.num_time == these.num_time && prev.num_stocks == these.num_stocks => {}
            Some(prev) => {
                return Err(DbError::shape("Inputs disagree on shape")
                    .with_field("input", name.clone())
                    .with_field("expected_time", prev.num_time)
                    .with_field("expected_stocks", prev.num_stocks));
            }
        }
    }

    match dims {
        Some(dims) => Ok(dims),
        // Nothing to infer extents from, everything is constant.
        None => {
            let num_stocks = options.num_stocks.ok_or_else(|| {
                DbError::shape("Stock count required for modules without inputs")
            })?;
            Ok(InputDims {
                num_time: usize::MAX,
                num_stocks,
            })
        }
    }
}

fn validate<T: Element>(
    module: &Module,
    inputs: &HashMap<String, Array<T>>,
    outputs: &HashMap<String, Array<T>>,
    out_shape: &[usize],
) -> Result<()> {
    if T::DTYPE != module.dtype() {
        return Err(DbError::shape("Array dtype doesn't match module")
            .with_field("module_dtype", module.dtype())
            .with_field("array_dtype", T::DTYPE)
            .with_field("width", T::DTYPE.width()));
    }
    for name in inputs.keys() {
        if !module.input_names().contains(name) {
            return Err(DbError::shape("Unknown input").with_field("input", name.clone()));
        }
    }
    for (name, arr) in outputs {
        if !module.output_names().any(|n| n == name) {
            return Err(DbError::shape("Unknown output").with_field("output", name.clone()));
        }
        if arr.shape() != out_shape {
            return Err(DbError::shape("Output array has wrong shape")
                .with_field("output", name.clone())
                .with_field("expected", out_shape.to_vec())
                .with_field("actual", arr.shape().to_vec()));
        }
    }
    Ok(())
}

/// Storage for a single buffer, one `[time][lane]` slab per block.
#[derive(Debug)]
struct BlockedBuffer {
    blocks: Vec<RwLock<Vec<f64>>>,
}

#[derive(Debug)]
struct BatchStorage {
    buffers: Vec<BlockedBuffer>,
    num_stocks: usize,
    num_blocks: usize,
    num_time: usize,
    blocking_len: usize,
}

impl BatchStorage {
    fn new(module: &Module, num_stocks: usize, num_time: usize) -> Self {
        let blocking_len = module.blocking_len();
        let num_blocks = num_blocks(num_stocks, blocking_len);
        let buffers = module
            .buffers()
            .iter()
            .map(|_| BlockedBuffer {
                blocks: (0..num_blocks)
                    .map(|_| RwLock::new(vec![0.0; num_time * blocking_len]))
                    .collect(),
            })
            .collect();

        BatchStorage {
            buffers,
            num_stocks,
            num_blocks,
            num_time,
            blocking_len,
        }
    }

    /// Copy time steps `[offset, offset + num_time)` of a caller input.
    fn load_input<T: Element>(
        &self,
        id: usize,
        arr: &Array<T>,
        layout: Layout,
        dims: InputDims,
        offset: usize,
    ) -> Result<()> {
        let blen = self.blocking_len;
        let data = arr.data();

        for (b, block) in self.buffers[id].blocks.iter().enumerate() {
            let mut block = block.write();
            match layout {
                Layout::TS => {
                    for t in 0..self.num_time {
                        let row = &data[(offset + t) * dims.num_stocks..][..dims.num_stocks];
                        for lane in 0..blen {
                            let s = b * blen + lane;
                            if s < dims.num_stocks {
                                block[t * blen + lane] = row[s].to_f64_lossy();
                            }
                        }
                    }
                }
                Layout::STs => {
                    let src_start = (b * dims.num_time + offset) * blen;
                    let src = &data[src_start..][..self.num_time * blen];
                    for (dst, v) in block.iter_mut().zip(src) {
                        *dst = v.to_f64_lossy();
                    }
                }
                Layout::Stream => {
                    return Err(DbError::shape("Streaming layout in batch input"));
                }
            }
        }
        Ok(())
    }

    /// Copy the last `num_time - offset` time steps of a buffer out.
    fn store_output<T: Element>(
        &self,
        id: usize,
        out: &mut Array<T>,
        layout: Layout,
        offset: usize,
    ) -> Result<()> {
        let blen = self.blocking_len;
        let length = self.num_time - offset;
        let num_stocks = self.num_stocks;
        let data = out.data_mut();

        for (b, block) in self.buffers[id].blocks.iter().enumerate() {
            let block = block.read();
            match layout {
                Layout::TS => {
                    for t in 0..length {
                        for lane in 0..blen {
                            let s = b * blen + lane;
                            if s < num_stocks {
                                data[t * num_stocks + s] =
                                    T::from_f64_lossy(block[(offset + t) * blen + lane]);
                            }
                        }
                    }
                }
                Layout::STs => {
                    let dst = &mut data[b * length * blen..][..length * blen];
                    for (d, v) in dst.iter_mut().zip(&block[offset * blen..]) {
                        *d = T::from_f64_lossy(*v);
                    }
                }
                Layout::Stream => {
                    return Err(DbError::shape("Streaming layout in batch output"));
                }
            }
        }
        Ok(())
    }

    fn run_by_stock(&self, stage: &Stage) -> Result<()> {
        (0..self.num_blocks).into_par_iter().try_for_each(|b| {
            let inputs: Vec<_> = stage
                .inputs
                .iter()
                .map(|&id| self.buffers[id].blocks[b].read())
                .collect();
            let mut outputs: Vec<_> = stage
                .outputs
                .iter()
                .map(|&id| self.buffers[id].blocks[b].write())
                .collect();

            let inputs: Vec<&[f64]> = inputs.iter().map(|g| g.as_slice()).collect();
            let mut outputs: Vec<&mut [f64]> =
                outputs.iter_mut().map(|g| g.as_mut_slice()).collect();
            stage
                .kernel
                .run_stock_block(&inputs, &mut outputs, self.blocking_len, self.num_time)
        })
    }

    fn run_by_time(&self, stage: &Stage) -> Result<()> {
        let blen = self.blocking_len;
        let n = self.num_stocks;
        let mut stepper = stage.kernel.new_stepper(n)?;

        let inputs: Vec<Vec<_>> = stage
            .inputs
            .iter()
            .map(|&id| self.buffers[id].blocks.iter().map(|b| b.read()).collect())
            .collect();
        let mut outputs: Vec<Vec<_>> = stage
            .outputs
            .iter()
            .map(|&id| self.buffers[id].blocks.iter().map(|b| b.write()).collect())
            .collect();

        // Only real stocks take part in a time step, padding lanes are left
        // alone.
        let mut in_cols = vec![vec![0.0; n]; inputs.len()];
        let mut out_cols = vec![vec![0.0; n]; outputs.len()];
        for t in 0..self.num_time {
            for (col, blocks) in in_cols.iter_mut().zip(&inputs) {
                for (s, v) in col.iter_mut().enumerate() {
                    *v = blocks[s / blen][t * blen + s % blen];
                }
            }

            let in_refs: Vec<&[f64]> = in_cols.iter().map(|c| c.as_slice()).collect();
            let mut out_refs: Vec<&mut [f64]> =
                out_cols.iter_mut().map(|c| c.as_mut_slice()).collect();
            stepper.step(&in_refs, &mut out_refs)?;

            for (col, blocks) in out_cols.iter().zip(outputs.iter_mut()) {
                for (s, v) in col.iter().enumerate() {
                    blocks[s / blen][t * blen + s % blen] = *v;
                }
            }
        }

        Ok(())
    }
}

impl StageRunner for BatchStorage {
    fn run_stage(&self, stage: &Stage) -> Result<()> {
        trace!(stage = %stage.name, num_time = self.num_time, "running batch stage");
        match stage.task_kind {
            TaskKind::SliceByStock => self.run_by_stock(stage),
            TaskKind::SliceByTime => self.run_by_time(stage),
        }
    }
}
