use std::collections::VecDeque;
use std::sync::Arc;

use factorflow_error::{DbError, Result};
use tracing::trace;

use super::{KernelGenerator, KernelRequest, KernelStepper, StageKernel};
use crate::ir::{CrossSectionalOp, Function, Op};

/// Generates kernels that walk the stage's operators directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterpretedKernelGenerator;

impl KernelGenerator for InterpretedKernelGenerator {
    fn generate(&self, req: &KernelRequest) -> Result<Arc<dyn StageKernel>> {
        let program = Program::try_new(req.func.clone())?;
        if program.input_slots.iter().flatten().count() != req.input_buffers.len()
            || program.num_outputs != req.output_buffers.len()
        {
            return Err(DbError::compile("Stage buffers don't match function I/O")
                .with_field("function", req.func.name.clone()));
        }
        trace!(function = %req.func.name, "generated interpreted kernel");
        Ok(Arc::new(InterpretedKernel {
            program: Arc::new(program),
        }))
    }
}

#[derive(Debug)]
struct Program {
    func: Function,
    /// Input slot for each Input operator.
    input_slots: Vec<Option<usize>>,
    /// Output slot for each Output operator.
    output_slots: Vec<Option<usize>>,
    num_outputs: usize,
    /// Number of columns of history kept per operator when stepping.
    history: Vec<usize>,
    cross_sectional: bool,
}

impl Program {
    fn try_new(func: Function) -> Result<Self> {
        let ops = func.ops();
        let mut input_slots = vec![None; ops.len()];
        let mut output_slots = vec![None; ops.len()];
        let mut history = vec![0; ops.len()];
        let (mut num_inputs, mut num_outputs) = (0, 0);

        for (idx, op) in ops.iter().enumerate() {
            match op {
                Op::Input { .. } => {
                    input_slots[idx] = Some(num_inputs);
                    num_inputs += 1;
                }
                Op::Output { .. } => {
                    output_slots[idx] = Some(num_outputs);
                    num_outputs += 1;
                }
                _ => (),
            }
            for operand in op.operands() {
                history[operand] = history[operand].max(op.history_needed());
            }
        }

        let cross_sectional = ops.iter().any(|op| op.is_cross_sectional());

        Ok(Program {
            func,
            input_slots,
            output_slots,
            num_outputs,
            history,
            cross_sectional,
        })
    }
}

#[derive(Debug)]
pub struct InterpretedKernel {
    program: Arc<Program>,
}

impl StageKernel for InterpretedKernel {
    fn run_stock_block(
        &self,
        inputs: &[&[f64]],
        outputs: &mut [&mut [f64]],
        lanes: usize,
        num_time: usize,
    ) -> Result<()> {
        let program = &self.program;
        if program.cross_sectional {
            return Err(
                DbError::execution("Cross-sectional stage cannot be sliced by stock")
                    .with_field("function", program.func.name.clone()),
            );
        }

        let len = lanes * num_time;
        let ops = program.func.ops();
        let mut values: Vec<Vec<f64>> = Vec::with_capacity(ops.len());

        for (idx, op) in ops.iter().enumerate() {
            let vals = match op {
                Op::Input { name } => {
                    let slot = program.input_slots[idx].unwrap_or_default();
                    let input = inputs.get(slot).ok_or_else(|| {
                        DbError::execution("Missing kernel input").with_field("input", name.clone())
                    })?;
                    check_len(name, input.len(), len)?;
                    input.to_vec()
                }
                Op::Output { name, input } => {
                    let slot = program.output_slots[idx].unwrap_or_default();
                    let output = outputs.get_mut(slot).ok_or_else(|| {
                        DbError::execution("Missing kernel output")
                            .with_field("output", name.clone())
                    })?;
                    check_len(name, output.len(), len)?;
                    output.copy_from_slice(&values[*input]);
                    Vec::new()
                }
                Op::Constant(v) => vec![*v; len],
                Op::Unary { op, input } => values[*input].iter().map(|v| op.apply(*v)).collect(),
                Op::Binary { op, lhs, rhs } => values[*lhs]
                    .iter()
                    .zip(&values[*rhs])
                    .map(|(a, b)| op.apply(*a, *b))
                    .collect(),
                Op::Rolling { op, input, window } => {
                    let x = &values[*input];
                    let w = *window;
                    let mut out = vec![f64::NAN; len];
                    for t in (w - 1)..num_time {
                        for lane in 0..lanes {
                            let window_vals = (t + 1 - w..=t).map(|k| x[k * lanes + lane]);
                            out[t * lanes + lane] = op.reduce(window_vals, w);
                        }
                    }
                    out
                }
                Op::BackRef { input, window } => {
                    let x = &values[*input];
                    let shift = window * lanes;
                    let mut out = vec![f64::NAN; len];
                    if shift < len {
                        out[shift..].copy_from_slice(&x[..len - shift]);
                    }
                    out
                }
                Op::CrossSectional { .. } => {
                    // Checked above.
                    return Err(DbError::execution("Unexpected cross-sectional operator"));
                }
            };
            values.push(vals);
        }

        Ok(())
    }

    fn new_stepper(&self, num_stocks: usize) -> Result<Box<dyn KernelStepper>> {
        let history = (0..self.program.func.len())
            .map(|idx| VecDeque::with_capacity(self.program.history[idx]))
            .collect();
        Ok(Box::new(InterpretedStepper {
            program: self.program.clone(),
            num_stocks,
            history,
        }))
    }
}

#[derive(Debug)]
struct InterpretedStepper {
    program: Arc<Program>,
    num_stocks: usize,
    /// Most recent columns per operator, oldest first.
    history: Vec<VecDeque<Vec<f64>>>,
}

impl KernelStepper for InterpretedStepper {
    fn step(&mut self, inputs: &[&[f64]], outputs: &mut [&mut [f64]]) -> Result<()> {
        let program = &self.program;
        let n = self.num_stocks;

        for (idx, op) in program.func.ops().iter().enumerate() {
            let cap = program.history[idx];
            // Reuse the allocation of the column falling out of the window.
            let mut col = if cap > 0 && self.history[idx].len() >= cap {
                self.history[idx].pop_front().unwrap_or_default()
            } else {
                Vec::with_capacity(n)
            };
            col.clear();

            match op {
                Op::Input { name } => {
                    let slot = program.input_slots[idx].unwrap_or_default();
                    let input = inputs.get(slot).ok_or_else(|| {
                        DbError::execution("Missing kernel input").with_field("input", name.clone())
                    })?;
                    check_len(name, input.len(), n)?;
                    col.extend_from_slice(input);
                }
                Op::Output { name, input } => {
                    let slot = program.output_slots[idx].unwrap_or_default();
                    let output = outputs.get_mut(slot).ok_or_else(|| {
                        DbError::execution("Missing kernel output")
                            .with_field("output", name.clone())
                    })?;
                    check_len(name, output.len(), n)?;
                    output.copy_from_slice(latest(&self.history, *input)?);
                    continue;
                }
                Op::Constant(v) => col.resize(n, *v),
                Op::Unary { op, input } => {
                    col.extend(latest(&self.history, *input)?.iter().map(|v| op.apply(*v)))
                }
                Op::Binary { op, lhs, rhs } => {
                    let a = latest(&self.history, *lhs)?;
                    let b = latest(&self.history, *rhs)?;
                    col.extend(a.iter().zip(b).map(|(a, b)| op.apply(*a, *b)));
                }
                Op::Rolling { op, input, window } => {
                    let hist = &self.history[*input];
                    if hist.len() < *window {
                        col.resize(n, f64::NAN);
                    } else {
                        let skip = hist.len() - window;
                        for s in 0..n {
                            let window_vals = hist.iter().skip(skip).map(|c| c[s]);
                            col.push(op.reduce(window_vals, *window));
                        }
                    }
                }
                Op::BackRef { input, window } => {
                    let hist = &self.history[*input];
                    if hist.len() <= *window {
                        col.resize(n, f64::NAN);
                    } else {
                        col.extend_from_slice(&hist[hist.len() - 1 - window]);
                    }
                }
                Op::CrossSectional { op, input } => {
                    let x = latest(&self.history, *input)?;
                    col.resize(n, f64::NAN);
                    match op {
                        CrossSectionalOp::Rank => rank_column(x, &mut col),
                        CrossSectionalOp::Scale => scale_column(x, &mut col),
                    }
                }
            }

            if cap > 0 {
                self.history[idx].push_back(col);
            }
        }

        Ok(())
    }
}

fn latest(history: &[VecDeque<Vec<f64>>], operand: usize) -> Result<&[f64]> {
    history[operand]
        .back()
        .map(|c| c.as_slice())
        .ok_or_else(|| DbError::execution("Operand has no value for this step"))
}

fn check_len(name: &str, have: usize, want: usize) -> Result<()> {
    if have != want {
        return Err(DbError::execution("Kernel buffer has unexpected length")
            .with_field("buffer", name.to_string())
            .with_field("have", have)
            .with_field("want", want));
    }
    Ok(())
}

/// 0-indexed ascending rank, ties get the average of their positions. NaNs
/// are left out of the ranking and stay NaN.
pub fn rank_column(x: &[f64], out: &mut [f64]) {
    let mut sorted: Vec<f64> = x.iter().copied().filter(|v| !v.is_nan()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    for (v, o) in x.iter().zip(out.iter_mut()) {
        if v.is_nan() {
            *o = f64::NAN;
            continue;
        }
        let less = sorted.partition_point(|u| u < v);
        let less_eq = sorted.partition_point(|u| u <= v);
        *o = less as f64 + (less_eq - less - 1) as f64 / 2.0;
    }
}

/// `x / sum(|x|)`, ignoring NaNs in the sum.
pub fn scale_column(x: &[f64], out: &mut [f64]) {
    let sum: f64 = x.iter().filter(|v| !v.is_nan()).map(|v| v.abs()).sum();
    for (v, o) in x.iter().zip(out.iter_mut()) {
        *o = v / sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferRegistry;
    use crate::config::CompilerConfig;
    use crate::ir::FunctionBuilder;

    fn generate(func: &Function) -> Arc<dyn StageKernel> {
        let inputs: Vec<usize> = (0..func.input_names().count()).collect();
        let outputs: Vec<usize> = (0..func.output_names().count()).collect();
        let registry = BufferRegistry::new();
        let config = CompilerConfig::default();
        InterpretedKernelGenerator
            .generate(&KernelRequest {
                func,
                input_buffers: &inputs,
                output_buffers: &outputs,
                registry: &registry,
                config: &config,
            })
            .unwrap()
    }

    fn avg3() -> Function {
        let mut b = FunctionBuilder::new();
        let a = b.input("a");
        let s = b.windowed_avg(a, 3);
        b.output(s, "avg");
        b.build("avg3").unwrap()
    }

    #[test]
    fn rank_ties_and_nan() {
        let x = [0.1, -0.1, 0.2, 0.0];
        let mut out = [0.0; 4];
        rank_column(&x, &mut out);
        assert_eq!([2.0, 0.0, 3.0, 1.0], out);

        let x = [1.0, f64::NAN, 1.0, 0.5];
        rank_column(&x, &mut out);
        assert_eq!(1.5, out[0]);
        assert!(out[1].is_nan());
        assert_eq!(1.5, out[2]);
        assert_eq!(0.0, out[3]);
    }

    #[test]
    fn scale_sums_to_one() {
        let x = [1.0, -3.0, 4.0];
        let mut out = [0.0; 3];
        scale_column(&x, &mut out);
        assert_eq!([0.125, -0.375, 0.5], out);
    }

    #[test]
    fn block_rolling_avg() {
        let kernel = generate(&avg3());
        // Two lanes, four steps, `[time][lane]`.
        let input = [1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0];
        let mut output = [0.0; 8];
        kernel
            .run_stock_block(&[&input], &mut [&mut output], 2, 4)
            .unwrap();

        assert!(output[..4].iter().all(|v| v.is_nan()));
        assert_eq!([2.0, 20.0, 3.0, 30.0], output[4..]);
    }

    #[test]
    fn stepper_matches_block() {
        let kernel = generate(&avg3());
        let input = [1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0];
        let mut block_out = [0.0; 8];
        kernel
            .run_stock_block(&[&input], &mut [&mut block_out], 2, 4)
            .unwrap();

        let mut stepper = kernel.new_stepper(2).unwrap();
        for t in 0..4 {
            let mut out = [0.0; 2];
            stepper
                .step(&[&input[t * 2..t * 2 + 2]], &mut [&mut out])
                .unwrap();
            for lane in 0..2 {
                let want = block_out[t * 2 + lane];
                assert!(want.is_nan() && out[lane].is_nan() || want == out[lane]);
            }
        }
    }

    #[test]
    fn stepper_back_ref() {
        let mut b = FunctionBuilder::new();
        let a = b.input("a");
        let r = b.back_ref(a, 2);
        b.output(r, "lag");
        let kernel = generate(&b.build("lag").unwrap());

        let mut stepper = kernel.new_stepper(1).unwrap();
        let mut seen = Vec::new();
        for t in 0..5 {
            let mut out = [0.0];
            stepper.step(&[&[t as f64]], &mut [&mut out]).unwrap();
            seen.push(out[0]);
        }
        assert!(seen[0].is_nan() && seen[1].is_nan());
        assert_eq!([0.0, 1.0, 2.0], seen[2..]);
    }

    #[test]
    fn cross_sectional_rejects_stock_slicing() {
        let mut b = FunctionBuilder::new();
        let a = b.input("a");
        let r = b.rank(a);
        b.output(r, "r");
        let kernel = generate(&b.build("rank").unwrap());

        let input = [1.0, 2.0];
        let mut output = [0.0; 2];
        kernel
            .run_stock_block(&[&input], &mut [&mut output], 2, 1)
            .unwrap_err();
    }

    #[test]
    fn wrong_input_length() {
        let kernel = generate(&avg3());
        let mut stepper = kernel.new_stepper(3).unwrap();
        let mut out = [0.0; 3];
        stepper.step(&[&[1.0, 2.0]], &mut [&mut out]).unwrap_err();
    }
}
