use std::collections::HashSet;
use std::fmt;

use factorflow_error::{DbError, Result};

use super::op::{BinaryOp, CrossSectionalOp, Op, OpRef, RollingOp, UnaryOp};

/// An ordered list of operators.
///
/// Operands always reference earlier operators, so the operator order is a
/// valid topological order of the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    ops: Vec<Op>,
}

impl Function {
    /// Create a function, validating that it's well formed.
    pub fn try_new(name: impl Into<String>, ops: Vec<Op>) -> Result<Self> {
        let func = Function {
            name: name.into(),
            ops,
        };
        func.validate()?;
        Ok(func)
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn op(&self, idx: OpRef) -> &Op {
        &self.ops[idx]
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn ops_mut(&mut self) -> &mut Vec<Op> {
        &mut self.ops
    }

    /// Check operand references and input/output naming.
    pub fn validate(&self) -> Result<()> {
        let mut input_names = HashSet::new();
        let mut output_names = HashSet::new();

        for (idx, op) in self.ops.iter().enumerate() {
            for operand in op.operands() {
                if operand >= idx {
                    return Err(DbError::compile("Operator references an unresolved operator")
                        .with_field("function", self.name.clone())
                        .with_field("op", idx)
                        .with_field("operand", operand));
                }
                if matches!(self.ops[operand], Op::Output { .. }) {
                    return Err(DbError::compile("Operator cannot read from an Output")
                        .with_field("function", self.name.clone())
                        .with_field("op", idx));
                }
            }

            match op {
                Op::Input { name } => {
                    if !input_names.insert(name.as_str()) {
                        return Err(DbError::compile("Duplicate input name")
                            .with_field("name", name.clone()));
                    }
                }
                Op::Output { name, .. } => {
                    if !output_names.insert(name.as_str()) {
                        return Err(DbError::compile("Duplicate output name")
                            .with_field("name", name.clone()));
                    }
                }
                Op::Rolling { window, .. } | Op::BackRef { window, .. } if *window == 0 => {
                    return Err(
                        DbError::compile("Window must be at least one").with_field("op", idx)
                    );
                }
                _ => (),
            }
        }

        if let Some(name) = input_names.intersection(&output_names).next() {
            return Err(DbError::compile("Name used as both an input and an output")
                .with_field("name", name.to_string()));
        }

        Ok(())
    }

    /// Consumers of each operator, in operator order.
    pub fn uses(&self) -> Vec<Vec<OpRef>> {
        let mut uses = vec![Vec::new(); self.ops.len()];
        for (idx, op) in self.ops.iter().enumerate() {
            for operand in op.operands() {
                uses[operand].push(idx);
            }
        }
        uses
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.ops.iter().filter_map(|op| match op {
            Op::Input { name } => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.ops.iter().filter_map(|op| match op {
            Op::Output { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Number of leading time steps each operator produces values that aren't
    /// backed by enough history.
    pub fn unreliable_counts(&self) -> Vec<usize> {
        let mut counts: Vec<usize> = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let operands = op
                .operands()
                .into_iter()
                .map(|o| counts[o])
                .max()
                .unwrap_or(0);
            let count = match op {
                Op::Rolling { window, .. } => operands + window - 1,
                Op::BackRef { window, .. } => operands + window,
                _ => operands,
            };
            counts.push(count);
        }
        counts
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "function {} {{", self.name)?;
        for (idx, op) in self.ops.iter().enumerate() {
            writeln!(f, "  %{idx} = {op}")?;
        }
        write!(f, "}}")
    }
}

/// Fluent construction of a [`Function`].
#[derive(Debug, Default)]
pub struct FunctionBuilder {
    ops: Vec<Op>,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Op) -> OpRef {
        self.ops.push(op);
        self.ops.len() - 1
    }

    pub fn input(&mut self, name: impl Into<String>) -> OpRef {
        self.push(Op::Input { name: name.into() })
    }

    pub fn output(&mut self, input: OpRef, name: impl Into<String>) -> OpRef {
        self.push(Op::Output {
            name: name.into(),
            input,
        })
    }

    pub fn constant(&mut self, v: f64) -> OpRef {
        self.push(Op::Constant(v))
    }

    pub fn unary(&mut self, op: UnaryOp, input: OpRef) -> OpRef {
        self.push(Op::Unary { op, input })
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: OpRef, rhs: OpRef) -> OpRef {
        self.push(Op::Binary { op, lhs, rhs })
    }

    pub fn add(&mut self, lhs: OpRef, rhs: OpRef) -> OpRef {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: OpRef, rhs: OpRef) -> OpRef {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: OpRef, rhs: OpRef) -> OpRef {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: OpRef, rhs: OpRef) -> OpRef {
        self.binary(BinaryOp::Div, lhs, rhs)
    }

    pub fn rolling(&mut self, op: RollingOp, input: OpRef, window: usize) -> OpRef {
        self.push(Op::Rolling { op, input, window })
    }

    pub fn windowed_sum(&mut self, input: OpRef, window: usize) -> OpRef {
        self.rolling(RollingOp::Sum, input, window)
    }

    pub fn windowed_avg(&mut self, input: OpRef, window: usize) -> OpRef {
        self.rolling(RollingOp::Avg, input, window)
    }

    pub fn back_ref(&mut self, input: OpRef, window: usize) -> OpRef {
        self.push(Op::BackRef { input, window })
    }

    pub fn rank(&mut self, input: OpRef) -> OpRef {
        self.push(Op::CrossSectional {
            op: CrossSectionalOp::Rank,
            input,
        })
    }

    pub fn scale(&mut self, input: OpRef) -> OpRef {
        self.push(Op::CrossSectional {
            op: CrossSectionalOp::Scale,
            input,
        })
    }

    pub fn build(self, name: impl Into<String>) -> Result<Function> {
        Function::try_new(name, self.ops)
    }
}
