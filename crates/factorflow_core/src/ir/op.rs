use std::fmt;

/// Index of an operator inside a [`Function`](super::Function).
pub type OpRef = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Log,
    Sign,
}

impl UnaryOp {
    pub fn apply(self, v: f64) -> f64 {
        match self {
            Self::Neg => -v,
            Self::Abs => v.abs(),
            Self::Log => v.ln(),
            Self::Sign => {
                if v.is_nan() {
                    f64::NAN
                } else if v > 0.0 {
                    1.0
                } else if v < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

impl BinaryOp {
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            // f64::max ignores NaN, we want it to propagate.
            Self::Max => {
                if a.is_nan() || b.is_nan() {
                    f64::NAN
                } else {
                    a.max(b)
                }
            }
            Self::Min => {
                if a.is_nan() || b.is_nan() {
                    f64::NAN
                } else {
                    a.min(b)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollingOp {
    Sum,
    Avg,
    Max,
    Min,
}

impl RollingOp {
    /// Reduce a full window of values, oldest first.
    ///
    /// Both the series and the step evaluators go through this so that they
    /// produce identical results.
    pub fn reduce(self, window: impl Iterator<Item = f64>, len: usize) -> f64 {
        match self {
            Self::Sum => window.fold(0.0, |acc, v| acc + v),
            Self::Avg => window.fold(0.0, |acc, v| acc + v) / len as f64,
            Self::Max => window.fold(f64::NEG_INFINITY, |acc, v| BinaryOp::Max.apply(acc, v)),
            Self::Min => window.fold(f64::INFINITY, |acc, v| BinaryOp::Min.apply(acc, v)),
        }
    }
}

/// Operators that need every entity at a time step at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrossSectionalOp {
    /// 0-indexed ascending rank, ties share the average position.
    Rank,
    /// `x / sum(|x|)`.
    Scale,
}

/// How an operator is allowed to be parallelized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Io,
    Elementwise,
    /// Reads the operand's own history, sequential in time per entity.
    Rolling,
    /// Reads all entities at a time step.
    CrossSectional,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Input {
        name: String,
    },
    Output {
        name: String,
        input: OpRef,
    },
    Constant(f64),
    Unary {
        op: UnaryOp,
        input: OpRef,
    },
    Binary {
        op: BinaryOp,
        lhs: OpRef,
        rhs: OpRef,
    },
    Rolling {
        op: RollingOp,
        input: OpRef,
        window: usize,
    },
    /// Value of the operand `window` steps in the past.
    BackRef {
        input: OpRef,
        window: usize,
    },
    CrossSectional {
        op: CrossSectionalOp,
        input: OpRef,
    },
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Input { .. } | Op::Output { .. } => OpKind::Io,
            Op::Constant(_) | Op::Unary { .. } | Op::Binary { .. } => OpKind::Elementwise,
            Op::Rolling { .. } | Op::BackRef { .. } => OpKind::Rolling,
            Op::CrossSectional { .. } => OpKind::CrossSectional,
        }
    }

    pub fn is_cross_sectional(&self) -> bool {
        self.kind() == OpKind::CrossSectional
    }

    /// Operands of this operator, in order.
    pub fn operands(&self) -> Vec<OpRef> {
        match self {
            Op::Input { .. } | Op::Constant(_) => Vec::new(),
            Op::Output { input, .. }
            | Op::Unary { input, .. }
            | Op::Rolling { input, .. }
            | Op::BackRef { input, .. }
            | Op::CrossSectional { input, .. } => vec![*input],
            Op::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
        }
    }

    /// Rewrite operands through `f`.
    pub fn map_operands(&self, mut f: impl FnMut(OpRef) -> OpRef) -> Op {
        match self {
            Op::Input { name } => Op::Input { name: name.clone() },
            Op::Constant(v) => Op::Constant(*v),
            Op::Output { name, input } => Op::Output {
                name: name.clone(),
                input: f(*input),
            },
            Op::Unary { op, input } => Op::Unary {
                op: *op,
                input: f(*input),
            },
            Op::Binary { op, lhs, rhs } => Op::Binary {
                op: *op,
                lhs: f(*lhs),
                rhs: f(*rhs),
            },
            Op::Rolling { op, input, window } => Op::Rolling {
                op: *op,
                input: f(*input),
                window: *window,
            },
            Op::BackRef { input, window } => Op::BackRef {
                input: f(*input),
                window: *window,
            },
            Op::CrossSectional { op, input } => Op::CrossSectional {
                op: *op,
                input: f(*input),
            },
        }
    }

    /// Number of past steps of the operand this operator reads, including
    /// the current one.
    pub fn history_needed(&self) -> usize {
        match self {
            Op::Rolling { window, .. } => *window,
            Op::BackRef { window, .. } => *window + 1,
            _ => 1,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Input { name } => write!(f, "Input({name})"),
            Op::Output { name, input } => write!(f, "Output({name}, %{input})"),
            Op::Constant(v) => write!(f, "Constant({v})"),
            Op::Unary { op, input } => write!(f, "{op:?}(%{input})"),
            Op::Binary { op, lhs, rhs } => write!(f, "{op:?}(%{lhs}, %{rhs})"),
            Op::Rolling { op, input, window } => write!(f, "Windowed{op:?}(%{input}, {window})"),
            Op::BackRef { input, window } => write!(f, "BackRef(%{input}, {window})"),
            Op::CrossSectional { op, input } => write!(f, "{op:?}(%{input})"),
        }
    }
}
