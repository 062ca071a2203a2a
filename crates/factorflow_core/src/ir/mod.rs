//! Operator graph representation.
pub mod function;
pub mod op;

pub use function::{Function, FunctionBuilder};
pub use op::{BinaryOp, CrossSectionalOp, Op, OpKind, OpRef, RollingOp, UnaryOp};
