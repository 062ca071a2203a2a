//! Compiling factor expressions into dependency scheduled stage graphs.
//!
//! A [`ir::Function`] is optimized, split into partitions, and each
//! partition becomes a [`stage::Stage`] reading and writing named buffers.
//! The result is an immutable [`module::Module`] that runtimes execute.
pub mod buffer;
pub mod compiler;
pub mod config;
pub mod ir;
pub mod kernel;
pub mod layout;
pub mod module;
pub mod optimizer;
pub mod partition;
pub mod stage;
