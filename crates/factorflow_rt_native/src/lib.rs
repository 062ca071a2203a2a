//! Native runtime executing compiled modules on a thread pool.
pub mod batch;
pub mod executor;
pub mod profile;
pub mod scheduler;
pub mod stream;

pub use batch::{RunOptions, run_graph};
pub use executor::NativeExecutor;
pub use profile::{ExecutionProfile, StageProfile};
pub use stream::{BufferHandle, StreamContext};
