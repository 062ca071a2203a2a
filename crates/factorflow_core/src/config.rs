use factorflow_error::{DbError, Result, ResultExt};
use serde::{Deserialize, Serialize};

use crate::layout::{DataType, Layout};

pub const DEFAULT_BLOCKING_LEN: usize = 8;
pub const DEFAULT_PARTITION_FACTOR: usize = 32;

/// Configuration for compiling a function into a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerConfig {
    /// Number of stocks processed together by a generated kernel. Batch
    /// buffers in blocked layout are padded to a multiple of this.
    pub blocking_len: usize,
    pub input_layout: Layout,
    pub output_layout: Layout,
    pub dtype: DataType,
    /// Maximum number of compute operators fused into one stock-sliced
    /// partition.
    pub partition_factor: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            blocking_len: DEFAULT_BLOCKING_LEN,
            input_layout: Layout::STs,
            output_layout: Layout::STs,
            dtype: DataType::Float32,
            partition_factor: DEFAULT_PARTITION_FACTOR,
        }
    }
}

impl CompilerConfig {
    /// Config for a module driven tick by tick.
    pub fn streaming() -> Self {
        CompilerConfig {
            input_layout: Layout::Stream,
            output_layout: Layout::Stream,
            ..Default::default()
        }
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let conf: CompilerConfig =
            serde_json::from_str(s).context("Failed to parse compiler config")?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        if self.blocking_len == 0 {
            return Err(DbError::compile("Blocking length must be non-zero"));
        }
        if self.partition_factor == 0 {
            return Err(DbError::compile("Partition factor must be non-zero"));
        }
        let input_stream = self.input_layout == Layout::Stream;
        let output_stream = self.output_layout == Layout::Stream;
        if input_stream != output_stream {
            return Err(
                DbError::compile("Streaming layout must be used for both inputs and outputs")
                    .with_field("input_layout", self.input_layout)
                    .with_field("output_layout", self.output_layout),
            );
        }
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.output_layout == Layout::Stream
    }
}
