//! Memory layouts, element types and dense arrays at the module boundary.
use std::fmt;
use std::str::FromStr;

use factorflow_error::{DbError, Result};
use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Layout of a buffer handed to, or returned from, a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// Time major, `[time, stock]`.
    #[serde(rename = "TS")]
    TS,
    /// Stocks blocked by the blocking length, `[block, time, lane]`.
    #[serde(rename = "STs")]
    STs,
    /// One time step at a time, `[stock]`.
    #[serde(rename = "STREAM")]
    Stream,
}

impl Layout {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TS => "TS",
            Self::STs => "STs",
            Self::Stream => "STREAM",
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Layout {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "TS" => Self::TS,
            "STs" => Self::STs,
            "STREAM" => Self::Stream,
            other => {
                return Err(DbError::new("Unknown layout").with_field("layout", other.to_string()));
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float64,
}

impl DataType {
    /// Width in bytes.
    pub const fn width(&self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

/// Element types buffers can hold.
pub trait Element: Float + Default + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DataType;

    fn to_f64_lossy(self) -> f64;
    fn from_f64_lossy(v: f64) -> Self;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::Float32;

    fn to_f64_lossy(self) -> f64 {
        self as f64
    }

    fn from_f64_lossy(v: f64) -> Self {
        v as f32
    }
}

impl Element for f64 {
    const DTYPE: DataType = DataType::Float64;

    fn to_f64_lossy(self) -> f64 {
        self
    }

    fn from_f64_lossy(v: f64) -> Self {
        v
    }
}

/// Number of stock blocks needed to hold `num_stocks` stocks.
pub const fn num_blocks(num_stocks: usize, blocking_len: usize) -> usize {
    num_stocks.div_ceil(blocking_len)
}

/// Dense row-major array.
#[derive(Debug, Clone, PartialEq)]
pub struct Array<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T: Element> Array<T> {
    pub fn try_new(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        let len: usize = shape.iter().product();
        if len != data.len() {
            return Err(DbError::shape("Array data doesn't match shape")
                .with_field("shape", shape)
                .with_field("data_len", data.len()));
        }
        Ok(Array { shape, data })
    }

    pub fn filled(shape: Vec<usize>, value: T) -> Self {
        let len = shape.iter().product();
        Array {
            shape,
            data: vec![value; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Get a value at a multi-dimensional index.
    pub fn get(&self, idx: &[usize]) -> Option<T> {
        if idx.len() != self.shape.len() {
            return None;
        }
        let mut offset = 0;
        for (&i, &dim) in idx.iter().zip(&self.shape) {
            if i >= dim {
                return None;
            }
            offset = offset * dim + i;
        }
        self.data.get(offset).copied()
    }
}

/// Convert a `[time, stock]` array into `[block, time, lane]`.
///
/// The stock axis is padded with zeros up to a multiple of `blocking_len`.
pub fn ts_to_sts<T: Element>(arr: &Array<T>, blocking_len: usize) -> Result<Array<T>> {
    let (num_time, num_stocks) = match arr.shape() {
        [t, s] => (*t, *s),
        other => {
            return Err(DbError::shape("Expected a two dimensional TS array")
                .with_field("shape", other.to_vec()));
        }
    };
    if blocking_len == 0 {
        return Err(DbError::shape("Blocking length must be non-zero"));
    }

    let blocks = num_blocks(num_stocks, blocking_len);
    let mut out = vec![T::zero(); blocks * num_time * blocking_len];
    for t in 0..num_time {
        for s in 0..num_stocks {
            let (block, lane) = (s / blocking_len, s % blocking_len);
            out[(block * num_time + t) * blocking_len + lane] = arr.data[t * num_stocks + s];
        }
    }

    Array::try_new(vec![blocks, num_time, blocking_len], out)
}

/// Convert a `[block, time, lane]` array back into `[time, stock]`, dropping
/// padded lanes beyond `num_stocks`.
pub fn sts_to_ts<T: Element>(arr: &Array<T>, num_stocks: usize) -> Result<Array<T>> {
    let (blocks, num_time, blocking_len) = match arr.shape() {
        [b, t, l] => (*b, *t, *l),
        other => {
            return Err(DbError::shape("Expected a three dimensional STs array")
                .with_field("shape", other.to_vec()));
        }
    };
    if num_stocks > blocks * blocking_len {
        return Err(DbError::shape("Too many stocks for blocked array")
            .with_field("num_stocks", num_stocks)
            .with_field("capacity", blocks * blocking_len));
    }

    let mut out = Vec::with_capacity(num_time * num_stocks);
    for t in 0..num_time {
        for s in 0..num_stocks {
            let (block, lane) = (s / blocking_len, s % blocking_len);
            out.push(arr.data[(block * num_time + t) * blocking_len + lane]);
        }
    }

    Array::try_new(vec![num_time, num_stocks], out)
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn random_ts(num_time: usize, num_stocks: usize) -> Array<f32> {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let data = (0..num_time * num_stocks)
            .map(|_| rng.random_range(0.5..100.0))
            .collect();
        Array::try_new(vec![num_time, num_stocks], data).unwrap()
    }

    #[test]
    fn round_trip_aligned() {
        let ts = random_ts(12, 16);
        let sts = ts_to_sts(&ts, 8).unwrap();
        assert_eq!(&[2, 12, 8], sts.shape());
        assert_eq!(ts, sts_to_ts(&sts, 16).unwrap());
    }

    #[test]
    fn round_trip_unaligned_pads_zero() {
        let ts = random_ts(5, 13);
        let sts = ts_to_sts(&ts, 8).unwrap();
        assert_eq!(&[2, 5, 8], sts.shape());

        // Stocks 13..16 live in the padded lanes of the second block.
        for t in 0..5 {
            for lane in 5..8 {
                assert_eq!(Some(0.0), sts.get(&[1, t, lane]));
            }
        }
        assert_eq!(ts.get(&[3, 9]), sts.get(&[1, 3, 1]));
        assert_eq!(ts, sts_to_ts(&sts, 13).unwrap());
    }

    #[test]
    fn wrong_dims() {
        let arr = Array::<f64>::filled(vec![4], 0.0);
        ts_to_sts(&arr, 8).unwrap_err();
        sts_to_ts(&arr, 4).unwrap_err();
    }

    #[test]
    fn layout_strings() {
        for layout in [Layout::TS, Layout::STs, Layout::Stream] {
            assert_eq!(layout, layout.as_str().parse().unwrap());
        }
        "ST".parse::<Layout>().unwrap_err();
    }
}
