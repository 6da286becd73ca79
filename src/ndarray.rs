//! Typed multidimensional views over a [`SharedMemoryRegion`].

use crate::error::{CodecError, ShmError};
use crate::shm::SharedMemoryRegion;
use crate::value::NDArrayRef;

/// A typed, row-major view over a shared-memory region: dtype (e.g.
/// `int8`, `uint16`, `float32`, `float64`) plus shape.
///
/// Invariant: `ceil(product(shape) * bytes_per_element(dtype)) <=
/// shm.rsize()`, enforced by [`NDArray::new`] and [`NDArray::wrap`].
#[derive(Debug)]
pub struct NDArray {
    dtype: String,
    shape: Vec<usize>,
    shm: SharedMemoryRegion,
}

/// Numeric element kinds this crate knows how to interpret directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl ElementType {
    pub fn parse(dtype: &str) -> Result<Self, CodecError> {
        Ok(match dtype {
            "int8" => ElementType::Int8,
            "uint8" => ElementType::Uint8,
            "int16" => ElementType::Int16,
            "uint16" => ElementType::Uint16,
            "int32" => ElementType::Int32,
            "uint32" => ElementType::Uint32,
            "int64" => ElementType::Int64,
            "uint64" => ElementType::Uint64,
            "float32" => ElementType::Float32,
            "float64" => ElementType::Float64,
            other => return Err(CodecError::InvalidDtype(other.to_string())),
        })
    }

    pub fn bytes_per_element(self) -> usize {
        match self {
            ElementType::Int8 | ElementType::Uint8 => 1,
            ElementType::Int16 | ElementType::Uint16 => 2,
            ElementType::Int32 | ElementType::Uint32 | ElementType::Float32 => 4,
            ElementType::Int64 | ElementType::Uint64 | ElementType::Float64 => 8,
        }
    }
}

/// Bytes per element for a dtype name. Dtype names are always
/// `<kind><bit-width>`, e.g. `uint16` -> 2 bytes.
pub fn bytes_per_element(dtype: &str) -> Result<usize, CodecError> {
    Ok(ElementType::parse(dtype)?.bytes_per_element())
}

fn required_bytes(shape: &[usize], dtype: &str) -> Result<usize, CodecError> {
    let per_element = bytes_per_element(dtype)?;
    let count: usize = shape.iter().product();
    Ok(count * per_element)
}

impl NDArray {
    /// Allocate a fresh shared-memory region sized to hold `shape` elements
    /// of `dtype`, and wrap it.
    pub fn new(dtype: impl Into<String>, shape: Vec<usize>) -> Result<Self, NDArrayError> {
        let dtype = dtype.into();
        let needed = required_bytes(&shape, &dtype)?;
        let shm = SharedMemoryRegion::create(needed)?;
        Ok(Self { dtype, shape, shm })
    }

    /// Wrap a caller-supplied shared-memory region, validating the size
    /// invariant.
    pub fn wrap(
        dtype: impl Into<String>,
        shape: Vec<usize>,
        shm: SharedMemoryRegion,
    ) -> Result<Self, NDArrayError> {
        let dtype = dtype.into();
        let needed = required_bytes(&shape, &dtype)?;
        if needed > shm.rsize() {
            return Err(NDArrayError::TooSmall {
                needed,
                rsize: shm.rsize(),
            });
        }
        Ok(Self { dtype, shape, shm })
    }

    pub fn dtype(&self) -> &str {
        &self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn shm(&self) -> &SharedMemoryRegion {
        &self.shm
    }

    pub fn shm_mut(&mut self) -> &mut SharedMemoryRegion {
        &mut self.shm
    }

    pub fn element_type(&self) -> ElementType {
        ElementType::parse(&self.dtype).expect("dtype validated at construction")
    }

    /// Sum of all bytes in the region's logical (`rsize`) extent, used by
    /// the reference test scenarios as a cheap content fingerprint.
    pub fn byte_sum(&self) -> u64 {
        self.shm.buffer()[..self.shm.rsize()]
            .iter()
            .map(|&b| b as u64)
            .sum()
    }

    /// The wire-shaped reference to this array.
    pub fn as_ref_handle(&self) -> NDArrayRef {
        NDArrayRef {
            dtype: self.dtype.clone(),
            shape: self.shape.clone(),
            shm: self.shm.as_ref_handle(),
        }
    }

    /// Reconstruct an `NDArray` from its wire reference by attaching the
    /// named shared-memory region.
    pub fn from_ref(r: &NDArrayRef) -> Result<Self, NDArrayError> {
        let shm = SharedMemoryRegion::attach(&r.shm.name, r.shm.rsize)?;
        Self::wrap(r.dtype.clone(), r.shape.clone(), shm)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NDArrayError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error("region of {rsize} bytes is too small to hold {needed} bytes")]
    TooSmall { needed: usize, rsize: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsize_covers_requested_shape() {
        let arr = NDArray::new("uint16", vec![2, 20, 25]).expect("alloc");
        let expected = 2 * 20 * 25 * 2;
        assert_eq!(arr.shm().rsize(), expected);
        assert!(arr.shm().rsize() <= arr.shm().size());
    }

    #[test]
    fn byte_sum_matches_manual_pokes() {
        let mut arr = NDArray::new("uint16", vec![2, 20, 25]).expect("alloc");
        {
            let buf = arr.shm_mut().buffer_mut();
            buf[0] = 123;
            buf[456] = 78;
            buf[1999] = 210;
        }
        assert_eq!(arr.byte_sum(), 123 + 78 + 210);
        assert_eq!(arr.dtype(), "uint16");
        assert_eq!(arr.shape(), &[2, 20, 25]);
        assert_eq!(arr.shm().rsize(), 2000);
    }

    #[test]
    fn wrap_rejects_undersized_region() {
        let shm = SharedMemoryRegion::create(4).expect("alloc");
        let err = NDArray::wrap("float64", vec![10], shm).unwrap_err();
        assert!(matches!(err, NDArrayError::TooSmall { .. }));
    }

    #[test]
    fn unknown_dtype_is_rejected() {
        let err = NDArray::new("complex256", vec![1]).unwrap_err();
        assert!(matches!(err, NDArrayError::Codec(CodecError::InvalidDtype(_))));
    }
}
