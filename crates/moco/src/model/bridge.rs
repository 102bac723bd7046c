//! Host ↔ burn tensor conversions.
//!
//! Diagnostics, collectives and checkpoints all move embeddings through
//! host memory as row-major `f32`; this module is that boundary.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::error::MocoError;

/// Convert a batch of equally sized rows to a `(batch, dim)` tensor.
///
/// # Panics
/// Panics if `rows` is empty or the rows have inconsistent lengths.
#[cfg(test)]
pub(crate) fn rows_to_tensor<B: Backend>(rows: &[Vec<f32>], device: &B::Device) -> Tensor<B, 2> {
    assert!(!rows.is_empty(), "rows must not be empty");
    let dim = rows[0].len();
    assert!(dim > 0, "row dimension must be > 0");
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.len(), dim, "row {i} has length {}, expected {dim}", row.len());
    }

    let batch = rows.len();
    let flat: Vec<f32> = rows.iter().flat_map(|v| v.iter().copied()).collect();
    Tensor::from_data(TensorData::new(flat, [batch, dim]), device)
}

/// Flatten tensor data into host `f32`s, whatever the backend's float type.
pub fn data_to_vec(data: TensorData) -> Result<Vec<f32>, MocoError> {
    data.convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| MocoError::Data(format!("{e:?}")))
}

/// Read a `(batch, dim)` tensor back as rows.
pub fn tensor_to_rows<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<Vec<f32>>, MocoError> {
    let [_, dim] = tensor.dims();
    let flat = data_to_vec(tensor.into_data())?;
    if dim == 0 {
        return Ok(Vec::new());
    }
    Ok(flat.chunks(dim).map(|c| c.to_vec()).collect())
}

/// Extract a single scalar from a one-element tensor.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    let val: f32 = tensor.into_scalar().elem();
    val as f64
}
