use ndarray::{Array1, Array2, Array3, Axis};

use crate::error::{ProverError, Result};

/// Masked mean over the sequence axis.
///
/// `hidden` is `(batch, seq_len, hidden)`, `attention_mask` is `(batch, seq_len)`.
/// Rows whose mask is all zeros divide by one rather than zero.
pub fn mean_pool(hidden: &Array3<f32>, attention_mask: &Array2<f32>) -> Result<Array2<f32>> {
    let (batch, seq_len, _) = hidden.dim();
    if attention_mask.dim() != (batch, seq_len) {
        return Err(ProverError::InferenceFailure(anyhow::anyhow!(
            "attention mask {:?} does not match hidden state {:?}",
            attention_mask.dim(),
            hidden.dim()
        )));
    }
    let mask_expanded = attention_mask.clone().insert_axis(Axis(2));
    let masked_hidden = hidden * &mask_expanded;
    let sum = masked_hidden.sum_axis(Axis(1));
    let count = attention_mask
        .sum_axis(Axis(1))
        .mapv(|x| x.max(1.0))
        .insert_axis(Axis(1));

    Ok(sum / &count)
}

/// `mean_pool` for a single sequence.
pub fn mean_pool_single(hidden: &Array3<f32>, attention_mask: &Array2<f32>) -> Result<Array1<f32>> {
    let pooled = mean_pool(hidden, attention_mask)?;
    if pooled.nrows() != 1 {
        return Err(ProverError::InferenceFailure(anyhow::anyhow!(
            "expected one pooled row, got {}",
            pooled.nrows()
        )));
    }
    Ok(pooled.row(0).to_owned())
}
