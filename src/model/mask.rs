//! Length masks for padded batches.
//!
//! Padding is removed from attention by replacing scores with `-inf` before
//! normalization, and from losses and convolutions by multiplying with a
//! `{0, 1}` float mask.

use candle_core::{DType, Device, Result, Tensor};

/// `[B, max_len]` u8 mask: 1 for positions `< length`, 0 for padding.
pub fn sequence_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<u8> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| u8::from(t < len)))
        .collect();
    Tensor::from_vec(data, (lengths.len(), max_len), device)
}

/// `[B, max_len]` float mask with the given dtype.
pub fn float_mask(
    lengths: &[usize],
    max_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    sequence_mask(lengths, max_len, device)?.to_dtype(dtype)
}

/// Replace scores at padded positions with `-inf`.
///
/// - `scores`: `[B, T]`
/// - `mask`: `[B, T]` u8 from [`sequence_mask`]
pub fn mask_scores(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.dims(), scores.device())?
        .to_dtype(scores.dtype())?;
    mask.where_cond(scores, &neg_inf)
}

/// Per-example index that reverses each example's first `length` positions
/// and leaves padding in place. Applying it twice is the identity.
///
/// Returns `[B, max_len]` u32.
pub fn reverse_index(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<u32> = lengths
        .iter()
        .flat_map(|&len| {
            (0..max_len).map(move |t| if t < len { (len - 1 - t) as u32 } else { t as u32 })
        })
        .collect();
    Tensor::from_vec(data, (lengths.len(), max_len), device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_mask() {
        let mask = sequence_mask(&[2, 4], 4, &Device::Cpu).unwrap();
        let rows: Vec<Vec<u8>> = mask.to_vec2().unwrap();
        assert_eq!(rows, vec![vec![1, 1, 0, 0], vec![1, 1, 1, 1]]);
    }

    #[test]
    fn test_mask_scores_sets_neg_inf() {
        let dev = Device::Cpu;
        let scores = Tensor::new(&[[1f32, 2., 3.], [4., 5., 6.]], &dev).unwrap();
        let mask = sequence_mask(&[1, 3], 3, &dev).unwrap();
        let masked: Vec<Vec<f32>> = mask_scores(&scores, &mask).unwrap().to_vec2().unwrap();
        assert_eq!(masked[0][0], 1.0);
        assert!(masked[0][1].is_infinite() && masked[0][1] < 0.0);
        assert!(masked[0][2].is_infinite());
        assert_eq!(masked[1], vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_reverse_index_is_involution() {
        let idx = reverse_index(&[3, 5], 5, &Device::Cpu).unwrap();
        let rows: Vec<Vec<u32>> = idx.to_vec2().unwrap();
        assert_eq!(rows[0], vec![2, 1, 0, 3, 4]);
        assert_eq!(rows[1], vec![4, 3, 2, 1, 0]);
        for row in &rows {
            for (t, &i) in row.iter().enumerate() {
                assert_eq!(row[i as usize] as usize, t);
            }
        }
    }
}
