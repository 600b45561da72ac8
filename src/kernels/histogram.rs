//! 2-D histogram scatter-add
//!
//! Accumulates `source[i]` into `histogram[index1[i]][index2[i]]` for
//! parallel index arrays. Duplicate (index1, index2) pairs sum: the
//! accumulation is sequential, giving the atomic-add semantics of the
//! accelerator kernel without last-write-wins races.

use crate::error::{check_len, QfResult, QuantForgeError};

/// Scatter-add into a row-major `rows x cols` histogram
///
/// All indices are bounds-checked before any accumulation happens; an
/// out-of-range pair leaves the histogram untouched.
pub fn histogram_scatter_add_2d(
    histogram: &mut [f32],
    rows: usize,
    cols: usize,
    index1: &[i32],
    index2: &[i32],
    source: &[f32],
) -> QfResult<()> {
    check_len("histogram", rows * cols, histogram.len())?;
    check_len("index2", index1.len(), index2.len())?;
    check_len("source", index1.len(), source.len())?;

    for (&i1, &i2) in index1.iter().zip(index2) {
        if i1 < 0 || i2 < 0 || i1 as usize >= rows || i2 as usize >= cols {
            return Err(QuantForgeError::HistogramIndexOutOfBounds(i1, i2));
        }
    }

    for ((&i1, &i2), &src) in index1.iter().zip(index2).zip(source) {
        histogram[i1 as usize * cols + i2 as usize] += src;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_scatter_add() {
        let mut hist = vec![0.0f32; 4 * 4];
        histogram_scatter_add_2d(&mut hist, 4, 4, &[0, 1], &[2, 3], &[1.5, 2.5]).unwrap();
        assert_eq!(hist[2], 1.5);
        assert_eq!(hist[4 + 3], 2.5);
    }

    #[test]
    fn test_duplicate_indices_sum() {
        let mut hist = vec![0.0f32; 2 * 2];
        histogram_scatter_add_2d(
            &mut hist,
            2,
            2,
            &[1, 1, 1],
            &[0, 0, 0],
            &[1.0, 2.0, 3.0],
        )
        .unwrap();
        assert_eq!(hist[2], 6.0);
    }

    #[test]
    fn test_mass_conserved() {
        let mut hist = vec![0.0f32; 16 * 16];
        let n = 1000;
        let index1: Vec<i32> = (0..n).map(|i| (i * 7 % 16) as i32).collect();
        let index2: Vec<i32> = (0..n).map(|i| (i * 13 % 16) as i32).collect();
        let source: Vec<f32> = (0..n).map(|i| i as f32 / n as f32).collect();

        histogram_scatter_add_2d(&mut hist, 16, 16, &index1, &index2, &source).unwrap();

        let total: f32 = hist.iter().sum();
        let expected: f32 = source.iter().sum();
        assert!((total - expected).abs() < 1e-2);
    }

    #[test]
    fn test_out_of_bounds_rejected_without_mutation() {
        let mut hist = vec![0.0f32; 4];
        let err = histogram_scatter_add_2d(&mut hist, 2, 2, &[0, 2], &[0, 0], &[1.0, 1.0])
            .unwrap_err();
        assert!(matches!(
            err,
            QuantForgeError::HistogramIndexOutOfBounds(2, 0)
        ));
        assert!(hist.iter().all(|&v| v == 0.0));

        let err = histogram_scatter_add_2d(&mut hist, 2, 2, &[-1], &[0], &[1.0]).unwrap_err();
        assert!(matches!(
            err,
            QuantForgeError::HistogramIndexOutOfBounds(-1, 0)
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut hist = vec![0.0f32; 4];
        let err =
            histogram_scatter_add_2d(&mut hist, 2, 2, &[0], &[0, 1], &[1.0]).unwrap_err();
        assert!(matches!(err, QuantForgeError::BufferSizeMismatch { .. }));
    }
}
