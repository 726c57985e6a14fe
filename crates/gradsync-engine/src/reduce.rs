//! Host-side elementwise summation.
//!
//! The cross-PCIe-switch stage folds per-switch staging buffers into the
//! canonical one on the CPU. Buffers hold native-endian elements of the
//! task's dtype; windows are always a whole number of elements because the
//! partition bound is a multiple of every element size.

use gradsync_types::dtype::TensorDtype;
use gradsync_types::error::{Result, SyncError};

/// `dst[i] += src[i]` elementwise, interpreting both as `dtype`.
pub fn sum_into(dst: &mut [u8], src: &[u8], dtype: TensorDtype) -> Result<()> {
    if dst.len() != src.len() {
        return Err(SyncError::InvariantViolation(format!(
            "sum window mismatch: {} vs {} bytes",
            dst.len(),
            src.len()
        )));
    }
    if dst.len() % dtype.element_bytes() != 0 {
        return Err(SyncError::InvariantViolation(format!(
            "{} bytes is not a whole number of {dtype:?} elements",
            dst.len()
        )));
    }

    match dtype {
        TensorDtype::U8 => {
            for (d, s) in dst.iter_mut().zip(src) {
                *d = d.wrapping_add(*s);
            }
        }
        TensorDtype::I32 => sum_elements::<i32, 4>(dst, src, i32::from_ne_bytes, |a, b| {
            a.wrapping_add(b).to_ne_bytes()
        }),
        TensorDtype::I64 => sum_elements::<i64, 8>(dst, src, i64::from_ne_bytes, |a, b| {
            a.wrapping_add(b).to_ne_bytes()
        }),
        TensorDtype::F32 => {
            sum_elements::<f32, 4>(dst, src, f32::from_ne_bytes, |a, b| (a + b).to_ne_bytes())
        }
        TensorDtype::F64 => {
            sum_elements::<f64, 8>(dst, src, f64::from_ne_bytes, |a, b| (a + b).to_ne_bytes())
        }
    }
    Ok(())
}

fn sum_elements<T: Copy, const N: usize>(
    dst: &mut [u8],
    src: &[u8],
    decode: fn([u8; N]) -> T,
    add: fn(T, T) -> [u8; N],
) {
    for (d, s) in dst.chunks_exact_mut(N).zip(src.chunks_exact(N)) {
        let a = decode(d.try_into().expect("chunk size"));
        let b = decode(s.try_into().expect("chunk size"));
        d.copy_from_slice(&add(a, b));
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
