//! Integer frame averaging.

use crate::core::Frame;
use crate::error::{AppResult, RigError};

/// Accumulates a batch of same-shaped frames into one integer-mean frame.
///
/// The mean is computed in a `u64` accumulator and narrowed back to `u16`
/// with truncating division. Truncation (not rounding) is deliberate: it
/// reproduces the source pipeline's semantics, keeping output bit-exact
/// with previously saved datasets.
pub struct FrameAverager;

impl FrameAverager {
    /// Average a non-empty batch of frames.
    ///
    /// All inputs must share width, height, and bit depth; the result takes
    /// its sequence number and timestamp from the first frame. A
    /// single-frame batch is the identity case and returns a copy with no
    /// averaging overhead.
    pub fn average(frames: &[Frame]) -> AppResult<Frame> {
        let first = frames.first().ok_or(RigError::CaptureFailed)?;

        if frames.len() == 1 {
            return Ok(first.clone());
        }

        for frame in &frames[1..] {
            if frame.width != first.width
                || frame.height != first.height
                || frame.bit_depth != first.bit_depth
            {
                return Err(RigError::ShapeMismatch {
                    expected_width: first.width,
                    expected_height: first.height,
                    expected_depth: first.bit_depth,
                    width: frame.width,
                    height: frame.height,
                    depth: frame.bit_depth,
                });
            }
        }

        let n = frames.len() as u64;
        let mut accum = vec![0u64; first.data.len()];
        for frame in frames {
            for (sum, &sample) in accum.iter_mut().zip(frame.data.iter()) {
                *sum += u64::from(sample);
            }
        }

        let data = accum.into_iter().map(|sum| (sum / n) as u16).collect();

        Ok(Frame {
            width: first.width,
            height: first.height,
            bit_depth: first.bit_depth,
            sequence: first.sequence,
            timestamp: first.timestamp,
            data,
        })
    }
}
