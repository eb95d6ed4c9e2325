//! Sinusoidal fringe-pattern generation for phase-shifting projection.

use crate::core::Pattern;
use std::f64::consts::PI;

/// Generate the fringe pattern for one phase step.
///
/// For fringe count `F`, projector height `H`, and phase index `p` of `P`
/// total phases:
///
/// ```text
/// k = 2*pi*F / H
/// phase_shift = 2*pi*p / P
/// pixel(x, y) = round(255 * (0.5 + 0.5*cos(k*y + phase_shift)))
/// ```
///
/// The fringes run across the projector height; every row is constant. The
/// arithmetic must stay bit-exact with previously recorded datasets, so the
/// rounding (not truncation) here is deliberate.
pub fn fringe_pattern(
    fringes: u32,
    width: u32,
    height: u32,
    phase_index: u32,
    nphases: u32,
) -> Pattern {
    let k = 2.0 * PI * f64::from(fringes) / f64::from(height);
    let phase_shift = 2.0 * PI * f64::from(phase_index) / f64::from(nphases);

    let mut data = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        let value = (255.0 * (0.5 + 0.5 * (k * f64::from(y) + phase_shift).cos())).round() as u8;
        data.extend(std::iter::repeat(value).take(width as usize));
    }

    Pattern {
        width,
        height,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Straight transcription of the formula, one pixel at a time.
    fn reference_pixel(fringes: u32, height: u32, y: u32, p: u32, nphases: u32) -> u8 {
        let k = 2.0 * PI * fringes as f64 / height as f64;
        let shift = 2.0 * PI * p as f64 / nphases as f64;
        (255.0 * (0.5 + 0.5 * (k * y as f64 + shift).cos())).round() as u8
    }

    #[test]
    fn test_matches_reference_formula_exactly() {
        let (fringes, width, height, nphases) = (16, 64, 480, 4);
        for p in 0..nphases {
            let pattern = fringe_pattern(fringes, width, height, p, nphases);
            assert_eq!(pattern.data.len(), (width * height) as usize);
            for y in 0..height {
                let expected = reference_pixel(fringes, height, y, p, nphases);
                for x in 0..width {
                    assert_eq!(pattern.data[(y * width + x) as usize], expected);
                }
            }
        }
    }

    #[test]
    fn test_phase_zero_starts_at_peak() {
        // cos(0) = 1 -> 255 at the first row.
        let pattern = fringe_pattern(16, 8, 480, 0, 4);
        assert_eq!(pattern.data[0], 255);
    }

    #[test]
    fn test_half_period_phase_starts_at_trough() {
        // p = P/2 -> phase shift pi -> cos = -1 -> 0 at the first row.
        let pattern = fringe_pattern(16, 8, 480, 2, 4);
        assert_eq!(pattern.data[0], 0);
    }
}
