//! Channel matrix for downmix/upmix between layouts

use crate::channels::{Channel, ChannelLayout};

/// -3 dB
const CENTER_GAIN: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Mixing matrix: `coeffs[out][in]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemapMatrix {
    coeffs: Vec<Vec<f32>>,
}

/// A destination for a channel that is missing from the output layout.
struct Route {
    targets: &'static [Channel],
    gain: f32,
}

/// Routes for `channel` in order of preference. The first route whose
/// targets all exist in the output layout is used.
fn fallbacks(channel: Channel) -> &'static [Route] {
    use Channel::*;
    match channel {
        FC => &[Route { targets: &[FL, FR], gain: CENTER_GAIN }],
        FL => &[Route { targets: &[FC], gain: CENTER_GAIN }],
        FR => &[Route { targets: &[FC], gain: CENTER_GAIN }],
        BL => &[
            Route { targets: &[SL], gain: 1.0 },
            Route { targets: &[FL], gain: CENTER_GAIN },
            Route { targets: &[FC], gain: 0.5 },
        ],
        BR => &[
            Route { targets: &[SR], gain: 1.0 },
            Route { targets: &[FR], gain: CENTER_GAIN },
            Route { targets: &[FC], gain: 0.5 },
        ],
        SL => &[
            Route { targets: &[BL], gain: 1.0 },
            Route { targets: &[FL], gain: CENTER_GAIN },
            Route { targets: &[FC], gain: 0.5 },
        ],
        SR => &[
            Route { targets: &[BR], gain: 1.0 },
            Route { targets: &[FR], gain: CENTER_GAIN },
            Route { targets: &[FC], gain: 0.5 },
        ],
        BC => &[
            Route { targets: &[BL, BR], gain: CENTER_GAIN },
            Route { targets: &[SL, SR], gain: CENTER_GAIN },
            Route { targets: &[FL, FR], gain: 0.5 },
        ],
        FLOC => &[
            Route { targets: &[FL], gain: 1.0 },
            Route { targets: &[FC], gain: CENTER_GAIN },
        ],
        FROC => &[
            Route { targets: &[FR], gain: 1.0 },
            Route { targets: &[FC], gain: CENTER_GAIN },
        ],
        TC => &[
            Route { targets: &[FL, FR], gain: 0.5 },
            Route { targets: &[FC], gain: 0.5 },
        ],
        // LFE is dropped when the output has no subwoofer
        LFE => &[],
    }
}

impl RemapMatrix {
    /// Build the matrix routing `input` onto `output`.
    ///
    /// With `normalize`, rows whose gains sum above 1.0 are scaled down so a
    /// full-scale downmix cannot clip.
    pub fn new(input: &ChannelLayout, output: &ChannelLayout, normalize: bool) -> Self {
        let mut coeffs = vec![vec![0.0f32; input.count()]; output.count()];

        for (in_idx, channel) in input.iter().enumerate() {
            if let Some(out_idx) = output.position(channel) {
                coeffs[out_idx][in_idx] = 1.0;
                continue;
            }
            let route = fallbacks(channel)
                .iter()
                .find(|route| route.targets.iter().all(|&t| output.contains(t)));
            if let Some(route) = route {
                for &target in route.targets {
                    if let Some(out_idx) = output.position(target) {
                        coeffs[out_idx][in_idx] += route.gain;
                    }
                }
            }
        }

        // Mono source: feed both fronts at full level
        if input.count() == 1 && input.contains(Channel::FC) && !output.contains(Channel::FC) {
            for target in [Channel::FL, Channel::FR] {
                if let Some(out_idx) = output.position(target) {
                    coeffs[out_idx][0] = 1.0;
                }
            }
        }

        if normalize {
            for row in coeffs.iter_mut() {
                let sum: f32 = row.iter().sum();
                if sum > 1.0 {
                    row.iter_mut().for_each(|c| *c /= sum);
                }
            }
        }

        Self { coeffs }
    }

    pub fn output_channels(&self) -> usize {
        self.coeffs.len()
    }

    pub fn coefficient(&self, out: usize, input: usize) -> f32 {
        self.coeffs[out][input]
    }

    /// True when every output channel copies exactly one input channel in order.
    pub fn is_identity(&self) -> bool {
        self.coeffs.iter().enumerate().all(|(o, row)| {
            row.len() == self.coeffs.len()
                && row
                    .iter()
                    .enumerate()
                    .all(|(i, &c)| if i == o { c == 1.0 } else { c == 0.0 })
        })
    }

    /// Mix `frames` frames of `input` (one vector per input channel, read
    /// from `start`) onto `output`, appending to each output channel.
    pub fn apply(&self, input: &[Vec<f32>], start: usize, frames: usize, output: &mut [Vec<f32>]) {
        if self.is_identity() {
            for (dst, src) in output.iter_mut().zip(input) {
                dst.extend_from_slice(&src[start..start + frames]);
            }
            return;
        }
        for (row, dst) in self.coeffs.iter().zip(output.iter_mut()) {
            dst.reserve(frames);
            for frame in start..start + frames {
                let mut acc = 0.0f32;
                for (&coeff, src) in row.iter().zip(input) {
                    if coeff != 0.0 {
                        acc += src[frame] * coeff;
                    }
                }
                dst.push(acc);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_for_matching_layouts() {
        let layout = ChannelLayout::surround_5_1();
        assert!(RemapMatrix::new(&layout, &layout, false).is_identity());
    }

    #[test]
    fn test_5_1_to_stereo_downmix() {
        let matrix =
            RemapMatrix::new(&ChannelLayout::surround_5_1(), &ChannelLayout::stereo(), false);
        // FL row: FL, FC at -3dB, BL at -3dB, LFE dropped
        assert_eq!(matrix.coefficient(0, 0), 1.0);
        assert!((matrix.coefficient(0, 2) - CENTER_GAIN).abs() < 1e-6);
        assert_eq!(matrix.coefficient(0, 3), 0.0);
        assert!((matrix.coefficient(0, 4) - CENTER_GAIN).abs() < 1e-6);
        assert_eq!(matrix.coefficient(0, 5), 0.0);
    }

    #[test]
    fn test_normalized_rows_do_not_exceed_unity() {
        let matrix =
            RemapMatrix::new(&ChannelLayout::surround_7_1(), &ChannelLayout::stereo(), true);
        for out in 0..2 {
            let sum: f32 = (0..8).map(|i| matrix.coefficient(out, i)).sum();
            assert!(sum <= 1.0 + 1e-6);
        }
    }

    #[test]
    fn test_mono_upmix_feeds_both_fronts() {
        let matrix = RemapMatrix::new(&ChannelLayout::mono(), &ChannelLayout::stereo(), false);
        let mut out = vec![Vec::new(), Vec::new()];
        matrix.apply(&[vec![0.5, 0.25]], 0, 2, &mut out);
        assert_eq!(out[0], vec![0.5, 0.25]);
        assert_eq!(out[1], vec![0.5, 0.25]);
    }

    #[test]
    fn test_upmix_leaves_new_channels_silent() {
        let matrix =
            RemapMatrix::new(&ChannelLayout::stereo(), &ChannelLayout::surround_5_1(), false);
        let mut out = vec![Vec::new(); 6];
        matrix.apply(&[vec![0.5], vec![-0.5]], 0, 1, &mut out);
        assert_eq!(out[0], vec![0.5]);
        assert_eq!(out[1], vec![-0.5]);
        assert_eq!(out[2], vec![0.0]);
        assert_eq!(out[3], vec![0.0]);
    }
}
