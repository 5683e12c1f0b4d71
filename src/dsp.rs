//! Spectrum extraction, smoothing, and quantization.
//!
//! Each captured chunk is reduced to 8 raw band magnitudes (one per matrix
//! column), smoothed against the previous frame, normalized against an
//! adaptive ceiling, and quantized to the 0-9 level range the display
//! firmware expects.

use spectrum_analyzer::{samples_fft_to_spectrum, FrequencyLimit};

/// Samples fed into one FFT. The capture side always delivers exactly this
/// many interleaved samples per chunk regardless of channel count.
pub const FFT_LEN: usize = 1024;

/// Number of frequency bands, one per matrix column.
pub const NUM_BANDS: usize = 8;

/// FFT bin sampled for each band. Strictly increasing, and every index has a
/// valid -1/+1 neighbor within the spectrum.
const BAND_POINTS: [usize; NUM_BANDS] = [10, 17, 20, 25, 30, 40, 55, 75];

/// Per-band gain compensating the energy skew toward low frequencies, so all
/// 8 columns are comparable after normalization.
const BAND_SCALES: [f32; NUM_BANDS] = [0.3, 0.6, 0.6, 0.7, 0.7, 0.7, 0.85, 1.0];

/// Ceiling starting point for mono capture. Keeps near-silence from producing
/// a degenerate ceiling that amplifies noise into visible bars.
pub const MONO_NOISE_FLOOR: f32 = 0.001;
/// Ceiling starting point in multi-channel compatibility mode.
pub const MULTI_CHANNEL_NOISE_FLOOR: f32 = 100.0;

/// Initial adaptive ceiling before any audio has been seen.
const INITIAL_CEILING: f32 = 25.0;
/// Ceiling rise rate when the current cycle is louder than the ceiling.
const CEILING_ATTACK: f32 = 0.15;
/// Ceiling fall rate when the current cycle is quieter.
const CEILING_DECAY: f32 = 0.03;
/// Interpolation factor of the per-cycle ceiling fold across bands.
const CEILING_FOLD_RATE: f32 = 0.7;
/// Interpolation factor of per-band smoothing against the previous frame.
const SMOOTHING_RATE: f32 = 0.5;

/// Quantizer output range is 0..=9; the ceiling maps to 8, with 9 absorbing
/// transient overshoot above it.
const LEVEL_SPAN: f32 = 8.0;
const MAX_LEVEL: u32 = 9;

pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + t * (b - a)
}

pub fn invlerp(a: f32, b: f32, v: f32) -> f32 {
    (v - a) / (b - a)
}

/// Reduce one chunk to 8 raw band magnitudes.
///
/// Runs an unwindowed, unscaled FFT over the first [`FFT_LEN`] samples and
/// samples each band point averaged with its immediate neighbors. The 3-bin
/// average suppresses single-bin spectral spikes.
pub fn band_magnitudes(samples: &[i16], sample_rate: u32) -> [f32; NUM_BANDS] {
    let mut buf = [0.0f32; FFT_LEN];
    for (dst, src) in buf.iter_mut().zip(samples.iter()) {
        *dst = *src as f32;
    }

    let spectrum = match samples_fft_to_spectrum(&buf, sample_rate, FrequencyLimit::All, None) {
        Ok(s) => s,
        Err(_) => return [0.0; NUM_BANDS],
    };
    let bins: Vec<f32> = spectrum.data().iter().map(|(_, mag)| mag.val()).collect();

    let mut raw = [0.0f32; NUM_BANDS];
    for (i, (&idx, &scale)) in BAND_POINTS.iter().zip(BAND_SCALES.iter()).enumerate() {
        let avg = (bins[idx - 1] + bins[idx] + bins[idx + 1]) / 3.0;
        raw[i] = avg * scale;
    }
    raw
}

/// Per-band smoothing state and the adaptive ceiling, carried across cycles.
///
/// Owned exclusively by the pipeline loop; advanced in place once per chunk.
pub struct SmoothingState {
    levels: [f32; NUM_BANDS],
    ceiling: f32,
}

impl SmoothingState {
    pub fn new() -> Self {
        Self {
            levels: [0.0; NUM_BANDS],
            ceiling: INITIAL_CEILING,
        }
    }

    /// Fold one cycle of raw band magnitudes into the state.
    ///
    /// The instantaneous ceiling `mv` is a left-to-right fold across bands,
    /// not an order-independent max: `mv` after the last band reflects the
    /// preceding bands in sequence. Changing this to a plain max would alter
    /// the observable smoothing, so the fold is kept literal.
    pub fn advance(&mut self, raw: &[f32; NUM_BANDS], noise_floor: f32) {
        let mut mv = noise_floor;
        for (level, &band) in self.levels.iter_mut().zip(raw.iter()) {
            mv = lerp(mv, mv.max(band), CEILING_FOLD_RATE);
            *level = lerp(*level, band, SMOOTHING_RATE);
        }
        // Rises fast on loud attacks, decays slowly back toward quiet.
        let rate = if mv > self.ceiling {
            CEILING_ATTACK
        } else {
            CEILING_DECAY
        };
        self.ceiling = lerp(self.ceiling, mv, rate);
    }

    /// Quantize the smoothed bands to display levels in `[0, 9]`.
    pub fn quantize(&self) -> [u8; NUM_BANDS] {
        let mut out = [0u8; NUM_BANDS];
        for (slot, &level) in out.iter_mut().zip(self.levels.iter()) {
            let frac = invlerp(0.0, self.ceiling, level);
            // f32 -> u32 casts saturate, so overshoot above the ceiling
            // lands on 9 and negatives land on 0.
            *slot = ((frac * LEVEL_SPAN).floor() as u32).min(MAX_LEVEL) as u8;
        }
        out
    }

    pub fn ceiling(&self) -> f32 {
        self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advance_n(state: &mut SmoothingState, raw: &[f32; NUM_BANDS], n: usize) {
        for _ in 0..n {
            state.advance(raw, MONO_NOISE_FLOOR);
        }
    }

    #[test]
    fn quantize_levels_stay_in_display_range() {
        let mut state = SmoothingState::new();
        let loud = [1e7f32; NUM_BANDS];
        for _ in 0..50 {
            state.advance(&loud, MONO_NOISE_FLOOR);
            for level in state.quantize() {
                assert!(level <= 9, "level {} out of range", level);
            }
        }
        // Spike far above a converged ceiling must clamp at 9, not 10+.
        let mut spiked = SmoothingState::new();
        advance_n(&mut spiked, &[10.0; NUM_BANDS], 30);
        spiked.advance(&[1e9; NUM_BANDS], MONO_NOISE_FLOOR);
        assert!(spiked.quantize().iter().all(|&l| l <= 9));
    }

    #[test]
    fn ceiling_never_collapses_to_zero() {
        let mut state = SmoothingState::new();
        let silence = [0.0f32; NUM_BANDS];
        for _ in 0..10_000 {
            state.advance(&silence, MONO_NOISE_FLOOR);
            assert!(state.ceiling() > 0.0);
        }
        // Decays toward the fold of the noise floor, never below it.
        assert!(state.ceiling() >= MONO_NOISE_FLOOR * 0.99);
    }

    #[test]
    fn smoothing_is_a_fixed_point_under_constant_input() {
        let mut state = SmoothingState::new();
        let steady = [40.0f32; NUM_BANDS];
        advance_n(&mut state, &steady, 200);
        let before = state.levels;
        state.advance(&steady, MONO_NOISE_FLOOR);
        for (a, b) in before.iter().zip(state.levels.iter()) {
            assert!((a - b).abs() < 1e-3, "converged level moved: {} -> {}", a, b);
        }
    }

    #[test]
    fn ceiling_rises_fast_and_decays_slow() {
        let mut state = SmoothingState::new();
        advance_n(&mut state, &[2000.0; NUM_BANDS], 5);
        let peak = state.ceiling();
        assert!(peak > INITIAL_CEILING);

        state.advance(&[0.0; NUM_BANDS], MONO_NOISE_FLOOR);
        let after_one_quiet = state.ceiling();
        // One quiet cycle only moves the ceiling by the slow decay rate.
        assert!(after_one_quiet < peak);
        assert!(after_one_quiet > peak * 0.9);
    }

    #[test]
    fn band_sampling_averages_immediate_neighbors() {
        // Pure cosine at an exact bin lands all its energy in that bin:
        // |FFT| = amplitude * FFT_LEN / 2 at the bin, ~0 elsewhere.
        let sample_rate = 44_100;
        let amplitude = 3000.0f32;
        let bin = 25; // band 3, scale 0.7
        let mut chunk = [0i16; FFT_LEN];
        for (n, s) in chunk.iter_mut().enumerate() {
            let phase = 2.0 * std::f32::consts::PI * bin as f32 * n as f32 / FFT_LEN as f32;
            *s = (amplitude * phase.cos()) as i16;
        }

        let raw = band_magnitudes(&chunk, sample_rate);
        let spike = amplitude * FFT_LEN as f32 / 2.0;
        let expected = 0.7 * spike / 3.0;
        let err = (raw[3] - expected).abs() / expected;
        assert!(err < 0.02, "raw[3]={} expected~{}", raw[3], expected);

        // Other bands see essentially nothing from a single-bin spike.
        assert!(raw[0] < expected * 0.05);
        assert!(raw[7] < expected * 0.05);
    }

    #[test]
    fn band_sampling_catches_spikes_on_adjacent_bins() {
        // A spike one bin to the side of the sample point still contributes
        // through the 3-bin average, at the same weight as a centered spike.
        let sample_rate = 44_100;
        let amplitude = 2000.0f32;
        let mut centered = [0i16; FFT_LEN];
        let mut adjacent = [0i16; FFT_LEN];
        for (n, (c, a)) in centered.iter_mut().zip(adjacent.iter_mut()).enumerate() {
            let t = 2.0 * std::f32::consts::PI * n as f32 / FFT_LEN as f32;
            *c = (amplitude * (t * 40.0).cos()) as i16;
            *a = (amplitude * (t * 39.0).cos()) as i16;
        }

        let on_point = band_magnitudes(&centered, sample_rate)[5];
        let off_point = band_magnitudes(&adjacent, sample_rate)[5];
        let err = (on_point - off_point).abs() / on_point;
        assert!(err < 0.05, "centered {} vs adjacent {}", on_point, off_point);
    }

    #[test]
    fn silence_produces_zero_levels() {
        let raw = band_magnitudes(&[0i16; FFT_LEN], 48_000);
        assert_eq!(raw, [0.0; NUM_BANDS]);

        let mut state = SmoothingState::new();
        state.advance(&raw, MONO_NOISE_FLOOR);
        assert_eq!(state.quantize(), [0u8; NUM_BANDS]);
    }
}
