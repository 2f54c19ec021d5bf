use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{LightshowError, Result};

/// Real-input FFT with the plan and buffers cached for the last size used.
pub(crate) struct Spectrum {
    planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl Spectrum {
    pub(crate) fn new() -> Self {
        Self {
            planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    /// Writes `|X[k]|` for `k in 0..=len/2` into `out`, optionally applying
    /// a window function of the same length as `samples` first.
    pub(crate) fn magnitudes(
        &mut self,
        samples: &[f32],
        window: Option<&[f32]>,
        out: &mut Vec<f32>,
    ) -> Result<()> {
        if samples.len() < 2 {
            return Err(LightshowError::Analysis(format!(
                "FFT needs at least two samples, got {}",
                samples.len()
            )));
        }

        let fft = self.prepare(samples.len());
        match window {
            Some(window) => {
                for ((slot, sample), weight) in fft.input.iter_mut().zip(samples).zip(window) {
                    *slot = sample * weight;
                }
            }
            None => fft.input.copy_from_slice(samples),
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        out.clear();
        out.extend(fft.spectrum.iter().map(|bin| bin.norm()));
        Ok(())
    }

    fn prepare(&mut self, size: usize) -> &mut FftResources {
        if self.fft.as_ref().map_or(false, |fft| fft.size != size) {
            self.fft = None;
        }

        let planner = &mut self.planner;
        self.fft.get_or_insert_with(|| {
            let plan = planner.plan_fft_forward(size);
            FftResources {
                size,
                scratch: plan.make_scratch_vec(),
                spectrum: plan.make_output_vec(),
                input: plan.make_input_vec(),
                plan,
            }
        })
    }
}

impl fmt::Debug for Spectrum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spectrum")
            .field("size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

pub(crate) fn hann_window(len: usize) -> Vec<f32> {
    (0..len).map(|index| hann_value(index, len)).collect()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_tone_peaks_at_its_bin() {
        let size = 1024;
        let rate = 1024.0;
        let samples: Vec<f32> = (0..size)
            .map(|i| (2.0 * PI * 64.0 * i as f32 / rate).sin())
            .collect();
        let mut spectrum = Spectrum::new();
        let mut mags = Vec::new();
        spectrum.magnitudes(&samples, None, &mut mags).unwrap();

        assert_eq!(mags.len(), size / 2 + 1);
        let peak = mags
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 64);
    }

    #[test]
    fn rejects_tiny_input() {
        let mut spectrum = Spectrum::new();
        let mut mags = Vec::new();
        assert!(spectrum.magnitudes(&[1.0], None, &mut mags).is_err());
    }

    #[test]
    fn hann_endpoints_are_zero() {
        let window = hann_window(16);
        assert!(window[0].abs() < 1e-6);
        assert!(window[15].abs() < 1e-6);
    }
}
