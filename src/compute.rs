use num_complex::Complex32;
use thiserror::Error;

use crate::clock::TimeStamp;
use crate::emit::result::CorrelationResult;

/// Samples of one (time, subband) unit of work.
///
/// `data` is receiver-major: every receiver contributes `nr_samples`
/// consecutive samples, the first `history` of which precede `time`.
#[derive(Debug, Clone)]
pub struct Window {
    pub time: TimeStamp,
    pub subband: usize,
    pub nr_receivers: usize,
    pub nr_samples: usize,
    pub history: usize,
    pub bytes_per_sample: usize,
    pub data: Vec<u8>,
}

impl Window {
    pub fn new(nr_receivers: usize, nr_samples: usize, history: usize, bytes_per_sample: usize) -> Self {
        Self {
            time: TimeStamp::new(0, 0),
            subband: 0,
            nr_receivers,
            nr_samples,
            history,
            bytes_per_sample,
            data: Vec::with_capacity(nr_receivers * nr_samples * bytes_per_sample),
        }
    }

    fn receiver_len(&self) -> usize {
        self.nr_samples * self.bytes_per_sample
    }

    /// All samples of one receiver, history included.
    pub fn receiver(&self, receiver: usize) -> &[u8] {
        let len = self.receiver_len();
        &self.data[receiver * len..(receiver + 1) * len]
    }

    /// Samples of one receiver from `time` onwards.
    pub fn active(&self, receiver: usize) -> &[u8] {
        &self.receiver(receiver)[self.history * self.bytes_per_sample..]
    }
}

/// Errors raised by the reference correlator.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ComputeError {
    #[error("window holds {actual} bytes, expected {expected}")]
    WindowSize { expected: usize, actual: usize },

    #[error("unsupported sample size: {bytes} bytes")]
    SampleSize { bytes: usize },

    #[error("result sized for {expected} receivers, window has {actual}")]
    ReceiverMismatch { expected: usize, actual: usize },
}

/// The stage turning a window into a correlation result.
///
/// Errors are fatal to the run.
pub trait Compute: Send {
    fn compute(&mut self, window: &Window, result: &mut CorrelationResult) -> anyhow::Result<()>;
}

/// Lag-zero cross-correlation over the active part of a window.
///
/// Samples are complex integers: one byte per component for 2-byte
/// samples, little-endian `i16` per component for 4-byte samples.
#[derive(Debug, Default)]
pub struct CpuCorrelator {
    samples: Vec<Vec<Complex32>>,
}

impl CpuCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(window: &Window, receiver: usize, out: &mut Vec<Complex32>) {
        out.clear();
        let active = window.active(receiver);

        match window.bytes_per_sample {
            2 => out.extend(
                active
                    .chunks_exact(2)
                    .map(|c| Complex32::new(c[0] as i8 as f32, c[1] as i8 as f32)),
            ),
            _ => out.extend(active.chunks_exact(4).map(|c| {
                Complex32::new(
                    i16::from_le_bytes([c[0], c[1]]) as f32,
                    i16::from_le_bytes([c[2], c[3]]) as f32,
                )
            })),
        }
    }
}

impl Compute for CpuCorrelator {
    fn compute(&mut self, window: &Window, result: &mut CorrelationResult) -> anyhow::Result<()> {
        if !matches!(window.bytes_per_sample, 2 | 4) {
            return Err(ComputeError::SampleSize {
                bytes: window.bytes_per_sample,
            }
            .into());
        }

        let expected = window.nr_receivers * window.receiver_len();
        if window.data.len() != expected {
            return Err(ComputeError::WindowSize {
                expected,
                actual: window.data.len(),
            }
            .into());
        }

        if result.nr_receivers != window.nr_receivers {
            return Err(ComputeError::ReceiverMismatch {
                expected: result.nr_receivers,
                actual: window.nr_receivers,
            }
            .into());
        }

        self.samples.resize_with(window.nr_receivers, Vec::new);
        for (receiver, samples) in self.samples.iter_mut().enumerate() {
            Self::decode(window, receiver, samples);
        }

        let mut pair = 0;
        for r2 in 0..window.nr_receivers {
            for r1 in 0..=r2 {
                let sum: Complex32 = self.samples[r1]
                    .iter()
                    .zip(&self.samples[r2])
                    .map(|(a, b)| a * b.conj())
                    .sum();
                result.data[pair] = sum;
                pair += 1;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(samples: &[&[(i8, i8)]], history: usize) -> Window {
        let nr_samples = samples[0].len();
        let mut w = Window::new(samples.len(), nr_samples, history, 2);
        for receiver in samples {
            for &(re, im) in receiver.iter() {
                w.data.push(re as u8);
                w.data.push(im as u8);
            }
        }
        w
    }

    #[test]
    fn test_window_accessors() {
        let w = window(&[&[(1, 1), (2, 2), (3, 3)], &[(4, 4), (5, 5), (6, 6)]], 1);
        assert_eq!(w.receiver(1), &[4, 4, 5, 5, 6, 6]);
        assert_eq!(w.active(0), &[2, 2, 3, 3]);
    }

    #[test]
    fn test_autocorrelation_is_power() {
        let w = window(&[&[(100, 100), (3, 4), (-3, 4)]], 1);
        let mut result = CorrelationResult::new(0, 1, 1024);

        CpuCorrelator::new()
            .compute(&w, &mut result)
            .expect("compute");

        assert_eq!(result.data[0], Complex32::new(50.0, 0.0));
    }

    #[test]
    fn test_cross_correlation_pairs() {
        let w = window(&[&[(1, 0), (0, 1)], &[(0, 1), (1, 0)]], 0);
        let mut result = CorrelationResult::new(0, 2, 1024);

        CpuCorrelator::new()
            .compute(&w, &mut result)
            .expect("compute");

        // (0,0), (0,1), (1,1)
        assert_eq!(result.data[0], Complex32::new(2.0, 0.0));
        // 1 * conj(i) + i * conj(1) = -i + i
        assert_eq!(result.data[1], Complex32::new(0.0, 0.0));
        assert_eq!(result.data[2], Complex32::new(2.0, 0.0));
    }

    #[test]
    fn test_sixteen_bit_samples() {
        let mut w = Window::new(1, 1, 0, 4);
        w.data.extend_from_slice(&300i16.to_le_bytes());
        w.data.extend_from_slice(&(-400i16).to_le_bytes());
        let mut result = CorrelationResult::new(0, 1, 1024);

        CpuCorrelator::new()
            .compute(&w, &mut result)
            .expect("compute");

        assert_eq!(result.data[0], Complex32::new(250_000.0, 0.0));
    }

    #[test]
    fn test_rejects_bad_window() {
        let mut w = window(&[&[(1, 1)]], 0);
        w.data.pop();
        let mut result = CorrelationResult::new(0, 1, 1024);

        let err = CpuCorrelator::new().compute(&w, &mut result).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ComputeError>(),
            Some(&ComputeError::WindowSize {
                expected: 2,
                actual: 1
            })
        );
    }
}
