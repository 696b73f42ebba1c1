//! Correlation results and their on-disk block format.
//!
//! Each emitted block is a fixed [`HEADER_SIZE`]-byte little-endian header
//! followed by one `Complex32` (real, imaginary as `f32`) per receiver pair.

use num_complex::Complex32;
use thiserror::Error;

use crate::clock::TimeStamp;
use crate::config::MAX_WEIGHTS;

/// Marks the start of every emitted block.
pub const HEADER_MAGIC: u32 = 0x3B98_F003;

/// Size of the block header in bytes.
pub const HEADER_SIZE: usize = 1536;

const WEIGHTS_OFFSET: usize = 24;
const TRAILER_OFFSET: usize = WEIGHTS_OFFSET + MAX_WEIGHTS * 4;

/// Errors that can occur while decoding a block header.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header too short: {size} bytes")]
    Truncated { size: usize },

    #[error("bad magic {found:#010x}")]
    BadMagic { found: u32 },
}

/// One (possibly integrated) correlation of a window.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationResult {
    pub subband: usize,
    pub nr_receivers: usize,
    pub start: TimeStamp,
    pub end: TimeStamp,
    /// Valid samples shared by each receiver pair, first [`MAX_WEIGHTS`] pairs.
    pub weights: Vec<u32>,
    /// One visibility per receiver pair `(r1, r2)`, `r1 <= r2`, ordered by
    /// `r2` then `r1`.
    pub data: Vec<Complex32>,
}

/// Number of receiver pairs including autocorrelations.
pub fn nr_pairs(nr_receivers: usize) -> usize {
    nr_receivers * (nr_receivers + 1) / 2
}

impl CorrelationResult {
    pub fn new(subband: usize, nr_receivers: usize, clock_speed: u32) -> Self {
        let pairs = nr_pairs(nr_receivers);

        Self {
            subband,
            nr_receivers,
            start: TimeStamp::new(0, clock_speed),
            end: TimeStamp::new(0, clock_speed),
            weights: vec![0; pairs.min(MAX_WEIGHTS)],
            data: vec![Complex32::new(0.0, 0.0); pairs],
        }
    }

    /// Reset data and weights before reuse.
    pub fn clear(&mut self) {
        self.weights.fill(0);
        self.data.fill(Complex32::new(0.0, 0.0));
    }

    /// Add `other` into this result, widening the covered time span.
    pub fn accumulate(&mut self, other: &CorrelationResult) {
        for (acc, v) in self.data.iter_mut().zip(&other.data) {
            *acc += *v;
        }
        for (acc, w) in self.weights.iter_mut().zip(&other.weights) {
            *acc = acc.saturating_add(*w);
        }
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
    }

    /// Serialize header and payload.
    pub fn encode(&self, info: &StreamInfo, out: &mut Vec<u8>) {
        let header = BlockHeader {
            nr_receivers: self.nr_receivers as u16,
            subband: self.subband as u16,
            start_seconds: self.start.seconds(),
            end_seconds: self.end.seconds(),
            weights: self.weights.clone(),
            nr_samples_per_integration: info.nr_samples_per_integration,
            integration_factor: info.integration_factor,
            center_frequency: info.center_frequency,
            bandwidth: info.bandwidth,
        };

        header.encode(out);
        out.reserve(self.data.len() * 8);
        for v in &self.data {
            out.extend_from_slice(&v.re.to_le_bytes());
            out.extend_from_slice(&v.im.to_le_bytes());
        }
    }
}

/// Per-output constants written into every header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub nr_samples_per_integration: u32,
    pub integration_factor: u32,
    pub center_frequency: f64,
    pub bandwidth: f64,
}

/// Decoded block header.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub nr_receivers: u16,
    pub subband: u16,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub weights: Vec<u32>,
    pub nr_samples_per_integration: u32,
    pub integration_factor: u32,
    pub center_frequency: f64,
    pub bandwidth: f64,
}

impl BlockHeader {
    /// Payload bytes following this header.
    pub fn payload_size(&self) -> usize {
        nr_pairs(self.nr_receivers as usize) * 8
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let base = out.len();
        out.reserve(HEADER_SIZE);

        out.extend_from_slice(&HEADER_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.nr_receivers.to_le_bytes());
        out.extend_from_slice(&self.subband.to_le_bytes());
        out.extend_from_slice(&self.start_seconds.to_le_bytes());
        out.extend_from_slice(&self.end_seconds.to_le_bytes());

        for i in 0..MAX_WEIGHTS {
            let w = self.weights.get(i).copied().unwrap_or(0);
            out.extend_from_slice(&w.to_le_bytes());
        }

        out.extend_from_slice(&self.nr_samples_per_integration.to_le_bytes());
        out.extend_from_slice(&self.integration_factor.to_le_bytes());
        out.extend_from_slice(&self.center_frequency.to_le_bytes());
        out.extend_from_slice(&self.bandwidth.to_le_bytes());

        out.resize(base + HEADER_SIZE, 0);
    }

    pub fn decode(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated { size: data.len() });
        }

        let magic = read_u32_le(data, 0);
        if magic != HEADER_MAGIC {
            return Err(HeaderError::BadMagic { found: magic });
        }

        let nr_receivers = read_u16_le(data, 4);
        let nr_weights = nr_pairs(nr_receivers as usize).min(MAX_WEIGHTS);
        let weights = (0..nr_weights)
            .map(|i| read_u32_le(data, WEIGHTS_OFFSET + i * 4))
            .collect();

        Ok(Self {
            nr_receivers,
            subband: read_u16_le(data, 6),
            start_seconds: read_f64_le(data, 8),
            end_seconds: read_f64_le(data, 16),
            weights,
            nr_samples_per_integration: read_u32_le(data, TRAILER_OFFSET),
            integration_factor: read_u32_le(data, TRAILER_OFFSET + 4),
            center_frequency: read_f64_le(data, TRAILER_OFFSET + 8),
            bandwidth: read_f64_le(data, TRAILER_OFFSET + 16),
        })
    }
}

// ---------------------------------------------------------------------------
// Byte-reading helpers; callers check lengths first.
// ---------------------------------------------------------------------------

fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_f64_le(data: &[u8], offset: usize) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    f64::from_le_bytes(bytes)
}
