use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::clock::{duration_to_samples, TimeStamp};
use crate::descriptor::Descriptor;

/// Header slots reserved for per-pair weights in emitted blocks.
pub const MAX_WEIGHTS: usize = 300;

/// Top-level configuration for a correlator run.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Sampling clock in samples per 1024 seconds. Default: 200 MHz.
    #[serde(default = "default_clock_speed")]
    pub clock_speed: u32,

    /// First window start, "YYYY-MM-DD HH:MM:SS" (UTC) or "now".
    #[serde(default = "default_start_time")]
    pub start_time: String,

    /// Last window start, in the same format as `start_time`.
    #[serde(default)]
    pub stop_time: Option<String>,

    /// Run length after `start_time`; ignored when `stop_time` is set.
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,

    /// Number of subbands carried by every input stream.
    pub nr_subbands: usize,

    /// Samples per channel in one window. Default: 3072.
    #[serde(default = "default_samples_per_channel")]
    pub samples_per_channel: usize,

    /// Channels per subband. Default: 64.
    #[serde(default = "default_nr_channels")]
    pub nr_channels: usize,

    /// Filter taps; `(taps - 1) * nr_channels` history samples. Default: 16.
    #[serde(default = "default_history_taps")]
    pub history_taps: usize,

    /// Ring buffer capacity in samples per subband.
    /// Default: `ring_buffer_duration` worth of samples.
    #[serde(default)]
    pub ring_buffer_samples: Option<usize>,

    /// Ring buffer capacity when `ring_buffer_samples` is unset. Default: 5s.
    #[serde(default = "default_ring_buffer_duration", with = "humantime_serde")]
    pub ring_buffer_duration: Duration,

    /// Bytes per sample per receiver (complex, both components). Default: 2.
    #[serde(default = "default_bytes_per_sample")]
    pub bytes_per_sample: usize,

    /// Time samples carried by one packet. Default: 2.
    #[serde(default = "default_times_per_packet")]
    pub times_per_packet: usize,

    /// Pace the run on the wall clock and prefer dropping over blocking.
    #[serde(default)]
    pub real_time: bool,

    /// Consecutive results summed into one emitted block. Default: 1.
    #[serde(default = "default_integration_factor")]
    pub integration_factor: usize,

    /// Result buffers per output subband. Default: 2.
    #[serde(default = "default_emission_pool_size")]
    pub emission_pool_size: usize,

    /// Extra wait for inputs without a producer. Default: 100ms.
    #[serde(default = "default_max_network_latency", with = "humantime_serde")]
    pub max_network_latency: Duration,

    /// Packets further than this from the wall clock are rejected in
    /// real-time mode. Default: 15s.
    #[serde(default = "default_max_timestamp_skew", with = "humantime_serde")]
    pub max_timestamp_skew: Duration,

    /// Samples held back from the writer after each window. Default: 20.
    #[serde(default = "default_read_margin_samples")]
    pub read_margin_samples: i64,

    /// Integer sample delay per receiver, applied when copying windows out.
    #[serde(default)]
    pub receiver_delays: Vec<i64>,

    /// Interval between valid-data reports. Default: 1s.
    #[serde(default = "default_log_interval", with = "humantime_serde")]
    pub log_interval: Duration,

    /// One entry per receiver group.
    pub inputs: Vec<InputConfig>,

    /// One entry per subband.
    pub outputs: Vec<OutputConfig>,

    /// One entry per compute worker. Default: a single worker at locality 0.
    #[serde(default = "default_workers")]
    pub workers: Vec<WorkerConfig>,
}

/// A receiver group delivered by one packet stream.
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// Stream descriptor (udp:HOST:PORT, file:PATH, null:).
    pub descriptor: String,

    /// Receivers carried by every packet of this stream.
    pub nr_receivers: usize,
}

/// Destination of one subband's results.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Stream descriptor (file:PATH, tcp:HOST:PORT, null:).
    pub descriptor: String,

    /// Subband center frequency in Hz, written into every header.
    #[serde(default)]
    pub center_frequency: f64,

    /// Locality hint matched against worker localities. Default: 0.
    #[serde(default)]
    pub locality: u32,
}

/// A compute worker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfig {
    /// Locality hint; workers prefer subbands whose output shares it.
    #[serde(default)]
    pub locality: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            clock_speed: default_clock_speed(),
            start_time: default_start_time(),
            stop_time: None,
            duration: None,
            nr_subbands: 1,
            samples_per_channel: default_samples_per_channel(),
            nr_channels: default_nr_channels(),
            history_taps: default_history_taps(),
            ring_buffer_samples: None,
            ring_buffer_duration: default_ring_buffer_duration(),
            bytes_per_sample: default_bytes_per_sample(),
            times_per_packet: default_times_per_packet(),
            real_time: false,
            integration_factor: default_integration_factor(),
            emission_pool_size: default_emission_pool_size(),
            max_network_latency: default_max_network_latency(),
            max_timestamp_skew: default_max_timestamp_skew(),
            read_margin_samples: default_read_margin_samples(),
            receiver_delays: Vec::new(),
            log_interval: default_log_interval(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            workers: default_workers(),
        }
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_clock_speed() -> u32 {
    200_000_000
}

fn default_start_time() -> String {
    "now".to_string()
}

fn default_samples_per_channel() -> usize {
    3072
}

fn default_nr_channels() -> usize {
    64
}

fn default_history_taps() -> usize {
    16
}

fn default_ring_buffer_duration() -> Duration {
    Duration::from_secs(5)
}

fn default_bytes_per_sample() -> usize {
    2
}

fn default_times_per_packet() -> usize {
    2
}

fn default_integration_factor() -> usize {
    1
}

fn default_emission_pool_size() -> usize {
    2
}

fn default_max_network_latency() -> Duration {
    Duration::from_millis(100)
}

fn default_max_timestamp_skew() -> Duration {
    Duration::from_secs(15)
}

fn default_read_margin_samples() -> i64 {
    20
}

fn default_log_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_workers() -> Vec<WorkerConfig> {
    vec![WorkerConfig::default()]
}

impl Config {
    /// Load and validate a configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Total receivers over all input groups.
    pub fn nr_receivers(&self) -> usize {
        self.inputs.iter().map(|i| i.nr_receivers).sum()
    }

    pub fn window_samples(&self) -> usize {
        self.samples_per_channel * self.nr_channels
    }

    pub fn history_samples(&self) -> usize {
        self.history_taps.saturating_sub(1) * self.nr_channels
    }

    pub fn ring_samples(&self) -> usize {
        self.ring_buffer_samples.unwrap_or_else(|| {
            duration_to_samples(self.ring_buffer_duration, self.clock_speed).max(0) as usize
        })
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.clock_speed == 0 {
            bail!("clock_speed must be positive");
        }

        if self.nr_subbands == 0 {
            bail!("nr_subbands must be positive");
        }

        if self.samples_per_channel == 0 || self.nr_channels == 0 {
            bail!("samples_per_channel and nr_channels must be positive");
        }

        if self.history_taps == 0 {
            bail!("history_taps must be positive");
        }

        if !matches!(self.bytes_per_sample, 2 | 4) {
            bail!(
                "bytes_per_sample must be 2 or 4, got {}",
                self.bytes_per_sample
            );
        }

        if self.times_per_packet == 0 {
            bail!("times_per_packet must be positive");
        }

        if self.integration_factor == 0 {
            bail!("integration_factor must be positive");
        }

        if self.emission_pool_size == 0 {
            bail!("emission_pool_size must be positive");
        }

        if self.read_margin_samples < 0 {
            bail!("read_margin_samples must not be negative");
        }

        if self.inputs.is_empty() {
            bail!("at least one input is required");
        }

        for (i, input) in self.inputs.iter().enumerate() {
            let descriptor: Descriptor = input
                .descriptor
                .parse()
                .with_context(|| format!("inputs[{i}].descriptor"))?;
            if !descriptor.is_input() {
                bail!("inputs[{i}].descriptor {descriptor} cannot be read from");
            }
            if input.nr_receivers == 0 {
                bail!("inputs[{i}].nr_receivers must be positive");
            }
        }

        if self.outputs.len() != self.nr_subbands {
            bail!(
                "expected one output per subband ({}), got {}",
                self.nr_subbands,
                self.outputs.len()
            );
        }

        for (i, output) in self.outputs.iter().enumerate() {
            let descriptor: Descriptor = output
                .descriptor
                .parse()
                .with_context(|| format!("outputs[{i}].descriptor"))?;
            if !descriptor.is_output() {
                bail!("outputs[{i}].descriptor {descriptor} cannot be written to");
            }
        }

        if self.workers.is_empty() {
            bail!("at least one worker is required");
        }

        let nr_receivers = self.nr_receivers();
        if !self.receiver_delays.is_empty() {
            if self.receiver_delays.len() != nr_receivers {
                bail!(
                    "receiver_delays has {} entries, expected {nr_receivers}",
                    self.receiver_delays.len()
                );
            }
            if self.receiver_delays.iter().any(|&d| d < 0) {
                bail!("receiver_delays must not be negative");
            }
        }

        let max_delay = self.receiver_delays.iter().copied().max().unwrap_or(0) as usize;
        let needed = self.window_samples() + self.history_samples() + max_delay;
        if self.ring_samples() < needed {
            bail!(
                "ring buffer holds {} samples but a window needs {needed}",
                self.ring_samples()
            );
        }

        if self.stop_time.is_some() && self.duration.is_some() {
            bail!("stop_time and duration are mutually exclusive");
        }

        Ok(())
    }

    /// Resolve the run parameters shared by every pipeline stage.
    pub fn params(&self) -> Result<Params> {
        let window_samples = self.window_samples() as i64;
        let start_time = if self.start_time.trim() == "now" {
            // Align to the next whole window.
            let now = TimeStamp::now(self.clock_speed);
            now.with_time((now.time() / window_samples + 1) * window_samples)
        } else {
            TimeStamp::from_date(&self.start_time, self.clock_speed)
                .context("parsing start_time")?
        };

        let stop_time = match (&self.stop_time, self.duration) {
            (Some(stop), _) => {
                TimeStamp::from_date(stop, self.clock_speed).context("parsing stop_time")?
            }
            (None, Some(duration)) => {
                start_time + duration_to_samples(duration, self.clock_speed)
            }
            (None, None) => TimeStamp::max(self.clock_speed),
        };

        if stop_time < start_time {
            bail!("stop_time {stop_time} is before start_time {start_time}");
        }

        Ok(Params {
            clock_speed: self.clock_speed,
            start_time,
            stop_time,
            nr_subbands: self.nr_subbands,
            nr_receivers: self.nr_receivers(),
            window_samples,
            history_samples: self.history_samples() as i64,
            ring_samples: self.ring_samples(),
            bytes_per_sample: self.bytes_per_sample,
            times_per_packet: self.times_per_packet,
            real_time: self.real_time,
            integration_factor: self.integration_factor,
            emission_pool_size: self.emission_pool_size,
            max_network_latency: duration_to_samples(self.max_network_latency, self.clock_speed),
            max_timestamp_skew: duration_to_samples(self.max_timestamp_skew, self.clock_speed),
            read_margin: self.read_margin_samples,
            receiver_delays: self.receiver_delays.clone(),
            log_interval: self.log_interval,
        })
    }
}

/// Resolved, immutable parameters of one run, in samples.
#[derive(Debug, Clone)]
pub struct Params {
    pub clock_speed: u32,
    pub start_time: TimeStamp,
    pub stop_time: TimeStamp,
    pub nr_subbands: usize,
    pub nr_receivers: usize,
    /// Active samples per window.
    pub window_samples: i64,
    /// Samples preceding the active region of every window.
    pub history_samples: i64,
    pub ring_samples: usize,
    pub bytes_per_sample: usize,
    pub times_per_packet: usize,
    pub real_time: bool,
    pub integration_factor: usize,
    pub emission_pool_size: usize,
    pub max_network_latency: i64,
    pub max_timestamp_skew: i64,
    pub read_margin: i64,
    pub receiver_delays: Vec<i64>,
    pub log_interval: Duration,
}

impl Params {
    pub fn timestamp(&self, time: i64) -> TimeStamp {
        TimeStamp::new(time, self.clock_speed)
    }

    /// Largest configured receiver delay.
    pub fn max_delay(&self) -> i64 {
        self.receiver_delays.iter().copied().max().unwrap_or(0)
    }

    /// Delay of one receiver, zero when compensation is off.
    pub fn delay_of(&self, receiver: usize) -> i64 {
        self.receiver_delays.get(receiver).copied().unwrap_or(0)
    }
}

impl Default for Params {
    fn default() -> Self {
        let clock_speed = 1024;

        Self {
            clock_speed,
            start_time: TimeStamp::new(0, clock_speed),
            stop_time: TimeStamp::max(clock_speed),
            nr_subbands: 1,
            nr_receivers: 1,
            window_samples: 8,
            history_samples: 0,
            ring_samples: 64,
            bytes_per_sample: default_bytes_per_sample(),
            times_per_packet: default_times_per_packet(),
            real_time: false,
            integration_factor: default_integration_factor(),
            emission_pool_size: default_emission_pool_size(),
            max_network_latency: 0,
            max_timestamp_skew: 15,
            read_margin: default_read_margin_samples(),
            receiver_delays: Vec::new(),
            log_interval: default_log_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            nr_subbands: 2,
            samples_per_channel: 8,
            nr_channels: 4,
            history_taps: 3,
            ring_buffer_samples: Some(1024),
            start_time: "2024-01-01 00:00:00".to_string(),
            duration: Some(Duration::from_secs(60)),
            inputs: vec![
                InputConfig {
                    descriptor: "udp:0.0.0.0:4000".to_string(),
                    nr_receivers: 3,
                },
                InputConfig {
                    descriptor: "file:/data/group1.raw".to_string(),
                    nr_receivers: 2,
                },
            ],
            outputs: vec![
                OutputConfig {
                    descriptor: "file:/data/sb0.vis".to_string(),
                    center_frequency: 58e6,
                    locality: 0,
                },
                OutputConfig {
                    descriptor: "null:".to_string(),
                    center_frequency: 58.2e6,
                    locality: 1,
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.clock_speed, 200_000_000);
        assert_eq!(cfg.times_per_packet, 2);
        assert_eq!(cfg.read_margin_samples, 20);
        assert_eq!(cfg.max_timestamp_skew, Duration::from_secs(15));
        assert_eq!(cfg.workers.len(), 1);
    }

    #[test]
    fn test_valid_config_passes() {
        valid_config().validate().expect("valid config");
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
nr_subbands: 1
clock_speed: 1024
samples_per_channel: 16
nr_channels: 1
history_taps: 5
ring_buffer_samples: 64
real_time: true
max_network_latency: 250ms
start_time: "2024-01-01 00:00:00"
stop_time: "2024-01-01 00:01:00"
inputs:
  - descriptor: "udp:127.0.0.1:4000"
    nr_receivers: 2
outputs:
  - descriptor: "null:"
    center_frequency: 1.5e6
workers:
  - locality: 0
  - locality: 1
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        cfg.validate().expect("valid config");

        assert!(cfg.real_time);
        assert_eq!(cfg.max_network_latency, Duration::from_millis(250));
        assert_eq!(cfg.workers.len(), 2);
        assert_eq!(cfg.history_samples(), 4);

        let params = cfg.params().expect("params");
        assert_eq!(params.stop_time - params.start_time, 60);
        assert_eq!(params.window_samples, 16);
        assert_eq!(params.nr_receivers, 2);
    }

    #[test]
    fn test_params_geometry() {
        let params = valid_config().params().expect("params");
        assert_eq!(params.window_samples, 32);
        assert_eq!(params.history_samples, 8);
        assert_eq!(params.nr_receivers, 5);
        assert_eq!(
            params.stop_time - params.start_time,
            duration_to_samples(Duration::from_secs(60), params.clock_speed)
        );
    }

    #[test]
    fn test_start_now_is_window_aligned() {
        let cfg = Config {
            start_time: "now".to_string(),
            ..valid_config()
        };
        let params = cfg.params().expect("params");
        assert_eq!(params.start_time.time() % params.window_samples, 0);
        assert!(params.start_time > TimeStamp::now(cfg.clock_speed) - params.window_samples);
    }

    #[test]
    fn test_missing_output_per_subband() {
        let mut cfg = valid_config();
        cfg.outputs.pop();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("one output per subband"));
    }

    #[test]
    fn test_input_descriptor_role() {
        let mut cfg = valid_config();
        cfg.inputs[0].descriptor = "tcp:localhost:9000".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unsupported_sample_size() {
        let cfg = Config {
            bytes_per_sample: 3,
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("bytes_per_sample"));

        for bytes_per_sample in [2, 4] {
            Config {
                bytes_per_sample,
                ..valid_config()
            }
            .validate()
            .expect("supported sample size");
        }
    }

    #[test]
    fn test_ring_too_small() {
        let cfg = Config {
            ring_buffer_samples: Some(16),
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("ring buffer"));
    }

    #[test]
    fn test_receiver_delays_validated() {
        let mut cfg = valid_config();
        cfg.receiver_delays = vec![0, 1];
        assert!(cfg.validate().is_err());

        cfg.receiver_delays = vec![0, 1, 2, 3, -1];
        assert!(cfg.validate().is_err());

        cfg.receiver_delays = vec![0, 1, 2, 3, 4];
        cfg.validate().expect("valid delays");
        assert_eq!(cfg.params().expect("params").max_delay(), 4);
    }

    #[test]
    fn test_stop_before_start() {
        let cfg = Config {
            duration: None,
            stop_time: Some("2023-12-31 23:59:59".to_string()),
            ..valid_config()
        };
        assert!(cfg.params().is_err());
    }
}
