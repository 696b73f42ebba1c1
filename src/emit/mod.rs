pub mod result;
pub mod section;

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::{subband_bandwidth, TimeStamp};
use crate::config::Params;
use crate::sync::{BoundedQueue, Watermark};

use self::result::{CorrelationResult, StreamInfo};

/// Output of one subband.
pub struct EmissionBuffer {
    shared: Arc<EmissionShared>,
    writer: Mutex<Option<JoinHandle<Result<()>>>>,
}

struct EmissionShared {
    subband: usize,
    clock_speed: u32,
    window_samples: i64,
    integration_factor: usize,
    real_time: bool,
    info: StreamInfo,
    /// End of the last window admitted to `pending`.
    current: Watermark<TimeStamp>,
    free: BoundedQueue<CorrelationResult>,
    pending: BoundedQueue<CorrelationResult>,
    released: AtomicBool,
    dropped: AtomicU64,
    emitted: AtomicU64,
}

impl EmissionBuffer {
    /// Allocate the result pool and start the writer thread.
    pub fn start(
        params: &Params,
        subband: usize,
        center_frequency: f64,
        sink: Box<dyn Write + Send>,
    ) -> Result<Self> {
        // The writer holds one buffer while integrating; workers need another.
        let pool_size = params.emission_pool_size.max(2);
        let integration_factor = params.integration_factor.max(1);

        let free = BoundedQueue::new(pool_size, false);
        for _ in 0..pool_size {
            free.append(CorrelationResult::new(subband, params.nr_receivers, params.clock_speed));
        }

        let shared = Arc::new(EmissionShared {
            subband,
            clock_speed: params.clock_speed,
            window_samples: params.window_samples,
            integration_factor,
            real_time: params.real_time,
            info: StreamInfo {
                nr_samples_per_integration: (params.window_samples as usize * integration_factor)
                    as u32,
                integration_factor: integration_factor as u32,
                center_frequency,
                bandwidth: subband_bandwidth(params.clock_speed) as f64,
            },
            current: Watermark::new(params.start_time),
            free,
            pending: BoundedQueue::new(pool_size, false),
            released: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
        });

        let writer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("emit-{subband}"))
                .spawn(move || shared.run_writer(sink))
                .with_context(|| format!("spawning writer for subband {subband}"))?
        };

        Ok(Self {
            shared,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn subband(&self) -> usize {
        self.shared.subband
    }

    /// A cleared-or-reusable result buffer.
    ///
    /// In real-time mode an exhausted pool steals the oldest pending result
    /// instead of waiting for the writer. Returns `None` once released.
    pub fn get_free_buffer(&self) -> Option<CorrelationResult> {
        let s = &self.shared;

        if let Some(buffer) = s.free.try_remove() {
            return Some(buffer);
        }

        if s.real_time {
            if let Some(buffer) = s.pending.try_remove() {
                s.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subband = s.subband,
                    start = %buffer.start,
                    "output too slow, dropping result block",
                );
                return Some(buffer);
            }
        }

        s.free.remove()
    }

    /// Admit the result for the window at `time` once every earlier window
    /// has been admitted; `None` marks a skipped window.
    pub fn put_result(&self, result: Option<CorrelationResult>, time: TimeStamp) {
        let s = &self.shared;

        s.current.wait_for(time);

        if let Some(result) = result {
            if s.released.load(Ordering::Acquire) {
                s.free.append(result);
            } else {
                s.pending.append(result);
            }
        }

        s.current.advance_to(time + s.window_samples);
    }

    /// True once the buffer stopped accepting results.
    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::Acquire)
    }

    /// Unblock every caller; later results are discarded.
    pub fn release(&self) {
        self.shared.release();
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn emitted(&self) -> u64 {
        self.shared.emitted.load(Ordering::Relaxed)
    }

    /// Write out everything pending and stop the writer.
    pub fn finish(&self) -> Result<()> {
        self.shared.pending.no_more();

        let Some(handle) = self.writer.lock().take() else {
            return Ok(());
        };

        let result = match handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow!("writer for subband {} panicked", self.shared.subband)),
        };

        info!(
            subband = self.shared.subband,
            emitted = self.emitted(),
            dropped = self.dropped(),
            "output closed",
        );

        result
    }
}

impl Drop for EmissionBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(subband = self.shared.subband, error = %e, "output dropped with error");
        }
    }
}

impl EmissionShared {
    fn release(&self) {
        self.released.store(true, Ordering::Release);
        self.current.advance_to(TimeStamp::max(self.clock_speed));
        self.pending.no_more();
        self.free.no_more();
    }

    fn run_writer(&self, sink: Box<dyn Write + Send>) -> Result<()> {
        let result = self.write_loop(sink);

        if let Err(e) = &result {
            error!(subband = self.subband, error = %e, "writing output failed");
            self.release();
        }

        result
    }

    fn write_loop(&self, mut sink: Box<dyn Write + Send>) -> Result<()> {
        let mut encoded = Vec::new();

        'blocks: while let Some(mut integrated) = self.pending.remove() {
            for _ in 1..self.integration_factor {
                let Some(next) = self.pending.remove() else {
                    debug!(subband = self.subband, "discarding partial integration at end of run");
                    break 'blocks;
                };
                integrated.accumulate(&next);
                self.free.append(next);
            }

            encoded.clear();
            integrated.encode(&self.info, &mut encoded);
            sink.write_all(&encoded)
                .with_context(|| format!("writing block for subband {}", self.subband))?;

            self.emitted.fetch_add(1, Ordering::Relaxed);
            self.free.append(integrated);
        }

        sink.flush()
            .with_context(|| format!("flushing output for subband {}", self.subband))
    }
}
