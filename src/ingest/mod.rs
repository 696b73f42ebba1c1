pub mod packet;
pub mod reassembly;
pub mod ring;
pub mod section;
pub mod source;
pub mod stats;

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::{subband_bandwidth, TimeStamp, WallClock};
use crate::config::Params;
use crate::interval::IntervalSet;
use crate::sync::{ReaderWriterSynchronization, StopFlag, Synchronizer};

use self::packet::{PacketLayout, HEADER_SIZE, MAX_PACKET_SIZE};
use self::reassembly::Reassembler;
use self::ring::RingBuffer;
use self::source::{PacketBatch, PacketSource, SourceError, MAX_PACKETS_PER_BATCH};
use self::stats::{IngestSnapshot, IngestStats};

/// Valid-data ranges tracked before new runs must abut the last one.
pub const MAX_VALID_RANGES: usize = 16;

/// Receivers delivered by one packet stream.
#[derive(Debug, Clone, Copy)]
pub struct GroupSpec {
    pub index: usize,
    pub first_receiver: usize,
    pub nr_receivers: usize,
    /// Pace readers on the wall clock instead of on the writer.
    pub wall_clock_paced: bool,
}

type ThreadHandle = (&'static str, JoinHandle<Result<()>>);

/// Rings, valid-data bookkeeping and threads of one receiver group.
pub struct IngestionBuffer {
    shared: Arc<BufferShared>,
    threads: Mutex<Vec<ThreadHandle>>,
}

struct BufferShared {
    name: String,
    params: Arc<Params>,
    group: GroupSpec,
    layout: PacketLayout,
    rings: Vec<RingBuffer>,
    sync: Synchronizer,
    valid: Mutex<IntervalSet<TimeStamp>>,
    latest_write: Mutex<TimeStamp>,
    /// Set once the ingestion thread has returned.
    finished: AtomicBool,
    stop: StopFlag,
    wall_clock: WallClock,
    stats: IngestStats,
}

impl IngestionBuffer {
    /// Allocate the rings and start the group's threads.
    pub fn start(
        params: Arc<Params>,
        group: GroupSpec,
        source: Box<dyn PacketSource>,
    ) -> Result<Self> {
        let name = format!(
            "receivers {}-{}",
            group.first_receiver,
            group.first_receiver + group.nr_receivers - 1
        );

        let sync = if group.wall_clock_paced {
            Synchronizer::wall_clock_paced(params.max_network_latency)
        } else {
            let initial_read = params.start_time
                - params.history_samples
                - params.max_delay()
                - params.read_margin;
            Synchronizer::ring_buffered(params.ring_samples, initial_read)
        };

        let layout = PacketLayout {
            times_per_packet: params.times_per_packet,
            nr_subbands: params.nr_subbands,
            nr_receivers: group.nr_receivers,
            bytes_per_sample: params.bytes_per_sample,
        };

        let rings = (0..params.nr_subbands)
            .map(|_| RingBuffer::new(group.nr_receivers, params.ring_samples, params.bytes_per_sample))
            .collect();

        let shared = Arc::new(BufferShared {
            name,
            latest_write: Mutex::new(TimeStamp::min(params.clock_speed)),
            params,
            group,
            layout,
            rings,
            sync,
            valid: Mutex::new(IntervalSet::new()),
            finished: AtomicBool::new(false),
            stop: StopFlag::new(),
            wall_clock: WallClock::new(),
            stats: IngestStats::new(),
        });

        let buffer = Self {
            shared,
            threads: Mutex::new(Vec::with_capacity(3)),
        };

        // Threads are joined in the order they are pushed here.
        if buffer.shared.params.real_time {
            let shared = Arc::clone(&buffer.shared);
            buffer.spawn("synthetic-advance", move || {
                shared.synthetic_advance_loop();
                Ok(())
            })?;
        }

        let shared = Arc::clone(&buffer.shared);
        buffer.spawn("log", move || {
            shared.log_loop();
            Ok(())
        })?;

        let shared = Arc::clone(&buffer.shared);
        buffer.spawn("ingest", move || shared.run_ingestion(source))?;

        info!(
            group = %buffer.shared.name,
            ring_samples = buffer.shared.params.ring_samples,
            paced = group.wall_clock_paced,
            "ingestion buffer started",
        );

        Ok(buffer)
    }

    fn spawn<F>(&self, role: &'static str, body: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("{role}-{}", self.shared.group.index))
            .spawn(body)
            .with_context(|| format!("spawning {role} thread for {}", self.shared.name))?;

        self.threads.lock().push((role, handle));
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn group(&self) -> GroupSpec {
        self.shared.group
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.shared.sync
    }

    pub fn stats(&self) -> IngestSnapshot {
        self.shared.stats.snapshot()
    }

    /// Copy of the full valid-data set.
    pub fn valid_data(&self) -> IntervalSet<TimeStamp> {
        self.shared.valid.lock().clone()
    }

    /// Valid data inside `[begin, end)`.
    pub fn current_valid_data(&self, begin: TimeStamp, end: TimeStamp) -> IntervalSet<TimeStamp> {
        self.shared.valid.lock().subset(begin, end)
    }

    /// Window bounds `[early, end)` read for a window starting at `time`.
    fn read_bounds(&self, time: TimeStamp) -> (TimeStamp, TimeStamp) {
        let p = &self.shared.params;
        (
            time - p.history_samples - p.max_delay(),
            time + p.window_samples,
        )
    }

    /// Whether ingestion has ended without writing anything the window at
    /// `time`, or any later window, reads.
    pub fn is_exhausted_before(&self, time: TimeStamp) -> bool {
        if !self.shared.finished.load(Ordering::Acquire) {
            return false;
        }
        let (early, _) = self.read_bounds(time);
        *self.shared.latest_write.lock() <= early
    }

    /// Zero the invalid parts of the window at `time` and return the valid part.
    pub fn fill_in_missing_samples(&self, time: TimeStamp, subband: usize) -> IntervalSet<TimeStamp> {
        let (early, end) = self.read_bounds(time);
        let valid = self.current_valid_data(early, end);
        let flagged = valid.invert(early, end);

        if let Some(ring) = self.shared.rings.get(subband) {
            for r in &flagged {
                ring.zero(r.start, r.end);
            }
        }

        if subband == 0 {
            let span = (end - early).max(1);
            debug!(
                group = %self.shared.name,
                time = %early,
                flagged_pct = 100.0 * flagged.count() as f64 / span as f64,
                flagged_ranges = flagged.len(),
                "window validity",
            );
        }

        valid
    }

    pub fn start_read_transaction(&self, time: TimeStamp) {
        let (early, end) = self.read_bounds(time);
        self.shared.sync.start_read(early, end);
    }

    pub fn end_read_transaction(&self, time: TimeStamp) {
        let p = &self.shared.params;
        let (_, end) = self.read_bounds(time);
        self.shared
            .sync
            .finished_read(end - p.history_samples - p.max_delay() - p.read_margin);
    }

    /// Append one local receiver's samples for `[begin, end)` to `out`.
    pub fn copy_out(
        &self,
        subband: usize,
        receiver: usize,
        begin: TimeStamp,
        end: TimeStamp,
        out: &mut Vec<u8>,
    ) {
        if let Some(ring) = self.shared.rings.get(subband) {
            ring.copy_out(receiver, begin, end, out);
        }
    }

    /// Ask every thread to stop and unblock readers waiting for data.
    ///
    /// Does not wait; [`IngestionBuffer::shutdown`] joins afterwards.
    pub fn release(&self) {
        self.shared.stop.set();
        self.shared.sync.no_more_reading();
        self.shared.sync.no_more_writing();
        self.shared.wall_clock.cancel();
    }

    /// Stop all threads and wait for them in their declared order.
    pub fn shutdown(&self) -> Result<()> {
        let threads = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            return Ok(());
        }

        self.shared.stop.set();
        self.shared.sync.no_more_reading();
        self.shared.wall_clock.cancel();

        let mut first_error = None;

        for (role, handle) in threads {
            let outcome = match handle.join() {
                Ok(result) => result.with_context(|| format!("{role} thread failed")),
                Err(_) => Err(anyhow!("{role} thread panicked")),
            };

            if let Err(e) = outcome {
                error!(group = %self.shared.name, error = %e, "ingestion thread error");
                first_error.get_or_insert(e);
            }
        }

        debug!(group = %self.shared.name, "ingestion buffer stopped");

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for IngestionBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(group = %self.shared.name, error = %e, "ingestion buffer dropped with error");
        }
    }
}

impl BufferShared {
    fn run_ingestion(&self, source: Box<dyn PacketSource>) -> Result<()> {
        let result = self.ingest_loop(source);

        // Readers must never wait for data this thread will not write.
        self.finished.store(true, Ordering::Release);
        self.sync.no_more_writing();

        if let Err(e) = &result {
            error!(group = %self.name, error = %e, "ingestion stopped");
        }

        result
    }

    fn ingest_loop(&self, mut source: Box<dyn PacketSource>) -> Result<()> {
        let p = &self.params;
        let stop_time = (p.stop_time + p.window_samples).time();
        let max_skew = p.real_time.then_some(p.max_timestamp_skew);

        let mut reassembler = Reassembler::new(p.times_per_packet, max_skew);
        let slot_size = self.layout.packet_size().max(MAX_PACKET_SIZE);
        let mut batch = PacketBatch::new(MAX_PACKETS_PER_BATCH, slot_size);
        let mut timestamps = Vec::with_capacity(MAX_PACKETS_PER_BATCH);
        let mut runs = Vec::new();

        loop {
            batch.clear();

            match source.recv_batch(&mut batch) {
                Ok(()) | Err(SourceError::Timeout) => {}
                Err(SourceError::EndOfStream) => {
                    info!(group = %self.name, "end of stream");
                    self.stop.set();
                }
                Err(SourceError::Io(e)) => {
                    return Err(e).with_context(|| format!("receiving packets for {}", self.name));
                }
            }

            if !batch.is_empty() {
                self.stats.record_packets(batch.len() as u64);

                timestamps.clear();
                for packet in batch.iter() {
                    match self.layout.check(packet) {
                        Ok(header) => timestamps.push(Some(header.timestamp)),
                        Err(e) => {
                            debug!(group = %self.name, error = %e, "dropping malformed packet");
                            timestamps.push(None);
                        }
                    }
                }

                let now = if p.real_time {
                    TimeStamp::now(p.clock_speed).time()
                } else {
                    0
                };

                runs.clear();
                let outcome = reassembler.split_runs(&timestamps, now, &mut runs);

                if let Some(ts) = outcome.onset {
                    warn!(group = %self.name, timestamp = ts, "impossible timestamp, rejecting packets");
                }
                for _ in 0..outcome.rejected {
                    self.stats.record_rejected();
                }
                for _ in 0..outcome.malformed {
                    self.stats.record_malformed();
                }

                for run in &runs {
                    if let Some(begin) = timestamps[run.start] {
                        self.write_run(&batch, run.clone(), p.timestamp(begin));
                    }
                }
            }

            if self.stop.is_set() || reassembler.last_timestamp() >= stop_time {
                return Ok(());
            }
        }
    }

    /// Copy a contiguous run of packets into the rings.
    fn write_run(&self, batch: &PacketBatch, run: Range<usize>, begin: TimeStamp) {
        let tpp = self.layout.times_per_packet;
        let block = self.layout.block_size();
        let nr_times = (run.len() * tpp) as i64;
        let end = begin + nr_times;

        let mut latest = self.latest_write.lock();

        if begin < *latest {
            self.stats.record_stale(nr_times as u64);
            return;
        }

        *latest = end;
        self.sync.start_write(begin, end);

        for (subband, ring) in self.rings.iter().enumerate() {
            let mut writer = ring.writer();

            for (k, index) in run.clone().enumerate() {
                let payload = &batch.get(index)[HEADER_SIZE..];

                for t in 0..tpp {
                    let offset = self.layout.block_offset(t, subband);
                    let time = begin + (k * tpp + t) as i64;
                    writer.store(time, &payload[offset..offset + block]);
                }
            }
        }

        {
            let mut valid = self.valid.lock();
            valid.exclude_below(end - self.params.ring_samples as i64);

            let abuts = valid.last().is_some_and(|r| r.end == begin);
            if valid.len() < MAX_VALID_RANGES || abuts {
                valid.include(begin, end);
            }
        }

        self.sync.finished_write(end);
        self.stats.record_write(nr_times as u64);
    }

    fn log_loop(&self) {
        while !self.stop.wait_timeout(self.params.log_interval) {
            let valid = self.valid.lock().clone();
            let stats = self.stats.snapshot();

            info!(
                group = %self.name,
                valid = %valid,
                packets = stats.packets,
                rejected = stats.rejected,
                stale_samples = stats.stale_samples,
                forced_advances = stats.forced_advances,
                "ingestion status",
            );
        }
    }

    /// Force empty writes so readers keep moving while no data arrives.
    fn synthetic_advance_loop(&self) {
        let p = &self.params;
        let bandwidth = subband_bandwidth(p.clock_speed).max(1);
        let step = (bandwidth / 10).max(1);
        let lead = bandwidth / 3;
        let last = p.stop_time + p.window_samples * p.integration_factor as i64;

        let mut late = false;
        let mut time = p.start_time;

        while time < last && !self.stop.is_set() {
            if !self.wall_clock.wait_until(time + lead) {
                break;
            }

            let mut latest = self.latest_write.lock();

            if *latest < time {
                self.sync.start_write(*latest, time);
                self.sync.finished_write(time);
                *latest = time;
                self.stats.record_forced_advance();

                if !late {
                    warn!(group = %self.name, time = %time, "forcing correlator to continue without data");
                    late = true;
                }
            } else if late {
                info!(group = %self.name, time = %time, "resumed normal operation");
                late = false;
            }

            drop(latest);
            time += step;
        }

        self.sync.no_more_writing();
    }
}
