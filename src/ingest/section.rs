use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info};

use super::packet::PacketLayout;
use super::source::{open_source, PacketSource};
use super::stats::IngestSnapshot;
use super::{GroupSpec, IngestionBuffer};
use crate::clock::TimeStamp;
use crate::compute::Window;
use crate::config::{InputConfig, Params};
use crate::descriptor::Descriptor;
use crate::interval::IntervalSet;
use crate::pipeline::ReadTransactions;

/// An opened input stream and the receivers it carries.
pub struct InputStream {
    pub nr_receivers: usize,
    pub source: Box<dyn PacketSource>,
    /// Pace readers on the wall clock; used for inputs without a producer.
    pub wall_clock_paced: bool,
}

/// One [`IngestionBuffer`] per receiver group, sharing one time axis.
pub struct IngestionSection {
    params: Arc<Params>,
    buffers: Vec<IngestionBuffer>,
}

impl IngestionSection {
    /// Open every configured input and start its buffer.
    pub fn open(params: Arc<Params>, inputs: &[InputConfig]) -> Result<Self> {
        let mut streams = Vec::with_capacity(inputs.len());

        for input in inputs {
            let descriptor: Descriptor = input
                .descriptor
                .parse()
                .with_context(|| format!("parsing input descriptor {:?}", input.descriptor))?;

            let layout = PacketLayout {
                times_per_packet: params.times_per_packet,
                nr_subbands: params.nr_subbands,
                nr_receivers: input.nr_receivers,
                bytes_per_sample: params.bytes_per_sample,
            };

            streams.push(InputStream {
                nr_receivers: input.nr_receivers,
                source: open_source(&descriptor, layout)?,
                wall_clock_paced: matches!(descriptor, Descriptor::Null),
            });
        }

        Self::with_streams(params, streams)
    }

    /// Start one buffer per already-opened stream.
    pub fn with_streams(params: Arc<Params>, streams: Vec<InputStream>) -> Result<Self> {
        let total: usize = streams.iter().map(|s| s.nr_receivers).sum();
        if total != params.nr_receivers {
            bail!(
                "input streams carry {total} receivers, expected {}",
                params.nr_receivers
            );
        }

        let mut buffers = Vec::with_capacity(streams.len());
        let mut first_receiver = 0;

        for (index, stream) in streams.into_iter().enumerate() {
            let group = GroupSpec {
                index,
                first_receiver,
                nr_receivers: stream.nr_receivers,
                wall_clock_paced: stream.wall_clock_paced,
            };

            buffers.push(IngestionBuffer::start(Arc::clone(&params), group, stream.source)?);
            first_receiver += stream.nr_receivers;
        }

        info!(
            groups = buffers.len(),
            receivers = first_receiver,
            subbands = params.nr_subbands,
            "ingestion section started",
        );

        Ok(Self { params, buffers })
    }

    pub fn buffers(&self) -> &[IngestionBuffer] {
        &self.buffers
    }

    /// Group holding a global receiver index.
    pub fn group_of(&self, receiver: usize) -> usize {
        self.buffers
            .iter()
            .position(|b| {
                let g = b.group();
                (g.first_receiver..g.first_receiver + g.nr_receivers).contains(&receiver)
            })
            .unwrap_or(0)
    }

    /// Zero the invalid samples of one window and return each group's
    /// valid data within it.
    pub fn fill_in_missing_samples(&self, time: TimeStamp, subband: usize) -> Vec<IntervalSet<TimeStamp>> {
        self.buffers
            .iter()
            .map(|b| b.fill_in_missing_samples(time, subband))
            .collect()
    }

    /// Copy every receiver's window samples into `window`.
    ///
    /// Receiver `r` is read from `[time - history - d, time + window - d)`
    /// where `d` is its configured delay; the window always holds
    /// `history + window` samples per receiver.
    pub fn copy_out(&self, time: TimeStamp, subband: usize, window: &mut Window) {
        let p = &self.params;

        window.time = time;
        window.subband = subband;
        window.data.clear();

        for buffer in &self.buffers {
            let group = buffer.group();

            for local in 0..group.nr_receivers {
                let delay = p.delay_of(group.first_receiver + local);
                let begin = time - p.history_samples - delay;
                let end = time + p.window_samples - delay;
                buffer.copy_out(subband, local, begin, end, &mut window.data);
            }
        }
    }

    /// Whether every group's stream has ended before the window at `time`.
    ///
    /// Wall-clock paced groups never end.
    pub fn inputs_exhausted(&self, time: TimeStamp) -> bool {
        self.buffers.iter().all(|b| b.is_exhausted_before(time))
    }

    /// Counters summed over all groups.
    pub fn stats(&self) -> IngestSnapshot {
        self.buffers.iter().fold(IngestSnapshot::default(), |acc, b| {
            let s = b.stats();
            IngestSnapshot {
                packets: acc.packets + s.packets,
                rejected: acc.rejected + s.rejected,
                malformed: acc.malformed + s.malformed,
                stale_samples: acc.stale_samples + s.stale_samples,
                written_samples: acc.written_samples + s.written_samples,
                writes: acc.writes + s.writes,
                forced_advances: acc.forced_advances + s.forced_advances,
            }
        })
    }

    /// Unblock everything waiting on ingestion without joining.
    pub fn release(&self) {
        for buffer in &self.buffers {
            buffer.release();
        }
    }

    /// Stop and join every buffer, returning the first failure.
    pub fn shutdown(&self) -> Result<()> {
        let mut first_error = None;

        for buffer in &self.buffers {
            if let Err(e) = buffer.shutdown() {
                error!(group = %buffer.name(), error = %e, "failed to stop ingestion buffer");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl ReadTransactions for IngestionSection {
    fn start_read_transaction(&self, time: TimeStamp) {
        for buffer in &self.buffers {
            buffer.start_read_transaction(time);
        }
    }

    fn end_read_transaction(&self, time: TimeStamp) {
        for buffer in &self.buffers {
            buffer.end_read_transaction(time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::packet::{encode_packet, PacketHeader};
    use super::super::source::{PacketBatch, SourceError};
    use super::*;

    struct OneShot {
        packets: Option<Vec<Vec<u8>>>,
    }

    impl PacketSource for OneShot {
        fn recv_batch(&mut self, batch: &mut PacketBatch) -> Result<(), SourceError> {
            let packets = self.packets.take().ok_or(SourceError::EndOfStream)?;
            for p in &packets {
                batch.push(p);
            }
            Ok(())
        }
    }

    /// Packets for one receiver whose sample at time `t` is `[t, t]`.
    fn stream(times: std::ops::Range<i64>) -> InputStream {
        let packets = times
            .step_by(2)
            .map(|ts| {
                let header = PacketHeader {
                    timestamp: ts,
                    group: 0,
                    nr_subbands: 1,
                };
                encode_packet(&header, &[ts as u8, ts as u8, ts as u8 + 1, ts as u8 + 1])
            })
            .collect();

        InputStream {
            nr_receivers: 1,
            source: Box::new(OneShot {
                packets: Some(packets),
            }),
            wall_clock_paced: false,
        }
    }

    fn params(delays: Vec<i64>) -> Arc<Params> {
        Arc::new(Params {
            nr_receivers: 2,
            window_samples: 4,
            history_samples: 2,
            ring_samples: 64,
            read_margin: 0,
            receiver_delays: delays,
            ..Params::default()
        })
    }

    fn drained(params: Arc<Params>) -> IngestionSection {
        let section =
            IngestionSection::with_streams(params, vec![stream(0..32), stream(0..32)]).expect("section");

        // Both streams end immediately; wait until everything is written.
        section.start_read_transaction(TimeStamp::new(i64::MAX - 1024, 1024));
        section
    }

    #[test]
    fn test_receiver_count_must_match() {
        let err = IngestionSection::with_streams(params(vec![]), vec![stream(0..4)])
            .err()
            .expect("mismatch");
        assert!(err.to_string().contains("expected 2"));
    }

    #[test]
    fn test_copy_out_without_delays() {
        let section = drained(params(vec![]));
        let mut window = Window::new(2, 6, 2, 2);

        section.copy_out(TimeStamp::new(10, 1024), 0, &mut window);

        let expected: Vec<u8> = (8..14).flat_map(|t| [t, t]).collect();
        assert_eq!(window.receiver(0), expected.as_slice());
        assert_eq!(window.receiver(1), expected.as_slice());
        section.shutdown().expect("shutdown");
    }

    #[test]
    fn test_copy_out_applies_delay_shift() {
        let section = drained(params(vec![0, 3]));
        let mut window = Window::new(2, 6, 2, 2);

        section.copy_out(TimeStamp::new(10, 1024), 0, &mut window);

        let r0: Vec<u8> = (8..14).flat_map(|t| [t, t]).collect();
        let r1: Vec<u8> = (5..11).flat_map(|t| [t, t]).collect();
        assert_eq!(window.receiver(0), r0.as_slice());
        assert_eq!(window.receiver(1), r1.as_slice());
        section.shutdown().expect("shutdown");
    }

    #[test]
    fn test_fill_in_missing_samples_per_group() {
        let section = drained(params(vec![]));

        let valid = section.fill_in_missing_samples(TimeStamp::new(30, 1024), 0);

        // Window reads [28, 34); only [28, 32) was received.
        assert_eq!(valid.len(), 2);
        assert!(valid.iter().all(|v| v.count() == 4));
        assert_eq!(section.group_of(1), 1);
        section.shutdown().expect("shutdown");
    }

    #[test]
    fn test_inputs_exhausted_needs_every_group() {
        let section = drained(params(vec![]));

        // Written up to 32; the window at 34 reads from 32 on.
        assert!(section.inputs_exhausted(TimeStamp::new(34, 1024)));
        assert!(!section.inputs_exhausted(TimeStamp::new(30, 1024)));
        section.shutdown().expect("shutdown");
    }
}
