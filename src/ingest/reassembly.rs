use std::ops::Range;

/// Result of splitting one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SplitOutcome {
    /// Packets rejected for an implausible timestamp.
    pub rejected: u64,
    /// Packets that failed to decode.
    pub malformed: u64,
    /// Timestamp that started a new implausible streak, to be logged once.
    pub onset: Option<i64>,
}

/// Tracks the expected next timestamp across batches.
///
/// A packet whose timestamp equals the expected one extends the current
/// run; any other timestamp closes it. In real-time mode a timestamp
/// further than `max_skew` samples from the wall clock is rejected and
/// resets the expectation, so the next plausible packet starts afresh.
#[derive(Debug)]
pub struct Reassembler {
    expected: i64,
    last: i64,
    times_per_packet: i64,
    max_skew: Option<u64>,
    warned: bool,
}

impl Reassembler {
    /// `max_skew` is `None` when timestamps are not checked against the clock.
    pub fn new(times_per_packet: usize, max_skew: Option<i64>) -> Self {
        Self {
            expected: 0,
            last: 0,
            times_per_packet: times_per_packet as i64,
            max_skew: max_skew.map(|s| s.max(0) as u64),
            warned: false,
        }
    }

    /// Timestamp of the most recent accepted packet, 0 after a rejection.
    pub fn last_timestamp(&self) -> i64 {
        self.last
    }

    /// Split a batch into runs of packet indices.
    ///
    /// `timestamps[i]` is `None` for a packet that failed to decode; `now`
    /// is the wall-clock sample count, only consulted in real-time mode.
    pub fn split_runs(
        &mut self,
        timestamps: &[Option<i64>],
        now: i64,
        runs: &mut Vec<Range<usize>>,
    ) -> SplitOutcome {
        let mut outcome = SplitOutcome::default();
        let mut first = 0;

        for (next, ts) in timestamps.iter().enumerate() {
            let Some(mut ts) = *ts else {
                if first < next {
                    runs.push(first..next);
                }
                first = next + 1;
                outcome.malformed += 1;
                self.expected = 0;
                self.last = 0;
                continue;
            };

            if ts != self.expected {
                if first < next {
                    runs.push(first..next);
                }
                first = next;

                let implausible = self
                    .max_skew
                    .is_some_and(|skew| now.abs_diff(ts) > skew);

                if implausible {
                    if !self.warned {
                        self.warned = true;
                        outcome.onset = Some(ts);
                    }
                    outcome.rejected += 1;
                    first = next + 1;
                    ts = 0;
                } else {
                    self.warned = false;
                }
            }

            self.last = ts;
            self.expected = ts + self.times_per_packet;
        }

        if first < timestamps.len() {
            runs.push(first..timestamps.len());
        }

        outcome
    }
}
