use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::clock::TimeStamp;
use crate::sync::Watermark;

/// The read side of the ingestion stage, opened and closed once per
/// timestamp no matter how many subbands read it.
pub trait ReadTransactions: Send + Sync {
    fn start_read_transaction(&self, time: TimeStamp);
    fn end_read_transaction(&self, time: TimeStamp);
}

#[derive(Debug)]
struct WorkState {
    next_time: TimeStamp,
    subbands_done: Vec<bool>,
}

/// Shared by every worker of one pipeline.
///
/// Workers take `(time, subband)` items from [`get_work`] and bracket each
/// with [`start_read_transaction`] / [`end_read_transaction`]. The first
/// worker to reach a timestamp opens the transaction on the ingestion side
/// and the last one to finish closes it.
///
/// [`get_work`]: PipelineCoordinator::get_work
/// [`start_read_transaction`]: PipelineCoordinator::start_read_transaction
/// [`end_read_transaction`]: PipelineCoordinator::end_read_transaction
pub struct PipelineCoordinator {
    section: Arc<dyn ReadTransactions>,
    nr_subbands: usize,
    window_samples: i64,
    stop_time: TimeStamp,
    /// Locality of each subband's output.
    localities: Vec<u32>,
    work: Mutex<WorkState>,
    /// Outstanding (time, subband) tokens per timestamp.
    current_times: Mutex<BTreeMap<TimeStamp, usize>>,
    current_time: Watermark<TimeStamp>,
    stop: AtomicBool,
}

impl PipelineCoordinator {
    pub fn new(
        section: Arc<dyn ReadTransactions>,
        start_time: TimeStamp,
        stop_time: TimeStamp,
        window_samples: i64,
        localities: Vec<u32>,
    ) -> Self {
        let nr_subbands = localities.len();

        Self {
            section,
            nr_subbands,
            window_samples,
            stop_time,
            localities,
            work: Mutex::new(WorkState {
                next_time: start_time,
                subbands_done: vec![false; nr_subbands],
            }),
            current_times: Mutex::new(BTreeMap::new()),
            current_time: Watermark::new(start_time - window_samples),
            stop: AtomicBool::new(false),
        }
    }

    pub fn nr_subbands(&self) -> usize {
        self.nr_subbands
    }

    /// Next `(time, subband)` to process, or `None` once the run is over.
    ///
    /// Subbands whose output shares `locality` are handed out first.
    pub fn get_work(&self, locality: u32) -> Option<(TimeStamp, usize)> {
        let mut work = self.work.lock();

        if self.stop.load(Ordering::Acquire) || work.next_time >= self.stop_time {
            return None;
        }

        let pending = |s: &usize| !work.subbands_done[*s];
        let subband = match (0..self.nr_subbands)
            .filter(pending)
            .find(|&s| self.localities[s] == locality)
        {
            Some(s) => s,
            None => {
                let s = (0..self.nr_subbands).find(pending)?;
                debug!(locality, subband = s, "no local subband left, taking a remote one");
                s
            }
        };

        let time = work.next_time;
        work.subbands_done[subband] = true;

        if work.subbands_done.iter().all(|&done| done) {
            work.subbands_done.fill(false);
            work.next_time = time + self.window_samples;
        }

        Some((time, subband))
    }

    /// Enter the read transaction for `time`, opening it if this is the
    /// first subband to arrive.
    pub fn start_read_transaction(&self, time: TimeStamp) {
        let first = {
            let mut times = self.current_times.lock();
            if times.contains_key(&time) {
                false
            } else {
                times.insert(time, self.nr_subbands);
                true
            }
        };

        if first {
            // Transactions open in time order, so reaching the watermark
            // means the transaction for `time` is open.
            self.current_time.wait_for(time - self.window_samples);
            self.section.start_read_transaction(time);
            self.current_time.advance_to(time);

            info!(time = %time, seconds = time.seconds(), "processing window");
        } else {
            self.current_time.wait_for(time);
        }
    }

    /// Leave the read transaction for `time`, closing it if this was the
    /// last outstanding subband.
    pub fn end_read_transaction(&self, time: TimeStamp) {
        let last = {
            let mut times = self.current_times.lock();
            match times.get_mut(&time) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    times.remove(&time);
                    true
                }
                None => false,
            }
        };

        if last {
            self.section.end_read_transaction(time);
        }
    }

    /// Make every later `get_work` return `None`.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Timestamps with transactions still open.
    pub fn in_flight(&self) -> Vec<TimeStamp> {
        self.current_times.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(&'static str, i64)>>,
    }

    impl ReadTransactions for Recorder {
        fn start_read_transaction(&self, time: TimeStamp) {
            self.events.lock().push(("start", time.time()));
        }

        fn end_read_transaction(&self, time: TimeStamp) {
            self.events.lock().push(("end", time.time()));
        }
    }

    fn ts(t: i64) -> TimeStamp {
        TimeStamp::new(t, 1024)
    }

    fn coordinator(localities: Vec<u32>, stop: i64) -> (Arc<Recorder>, PipelineCoordinator) {
        let recorder = Arc::new(Recorder::default());
        let c = PipelineCoordinator::new(recorder.clone(), ts(0), ts(stop), 8, localities);
        (recorder, c)
    }

    #[test]
    fn test_get_work_covers_every_subband_then_advances() {
        let (_, c) = coordinator(vec![0, 0, 0], 16);

        let items: Vec<_> = std::iter::from_fn(|| c.get_work(0))
            .map(|(t, s)| (t.time(), s))
            .collect();

        assert_eq!(items, vec![(0, 0), (0, 1), (0, 2), (8, 0), (8, 1), (8, 2)]);
    }

    #[test]
    fn test_get_work_prefers_locality() {
        let (_, c) = coordinator(vec![0, 1, 0, 1], 8);

        assert_eq!(c.get_work(1), Some((ts(0), 1)));
        assert_eq!(c.get_work(1), Some((ts(0), 3)));
        // Nothing local left: falls back to a remote subband.
        assert_eq!(c.get_work(1), Some((ts(0), 0)));
        assert_eq!(c.get_work(0), Some((ts(0), 2)));
        assert_eq!(c.get_work(0), None);
    }

    #[test]
    fn test_request_stop_ends_work() {
        let (_, c) = coordinator(vec![0], i64::MAX);

        assert!(c.get_work(0).is_some());
        c.request_stop();
        assert!(c.is_stopped());
        assert_eq!(c.get_work(0), None);
    }

    #[test]
    fn test_single_transaction_per_time() {
        let (recorder, c) = coordinator(vec![0, 0], 64);

        c.start_read_transaction(ts(0));
        c.start_read_transaction(ts(0));
        c.end_read_transaction(ts(0));
        assert_eq!(c.in_flight(), vec![ts(0)]);
        c.end_read_transaction(ts(0));

        assert!(c.in_flight().is_empty());
        assert_eq!(*recorder.events.lock(), vec![("start", 0), ("end", 0)]);
    }
}
