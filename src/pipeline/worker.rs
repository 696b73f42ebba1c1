use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use super::coordinator::PipelineCoordinator;
use crate::clock::TimeStamp;
use crate::compute::{Compute, Window};
use crate::config::{Params, MAX_WEIGHTS};
use crate::emit::section::EmissionSection;
use crate::ingest::section::IngestionSection;
use crate::interval::IntervalSet;

/// Takes `(time, subband)` items from the coordinator until the run ends.
pub struct Worker {
    index: usize,
    locality: u32,
    params: Arc<Params>,
    coordinator: Arc<PipelineCoordinator>,
    section: Arc<IngestionSection>,
    emission: Arc<EmissionSection>,
    compute: Box<dyn Compute>,
    window: Window,
}

impl Worker {
    pub fn new(
        index: usize,
        locality: u32,
        params: Arc<Params>,
        coordinator: Arc<PipelineCoordinator>,
        section: Arc<IngestionSection>,
        emission: Arc<EmissionSection>,
        compute: Box<dyn Compute>,
    ) -> Self {
        let window = Window::new(
            params.nr_receivers,
            (params.history_samples + params.window_samples) as usize,
            params.history_samples as usize,
            params.bytes_per_sample,
        );

        Self {
            index,
            locality,
            params,
            coordinator,
            section,
            emission,
            compute,
            window,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let mut processed = 0u64;

        while let Some((time, subband)) = self.coordinator.get_work(self.locality) {
            self.do_subband(time, subband)
                .with_context(|| format!("worker {} at {time}, subband {subband}", self.index))?;
            processed += 1;
        }

        debug!(worker = self.index, processed, "worker finished");
        Ok(())
    }

    /// Process one window inside its read transaction.
    fn do_subband(&mut self, time: TimeStamp, subband: usize) -> Result<()> {
        self.coordinator.start_read_transaction(time);
        let result = self.correlate(time, subband);
        self.coordinator.end_read_transaction(time);
        result
    }

    fn correlate(&mut self, time: TimeStamp, subband: usize) -> Result<()> {
        let emission = Arc::clone(&self.emission);
        let Some(output) = emission.buffer(subband) else {
            bail!("no output for subband {subband}");
        };
        if output.is_released() {
            bail!("output for subband {subband} closed");
        }

        let valid = self.section.fill_in_missing_samples(time, subband);
        let has_data = valid.iter().any(|v| !v.is_empty());

        if !has_data && self.section.inputs_exhausted(time) && !self.coordinator.is_stopped() {
            info!(time = %time, "all inputs ended, stopping");
            self.coordinator.request_stop();
        }

        if !has_data || !self.in_time(time) {
            if subband == 0 {
                warn!(
                    time = %time,
                    has_data,
                    "skipping window: no valid data or too late",
                );
            }
            output.put_result(None, time);
            return Ok(());
        }

        let Some(mut result) = output.get_free_buffer() else {
            output.put_result(None, time);
            return Ok(());
        };

        result.clear();
        self.section.copy_out(time, subband, &mut self.window);
        self.compute
            .compute(&self.window, &mut result)
            .context("computing correlation")?;

        result.start = time;
        result.end = time + self.params.window_samples;
        compute_weights(
            &valid,
            |r| self.section.group_of(r),
            self.params.nr_receivers,
            time,
            time + self.params.window_samples,
            &mut result.weights,
        );

        output.put_result(Some(result), time);
        Ok(())
    }

    fn in_time(&self, time: TimeStamp) -> bool {
        if !self.params.real_time {
            return true;
        }

        let p = &self.params;
        window_in_time(TimeStamp::now(p.clock_speed), time, p.ring_samples, p.window_samples)
    }
}

/// Whether the window at `time` can still be read at `now` before the
/// writer overwrites it.
pub fn window_in_time(now: TimeStamp, time: TimeStamp, ring_samples: usize, window_samples: i64) -> bool {
    now - time < ring_samples as i64 - window_samples
}

/// Per receiver pair `(r1, r2)`, `r1 <= r2`, ordered by `r2` then `r1`:
/// samples in `[begin, end)` valid for both receivers.
///
/// Only the first [`MAX_WEIGHTS`] pairs are weighted.
pub fn compute_weights(
    valid: &[IntervalSet<TimeStamp>],
    group_of: impl Fn(usize) -> usize,
    nr_receivers: usize,
    begin: TimeStamp,
    end: TimeStamp,
    weights: &mut [u32],
) {
    let nr_groups = valid.len();
    let mut shared = vec![None; nr_groups * nr_groups];
    let mut pair = 0;

    'pairs: for r2 in 0..nr_receivers {
        for r1 in 0..=r2 {
            if pair >= MAX_WEIGHTS || pair >= weights.len() {
                break 'pairs;
            }

            let (g1, g2) = (group_of(r1), group_of(r2));
            let count = *shared[g1 * nr_groups + g2].get_or_insert_with(|| {
                let both = &valid[g1] & &valid[g2];
                both.subset(begin, end).count() as u32
            });

            weights[pair] = count;
            pair += 1;
        }
    }
}
