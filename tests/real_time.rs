use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;

use correlator::clock::TimeStamp;
use correlator::compute::CpuCorrelator;
use correlator::config::Params;
use correlator::emit::section::OutputStream;
use correlator::ingest::section::{IngestionSection, InputStream};
use correlator::ingest::source::{PacketBatch, PacketSource, SourceError};
use correlator::pipeline::{Pipeline, ReadTransactions, WorkerSpec};

/// 1024 samples per second per subband.
const CLOCK: u32 = 1024 * 1024;
const WINDOW: i64 = 64;

/// A network input on which nothing ever arrives.
struct Silent;

impl PacketSource for Silent {
    fn recv_batch(&mut self, _: &mut PacketBatch) -> Result<(), SourceError> {
        thread::sleep(Duration::from_millis(10));
        Err(SourceError::Timeout)
    }
}

fn silent_input() -> InputStream {
    InputStream {
        nr_receivers: 2,
        source: Box::new(Silent),
        wall_clock_paced: false,
    }
}

fn real_time_params() -> Params {
    let now = TimeStamp::now(CLOCK);

    Params {
        clock_speed: CLOCK,
        start_time: now.with_time((now.time() / WINDOW + 1) * WINDOW),
        nr_receivers: 2,
        window_samples: WINDOW,
        history_samples: 16,
        ring_samples: 1024,
        real_time: true,
        max_timestamp_skew: 15 * 1024,
        log_interval: Duration::from_millis(100),
        ..Params::default()
    }
}

#[test]
#[serial]
fn test_synthetic_advance_releases_readers_without_data() {
    let params = real_time_params();
    let start = params.start_time;
    let section = IngestionSection::with_streams(Arc::new(params), vec![silent_input()])
        .expect("start ingestion");

    let begun = Instant::now();
    section.start_read_transaction(start);
    assert!(begun.elapsed() < Duration::from_secs(5));

    let valid = section.fill_in_missing_samples(start, 0);
    assert!(valid[0].is_empty());
    section.end_read_transaction(start);

    assert!(section.stats().forced_advances >= 1);
    section.shutdown().expect("shutdown");
}

#[test]
#[serial]
fn test_pipeline_skips_windows_without_data() {
    let mut params = real_time_params();
    params.stop_time = params.start_time + 4 * WINDOW;

    let pipeline = Pipeline::start(
        params,
        vec![silent_input()],
        vec![OutputStream {
            sink: Box::new(io::sink()),
            center_frequency: 0.0,
            locality: 0,
        }],
        vec![WorkerSpec {
            locality: 0,
            compute: Box::new(CpuCorrelator::new()),
        }],
    )
    .expect("start pipeline");

    let begun = Instant::now();
    pipeline.wait().expect("pipeline run");

    assert!(begun.elapsed() < Duration::from_secs(10));
    assert!(pipeline.ingest_stats().forced_advances >= 1);
    assert_eq!(pipeline.ingest_stats().packets, 0);
}

#[test]
#[serial]
fn test_stop_interrupts_waiting_pipeline() {
    // Start far in the future so workers block waiting for data.
    let mut params = real_time_params();
    params.start_time += 3_600 * 1024;

    let pipeline = Arc::new(
        Pipeline::start(
            params,
            vec![silent_input()],
            vec![OutputStream {
                sink: Box::new(io::sink()),
                center_frequency: 0.0,
                locality: 0,
            }],
            vec![WorkerSpec {
                locality: 0,
                compute: Box::new(CpuCorrelator::new()),
            }],
        )
        .expect("start pipeline"),
    );

    let waiter = Arc::clone(&pipeline);
    let handle = thread::spawn(move || waiter.wait());

    thread::sleep(Duration::from_millis(200));
    let begun = Instant::now();
    pipeline.stop();

    handle.join().expect("waiter").expect("pipeline run");
    assert!(begun.elapsed() < Duration::from_secs(5));
}
