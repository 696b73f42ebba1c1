use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use num_complex::Complex32;
use parking_lot::Mutex;

use correlator::clock::TimeStamp;
use correlator::config::Params;
use correlator::emit::result::{BlockHeader, HEADER_SIZE};
use correlator::emit::EmissionBuffer;

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn ts(t: i64) -> TimeStamp {
    TimeStamp::new(t, 1024)
}

/// Windows one sample long, starting at 3.
fn params(integration_factor: usize) -> Params {
    Params {
        start_time: ts(3),
        nr_receivers: 1,
        window_samples: 1,
        integration_factor,
        emission_pool_size: 4,
        ..Params::default()
    }
}

/// Decoded headers and first visibility of every block.
fn blocks(bytes: &[u8]) -> Vec<(BlockHeader, f32)> {
    bytes
        .chunks(HEADER_SIZE + 8)
        .map(|chunk| {
            let header = BlockHeader::decode(chunk).expect("header");
            let re = f32::from_le_bytes(chunk[HEADER_SIZE..HEADER_SIZE + 4].try_into().unwrap());
            (header, re)
        })
        .collect()
}

/// Submit one result per time from its own thread, in the given order.
fn submit(emission: &Arc<EmissionBuffer>, times: &[i64], value: impl Fn(i64) -> f32) {
    let handles: Vec<_> = times
        .iter()
        .enumerate()
        .map(|(i, &t)| {
            let emission = Arc::clone(emission);
            let v = value(t);

            let handle = thread::spawn(move || {
                let mut result = emission.get_free_buffer().expect("free buffer");
                result.clear();
                result.start = ts(t);
                result.end = ts(t + 1);
                result.data[0] = Complex32::new(v, 0.0);
                result.weights[0] = 1;
                emission.put_result(Some(result), ts(t));
            });

            // Stagger the threads so they arrive in submission order.
            if i + 1 < times.len() {
                thread::sleep(Duration::from_millis(20));
            }
            handle
        })
        .collect();

    for handle in handles {
        handle.join().expect("submitter");
    }
}

#[test]
fn test_out_of_order_results_emitted_in_time_order() {
    let sink = SharedSink::default();
    let emission = Arc::new(
        EmissionBuffer::start(&params(1), 0, 0.0, Box::new(sink.clone())).expect("start"),
    );

    submit(&emission, &[5, 3, 4], |t| t as f32);
    emission.finish().expect("finish");

    let order: Vec<f32> = blocks(&sink.0.lock()).iter().map(|(_, v)| *v).collect();
    assert_eq!(order, vec![3.0, 4.0, 5.0]);
}

#[test]
fn test_integration_of_three_unit_results() {
    let sink = SharedSink::default();
    let emission = Arc::new(
        EmissionBuffer::start(&params(3), 0, 0.0, Box::new(sink.clone())).expect("start"),
    );

    submit(&emission, &[4, 5, 3], |_| 1.0);
    emission.finish().expect("finish");

    let written = blocks(&sink.0.lock());
    assert_eq!(written.len(), 1);

    let (header, value) = &written[0];
    assert_eq!(*value, 3.0);
    assert_eq!(header.weights[0], 3);
    assert_eq!(header.integration_factor, 3);
    assert_eq!(header.start_seconds, ts(3).seconds());
    assert_eq!(header.end_seconds, ts(6).seconds());
}
