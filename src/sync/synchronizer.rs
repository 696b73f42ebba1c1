use tracing::debug;

use super::watermark::Watermark;
use crate::clock::{TimeStamp, WallClock};

/// Handshake between the single writer of a ring buffer and its readers.
///
/// Callers hold this capability, never a concrete strategy.
pub trait ReaderWriterSynchronization: Send + Sync {
    /// Announce a read of `[begin, end)` and block until it is written.
    fn start_read(&self, begin: TimeStamp, end: TimeStamp);

    /// Release everything before `advance_to` for overwriting.
    fn finished_read(&self, advance_to: TimeStamp);

    /// Announce a write of `[begin, end)` and block until readers freed it.
    fn start_write(&self, begin: TimeStamp, end: TimeStamp);

    /// Publish everything before `advance_to` to readers.
    fn finished_write(&self, advance_to: TimeStamp);

    /// Unblock the writer permanently.
    fn no_more_reading(&self);

    /// Unblock readers permanently.
    fn no_more_writing(&self);
}

/// Closed set of synchronization strategies.
#[derive(Debug)]
pub enum Synchronizer {
    /// Two watermarks bounding the writer to one ring ahead of the reader.
    RingBuffered(RingBuffered),
    /// Readers pace themselves on the wall clock; writers never block.
    WallClockPaced(WallClockPaced),
}

impl Synchronizer {
    pub fn ring_buffered(buffer_size: usize, initial_read: TimeStamp) -> Self {
        Self::RingBuffered(RingBuffered::new(buffer_size, initial_read))
    }

    pub fn wall_clock_paced(max_network_latency: i64) -> Self {
        Self::WallClockPaced(WallClockPaced::new(max_network_latency))
    }
}

impl ReaderWriterSynchronization for Synchronizer {
    fn start_read(&self, begin: TimeStamp, end: TimeStamp) {
        match self {
            Self::RingBuffered(s) => s.start_read(begin, end),
            Self::WallClockPaced(s) => s.start_read(begin, end),
        }
    }

    fn finished_read(&self, advance_to: TimeStamp) {
        match self {
            Self::RingBuffered(s) => s.finished_read(advance_to),
            Self::WallClockPaced(s) => s.finished_read(advance_to),
        }
    }

    fn start_write(&self, begin: TimeStamp, end: TimeStamp) {
        match self {
            Self::RingBuffered(s) => s.start_write(begin, end),
            Self::WallClockPaced(s) => s.start_write(begin, end),
        }
    }

    fn finished_write(&self, advance_to: TimeStamp) {
        match self {
            Self::RingBuffered(s) => s.finished_write(advance_to),
            Self::WallClockPaced(s) => s.finished_write(advance_to),
        }
    }

    fn no_more_reading(&self) {
        match self {
            Self::RingBuffered(s) => s.no_more_reading(),
            Self::WallClockPaced(s) => s.no_more_reading(),
        }
    }

    fn no_more_writing(&self) {
        match self {
            Self::RingBuffered(s) => s.no_more_writing(),
            Self::WallClockPaced(s) => s.no_more_writing(),
        }
    }
}

/// Watermark pair over a ring of `buffer_size` samples.
///
/// The writer may start `[b, e)` only once the reader has released
/// `e - buffer_size`; a reader may start `[b, e)` only once `e` is written.
#[derive(Debug)]
pub struct RingBuffered {
    read: Watermark<TimeStamp>,
    write: Watermark<TimeStamp>,
    buffer_size: i64,
}

impl RingBuffered {
    pub fn new(buffer_size: usize, initial_read: TimeStamp) -> Self {
        Self {
            read: Watermark::new(initial_read),
            write: Watermark::new(TimeStamp::min(initial_read.clock_speed())),
            buffer_size: buffer_size as i64,
        }
    }

    pub fn read_progress(&self) -> TimeStamp {
        self.read.value()
    }

    pub fn write_progress(&self) -> TimeStamp {
        self.write.value()
    }
}

impl ReaderWriterSynchronization for RingBuffered {
    fn start_read(&self, begin: TimeStamp, end: TimeStamp) {
        self.read.advance_to(begin);
        self.write.wait_for(end);
    }

    fn finished_read(&self, advance_to: TimeStamp) {
        self.read.advance_to(advance_to);
    }

    fn start_write(&self, begin: TimeStamp, end: TimeStamp) {
        // Advancing first lets a reader waiting inside a gap proceed.
        self.write.advance_to(begin);
        self.read.wait_for(end - self.buffer_size);
    }

    fn finished_write(&self, advance_to: TimeStamp) {
        self.write.advance_to(advance_to);
    }

    fn no_more_reading(&self) {
        let clock_speed = self.read.value().clock_speed();
        self.read.advance_to(TimeStamp::max(clock_speed));
    }

    fn no_more_writing(&self) {
        let clock_speed = self.read.value().clock_speed();
        self.write.advance_to(TimeStamp::max(clock_speed));
    }
}

/// Reader side that waits for wall-clock time instead of a writer.
///
/// Used when no real producer feeds the buffer; a read of `[b, e)` starts
/// once the wall clock passes `e + max_network_latency`.
#[derive(Debug)]
pub struct WallClockPaced {
    clock: WallClock,
    max_network_latency: i64,
}

impl WallClockPaced {
    pub fn new(max_network_latency: i64) -> Self {
        Self {
            clock: WallClock::new(),
            max_network_latency,
        }
    }
}

impl ReaderWriterSynchronization for WallClockPaced {
    fn start_read(&self, _begin: TimeStamp, end: TimeStamp) {
        if !self.clock.wait_until(end + self.max_network_latency) {
            debug!(end = %end, "wall-clock paced read released by shutdown");
        }
    }

    fn finished_read(&self, _advance_to: TimeStamp) {}

    fn start_write(&self, _begin: TimeStamp, _end: TimeStamp) {}

    fn finished_write(&self, _advance_to: TimeStamp) {}

    fn no_more_reading(&self) {
        self.clock.cancel();
    }

    fn no_more_writing(&self) {
        self.clock.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    const CLOCK_SPEED: u32 = 1024;
    const BUFFER: usize = 16;

    fn ts(t: i64) -> TimeStamp {
        TimeStamp::new(t, CLOCK_SPEED)
    }

    fn still_blocked(rx: &mpsc::Receiver<()>) -> bool {
        matches!(
            rx.recv_timeout(Duration::from_millis(50)),
            Err(mpsc::RecvTimeoutError::Timeout)
        )
    }

    #[test]
    fn test_writer_blocks_until_reader_frees_space() {
        let sync = Arc::new(Synchronizer::ring_buffered(BUFFER, ts(0)));
        let (tx, rx) = mpsc::channel();

        let writer = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                sync.start_write(ts(0), ts(BUFFER as i64 + 1));
                tx.send(()).expect("signal write start");
            })
        };

        assert!(still_blocked(&rx));

        sync.finished_read(ts(1));
        rx.recv_timeout(Duration::from_secs(5))
            .expect("writer released after finished_read");
        writer.join().expect("writer thread");
    }

    #[test]
    fn test_reader_blocks_until_window_written() {
        let sync = Arc::new(Synchronizer::ring_buffered(BUFFER, ts(-20)));
        let (tx, rx) = mpsc::channel();

        let reader = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                sync.start_read(ts(0), ts(BUFFER as i64));
                tx.send(()).expect("signal read start");
            })
        };

        assert!(still_blocked(&rx));

        sync.finished_write(ts(BUFFER as i64 - 1));
        assert!(still_blocked(&rx));

        sync.finished_write(ts(BUFFER as i64));
        rx.recv_timeout(Duration::from_secs(5))
            .expect("reader released after finished_write");
        reader.join().expect("reader thread");
    }

    #[test]
    fn test_start_write_advances_past_gap() {
        let sync = RingBuffered::new(BUFFER, ts(0));
        sync.start_write(ts(8), ts(12));
        assert_eq!(sync.write_progress(), ts(8));

        sync.finished_write(ts(12));
        assert_eq!(sync.write_progress(), ts(12));

        sync.start_read(ts(2), ts(10));
        assert_eq!(sync.read_progress(), ts(2));
    }

    #[test]
    fn test_no_more_writing_releases_reader() {
        let sync = Arc::new(Synchronizer::ring_buffered(BUFFER, ts(0)));
        let reader = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || sync.start_read(ts(0), ts(1_000)))
        };

        thread::sleep(Duration::from_millis(20));
        sync.no_more_writing();
        reader.join().expect("reader thread");
    }

    #[test]
    fn test_no_more_reading_releases_writer() {
        let sync = Arc::new(Synchronizer::ring_buffered(BUFFER, ts(0)));
        let writer = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || sync.start_write(ts(1_000), ts(2_000)))
        };

        thread::sleep(Duration::from_millis(20));
        sync.no_more_reading();
        writer.join().expect("writer thread");
    }

    #[test]
    fn test_wall_clock_paced_never_blocks_writer() {
        let sync = Synchronizer::wall_clock_paced(0);
        let started = Instant::now();

        sync.start_write(ts(i64::MAX - 10), ts(i64::MAX));
        sync.finished_write(ts(i64::MAX));

        // A window ending in the past is readable immediately.
        let past = TimeStamp::now(CLOCK_SPEED) - 10;
        sync.start_read(past - 8, past);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wall_clock_paced_reader_released_on_shutdown() {
        let sync = Arc::new(Synchronizer::wall_clock_paced(0));
        let reader = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                let far = TimeStamp::now(CLOCK_SPEED) + 3_600;
                sync.start_read(far - 8, far);
            })
        };

        thread::sleep(Duration::from_millis(20));
        sync.no_more_writing();
        reader.join().expect("reader thread");
    }
}
