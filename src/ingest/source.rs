use std::fs::File;
use std::io::{self, BufReader, Read};
use std::net::UdpSocket;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use thiserror::Error;

use super::packet::PacketLayout;
use crate::descriptor::Descriptor;

/// Most packets handled per receive call.
pub const MAX_PACKETS_PER_BATCH: usize = 64;

/// How long a receive waits before reporting [`SourceError::Timeout`].
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors a packet source can report.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Nothing arrived in time; retried silently.
    #[error("receive timed out")]
    Timeout,

    /// The stream ended cleanly.
    #[error("end of stream")]
    EndOfStream,

    #[error("receive failed: {0}")]
    Io(#[from] io::Error),
}

impl SourceError {
    fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                Self::Timeout
            }
            io::ErrorKind::UnexpectedEof => Self::EndOfStream,
            _ => Self::Io(err),
        }
    }
}

/// Fixed-capacity set of packet slots filled by one receive call.
pub struct PacketBatch {
    data: Vec<u8>,
    lens: Vec<usize>,
    slot_size: usize,
    capacity: usize,
}

impl PacketBatch {
    pub fn new(capacity: usize, slot_size: usize) -> Self {
        Self {
            data: vec![0u8; capacity * slot_size],
            lens: Vec::with_capacity(capacity),
            slot_size,
            capacity,
        }
    }

    pub fn clear(&mut self) {
        self.lens.clear();
    }

    pub fn len(&self) -> usize {
        self.lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lens.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lens.len() >= self.capacity
    }

    /// The next unused slot, if any.
    pub fn vacant(&mut self) -> Option<&mut [u8]> {
        if self.is_full() {
            return None;
        }
        let start = self.lens.len() * self.slot_size;
        Some(&mut self.data[start..start + self.slot_size])
    }

    /// Mark the slot returned by [`PacketBatch::vacant`] as holding `size` bytes.
    pub fn commit(&mut self, size: usize) {
        if !self.is_full() {
            self.lens.push(size.min(self.slot_size));
        }
    }

    /// Copy a packet into the next slot; false if the batch is full.
    pub fn push(&mut self, packet: &[u8]) -> bool {
        let Some(slot) = self.vacant() else {
            return false;
        };
        let size = packet.len().min(slot.len());
        slot[..size].copy_from_slice(&packet[..size]);
        self.commit(size);
        true
    }

    pub fn get(&self, index: usize) -> &[u8] {
        let start = index * self.slot_size;
        &self.data[start..start + self.lens[index]]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}

/// A stream of timestamped packets.
pub trait PacketSource: Send {
    /// Receive up to a batch worth of packets.
    ///
    /// `Ok` with an empty batch is allowed; timeouts and end of stream are
    /// reported as the matching [`SourceError`] variants.
    fn recv_batch(&mut self, batch: &mut PacketBatch) -> Result<(), SourceError>;
}

/// Open the source named by an input descriptor.
pub fn open_source(
    descriptor: &Descriptor,
    layout: PacketLayout,
) -> anyhow::Result<Box<dyn PacketSource>> {
    match descriptor {
        Descriptor::Udp(addr) => Ok(Box::new(
            UdpSource::bind(addr).with_context(|| format!("binding {descriptor}"))?,
        )),
        Descriptor::File(path) => Ok(Box::new(
            FileSource::open(path, layout.packet_size())
                .with_context(|| format!("opening {descriptor}"))?,
        )),
        Descriptor::Null => Ok(Box::new(NullSource::new(RECEIVE_TIMEOUT))),
        Descriptor::Tcp(_) => bail!("{descriptor} is not a packet source"),
    }
}

/// Datagram socket; one packet per datagram.
pub struct UdpSource {
    socket: UdpSocket,
}

impl UdpSource {
    pub fn bind(addr: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    fn drain_ready(&mut self, batch: &mut PacketBatch) -> io::Result<()> {
        while let Some(slot) = batch.vacant() {
            match self.socket.recv(slot) {
                Ok(size) => batch.commit(size),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl PacketSource for UdpSource {
    fn recv_batch(&mut self, batch: &mut PacketBatch) -> Result<(), SourceError> {
        let Some(slot) = batch.vacant() else {
            return Ok(());
        };

        // The first datagram waits up to the read timeout, the rest of the
        // batch only takes what is already queued.
        let size = self.socket.recv(slot).map_err(SourceError::from_io)?;
        batch.commit(size);

        self.socket.set_nonblocking(true)?;
        let drained = self.drain_ready(batch);
        self.socket.set_nonblocking(false)?;

        drained.map_err(SourceError::from_io)
    }
}

/// Replays fixed-size packet records from a file.
pub struct FileSource {
    reader: BufReader<File>,
    packet_size: usize,
    exhausted: bool,
}

impl FileSource {
    pub fn open(path: &Path, packet_size: usize) -> io::Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            packet_size,
            exhausted: false,
        })
    }
}

impl PacketSource for FileSource {
    fn recv_batch(&mut self, batch: &mut PacketBatch) -> Result<(), SourceError> {
        if self.exhausted {
            return Err(SourceError::EndOfStream);
        }

        while let Some(slot) = batch.vacant() {
            let size = self.packet_size.min(slot.len());
            let read = self.reader.read_exact(&mut slot[..size]);

            match read {
                Ok(()) => batch.commit(size),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.exhausted = true;
                    break;
                }
                Err(e) => return Err(SourceError::from_io(e)),
            }
        }

        if self.exhausted && batch.is_empty() {
            return Err(SourceError::EndOfStream);
        }

        Ok(())
    }
}

/// A source that never delivers; used for groups without a producer.
pub struct NullSource {
    timeout: Duration,
}

impl NullSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl PacketSource for NullSource {
    fn recv_batch(&mut self, _batch: &mut PacketBatch) -> Result<(), SourceError> {
        thread::sleep(self.timeout);
        Err(SourceError::Timeout)
    }
}
