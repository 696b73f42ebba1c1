use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::TcpStream;

use anyhow::{bail, Context, Result};
use tracing::{error, info};

use super::EmissionBuffer;
use crate::config::{OutputConfig, Params};
use crate::descriptor::Descriptor;

/// An opened output and its per-subband settings.
pub struct OutputStream {
    pub sink: Box<dyn Write + Send>,
    pub center_frequency: f64,
    pub locality: u32,
}

/// Open the sink named by an output descriptor.
pub fn open_sink(descriptor: &Descriptor) -> Result<Box<dyn Write + Send>> {
    match descriptor {
        Descriptor::File(path) => {
            let file = File::create(path).with_context(|| format!("creating {descriptor}"))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        Descriptor::Tcp(addr) => {
            let stream =
                TcpStream::connect(addr.as_str()).with_context(|| format!("connecting {descriptor}"))?;
            Ok(Box::new(BufWriter::new(stream)))
        }
        Descriptor::Null => Ok(Box::new(io::sink())),
        Descriptor::Udp(_) => bail!("{descriptor} is not an output sink"),
    }
}

pub struct EmissionSection {
    buffers: Vec<EmissionBuffer>,
    localities: Vec<u32>,
}

impl EmissionSection {
    /// Open one sink per configured output; output `i` carries subband `i`.
    pub fn open(params: &Params, outputs: &[OutputConfig]) -> Result<Self> {
        let mut streams = Vec::with_capacity(outputs.len());

        for output in outputs {
            let descriptor: Descriptor = output
                .descriptor
                .parse()
                .with_context(|| format!("parsing output descriptor {:?}", output.descriptor))?;

            streams.push(OutputStream {
                sink: open_sink(&descriptor)?,
                center_frequency: output.center_frequency,
                locality: output.locality,
            });
        }

        Self::with_streams(params, streams)
    }

    pub fn with_streams(params: &Params, streams: Vec<OutputStream>) -> Result<Self> {
        if streams.len() != params.nr_subbands {
            bail!(
                "{} outputs configured for {} subbands",
                streams.len(),
                params.nr_subbands
            );
        }

        let mut buffers = Vec::with_capacity(streams.len());
        let mut localities = Vec::with_capacity(streams.len());

        for (subband, stream) in streams.into_iter().enumerate() {
            buffers.push(EmissionBuffer::start(
                params,
                subband,
                stream.center_frequency,
                stream.sink,
            )?);
            localities.push(stream.locality);
        }

        info!(
            subbands = buffers.len(),
            integration_factor = params.integration_factor,
            "emission section started",
        );

        Ok(Self { buffers, localities })
    }

    pub fn buffer(&self, subband: usize) -> Option<&EmissionBuffer> {
        self.buffers.get(subband)
    }

    /// Locality hint of each subband's output.
    pub fn localities(&self) -> &[u32] {
        &self.localities
    }

    /// Result blocks dropped under overload, over all subbands.
    pub fn dropped(&self) -> u64 {
        self.buffers.iter().map(EmissionBuffer::dropped).sum()
    }

    pub fn emitted(&self) -> u64 {
        self.buffers.iter().map(EmissionBuffer::emitted).sum()
    }

    pub fn release(&self) {
        for buffer in &self.buffers {
            buffer.release();
        }
    }

    /// Flush and close every output, returning the first failure.
    pub fn finish(&self) -> Result<()> {
        let mut first_error = None;

        for buffer in &self.buffers {
            if let Err(e) = buffer.finish() {
                error!(subband = buffer.subband(), error = %e, "failed to close output");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}
