//! Destinations for completed bias blocks.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::bias::BiasValue;
use crate::codec;
use crate::error::DriverError;

/// Receives one decoded block per completed bias value.
pub trait SampleSink {
    fn append(&mut self, bias: BiasValue, block: &[u32]) -> Result<(), DriverError>;

    /// Flush and close out. Called once, at the end of a sweep.
    fn finish(&mut self) -> Result<(), DriverError>;
}

/// CSV file sink: one `bias,x1,x2,x3` row per sample, no header.
///
/// The file is created fresh (truncating any previous run) per sweep.
pub struct CsvSink {
    writer: BufWriter<File>,
}

impl CsvSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }
}

impl SampleSink for CsvSink {
    fn append(&mut self, bias: BiasValue, block: &[u32]) -> Result<(), DriverError> {
        // flags and logs any analog glitches on the way to disk
        codec::scan_discontinuities(block);
        for &word in block {
            let (x1, x2, x3) = codec::decode(word);
            writeln!(self.writer, "{},{},{},{}", bias.get(), x1, x2, x3)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), DriverError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory sink, useful for tests and deterministic playback.
#[derive(Default)]
pub struct MemorySink {
    pub rows: Vec<(u16, u16, u16, u16)>,
    finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl SampleSink for MemorySink {
    fn append(&mut self, bias: BiasValue, block: &[u32]) -> Result<(), DriverError> {
        for &word in block {
            let (x1, x2, x3) = codec::decode(word);
            self.rows.push((bias.get(), x1, x2, x3));
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), DriverError> {
        self.finished = true;
        Ok(())
    }
}
