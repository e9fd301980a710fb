//! In-memory transport that behaves like the instrument's firmware.
//!
//! Useful for tests and deterministic playback: it answers the command set
//! with scripted waveform data, counts transfers, and can inject the fault
//! shapes the driver has to survive (short writes, failed reads, dropped
//! packets, the device leaving the bus).

use std::time::Duration;

use crate::codec;
use crate::error::TransportError;
use crate::protocol::{DATA_FRAME_LEN, WORDS_PER_PACKET};
use crate::transport::BulkTransport;

const SIM_FIRMWARE_VERSION: u32 = 0x0104;
const PING_MAGIC: u8 = 0x55;

enum Reply {
    Ack,
    Value(u32),
    Ping,
    Data,
}

pub struct SimTransport {
    present: bool,
    open: bool,
    bias: u16,
    next_packet_id: u32,
    sample_clock: u64,
    pending: Option<Reply>,
    wave: Box<dyn FnMut(u64) -> u32 + Send>,
    // fault injection
    short_writes: usize,
    failed_reads: usize,
    skip_ids: Vec<u32>,
    corrupt_ping: bool,
    // transfer accounting
    writes: usize,
    reads: usize,
    data_requests: usize,
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            present: true,
            open: false,
            bias: 0,
            next_packet_id: 0,
            sample_clock: 0,
            pending: None,
            wave: Box::new(default_wave),
            short_writes: 0,
            failed_reads: 0,
            skip_ids: Vec::new(),
            corrupt_ping: false,
            writes: 0,
            reads: 0,
            data_requests: 0,
        }
    }

    /// Replace the scripted waveform. The closure maps a monotonically
    /// increasing sample clock to a packed sample word.
    pub fn with_wave(mut self, wave: impl FnMut(u64) -> u32 + Send + 'static) -> Self {
        self.wave = Box::new(wave);
        self
    }

    /// Unplug or re-plug the simulated device.
    pub fn set_present(&mut self, present: bool) {
        self.present = present;
        if !present {
            self.open = false;
        }
    }

    /// The next `n` writes complete one byte short.
    pub fn fail_next_writes(&mut self, n: usize) {
        self.short_writes = n;
    }

    /// The next `n` reads fail outright.
    pub fn fail_next_reads(&mut self, n: usize) {
        self.failed_reads = n;
    }

    /// Packet ids in `ids` are never served; their payload vanishes, exactly
    /// like a dropped bulk transfer.
    pub fn drop_packet_ids(&mut self, ids: &[u32]) {
        self.skip_ids = ids.to_vec();
    }

    /// Ping replies carry the wrong magic byte from now on.
    pub fn corrupt_ping_replies(&mut self, corrupt: bool) {
        self.corrupt_ping = corrupt;
    }

    pub fn bias(&self) -> u16 {
        self.bias
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn reads(&self) -> usize {
        self.reads
    }

    /// How many get-data commands the firmware has answered.
    pub fn data_requests(&self) -> usize {
        self.data_requests
    }

    fn serve(&mut self, reply: Reply, buf: &mut [u8]) -> usize {
        match reply {
            Reply::Ack => fill(buf, &[0x00]),
            Reply::Value(v) => fill(buf, &v.to_le_bytes()),
            Reply::Ping => {
                let mut reply = [0u8; 64];
                reply[0] = if self.corrupt_ping { 0x00 } else { PING_MAGIC };
                fill(buf, &reply)
            }
            Reply::Data => {
                while self.skip_ids.contains(&self.next_packet_id) {
                    // the dropped packet still consumes waveform time
                    self.sample_clock += WORDS_PER_PACKET as u64;
                    self.next_packet_id += 1;
                }
                let mut frame = [0u8; DATA_FRAME_LEN];
                frame[..4].copy_from_slice(&self.next_packet_id.to_le_bytes());
                for slot in 0..WORDS_PER_PACKET {
                    let word = (self.wave)(self.sample_clock);
                    self.sample_clock += 1;
                    let at = 4 + slot * 4;
                    frame[at..at + 4].copy_from_slice(&word.to_le_bytes());
                }
                self.next_packet_id += 1;
                self.data_requests += 1;
                fill(buf, &frame)
            }
        }
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BulkTransport for SimTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if !self.present {
            return Err(TransportError::NotFound);
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_present(&mut self) -> bool {
        self.present
    }

    fn bulk_write(&mut self, buf: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        self.writes += 1;
        if !self.open {
            return Err(TransportError::Disconnected);
        }
        if self.short_writes > 0 {
            self.short_writes -= 1;
            return Ok(buf.len().saturating_sub(1));
        }
        let bias_arg = || u16::from_le_bytes([buf[4], buf[5]]);
        self.pending = match buf[0] {
            0x00 => {
                // reset drops any half-finished exchange
                Some(Reply::Ack)
            }
            0x01 => Some(Reply::Value(self.bias as u32)),
            0x02 => {
                self.bias = bias_arg();
                self.next_packet_id = 0;
                Some(Reply::Ack)
            }
            0x03 => Some(Reply::Data),
            0x04 => Some(Reply::Ack),
            0x05 => {
                self.bias = bias_arg();
                Some(Reply::Ack)
            }
            0x06 => Some(Reply::Value(SIM_FIRMWARE_VERSION)),
            0x80 => Some(Reply::Ping),
            0x81 => Some(Reply::Ack),
            _ => None,
        };
        Ok(buf.len())
    }

    fn bulk_read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        self.reads += 1;
        if !self.open {
            return Err(TransportError::Disconnected);
        }
        if self.failed_reads > 0 {
            self.failed_reads -= 1;
            return Err(TransportError::Transfer("injected read fault".into()));
        }
        match self.pending.take() {
            Some(reply) => Ok(self.serve(reply, buf)),
            None => Err(TransportError::Timeout),
        }
    }
}

fn fill(dst: &mut [u8], src: &[u8]) -> usize {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
    n
}

/// Triangle on x1/x2 with the nominal 60-sample period, x3 pinned midscale.
fn default_wave(clock: u64) -> u32 {
    let phase = (clock % 60) as u16;
    let x1 = if phase <= 30 {
        phase * 30
    } else {
        (60 - phase) * 30
    };
    codec::encode(x1, x1, 512)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_status_with_current_bias() {
        let mut sim = SimTransport::new();
        sim.open().unwrap();

        let mut set_bias = [0u8; 8];
        set_bias[0] = 0x05;
        set_bias[4..6].copy_from_slice(&1234u16.to_le_bytes());
        sim.bulk_write(&set_bias, Duration::from_millis(1)).unwrap();
        let mut ack = [0u8; 1];
        sim.bulk_read(&mut ack, Duration::from_millis(1)).unwrap();

        let mut status = [0u8; 8];
        status[0] = 0x01;
        sim.bulk_write(&status, Duration::from_millis(1)).unwrap();
        let mut value = [0u8; 4];
        assert_eq!(sim.bulk_read(&mut value, Duration::from_millis(1)).unwrap(), 4);
        assert_eq!(u32::from_le_bytes(value), 1234);
    }

    #[test]
    fn read_without_command_times_out() {
        let mut sim = SimTransport::new();
        sim.open().unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            sim.bulk_read(&mut buf, Duration::from_millis(1)),
            Err(TransportError::Timeout)
        ));
    }

    #[test]
    fn wave_stays_in_channel_range() {
        for clock in 0..200 {
            let (a, b, c) = codec::decode(default_wave(clock));
            assert!(a <= 1023 && b <= 1023 && c == 512);
        }
    }
}
