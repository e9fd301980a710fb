//! Framed command protocol spoken over the bulk link.
//!
//! Every command is one fixed 8-byte frame; the reply is a 1-byte
//! acknowledgement, a 4-byte little-endian value, a 64-byte ping reply, or a
//! full 1024-byte data frame. Data frames carry a sequential packet id; gaps
//! in the sequence are recorded as [`SequenceLoss`] events and the payload in
//! the gap is gone for good.

use log::{debug, warn};
use serde::Serialize;

use crate::bias::{BiasValue, BIAS_MAX};
use crate::error::{DriverError, TransportError};
use crate::transport::{BulkTransport, Link};

/// Outbound command frames are always this long.
pub const COMMAND_FRAME_LEN: usize = 8;
/// Data frames: 4-byte packet id plus 255 sample words.
pub const DATA_FRAME_LEN: usize = 1024;
pub const WORDS_PER_PACKET: usize = 255;

/// Upper bound on the settle discard count.
pub const TRANSIENT_DISCARD_MAX: u32 = 24;
pub const TRANSIENT_DISCARD_DEFAULT: u32 = 4;

/// Reserved idle opcode; the firmware never sees it from this driver.
pub const OPCODE_NONE: u8 = 0xFF;

const PING_REPLY_LEN: usize = 64;
const PING_MAGIC: u8 = 0x55;
const SELF_TEST_TRIES: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Opcode {
    Reset = 0x00,
    GetStatus = 0x01,
    StartSample = 0x02,
    GetData = 0x03,
    EndSample = 0x04,
    SetBias = 0x05,
    GetVersion = 0x06,
    Ping = 0x80,
    LedTest = 0x81,
}

fn frame(op: Opcode) -> [u8; COMMAND_FRAME_LEN] {
    let mut frame = [0u8; COMMAND_FRAME_LEN];
    frame[0] = op as u8;
    frame
}

// The 16-bit tap rides in bytes 4-5, little-endian.
fn frame_with_bias(op: Opcode, bias: BiasValue) -> [u8; COMMAND_FRAME_LEN] {
    let mut frame = frame(op);
    frame[4..6].copy_from_slice(&bias.get().to_le_bytes());
    frame
}

/// One decoded data frame.
pub struct Packet {
    pub id: u32,
    pub words: Vec<u32>,
}

/// Detected gap in the packet id sequence. The payload of the missing
/// packets is never recovered; the event only reports the span.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceLoss {
    /// Last id seen before the gap.
    pub before: u32,
    /// Id that arrived instead of `before + 1`.
    pub after: u32,
    /// Number of packets that went missing in between.
    pub missing: u32,
}

/// Operator-facing status snapshot.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct DeviceInfo {
    pub firmware_version: u32,
    pub bias: u16,
    pub resistance_ohms: u32,
}

/// The instrument, addressed through a [`Link`] over any [`BulkTransport`].
pub struct Device<T> {
    link: Link<T>,
    transient_discard: u32,
    last_packet_id: u32,
    in_sample: bool,
    losses: Vec<SequenceLoss>,
    packets_lost: u64,
}

impl<T: BulkTransport> Device<T> {
    pub fn new(transport: T) -> Self {
        Self {
            link: Link::new(transport),
            transient_discard: TRANSIENT_DISCARD_DEFAULT,
            last_packet_id: 0,
            in_sample: false,
            losses: Vec::new(),
            packets_lost: 0,
        }
    }

    pub fn connect(&mut self) -> Result<(), TransportError> {
        self.link.connect()
    }

    pub fn is_connected(&mut self) -> bool {
        self.link.is_connected()
    }

    pub fn close(&mut self) {
        self.link.close()
    }

    /// How many packets to pull and drop after `start_sample` so the analog
    /// path settles. The actual discard count is this plus one.
    pub fn set_transient_discard(&mut self, packets: u32) -> Result<(), DriverError> {
        if packets > TRANSIENT_DISCARD_MAX {
            return Err(DriverError::InvalidTransientDiscard(packets));
        }
        self.transient_discard = packets;
        Ok(())
    }

    /// Send the reset command.
    ///
    /// A failed write usually means the firmware is still holding a reply
    /// from an interrupted exchange, so drain one read and send again; only
    /// a failed resend is permanent.
    pub fn reset(&mut self) -> Result<(), DriverError> {
        let frame = frame(Opcode::Reset);
        if let Err(err) = self.send(&frame) {
            warn!("reset write failed ({err}), draining a pending read");
            let mut stale = [0u8; DATA_FRAME_LEN];
            match self.link.read(&mut stale) {
                Ok(n) => debug!("drained {n} stale bytes"),
                Err(err) => debug!("nothing pending to drain: {err}"),
            }
            self.send(&frame)?;
        }
        self.read_ack()
    }

    pub fn set_bias(&mut self, bias: BiasValue) -> Result<(), DriverError> {
        self.send(&frame_with_bias(Opcode::SetBias, bias))?;
        self.read_ack()
    }

    /// Current tap as reported by the firmware.
    pub fn get_status(&mut self) -> Result<BiasValue, DriverError> {
        self.send(&frame(Opcode::GetStatus))?;
        let raw = self.read_u32()?;
        if raw > BIAS_MAX as u32 {
            return Err(DriverError::BiasOutOfRange(raw));
        }
        BiasValue::new(raw as u16)
    }

    pub fn get_version(&mut self) -> Result<u32, DriverError> {
        self.send(&frame(Opcode::GetVersion))?;
        self.read_u32()
    }

    /// Status snapshot for operator display.
    pub fn info(&mut self) -> Result<DeviceInfo, DriverError> {
        let firmware_version = self.get_version()?;
        let bias = self.get_status()?;
        Ok(DeviceInfo {
            firmware_version,
            bias: bias.get(),
            resistance_ohms: bias.resistance_ohms(),
        })
    }

    /// Begin sampling at `bias`.
    ///
    /// After the acknowledgement, `transient_discard + 1` packets are pulled
    /// and dropped to let the analog path settle; the id of the last dropped
    /// packet becomes the sequencing baseline for the block reads that
    /// follow.
    pub fn start_sample(&mut self, bias: BiasValue) -> Result<(), DriverError> {
        self.send(&frame_with_bias(Opcode::StartSample, bias))?;
        self.read_ack()?;
        let mut baseline = 0;
        for _ in 0..=self.transient_discard {
            baseline = self.get_data()?.id;
        }
        self.last_packet_id = baseline;
        self.in_sample = true;
        Ok(())
    }

    /// Request and decode one data frame.
    pub fn get_data(&mut self) -> Result<Packet, DriverError> {
        self.send(&frame(Opcode::GetData))?;
        let mut buf = [0u8; DATA_FRAME_LEN];
        self.read_exact_len(&mut buf)?;
        let id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let words = buf[4..]
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        Ok(Packet { id, words })
    }

    /// Fill `dst` with consecutive samples at the current tap.
    ///
    /// Pulls as many packets as the destination needs, copying a short final
    /// slice from the last one. A packet id that is not the successor of the
    /// previous one records a [`SequenceLoss`] and the read carries on; a
    /// failed transfer aborts the block. Must run between
    /// [`Device::start_sample`] and [`Device::end_sample`].
    pub fn read_block(&mut self, dst: &mut [u32]) -> Result<(), DriverError> {
        if !self.in_sample {
            return Err(DriverError::NotSampling);
        }
        let mut cursor = 0;
        while cursor < dst.len() {
            let packet = self.get_data()?;
            let take = (dst.len() - cursor).min(WORDS_PER_PACKET);
            dst[cursor..cursor + take].copy_from_slice(&packet.words[..take]);
            self.note_packet_id(packet.id);
            cursor += take;
        }
        Ok(())
    }

    pub fn end_sample(&mut self) -> Result<(), DriverError> {
        self.in_sample = false;
        self.send(&frame(Opcode::EndSample))?;
        self.read_ack()
    }

    /// One complete acquisition: start, read `num_samples`, end.
    pub fn sample_at(&mut self, bias: BiasValue, num_samples: usize) -> Result<Vec<u32>, DriverError> {
        self.start_sample(bias)?;
        let mut block = vec![0u32; num_samples];
        if let Err(err) = self.read_block(&mut block) {
            // best effort: leave the firmware out of sampling mode
            let _ = self.end_sample();
            return Err(err);
        }
        self.end_sample()?;
        Ok(block)
    }

    /// Drain the sequence-loss events recorded since the last call.
    pub fn take_sequence_losses(&mut self) -> Vec<SequenceLoss> {
        std::mem::take(&mut self.losses)
    }

    /// Total packets lost across the life of this device handle.
    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    /// Ping the firmware and check the magic reply byte.
    pub fn ping(&mut self) -> Result<(), DriverError> {
        let mut frame = frame(Opcode::Ping);
        frame[1] = PING_REPLY_LEN as u8;
        self.send(&frame)?;
        let mut reply = [0u8; PING_REPLY_LEN];
        self.read_exact_len(&mut reply)?;
        if reply[0] != PING_MAGIC {
            return Err(DriverError::UnexpectedResponse {
                got: reply[0],
                wanted: PING_MAGIC,
            });
        }
        Ok(())
    }

    /// Flash the front-panel LEDs.
    pub fn led_test(&mut self) -> Result<(), DriverError> {
        self.send(&frame(Opcode::LedTest))?;
        self.read_ack()
    }

    /// Ping followed by an LED flash.
    ///
    /// The whole sequence retries up to five times with a link [`reset`]
    /// between attempts; a failing reset aborts immediately. Ordinary
    /// acquisition never auto-retries, this is the one exception.
    ///
    /// [`reset`]: Device::reset
    pub fn self_test(&mut self) -> Result<(), DriverError> {
        for attempt in 1..=SELF_TEST_TRIES {
            match self.ping().and_then(|_| self.led_test()) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!("self test attempt {attempt} failed: {err}");
                    if attempt == SELF_TEST_TRIES {
                        break;
                    }
                    self.reset()?;
                }
            }
        }
        Err(DriverError::SelfTestFailed {
            attempts: SELF_TEST_TRIES,
        })
    }

    pub fn transport(&self) -> &T {
        self.link.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.link.transport_mut()
    }

    fn send(&mut self, frame: &[u8; COMMAND_FRAME_LEN]) -> Result<(), DriverError> {
        let sent = self.link.write(frame)?;
        if sent != COMMAND_FRAME_LEN {
            return Err(DriverError::ShortWrite {
                sent,
                expected: COMMAND_FRAME_LEN,
            });
        }
        Ok(())
    }

    fn read_exact_len(&mut self, buf: &mut [u8]) -> Result<(), DriverError> {
        let got = self.link.read(buf)?;
        if got != buf.len() {
            return Err(DriverError::ShortRead {
                got,
                expected: buf.len(),
            });
        }
        Ok(())
    }

    fn read_ack(&mut self) -> Result<(), DriverError> {
        let mut ack = [0u8; 1];
        self.read_exact_len(&mut ack)
    }

    fn read_u32(&mut self) -> Result<u32, DriverError> {
        let mut value = [0u8; 4];
        self.read_exact_len(&mut value)?;
        Ok(u32::from_le_bytes(value))
    }

    fn note_packet_id(&mut self, id: u32) {
        let expected = self.last_packet_id.wrapping_add(1);
        if id != expected {
            let loss = SequenceLoss {
                before: self.last_packet_id,
                after: id,
                missing: id.wrapping_sub(self.last_packet_id).wrapping_sub(1),
            };
            warn!(
                "missing {} packets between ids {} and {}",
                loss.missing, loss.before, loss.after
            );
            self.packets_lost += loss.missing as u64;
            self.losses.push(loss);
        }
        self.last_packet_id = id;
    }
}
