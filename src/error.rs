use thiserror::Error;

/// Failures raised by the injected USB transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device not found on the bus")]
    NotFound,
    #[error("failed to open the device: {0}")]
    Open(String),
    #[error("link is not connected")]
    Disconnected,
    #[error("bulk transfer failed: {0}")]
    Transfer(String),
    #[error("bulk transfer timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },
    #[error("short read: got {got} of {expected} bytes")]
    ShortRead { got: usize, expected: usize },
    #[error("unexpected response byte {got:#04x} (wanted {wanted:#04x})")]
    UnexpectedResponse { got: u8, wanted: u8 },
    #[error("block read outside a start/end sample bracket")]
    NotSampling,
    #[error("device self test failed after {attempts} attempts")]
    SelfTestFailed { attempts: u32 },
    #[error("bias value {0} is outside 0..=4095")]
    BiasOutOfRange(u32),
    #[error("transient discard count {0} is outside 0..=24")]
    InvalidTransientDiscard(u32),
    #[error("peaks per bias must be at least 1")]
    InvalidPeaksPerBias,
    #[error("display size {0} is outside 1020..=8192")]
    InvalidDisplayPoints(usize),
    #[error("invalid sweep: start {start}, end {end}, step {step}, periods {periods}")]
    InvalidSweep {
        start: u16,
        end: u16,
        step: u16,
        periods: usize,
    },
    #[error("spectrum input length {0} is not a power of two")]
    FftLength(usize),
    #[error("sink I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
