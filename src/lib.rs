//! Driver and signal pipeline for a USB-attached chaotic-signal instrument.
//!
//! The unit streams three 10-bit channels of a chaotic oscillator, steered
//! by a single 12-bit bias ("tap") value. This crate covers the framed bulk
//! command protocol with sequence-loss detection, chunked and blocking bias
//! sweeps, the log-power spectrum path, delta-threshold peak detection with
//! a per-bias cache, and the per-frame support an interactive display needs
//! (trigger alignment, return-map extraction).
//!
//! The USB plumbing itself is injected through [`transport::BulkTransport`];
//! [`sim::SimTransport`] stands in for real hardware in tests and demos.

pub mod bias;
pub mod codec;
pub mod error;
pub mod peaks;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod sink;
pub mod spectrum;
pub mod transport;

pub use bias::BiasValue;
pub use error::{DriverError, TransportError};
pub use peaks::{find_peaks, Peak, PeakCache};
pub use pipeline::{LivePipeline, ReturnMapPoint};
pub use protocol::{Device, DeviceInfo, Packet, SequenceLoss};
pub use session::{sweep_to_sink, SweepSession};
pub use sim::SimTransport;
pub use sink::{CsvSink, MemorySink, SampleSink};
pub use spectrum::power_spectrum;
pub use transport::{BulkTransport, Link};
