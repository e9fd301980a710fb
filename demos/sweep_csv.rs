//! Run a short bias sweep against the simulated instrument and write the
//! result to `sweep.csv`. Swap `SimTransport` for a real transport to drive
//! hardware.

use anyhow::{Context, Result};
use chaoscope::{CsvSink, Device, SimTransport, SweepSession};

fn main() -> Result<()> {
    env_logger::init();

    let mut dev = Device::new(SimTransport::new());
    dev.connect().context("opening the instrument")?;
    dev.self_test().context("device self test")?;

    let info = dev.info()?;
    println!("{}", serde_json::to_string_pretty(&info)?);

    let sink = CsvSink::create("sweep.csv").context("creating sweep.csv")?;
    let mut sweep = SweepSession::begin(sink, 0, 400, 100, 4)?;
    loop {
        let percent = sweep.advance(&mut dev)?;
        if percent == 0 {
            break;
        }
        println!("{percent}%");
    }
    sweep.finish()?;
    println!("sweep complete, wrote sweep.csv");
    Ok(())
}
