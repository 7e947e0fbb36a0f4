// Integration time sweep example
//
// Picks a gain automatically, reads the sensor once per integration time and
// prints the readings as a DataFrame.

use clap::Parser;
use polars::prelude::*;
use spectro_link::settings::DEFAULT_RANGE_MS;
use spectro_link::{Session, SessionConfig, SerialSettings, DESCRIPTOR_PATTERNS};

#[derive(Parser)]
#[command(name = "integration_sweep")]
#[command(version = "1.0")]
#[command(about = "Read a sensor over a range of integration times")]
struct Args {
    /// Serial port to open instead of scanning
    #[arg(short, long)]
    port: Option<String>,

    /// Integration times in milliseconds, comma separated
    #[arg(short, long, value_delimiter = ',')]
    times: Vec<f64>,

    /// Skip the automatic gain selection
    #[arg(long)]
    fixed_gain: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let serial = SerialSettings::psoc();
    let config = SessionConfig::psoc();
    let session = match &args.port {
        Some(port) => Session::open_serial(port, &serial, config)?,
        None => Session::connect_serial(&DESCRIPTOR_PATTERNS, &serial, config)?,
    };
    let sensor = session.attached_sensor()?;

    if !args.fixed_gain {
        let gain = session.auto_gain(sensor)?;
        println!("Using gain {}", gain);
    }

    let times = if args.times.is_empty() {
        DEFAULT_RANGE_MS.to_vec()
    } else {
        args.times
    };

    let readings = session.read_range(sensor, &times)?;
    for (ms, reading) in times.iter().zip(&readings) {
        let df = reading
            .to_frame()?
            .lazy()
            .with_column(lit(*ms).alias("integration_ms"))
            .collect()?;
        println!("{}", df);
        if reading.saturated() {
            println!("Saturated at {} ms", ms);
        }
    }
    Ok(())
}
