// Continuous reading example
//
// Starts a background reader thread and prints every reading it hands over
// until the requested count is reached.

use clap::Parser;
use spectro_link::{
    CancelToken, ReadWorker, Session, SessionConfig, SerialSettings, DESCRIPTOR_PATTERNS,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "continuous_read")]
#[command(version = "1.0")]
#[command(about = "Continuous readings from an AS726x / AS7265x sensor")]
struct Args {
    /// Serial port to open instead of scanning
    #[arg(short, long)]
    port: Option<String>,

    /// Milliseconds between readings
    #[arg(short = 'i', long, default_value_t = 1000, help = "Read period in milliseconds")]
    period_ms: u64,

    /// Number of readings to take
    #[arg(short, long, default_value_t = 10)]
    count: usize,

    /// Talk to a WiPy / Arduino MicroPython host instead of the PSoC
    #[arg(short, long)]
    micropython: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let (serial, config) = if args.micropython {
        (SerialSettings::micropython(), SessionConfig::micropython())
    } else {
        (SerialSettings::psoc(), SessionConfig::psoc())
    };

    let session = match &args.port {
        Some(port) => Session::open_serial(port, &serial, config)?,
        None => Session::connect_serial(&DESCRIPTOR_PATTERNS, &serial, config)?,
    };
    let sensor = session.attached_sensor()?;
    println!("Reading {} every {} ms", sensor, args.period_ms);

    let cancel = CancelToken::new();
    let worker = ReadWorker::spawn(
        Arc::new(session),
        sensor,
        Duration::from_millis(args.period_ms),
        cancel.clone(),
    )?;

    let mut received = 0;
    while received < args.count && worker.is_running() {
        match worker.recv_timeout(Duration::from_secs(10)) {
            Some(Ok(reading)) => {
                received += 1;
                let flag = if reading.saturated() { " (saturated)" } else { "" };
                println!("#{:3} gain {} {:?}{}", received, reading.gain(), reading.norm_data(), flag);
            }
            Some(Err(e)) => println!("Read failed: {}", e),
            None => println!("No reading in 10 s, device not responding"),
        }
    }

    cancel.cancel();
    worker.stop();
    println!("Done after {} readings", received);
    Ok(())
}
