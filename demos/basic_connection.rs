// Basic device discovery and connection example
//
// This example lists the serial ports, connects to the first sensor host found
// and performs the identification handshake.

use spectro_link::discovery::available_ports;
use spectro_link::{Session, SessionConfig, SerialSettings, DESCRIPTOR_PATTERNS};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (optional)
    env_logger::init();

    println!("Spectro Link Device Discovery Example");
    println!("=====================================\n");

    println!("1. Scanning serial ports...");
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found. Please connect a sensor host and try again.");
        return Ok(());
    }
    for (i, port) in ports.iter().enumerate() {
        let marker = if port.matches(&DESCRIPTOR_PATTERNS) { "*" } else { " " };
        println!(" {} {}. {} ({})", marker, i + 1, port.port, port.description);
    }
    println!();

    println!("2. Connecting to the first matching port...");
    let session = Session::connect_serial(&DESCRIPTOR_PATTERNS, &SerialSettings::psoc(), SessionConfig::psoc())?;
    println!("Successfully connected!");

    println!("\n3. Device information:");
    if let Some(identity) = session.identity() {
        println!("   Host: {}", identity.signature.as_deref().unwrap_or("unknown"));
        match identity.sensor {
            Some(sensor) => println!("   Sensor: {} ({:?} nm)", sensor, sensor.sorted_wavelengths()),
            None => println!("   No sensor attached"),
        }
    }

    println!("\n4. Connection test completed successfully!");
    Ok(())
}
