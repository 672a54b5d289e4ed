use crate::cli::PortsArgs;
use intensity_relay::streaming::available_ports;

pub fn execute(args: PortsArgs) -> anyhow::Result<()> {
    let ports = available_ports()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    if ports.is_empty() {
        println!("No serial ports found");
    } else {
        for port in ports {
            println!("{}", port);
        }
    }
    Ok(())
}
