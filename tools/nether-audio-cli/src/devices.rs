//! `devices` command

use anyhow::Result;

#[cfg(feature = "cpal")]
pub fn execute() -> Result<()> {
    let devices = nethercore_audio::sink::output_devices();
    if devices.is_empty() {
        println!("No output devices found");
    }
    for name in devices {
        println!("{}", name);
    }
    Ok(())
}

#[cfg(not(feature = "cpal"))]
pub fn execute() -> Result<()> {
    println!("Built without device output (enable the `cpal` feature)");
    Ok(())
}
