//! `config` command

use anyhow::{Context, Result};
use clap::Args;
use nethercore_audio::config::{self, AudioConfig};

#[derive(Args)]
pub struct ConfigArgs {
    /// Write the default configuration if none exists
    #[arg(long)]
    pub init: bool,
}

pub fn execute(args: ConfigArgs) -> Result<()> {
    let path = config::config_dir().map(|dir| dir.join("audio.toml"));
    match &path {
        Some(path) => println!("# {}", path.display()),
        None => println!("# no configuration directory"),
    }

    if args.init {
        if path.as_ref().is_some_and(|path| path.exists()) {
            println!("# already exists, left untouched");
        } else {
            config::save(&AudioConfig::default()).context("Failed to write configuration")?;
            println!("# written with defaults");
        }
    }

    let current = config::load();
    print!("{}", toml::to_string_pretty(&current)?);
    Ok(())
}
