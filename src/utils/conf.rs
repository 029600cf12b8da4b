use std::time::Duration;

use anyhow::{Result, bail};
use config::{Config, Environment, File};
use plexus_bus::{BusConfig, ModulesConf};
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Conf {
    /// Name of this host, used as log prefix in `node` format
    pub id: String,
    /// "full", "json" or "node"
    pub log_format: String,
    #[serde_as(as = "DurationMilliSeconds")]
    pub tick_interval: Duration,
    /// Physics runs once every `physics_every` frames
    pub physics_every: u64,
    /// Stop after this many frames. Zero runs until interrupted.
    pub max_frames: u64,
    pub modules: ModulesConf,
    pub bus: BusConfig,
}

impl Conf {
    pub fn new(
        config_files: Vec<String>,
        log_format: Option<String>,
        max_frames: Option<u64>,
    ) -> Result<Self, anyhow::Error> {
        let mut s = Config::builder().add_source(File::from_str(
            include_str!("conf_defaults.toml"),
            config::FileFormat::Toml,
        ));
        // Priority order: config file, then environment variables, then CLI
        for config_file in config_files {
            s = s.add_source(File::with_name(&config_file).required(false));
        }
        let conf: Self = s
            .add_source(
                Environment::with_prefix("plexus")
                    .separator("__")
                    .prefix_separator("_")
                    .list_separator(",")
                    .with_list_parse_key("modules.enabled")
                    .with_list_parse_key("modules.disabled")
                    .try_parsing(true),
            )
            .set_override_option("log_format", log_format)?
            .set_override_option("max_frames", max_frames)?
            .build()?
            .try_deserialize()?;

        if conf.tick_interval.is_zero() {
            bail!("tick_interval must be at least one millisecond");
        }
        if conf.physics_every == 0 {
            bail!("physics_every must be at least 1");
        }
        Ok(conf)
    }
}
