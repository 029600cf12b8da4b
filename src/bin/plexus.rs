use anyhow::{Context, Result};
use clap::Parser;
use plexus::{
    entrypoint::{main_process, welcome_message},
    utils::conf,
};
use plexus_bus::{log_error, utils::logger::setup_tracing};
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value = "config.toml")]
    pub config_file: Vec<String>,

    /// "full", "json" or "node"
    #[arg(long)]
    pub log_format: Option<String>,

    /// Stop after this many frames
    #[arg(long)]
    pub max_frames: Option<u64>,
}

fn main() {
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("Failed to build tokio runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = rt.block_on(inner_main()) {
        eprintln!("plexus failed: {err:#}");
        std::process::exit(1);
    }
}

async fn inner_main() -> Result<()> {
    let args = Args::parse();
    let config = conf::Conf::new(args.config_file, args.log_format, args.max_frames)
        .context("reading config file")?;

    setup_tracing(&config.log_format, config.id.clone())?;
    welcome_message(&config);

    let summary = log_error!(main_process(config).await, "Error running plexus")?;
    info!(
        "👋 Stopped after {} frames ({} modules)",
        summary.frames,
        summary.modules.len()
    );
    Ok(())
}
