use anodiff_rs::config::AppConfig;
use clap::Parser;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.default.toml")]
    config: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let config = AppConfig::from_file(&args.config)?;
    anodiff_rs::eval::run(&config)
}
