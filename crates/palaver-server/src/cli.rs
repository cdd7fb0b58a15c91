use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "palaver-server", about = "Palaver realtime messaging hub")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/palaver.toml")]
    pub config: String,

    /// Bind address (host:port), overrides the config file
    #[arg(long)]
    pub bind: Option<String>,

    /// Database URL, overrides the config file
    #[arg(long)]
    pub db: Option<String>,

    /// Log filter, e.g. "palaver=debug" (overrides RUST_LOG)
    #[arg(long)]
    pub log: Option<String>,
}
