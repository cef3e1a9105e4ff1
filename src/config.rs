use clap::Parser;

/// Multilateration server configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Listen address for receiver connections.
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:31090")]
    pub client_listen: String,

    /// Listen address for the JSON result feed; repeatable.
    #[arg(long, value_name = "ADDR")]
    pub results_listen: Vec<String>,

    /// Append results in CSV format to a local file; repeatable.
    #[arg(long, value_name = "FILE")]
    pub write_csv: Vec<String>,

    /// Directory for status snapshots (sync.json, coverage.json).
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<String>,

    /// Serve the work dir over HTTP on this port.
    #[arg(long, value_name = "PORT")]
    pub http_port: Option<u16>,

    /// Verbose logging (DEBUG level).
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}
