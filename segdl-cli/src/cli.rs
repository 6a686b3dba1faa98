use std::path::PathBuf;

use clap::Parser;
use segdl_engine::ProxyType;

#[derive(Parser, Debug)]
#[command(name = "segdl", author, version, about = "Segmented HTTP downloader", long_about = None)]
pub struct Args {
    /// URL of the resource to download
    pub url: String,

    /// Output file path
    #[arg(short, long, conflicts_with = "dir")]
    pub output: Option<PathBuf>,

    /// Directory to save into; the file name is taken from the URL
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Number of parallel connections
    #[arg(short, long)]
    pub connections: Option<usize>,

    /// Engine configuration file (JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Retries per segment before the download fails
    #[arg(long)]
    pub retries: Option<u32>,

    /// Proxy URL (e.g. http://127.0.0.1:8080, socks5://127.0.0.1:1080)
    #[arg(long)]
    pub proxy: Option<String>,

    /// Proxy type, inferred from the proxy URL when omitted
    #[arg(long, value_enum, requires = "proxy")]
    pub proxy_type: Option<ProxyType>,

    #[arg(long, requires = "proxy_password")]
    pub proxy_username: Option<String>,

    #[arg(long, requires = "proxy_username")]
    pub proxy_password: Option<String>,

    /// Extra request header as `Name: value`; repeatable
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Print events as JSON lines instead of a progress bar
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}

/// Parses `Name: value` (or `Name=value`) into a header pair.
pub fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .or_else(|| raw.split_once('='))
        .ok_or_else(|| format!("invalid header `{raw}`, expected `Name: value`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("invalid header `{raw}`, empty name"));
    }
    Ok((name.to_owned(), value.trim().to_owned()))
}
