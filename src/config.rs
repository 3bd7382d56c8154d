use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;
use tracing::Level;

pub const DEFAULT_PORT: u16 = 6767;
pub const DEFAULT_HZ_MS: u64 = 100;

#[derive(Parser, Debug, Clone)]
#[command(name = "godis")]
#[command(about = "Single-threaded in-memory key-value server", version)]
pub struct Config {
    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port to listen on (0 picks an ephemeral port)
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Interval of the background expiry job in milliseconds
    #[arg(long, default_value_t = DEFAULT_HZ_MS, value_parser = clap::value_parser!(u64).range(1..))]
    pub hz_ms: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    pub log_level: Level,
}

impl Config {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            hz_ms: DEFAULT_HZ_MS,
            log_level: Level::INFO,
        }
    }
}
