//! Proxy configuration and CLI parsing.

use clap::{Parser, ValueEnum};

/// Hard ceiling on worker threads.
pub const MAX_THREADS: usize = 500;

/// When the proxy should stop multiplexing clients over shared upstream
/// connections and give each client its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MultiplexingPolicy {
    /// Keep multiplexing no matter what.
    Never,
    /// Switch a worker's clients to private connections when its shared
    /// request queues grow past the threshold.
    Auto,
    /// Every client gets private connections from the start.
    Always,
}

impl std::fmt::Display for MultiplexingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MultiplexingPolicy::Never => write!(f, "never"),
            MultiplexingPolicy::Auto => write!(f, "auto"),
            MultiplexingPolicy::Always => write!(f, "always"),
        }
    }
}

/// Minimum log level, matching the levels the logger exposes.
/// `success` is accepted for compatibility and maps to `info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    /// The `tracing` filter directive for this level.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info | LogLevel::Success => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Command line interface.
#[derive(Debug, Parser)]
#[command(
    name = "manifold-proxy",
    version,
    about = "Multi-threaded multiplexing proxy for sharded key-value clusters"
)]
pub struct Args {
    /// Cluster seed address as host:port.
    pub cluster: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 7777)]
    pub port: u16,

    /// Maximum number of simultaneous clients.
    #[arg(long, default_value_t = 10_000_000)]
    pub maxclients: usize,

    /// Worker thread count (clamped to 1..=500).
    #[arg(long, default_value_t = 8)]
    pub threads: usize,

    /// TCP keepalive for client sockets, in seconds (0 disables).
    #[arg(long, default_value_t = 300)]
    pub tcpkeepalive: u64,

    /// Run in the background.
    #[arg(long)]
    pub daemonize: bool,

    /// When multiplexing should be disabled.
    #[arg(long, value_enum, default_value_t = MultiplexingPolicy::Auto)]
    pub disable_multiplexing: MultiplexingPolicy,

    /// Authentication password sent to cluster nodes.
    #[arg(short = 'a', long)]
    pub auth: Option<String>,

    /// Disable colorized log output.
    #[arg(long)]
    pub disable_colors: bool,

    /// Minimum log level.
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Log query arguments (log-level debug only).
    #[arg(long)]
    pub dump_queries: bool,

    /// Log raw query buffers (log-level debug only).
    #[arg(long)]
    pub dump_buffer: bool,
}

/// Runtime configuration shared by the listener and every worker.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub maxclients: usize,
    pub threads: usize,
    pub tcpkeepalive: u64,
    pub multiplexing: MultiplexingPolicy,
    pub auth: Option<String>,
    pub dump_queries: bool,
    pub dump_buffer: bool,
}

impl Args {
    pub fn to_config(&self) -> ProxyConfig {
        let mut threads = self.threads;
        if threads > MAX_THREADS {
            eprintln!("warning: maximum threads allowed: {MAX_THREADS}");
            threads = MAX_THREADS;
        } else if threads < 1 {
            threads = 1;
        }
        ProxyConfig {
            port: self.port,
            maxclients: self.maxclients,
            threads,
            tcpkeepalive: self.tcpkeepalive,
            multiplexing: self.disable_multiplexing,
            auth: self.auth.clone(),
            dump_queries: self.dump_queries,
            dump_buffer: self.dump_buffer,
        }
    }
}

/// Splits a `host:port` seed address. A missing host (`:7000`) means
/// localhost.
pub fn parse_seed(address: &str) -> Result<(String, u16), String> {
    let (host, port_str) = address
        .rsplit_once(':')
        .ok_or_else(|| format!("invalid cluster address '{address}': expected host:port"))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| format!("invalid port in cluster address '{address}'"))?;
    let host = if host.is_empty() { "localhost" } else { host };
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_parsing() {
        assert_eq!(parse_seed("10.0.0.1:7000").unwrap(), ("10.0.0.1".into(), 7000));
        assert_eq!(parse_seed(":7000").unwrap(), ("localhost".into(), 7000));
        assert!(parse_seed("no-port").is_err());
        assert!(parse_seed("host:not-a-port").is_err());
    }

    #[test]
    fn thread_count_clamped() {
        let mut args = Args::parse_from(["manifold-proxy", "127.0.0.1:7000", "--threads", "9999"]);
        assert_eq!(args.to_config().threads, MAX_THREADS);
        args.threads = 0;
        assert_eq!(args.to_config().threads, 1);
    }

    #[test]
    fn defaults_match_documentation() {
        let args = Args::parse_from(["manifold-proxy", "127.0.0.1:7000"]);
        let cfg = args.to_config();
        assert_eq!(cfg.port, 7777);
        assert_eq!(cfg.threads, 8);
        assert_eq!(cfg.tcpkeepalive, 300);
        assert_eq!(cfg.multiplexing, MultiplexingPolicy::Auto);
        assert_eq!(cfg.maxclients, 10_000_000);
    }

    #[test]
    fn log_levels_map_to_directives() {
        assert_eq!(LogLevel::Success.as_directive(), "info");
        assert_eq!(LogLevel::Warning.as_directive(), "warn");
        assert_eq!(LogLevel::Debug.as_directive(), "debug");
    }
}
