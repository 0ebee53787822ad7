use clap::Parser;
use serde::Deserialize;
use std::fs::read_to_string;

#[derive(Deserialize, Debug, Clone)]
pub struct Http {
    /// http transport port
    ///
    /// unary calls arrive as POST /rpc with an octet-stream body;
    /// websocket sessions upgrade on GET /rpc.
    #[serde(default = "Http::port")]
    pub port: u16,

    /// static content root
    ///
    /// accepted for configuration compatibility; this build does not
    /// serve static files and ignores the value with a warning.
    #[serde(default)]
    pub root_dir: Option<String>,

    /// terminate tls in front of the http transport
    ///
    /// accepted for configuration compatibility; certificate provisioning
    /// is outside this server and the flag only tags endpoints as ssl.
    #[serde(default)]
    pub ssl: bool,

    /// accepted and ignored; no http/3 framing in this build.
    #[serde(default)]
    pub http3: bool,

    /// accepted and ignored; no server-side rendering in this build.
    #[serde(default)]
    pub ssr: bool,
}

impl Http {
    fn port() -> u16 {
        8080
    }
}

impl Default for Http {
    fn default() -> Self {
        Self {
            port: Self::port(),
            root_dir: None,
            ssl: false,
            http3: false,
            ssr: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Trace => log::Level::Trace,
            Self::Debug => log::Level::Debug,
            Self::Info => log::Level::Info,
            Self::Warn => log::Level::Warn,
            // The log facade has no level above error.
            Self::Error | Self::Critical => log::Level::Error,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// the name this process advertises inside object references it
    /// hands out.
    #[serde(default = "Config::hostname")]
    pub hostname: String,

    /// tcp transport listen port; absent disables the tcp transport.
    #[serde(default)]
    pub listen_tcp_port: Option<u16>,

    /// udp transport listen port; absent disables the udp transport.
    #[serde(default)]
    pub listen_udp_port: Option<u16>,

    /// accepted for configuration compatibility; no quic transport in
    /// this build.
    #[serde(default)]
    pub listen_quic_port: Option<u16>,

    /// http/websocket transport configuration; absent disables both.
    #[serde(default)]
    pub http: Option<Http>,

    /// shared-memory listener name; absent disables the shm transport.
    /// peers connect with the same name.
    #[serde(default)]
    pub listen_shm: Option<String>,

    /// present clients to ssl peers with a self-signed certificate.
    #[serde(default)]
    pub ssl_client_self_signed_cert: bool,

    /// serve tcp ingress from a dedicated raw-epoll thread instead of
    /// the async acceptor.
    #[serde(default)]
    pub use_epoll_tcp: bool,

    /// capacity of each per-connection shared-memory ring.
    #[serde(default = "Config::shared_memory_size")]
    pub shared_memory_size: usize,

    #[serde(default)]
    pub log_level: LogLevel,

    /// frames whose header claims more than this are fatal to their
    /// session.
    #[serde(default = "Config::max_message_size")]
    pub max_message_size: usize,
}

impl Config {
    fn hostname() -> String {
        "localhost".to_string()
    }

    fn shared_memory_size() -> usize {
        shm::DEFAULT_RING_CAPACITY
    }

    fn max_message_size() -> usize {
        codec::MAX_MESSAGE_SIZE
    }
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config is valid")
    }
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    pub fn load() -> anyhow::Result<Self> {
        let cfg_str = Cli::parse()
            .config
            .and_then(|path| read_to_string(path).ok())
            .unwrap_or_default();

        Ok(toml::from_str(&cfg_str)?)
    }
}
