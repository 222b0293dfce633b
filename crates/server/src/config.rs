use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 39400;

/// Tabletop session server.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "tabletop-server", version, about)]
pub struct Cli {
    /// Address to bind, e.g. 127.0.0.1:39400.
    #[arg(long)]
    pub addr: Option<SocketAddr>,

    /// SQLite database file.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// YAML file with `addr`, `db_path` and `allowed_origins`.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub addr: Option<SocketAddr>,
    pub db_path: Option<PathBuf>,
    pub allowed_origins: Vec<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parse config: {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::merge(cli, file))
    }

    /// CLI flags win over the file; the file wins over defaults.
    pub fn merge(cli: &Cli, file: FileConfig) -> Self {
        Self {
            addr: cli
                .addr
                .or(file.addr)
                .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT)),
            db_path: cli
                .db
                .clone()
                .or(file.db_path)
                .unwrap_or_else(default_db_path),
            allowed_origins: file.allowed_origins,
        }
    }
}

pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tabletop")
        .join("tabletop.db")
}
