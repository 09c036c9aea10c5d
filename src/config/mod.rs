//! Server configuration.
//!
//! Values come from CLI flags, each with an environment fallback:
//!
//! | Flag                | Environment                   | Default                        |
//! |---------------------|-------------------------------|--------------------------------|
//! | `--scenario-root`   | `ISSUE_TRACKER_SCENARIO_ROOT` | current directory              |
//! | `--data-dir`        | `ISSUE_TRACKER_DATA_DIR`      | `<scenario_root>/data/issues`  |
//! | `--port`            | `API_PORT`                    | none, `serve` refuses to start |
//! | `--host`            | `API_HOST`                    | `127.0.0.1`                    |
//! | `--allowed-origins` | `WEBSOCKET_ALLOWED_ORIGINS`   | empty (origin check disabled)  |
//!
//! Paths are made absolute once, here, so every component agrees on them.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::processor::ProcessorState;
use crate::{Error, Result};

pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Issue store location relative to the scenario root.
pub const DEFAULT_DATA_SUBDIR: &str = "data/issues";

/// Where the tracker keeps its data and where the agent works.
#[derive(Debug, Clone, PartialEq)]
pub struct Paths {
    pub scenario_root: PathBuf,
    pub data_dir: PathBuf,
}

impl Paths {
    /// Resolve both roots, falling back to the current directory.
    pub fn resolve(scenario_root: Option<&Path>, data_dir: Option<&Path>) -> Result<Self> {
        let scenario_root = match scenario_root {
            Some(root) => std::path::absolute(root)?,
            None => std::env::current_dir()?,
        };
        let data_dir = match data_dir {
            Some(dir) => std::path::absolute(dir)?,
            None => scenario_root.join(DEFAULT_DATA_SUBDIR),
        };
        Ok(Self {
            scenario_root,
            data_dir,
        })
    }
}

/// Everything `serve` needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub paths: Paths,
    pub host: String,
    pub port: Option<u16>,
    /// Origins allowed to open the event stream; empty allows any
    pub allowed_origins: Vec<String>,
    /// Processor state at startup
    pub processor: ProcessorState,
}

impl ServerConfig {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            host: DEFAULT_HOST.to_string(),
            port: None,
            allowed_origins: Vec::new(),
            processor: ProcessorState::default(),
        }
    }

    /// Address to bind. Fails when no port was configured.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let port = self.port.ok_or_else(|| {
            Error::InvalidInput("API port is not configured (use --port or API_PORT)".to_string())
        })?;
        let host: IpAddr = self
            .host
            .parse()
            .map_err(|e| Error::InvalidInput(format!("Invalid host address '{}': {}", self.host, e)))?;
        Ok(SocketAddr::from((host, port)))
    }

    /// Whether a WebSocket client presenting `origin` may connect.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        origin_allowed(&self.allowed_origins, origin)
    }
}

/// Split a comma-separated origin list, dropping blanks.
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|o| o.trim().trim_end_matches('/'))
        .filter(|o| !o.is_empty())
        .map(String::from)
        .collect()
}

/// An empty allowlist admits everyone; otherwise the origin must match exactly.
pub fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match origin {
        Some(origin) => {
            let origin = origin.trim().trim_end_matches('/');
            allowed.iter().any(|a| a == origin)
        }
        None => false,
    }
}
