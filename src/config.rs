use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::relay::{RelayConfig, DEFAULT_SEND_QUEUE_CAPACITY, DEFAULT_TYPING_TIMEOUT};

pub const ADDR_VAR: &str = "CHAT_RELAY_ADDR";
pub const STATIC_DIR_VAR: &str = "CHAT_RELAY_STATIC_DIR";
pub const TLS_CERT_VAR: &str = "CHAT_RELAY_TLS_CERT";
pub const TLS_KEY_VAR: &str = "CHAT_RELAY_TLS_KEY";
pub const TYPING_TIMEOUT_VAR: &str = "CHAT_RELAY_TYPING_TIMEOUT_MS";
pub const SEND_QUEUE_VAR: &str = "CHAT_RELAY_SEND_QUEUE";

const DEFAULT_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_STATIC_DIR: &str = "public";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("CHAT_RELAY_TLS_CERT and CHAT_RELAY_TLS_KEY must be set together")]
    IncompleteTls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("No certificate found in {}", .0.display())]
    NoCertificate(PathBuf),
    #[error("No private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),
}

impl TlsConfig {
    /// Opens and parses both PEM files. warp panics when it cannot load them,
    /// so TLS is only selected once this succeeds.
    pub fn validate(&self) -> Result<(), TlsError> {
        let mut cert_reader = open(&self.cert_path)?;
        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TlsError::Read {
                path: self.cert_path.clone(),
                source,
            })?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificate(self.cert_path.clone()));
        }

        let mut key_reader = open(&self.key_path)?;
        match rustls_pemfile::private_key(&mut key_reader) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(TlsError::NoPrivateKey(self.key_path.clone())),
            Err(source) => Err(TlsError::Read {
                path: self.key_path.clone(),
                source,
            }),
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub static_dir: PathBuf,
    pub tls: Option<TlsConfig>,
    pub relay: RelayConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = match lookup(ADDR_VAR) {
            Some(value) => parse(ADDR_VAR, &value)?,
            None => parse(ADDR_VAR, DEFAULT_ADDR)?,
        };

        let static_dir = lookup(STATIC_DIR_VAR)
            .map_or_else(|| PathBuf::from(DEFAULT_STATIC_DIR), PathBuf::from);

        let tls = match (lookup(TLS_CERT_VAR), lookup(TLS_KEY_VAR)) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_path: cert.into(),
                key_path: key.into(),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTls),
        };

        let typing_timeout = match lookup(TYPING_TIMEOUT_VAR) {
            Some(value) => Duration::from_millis(parse(TYPING_TIMEOUT_VAR, &value)?),
            None => DEFAULT_TYPING_TIMEOUT,
        };

        let send_queue_capacity = match lookup(SEND_QUEUE_VAR) {
            Some(value) => {
                let capacity: usize = parse(SEND_QUEUE_VAR, &value)?;
                if capacity == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: SEND_QUEUE_VAR,
                        value,
                        reason: "must be greater than zero".to_string(),
                    });
                }
                capacity
            }
            None => DEFAULT_SEND_QUEUE_CAPACITY,
        };

        Ok(Config {
            bind_addr,
            static_dir,
            tls,
            relay: RelayConfig {
                typing_timeout,
                send_queue_capacity,
            },
        })
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
