// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use thiserror::Error;

/// Default HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 8010;

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_HTTP_PORT),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `DOMJOIN_HTTP_BIND`: listen address (default: `127.0.0.1`)
    /// - `DOMJOIN_HTTP_PORT`: listen port (default: 8010)
    pub fn from_env() -> Result<Self, ServerConfigError> {
        let ip: IpAddr = match std::env::var("DOMJOIN_HTTP_BIND") {
            Ok(value) => value
                .trim()
                .parse()
                .map_err(|_| ServerConfigError::Invalid("DOMJOIN_HTTP_BIND", value))?,
            Err(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        };
        let port: u16 = match std::env::var("DOMJOIN_HTTP_PORT") {
            Ok(value) => value
                .trim()
                .parse()
                .map_err(|_| ServerConfigError::Invalid("DOMJOIN_HTTP_PORT", value))?,
            Err(_) => DEFAULT_HTTP_PORT,
        };

        Ok(Self {
            bind_addr: SocketAddr::new(ip, port),
        })
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ServerConfigError {
    /// A variable holds an unusable value.
    #[error("{0} has invalid value '{1}'")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_binds_localhost() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8010");
    }

    // Variables are process-global, so all cases live in one test.
    #[test]
    fn test_from_env() {
        // SAFETY: no other test in this crate touches these variables.
        unsafe {
            std::env::set_var("DOMJOIN_HTTP_BIND", "0.0.0.0");
            std::env::set_var("DOMJOIN_HTTP_PORT", "9100");
        }
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9100");

        unsafe {
            std::env::set_var("DOMJOIN_HTTP_PORT", "http");
        }
        let err = ServerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DOMJOIN_HTTP_PORT"));

        unsafe {
            std::env::remove_var("DOMJOIN_HTTP_BIND");
            std::env::remove_var("DOMJOIN_HTTP_PORT");
        }
        assert_eq!(ServerConfig::from_env().unwrap(), ServerConfig::default());
    }
}
