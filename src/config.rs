use std::{
    net::{Ipv4Addr, SocketAddr},
    path::Path,
};

use serde::{Deserialize, Serialize};

/// Static deployment shared by every process: the ordered resolver endpoints
/// (a replica's id is its index) and the number of service categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub resolvers: Vec<SocketAddr>,
    pub services: u8,
}

pub const DEFAULT_BASE_PORT: u16 = 6000;

impl Default for Config {
    fn default() -> Self {
        Self::loopback(DEFAULT_BASE_PORT, 3, 2)
    }
}

impl Config {
    pub fn loopback(base_port: u16, num_resolver: u16, services: u8) -> Self {
        Self {
            resolvers: (0..num_resolver)
                .map(|i| SocketAddr::from((Ipv4Addr::LOCALHOST, base_port + i)))
                .collect(),
            services,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let config = serde_json::from_slice::<Self>(&std::fs::read(path)?)
            .map_err(|err| crate::err!("parse config {}: {err}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.resolvers.is_empty() {
            crate::bail!("no resolver configured")
        }
        for (i, addr) in self.resolvers.iter().enumerate() {
            if !addr.is_ipv4() {
                crate::bail!("resolver {i} address {addr} is not IPv4")
            }
            if addr.ip().is_unspecified() {
                crate::bail!("resolver {i} address {addr} is unspecified")
            }
            if self.resolvers[..i].contains(addr) {
                crate::bail!("resolver {i} address {addr} is duplicated")
            }
        }
        Ok(())
    }

    pub fn resolver_addr(&self, id: usize) -> crate::Result<SocketAddr> {
        self.resolvers
            .get(id)
            .copied()
            .ok_or_else(|| crate::err!("resolver {id} not configured"))
    }

    /// Every configured resolver except `id`.
    pub fn peer_addrs(&self, id: usize) -> Vec<SocketAddr> {
        self.resolvers
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != id)
            .map(|(_, &addr)| addr)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_loopback() {
        let config = Config::default();
        assert_eq!(config.resolvers.len(), 3);
        assert_eq!(config.resolvers[2], SocketAddr::from(([127, 0, 0, 1], 6002)));
        assert_eq!(config.services, 2);
        config.validate().unwrap();
        assert_eq!(
            config.peer_addrs(1),
            [config.resolvers[0], config.resolvers[2]]
        );
        assert!(config.resolver_addr(3).is_err());
    }

    #[test]
    fn json() {
        let config = serde_json::from_str::<Config>(
            r#"{"resolvers": ["10.0.0.1:6000", "10.0.0.2:6000"], "services": 4}"#,
        )
        .unwrap();
        assert_eq!(config.resolvers[1], SocketAddr::from(([10, 0, 0, 2], 6000)));
        config.validate().unwrap();

        let duplicated = Config {
            resolvers: vec![config.resolvers[0]; 2],
            services: 1,
        };
        assert!(duplicated.validate().is_err());
        let unspecified = Config {
            resolvers: vec![SocketAddr::from(([0, 0, 0, 0], 6000))],
            services: 1,
        };
        assert!(unspecified.validate().is_err());
        assert!(Config {
            resolvers: Vec::new(),
            services: 1
        }
        .validate()
        .is_err());
    }
}
