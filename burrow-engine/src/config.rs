//! Server configuration
//!
//! TOML configuration for the tunnel server. Only the server half exists in
//! this crate; the client negotiates everything else in-band.
//!
//! # Example
//!
//! ```toml
//! topdomain = "t.example.com"
//! password = "secretpassword"
//!
//! listen = "0.0.0.0"
//! port = 53
//! tun_device = "burrow0"
//! tun_ip = "10.0.0.1"
//! netmask = 27
//! mtu = 1130
//!
//! # Answer `I` queries and NS glue with this address instead of the
//! # socket's own:
//! # ns_ip = "198.51.100.7"
//!
//! # Relay non-tunnel queries to a resolver on this localhost port:
//! # forward_port = 5353
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest accepted password, matching the 32-byte login hash block.
pub const MAX_PASSWORD_LEN: usize = 32;

fn default_listen() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    53
}

fn default_tun_device() -> String {
    "burrow0".to_string()
}

fn default_netmask() -> u8 {
    27
}

fn default_mtu() -> u16 {
    1130
}

fn default_check_ip() -> bool {
    true
}

/// Tunnel server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DNS zone delegated to this server. Any query ending in it is tunnel
    /// traffic; everything else may be forwarded.
    pub topdomain: String,

    /// Shared tunnel password (at most 32 bytes).
    pub password: String,

    /// Address of the IPv4 DNS socket.
    #[serde(default = "default_listen")]
    pub listen: IpAddr,

    /// Port for the DNS sockets. Port 0 picks an ephemeral port, which is
    /// only useful for tests.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Also listen on this IPv6 address.
    #[serde(default)]
    pub listen_v6: Option<Ipv6Addr>,

    /// Name of the TUN interface to create.
    #[serde(default = "default_tun_device")]
    pub tun_device: String,

    /// Server address inside the tunnel subnet. Clients get the addresses
    /// after it.
    pub tun_ip: Ipv4Addr,

    /// Tunnel subnet prefix length.
    #[serde(default = "default_netmask")]
    pub netmask: u8,

    /// MTU announced to clients and set on the TUN interface.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// External address handed out in `I` replies and NS glue records.
    /// Defaults to the address the DNS socket is bound to.
    #[serde(default)]
    pub ns_ip: Option<Ipv4Addr>,

    /// Reject queries whose source address differs from the one the
    /// session was established from.
    #[serde(default = "default_check_ip")]
    pub check_ip: bool,

    /// Shut down after this many seconds without any client activity.
    #[serde(default)]
    pub max_idle_time: Option<u64>,

    /// Relay queries outside the topdomain to 127.0.0.1 on this port.
    #[serde(default)]
    pub forward_port: Option<u16>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.topdomain.is_empty() || self.topdomain.len() > 128 {
            return Err(Error::Config(
                "topdomain must be 1..=128 characters".into(),
            ));
        }
        if self.topdomain.starts_with('.') || self.topdomain.ends_with('.') {
            return Err(Error::Config(
                "topdomain must not have leading or trailing dots".into(),
            ));
        }
        if self.password.is_empty() {
            return Err(Error::Config("password is required".into()));
        }
        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(Error::Config(format!(
                "password longer than {} bytes",
                MAX_PASSWORD_LEN
            )));
        }
        if !(8..=30).contains(&self.netmask) {
            return Err(Error::Config(format!(
                "netmask /{} out of range (8..=30)",
                self.netmask
            )));
        }
        if self.mtu < 576 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 576)",
                self.mtu
            )));
        }
        if self.forward_port == Some(0) {
            return Err(Error::Config("forward_port must not be 0".into()));
        }
        Ok(())
    }

    /// Generate a commented sample configuration.
    pub fn sample() -> String {
        concat!(
            "# burrow tunnel server configuration\n",
            "\n",
            "# DNS zone delegated to this server (NS record pointing here)\n",
            "topdomain = \"t.example.com\"\n",
            "password = \"secretpassword\"\n",
            "\n",
            "listen = \"0.0.0.0\"\n",
            "port = 53\n",
            "# listen_v6 = \"::\"\n",
            "\n",
            "tun_device = \"burrow0\"\n",
            "tun_ip = \"10.0.0.1\"\n",
            "netmask = 27\n",
            "mtu = 1130\n",
            "\n",
            "# External address for `I` replies and NS glue\n",
            "# ns_ip = \"198.51.100.7\"\n",
            "\n",
            "check_ip = true\n",
            "# max_idle_time = 3600\n",
            "# forward_port = 5353\n",
        )
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config::from_toml(
            r#"
            topdomain = "t.example.com"
            password = "secret"
            tun_ip = "10.0.0.1"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_minimal_config_defaults() {
        let cfg = minimal();
        assert_eq!(cfg.port, 53);
        assert_eq!(cfg.netmask, 27);
        assert_eq!(cfg.mtu, 1130);
        assert_eq!(cfg.tun_device, "burrow0");
        assert!(cfg.check_ip);
        assert!(cfg.listen_v6.is_none());
        assert!(cfg.forward_port.is_none());
    }

    #[test]
    fn test_sample_parses() {
        let cfg = Config::from_toml(&Config::sample()).unwrap();
        assert_eq!(cfg.topdomain, "t.example.com");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::from_toml("topdomain = \"\"\npassword = \"x\"\ntun_ip = \"10.0.0.1\"").is_err());
        assert!(Config::from_toml(
            "topdomain = \"t.example.com\"\npassword = \"\"\ntun_ip = \"10.0.0.1\""
        )
        .is_err());
        assert!(Config::from_toml(
            "topdomain = \"t.example.com\"\npassword = \"x\"\ntun_ip = \"10.0.0.1\"\nnetmask = 31"
        )
        .is_err());
        assert!(Config::from_toml(
            "topdomain = \"t.example.com\"\npassword = \"x\"\ntun_ip = \"10.0.0.1\"\nmtu = 100"
        )
        .is_err());

        let long_pw = format!(
            "topdomain = \"t.example.com\"\npassword = \"{}\"\ntun_ip = \"10.0.0.1\"",
            "p".repeat(40)
        );
        assert!(Config::from_toml(&long_pw).is_err());
    }
}
