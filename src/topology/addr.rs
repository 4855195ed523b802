//! IPv4 address-with-prefix type used for host, gateway and subnet addresses.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidrError {
    #[error("invalid IPv4 address in '{0}'")]
    Address(String),
    #[error("invalid prefix length in '{0}' (expected 0-32)")]
    Prefix(String),
}

/// An IPv4 address with a prefix length, e.g. `10.0.0.254/8`.
///
/// The address keeps its host bits: `10.0.0.254/8` names the gateway
/// interface, while [`Ipv4Cidr::network`] yields `10.0.0.0/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Mininet's default host subnet, `10.0.0.0/8`.
    pub const DEFAULT_SUBNET: Ipv4Cidr = Ipv4Cidr {
        addr: Ipv4Addr::new(10, 0, 0, 0),
        prefix: 8,
    };

    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, CidrError> {
        if prefix > 32 {
            return Err(CidrError::Prefix(format!("{addr}/{prefix}")));
        }
        Ok(Self { addr, prefix })
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn mask(&self) -> u32 {
        (!0u32).checked_shl(32 - u32::from(self.prefix)).unwrap_or(0)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask())
    }

    /// The network this address belongs to, host bits cleared.
    pub fn network(&self) -> Ipv4Cidr {
        Ipv4Cidr {
            addr: Ipv4Addr::from(u32::from(self.addr) & self.mask()),
            prefix: self.prefix,
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.addr) & self.mask()
    }

    /// The `n`-th host address of the network, with this prefix.
    ///
    /// Returns `None` for `n == 0` (network address), for the broadcast
    /// address, and past the end of the range.
    pub fn host(&self, n: u32) -> Option<Ipv4Cidr> {
        let size = 1u64 << (32 - u32::from(self.prefix));
        if n == 0 || u64::from(n) >= size.saturating_sub(1) {
            return None;
        }
        let base = u32::from(self.network().addr);
        Some(Ipv4Cidr {
            addr: Ipv4Addr::from(base + n),
            prefix: self.prefix,
        })
    }

    /// Reuse this prefix length for another address.
    pub fn with_addr(&self, addr: Ipv4Addr) -> Ipv4Cidr {
        Ipv4Cidr {
            addr,
            prefix: self.prefix,
        }
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (
                addr,
                prefix
                    .parse::<u8>()
                    .map_err(|_| CidrError::Prefix(s.to_string()))?,
            ),
            None => (s, 32),
        };
        let addr = addr
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| CidrError::Address(s.to_string()))?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = CidrError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(c: Ipv4Cidr) -> String {
        c.to_string()
    }
}
