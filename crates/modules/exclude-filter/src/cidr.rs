use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CidrError {
    #[error("missing prefix length in {0}")]
    MissingPrefix(String),
    #[error("invalid address in {0}")]
    InvalidAddress(String),
    #[error("invalid prefix length in {0}")]
    InvalidPrefix(String),
}

/// An IP network in CIDR notation, e.g. `192.168.1.0/24`.
///
/// Host bits of the address are cleared on parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// IPv4 addresses mapped into IPv6 are matched against IPv4 networks.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip.to_canonical()) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => mask_v4(ip, self.prefix) == network,
            (IpAddr::V6(network), IpAddr::V6(ip)) => mask_v6(ip, self.prefix) == network,
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = s
            .split_once('/')
            .ok_or_else(|| CidrError::MissingPrefix(s.to_string()))?;
        let address: IpAddr = address
            .parse()
            .map_err(|_| CidrError::InvalidAddress(s.to_string()))?;
        let prefix: u8 = match prefix.parse::<u8>() {
            // leading signs and zeros aren't valid prefix lengths
            Ok(value) if prefix == value.to_string() => value,
            _ => return Err(CidrError::InvalidPrefix(s.to_string())),
        };

        let network = match address {
            IpAddr::V4(ip) if prefix <= 32 => IpAddr::V4(mask_v4(ip, prefix)),
            IpAddr::V6(ip) if prefix <= 128 => IpAddr::V6(mask_v6(ip, prefix)),
            _ => return Err(CidrError::InvalidPrefix(s.to_string())),
        };

        Ok(Self { network, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn mask_v4(ip: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    Ipv4Addr::from(u32::from(ip) & mask)
}

fn mask_v6(ip: Ipv6Addr, prefix: u8) -> Ipv6Addr {
    let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
    Ipv6Addr::from(u128::from(ip) & mask)
}
