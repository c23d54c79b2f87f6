//! IPv4 CIDR parsing and equal-size subnet carving for VPC layouts.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Smallest subnet AWS allows in a VPC.
pub const MIN_SUBNET_PREFIX: u8 = 28;

/// Largest VPC AWS allows.
pub const MAX_VPC_PREFIX: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    fn size(prefix: u8) -> u64 {
        1u64 << (32 - u32::from(prefix))
    }

    /// Whether `other` lies entirely inside this block.
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        if other.prefix < self.prefix {
            return false;
        }
        let start = u64::from(self.network);
        let end = start + Self::size(self.prefix);
        let o_start = u64::from(other.network);
        o_start >= start && o_start + Self::size(other.prefix) <= end
    }

    /// Carve `count` equally sized, consecutive subnets from the front of
    /// the block. Each subnet gets the smallest prefix that fits `count`
    /// into the block, and must be no smaller than /28.
    pub fn split(&self, count: usize) -> Result<Vec<Ipv4Cidr>, String> {
        if count == 0 {
            return Err("cannot split into zero subnets".to_string());
        }
        let bits = usize::BITS - (count - 1).leading_zeros();
        let new_prefix = u32::from(self.prefix) + bits;
        if new_prefix > u32::from(MIN_SUBNET_PREFIX) {
            return Err(format!(
                "{} cannot hold {} subnets of at least /{}",
                self, count, MIN_SUBNET_PREFIX
            ));
        }
        let new_prefix = new_prefix as u8;
        let step = Self::size(new_prefix);
        (0..count as u64)
            .map(|i| {
                let network = u64::from(self.network) + i * step;
                u32::try_from(network)
                    .map(|network| Ipv4Cidr {
                        network,
                        prefix: new_prefix,
                    })
                    .map_err(|_| format!("{} overflows the IPv4 space", self))
            })
            .collect()
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("missing prefix length in '{}'", s))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| format!("bad address '{}': {}", addr, e))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| format!("bad prefix '{}': {}", prefix, e))?;
        if prefix > 32 {
            return Err(format!("prefix /{} exceeds /32", prefix));
        }
        let network = u32::from(addr);
        let host_bits = Self::size(prefix) - 1;
        if u64::from(network) & host_bits != 0 {
            return Err(format!("'{}' has host bits set", s));
        }
        Ok(Self { network, prefix })
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_and_display() {
        let c: Ipv4Cidr = "10.1.0.0/20".parse().unwrap();
        assert_eq!(c.prefix(), 20);
        assert_eq!(c.to_string(), "10.1.0.0/20");
    }

    #[test]
    fn test_parse_errors() {
        assert!("10.1.0.0".parse::<Ipv4Cidr>().is_err());
        assert!("10.1.0.300/20".parse::<Ipv4Cidr>().is_err());
        assert!("10.1.0.0/33".parse::<Ipv4Cidr>().is_err());
        let err = "10.1.0.1/20".parse::<Ipv4Cidr>().unwrap_err();
        assert!(err.contains("host bits"));
    }

    #[test]
    fn test_split_two_azs() {
        let c: Ipv4Cidr = "10.1.0.0/20".parse().unwrap();
        let subnets: Vec<String> = c.split(4).unwrap().iter().map(|s| s.to_string()).collect();
        assert_eq!(
            subnets,
            vec!["10.1.0.0/22", "10.1.4.0/22", "10.1.8.0/22", "10.1.12.0/22"]
        );
    }

    #[test]
    fn test_split_non_power_of_two() {
        let c: Ipv4Cidr = "10.3.0.0/20".parse().unwrap();
        let subnets = c.split(6).unwrap();
        assert_eq!(subnets.len(), 6);
        assert!(subnets.iter().all(|s| s.prefix() == 23));
    }

    #[test]
    fn test_split_too_small() {
        let c: Ipv4Cidr = "10.0.0.0/27".parse().unwrap();
        assert!(c.split(4).is_err());
        assert!(c.split(0).is_err());
        assert_eq!(c.split(1).unwrap()[0].prefix(), 27);
    }

    proptest! {
        #[test]
        fn prop_split_subnets_disjoint_and_inside(
            octet in 0u8..=255,
            prefix in 16u8..=24,
            count in 1usize..=12,
        ) {
            let base = u32::from(Ipv4Addr::new(10, octet, 0, 0));
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) };
            let parent = Ipv4Cidr { network: base & mask, prefix };
            let subnets = parent.split(count).unwrap();
            prop_assert_eq!(subnets.len(), count);
            for (i, a) in subnets.iter().enumerate() {
                prop_assert!(parent.contains(a));
                for b in subnets.iter().skip(i + 1) {
                    prop_assert!(!a.contains(b) && !b.contains(a));
                }
            }
        }
    }
}
