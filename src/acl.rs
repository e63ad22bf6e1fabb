use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::Error;

/// A list of CIDR blocks evaluated against client addresses.
///
/// `check` answers for a single ip, `check_any`/`check_all` for an ordered ip
/// list (forwarded chain plus socket address). An empty acl matches nothing.
#[derive(Clone, Debug, Default)]
pub struct Acl {
    blocks: Vec<IpNet>,
}

impl Acl {
    pub fn new(blocks: impl IntoIterator<Item = impl AsRef<str>>) -> Result<Self, Error> {
        let blocks = blocks
            .into_iter()
            .map(|block| parse_block(block.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { blocks })
    }

    /// The rfc1918/rfc4193 set plus loopback and link local. Used as the
    /// default private-range acl when none is configured.
    pub fn private_ranges() -> Self {
        Self::new([
            "127.0.0.0/8",
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "169.254.0.0/16",
            "::1/128",
            "fc00::/7",
            "fe80::/10",
        ])
        .unwrap()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn check(&self, ip: IpAddr) -> bool {
        self.blocks.iter().any(|net| net.contains(&ip))
    }

    pub fn check_any(&self, ips: &[IpAddr]) -> bool {
        ips.iter().any(|ip| self.check(*ip))
    }

    pub fn check_all(&self, ips: &[IpAddr]) -> bool {
        !ips.is_empty() && ips.iter().all(|ip| self.check(*ip))
    }
}

// accept both bare addresses and cidr notation.
fn parse_block(block: &str) -> Result<IpNet, Error> {
    if let Ok(net) = block.parse::<IpNet>() {
        return Ok(net);
    }
    block
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| Error::Config(format!("invalid acl block: {block:?}")))
}

#[cfg(test)]
mod test {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn single_ip_block() {
        let acl = Acl::new(["1.2.3.4"]).unwrap();
        assert!(acl.check(ip("1.2.3.4")));
        assert!(!acl.check(ip("1.2.3.5")));
    }

    #[test]
    fn cidr_block() {
        let acl = Acl::new(["10.0.0.0/8", "::1/128"]).unwrap();
        assert!(acl.check(ip("10.200.1.1")));
        assert!(acl.check(ip("::1")));
        assert!(!acl.check(ip("11.0.0.1")));
    }

    #[test]
    fn any_and_all() {
        let acl = Acl::new(["127.0.0.0/8"]).unwrap();
        let ips = [ip("1.2.3.4"), ip("127.0.0.1")];
        assert!(acl.check_any(&ips));
        assert!(!acl.check_all(&ips));
        assert!(acl.check_all(&[ip("127.0.0.1"), ip("127.1.1.1")]));
        assert!(!acl.check_all(&[]));
    }

    #[test]
    fn empty_matches_nothing() {
        let acl = Acl::default();
        assert!(!acl.check(ip("127.0.0.1")));
        assert!(!acl.check_any(&[ip("127.0.0.1")]));
    }

    #[test]
    fn bad_block() {
        assert!(Acl::new(["not-an-ip"]).is_err());
    }
}
