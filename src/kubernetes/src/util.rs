use std::net::IpAddr;

use ipnet::IpNet;

/// Host route covering a single address.
pub fn host_prefix(addr: IpAddr) -> IpNet {
    IpNet::from(addr)
}

/// Accept either a bare address or a host prefix such as `10.0.0.1/32`.
pub fn parse_peer_address(s: &str) -> Option<IpAddr> {
    if let Ok(addr) = s.parse::<IpAddr>() {
        return Some(addr);
    }
    match s.parse::<IpNet>() {
        Ok(net) if net.prefix_len() == net.max_prefix_len() => Some(net.addr()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest(
        input,
        expected,
        case("10.0.0.1", Some("10.0.0.1")),
        case("10.0.0.1/32", Some("10.0.0.1")),
        case("fd00::1/128", Some("fd00::1")),
        case("10.0.0.0/24", None),
        case("peer", None)
    )]
    fn test_parse_peer_address(input: &str, expected: Option<&str>) {
        assert_eq!(
            expected.map(|e| e.parse::<IpAddr>().unwrap()),
            parse_peer_address(input)
        );
    }

    #[test]
    fn test_host_prefix() {
        assert_eq!(
            "192.168.1.1/32".parse::<IpNet>().unwrap(),
            host_prefix("192.168.1.1".parse().unwrap())
        );
        assert_eq!(
            "2001:db8::1/128".parse::<IpNet>().unwrap(),
            host_prefix("2001:db8::1".parse().unwrap())
        );
    }
}
