use flint::shared::{ErrorType, NetworkError, NetworkResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Scheme prefix of every peer-facing address string.
pub const ADDRESS_PREFIX: &str = "tcp-";

/// Parses a peer address of the form `tcp-HOST:PORT` with a literal IPv4
/// or bracketed IPv6 host. Name resolution happens outside the communicator.
pub fn parse_peer_address(text: &str) -> NetworkResult<SocketAddr> {
    let rest = text
        .strip_prefix(ADDRESS_PREFIX)
        .ok_or(NetworkError::Fatal(ErrorType::AddrParse))?;

    Ok(rest.parse::<SocketAddr>()?)
}

/// Formats a socket address into its peer-facing `tcp-HOST:PORT` form.
pub fn format_address(addr: &SocketAddr) -> String {
    format!("{}{}", ADDRESS_PREFIX, addr)
}

/// Expands one bind specification into socket addresses. A bare port binds
/// the IPv4 wildcard and, unless disabled, the IPv6 wildcard as well; any
/// other form is a literal address with an optional `tcp-` prefix.
pub fn expand_bind_spec(spec: &str, disable_v6: bool) -> NetworkResult<Vec<SocketAddr>> {
    if let Ok(port) = spec.parse::<u16>() {
        let mut addrs = vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)];

        if !disable_v6 {
            addrs.push(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port));
        }

        return Ok(addrs);
    }

    let rest = spec.strip_prefix(ADDRESS_PREFIX).unwrap_or(spec);

    Ok(vec![rest.parse::<SocketAddr>()?])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_address_v4() {
        let addr = parse_peer_address("tcp-127.0.0.1:2086").unwrap();
        assert_eq!(addr, "127.0.0.1:2086".parse().unwrap());
    }

    #[test]
    fn test_parse_peer_address_v6() {
        let addr = parse_peer_address("tcp-[::1]:2086").unwrap();
        assert_eq!(addr, "[::1]:2086".parse().unwrap());
    }

    #[test]
    fn test_parse_peer_address_requires_prefix() {
        assert_eq!(
            parse_peer_address("127.0.0.1:2086").unwrap_err(),
            NetworkError::Fatal(ErrorType::AddrParse)
        );
    }

    #[test]
    fn test_format_roundtrip() {
        let addr: SocketAddr = "10.0.0.7:999".parse().unwrap();
        let text = format_address(&addr);

        assert_eq!(text, "tcp-10.0.0.7:999");
        assert_eq!(parse_peer_address(&text).unwrap(), addr);
    }

    #[test]
    fn test_bare_port_expands_to_both_wildcards() {
        let addrs = expand_bind_spec("2086", false).unwrap();

        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0], "0.0.0.0:2086".parse().unwrap());
        assert_eq!(addrs[1], "[::]:2086".parse().unwrap());
    }

    #[test]
    fn test_bare_port_respects_disable_v6() {
        let addrs = expand_bind_spec("2086", true).unwrap();

        assert_eq!(addrs, vec!["0.0.0.0:2086".parse().unwrap()]);
    }

    #[test]
    fn test_explicit_bind_spec() {
        let addrs = expand_bind_spec("tcp-192.168.1.2:4000", false).unwrap();
        assert_eq!(addrs, vec!["192.168.1.2:4000".parse().unwrap()]);

        let addrs = expand_bind_spec("192.168.1.2:4000", false).unwrap();
        assert_eq!(addrs, vec!["192.168.1.2:4000".parse().unwrap()]);
    }

    #[test]
    fn test_invalid_spec_is_rejected() {
        assert!(expand_bind_spec("not-an-address", false).is_err());
    }
}
