use std::net::IpAddr;

use http::HeaderMap;

use crate::acl::Acl;

// single valued forwarding headers, scanned in this order.
const SINGLE: &[&str] = &[
    "x-client-ip",
    "cf-connecting-ip",
    "true-client-ip",
    "x-real-ip",
    "x-cluster-client-ip",
];

// comma separated forwarding headers.
const CSV: &[&str] = &["x-forwarded-for", "forwarded-for"];

/// Collect every client address a request claims, ordered: single valued
/// headers, csv headers, rfc7239 `Forwarded` tokens, then the socket peer
/// address. Unparseable tokens are dropped; duplicates keep their first
/// position. IPv4 mapped into IPv6 is unwrapped.
pub fn collect_client_ips(headers: &HeaderMap, remote: Option<IpAddr>) -> Vec<IpAddr> {
    let mut ips = Vec::with_capacity(4);

    let mut push = |ip: IpAddr| {
        let ip = ip.to_canonical();
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    };

    for name in SINGLE {
        if let Some(val) = header_str(headers, name) {
            if let Some(ip) = parse_ip_token(val) {
                push(ip);
            }
        }
    }

    for name in CSV {
        if let Some(val) = header_str(headers, name) {
            for token in val.split(',') {
                if let Some(ip) = parse_ip_token(token) {
                    push(ip);
                }
            }
        }
    }

    if let Some(val) = header_str(headers, "forwarded") {
        for element in val.split(',') {
            for pair in element.split(';') {
                let mut kv = pair.splitn(2, '=');
                let key = kv.next().unwrap_or("").trim();
                if key.eq_ignore_ascii_case("for") {
                    if let Some(ip) = kv.next().and_then(parse_ip_token) {
                        push(ip);
                    }
                }
            }
        }
    }

    if let Some(remote) = remote {
        push(remote);
    }

    ips
}

/// Pick the address to report as the requester. With a zero offset the first
/// address outside the private ranges wins, falling back to the head of the
/// list. A non-zero offset indexes the list directly, negative counting from
/// the end, clamped into range.
pub fn public_ip(ips: &[IpAddr], private: &Acl, offset: i32) -> Option<IpAddr> {
    if ips.is_empty() {
        return None;
    }
    if offset != 0 {
        let len = ips.len() as i64;
        let idx = if offset < 0 { len + offset as i64 } else { offset as i64 };
        let idx = idx.clamp(0, len - 1) as usize;
        return Some(ips[idx]);
    }
    ips.iter().find(|ip| !private.check(**ip)).or_else(|| ips.first()).copied()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// accepts bare addresses, quoted rfc7239 values, bracketed v6 and v4:port.
fn parse_ip_token(token: &str) -> Option<IpAddr> {
    let token = token.trim().trim_matches('"');

    if let Ok(ip) = token.parse::<IpAddr>() {
        return Some(ip);
    }

    // [v6]:port or [v6]
    if let Some(rest) = token.strip_prefix('[') {
        let end = rest.find(']')?;
        return rest[..end].parse().ok();
    }

    // v4:port
    if let Some((host, port)) = token.rsplit_once(':') {
        if port.chars().all(|c| c.is_ascii_digit()) {
            return host.parse().ok();
        }
    }

    None
}

#[cfg(test)]
mod test {
    use http::header::{HeaderName, HeaderValue};

    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                k.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn header_order() {
        let h = headers(&[
            ("x-forwarded-for", "9.9.9.9, 8.8.8.8"),
            ("x-real-ip", "7.7.7.7"),
        ]);
        let ips = collect_client_ips(&h, Some(ip("1.1.1.1")));
        assert_eq!(ips, vec![ip("7.7.7.7"), ip("9.9.9.9"), ip("8.8.8.8"), ip("1.1.1.1")]);
    }

    #[test]
    fn forwarded_rfc7239() {
        let h = headers(&[("forwarded", "for=\"[2001:db8::1]:4711\";proto=https, for=5.6.7.8")]);
        let ips = collect_client_ips(&h, None);
        assert_eq!(ips, vec![ip("2001:db8::1"), ip("5.6.7.8")]);
    }

    #[test]
    fn mapped_v4_unwrapped_and_deduped() {
        let h = headers(&[("x-forwarded-for", "1.2.3.4")]);
        let ips = collect_client_ips(&h, Some(ip("::ffff:1.2.3.4")));
        assert_eq!(ips, vec![ip("1.2.3.4")]);
    }

    #[test]
    fn garbage_tokens_dropped() {
        let h = headers(&[("x-forwarded-for", "unknown, _hidden, 4.4.4.4:1234")]);
        let ips = collect_client_ips(&h, None);
        assert_eq!(ips, vec![ip("4.4.4.4")]);
    }

    #[test]
    fn public_ip_skips_private() {
        let private = Acl::private_ranges();
        let ips = vec![ip("10.0.0.1"), ip("4.4.4.4"), ip("127.0.0.1")];
        assert_eq!(public_ip(&ips, &private, 0), Some(ip("4.4.4.4")));
        // all private falls back to first.
        let ips = vec![ip("10.0.0.1"), ip("192.168.1.1")];
        assert_eq!(public_ip(&ips, &private, 0), Some(ip("10.0.0.1")));
    }

    #[test]
    fn public_ip_offset() {
        let private = Acl::private_ranges();
        let ips = vec![ip("1.1.1.1"), ip("2.2.2.2"), ip("3.3.3.3")];
        assert_eq!(public_ip(&ips, &private, 1), Some(ip("2.2.2.2")));
        assert_eq!(public_ip(&ips, &private, -1), Some(ip("3.3.3.3")));
        assert_eq!(public_ip(&ips, &private, 99), Some(ip("3.3.3.3")));
        assert_eq!(public_ip(&[], &private, 0), None);
    }
}
