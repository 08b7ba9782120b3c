//! Parsing of the `PORTS` declaration.

use super::{HostPort, PortMapping, Protocol};

const AUTO_MARKER: &str = "auto";

/// Parses a comma-separated list of `host:guest[/proto]` entries.
///
/// Every malformed entry is reported; duplicate guest ports and duplicate
/// fixed host ports (per protocol) are rejected.
pub(super) fn parse_ports(raw: &str) -> Result<Vec<PortMapping>, Vec<String>> {
    let mut mappings = Vec::new();
    let mut problems = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        match parse_entry(entry) {
            Ok(mapping) => mappings.push(mapping),
            Err(problem) => problems.push(problem),
        }
    }

    for (index, mapping) in mappings.iter().enumerate() {
        let earlier = mappings.iter().take(index);
        if earlier.clone().any(|other: &PortMapping| {
            other.guest == mapping.guest && other.protocol == mapping.protocol
        }) {
            problems.push(format!(
                "guest port {}/{} is mapped more than once",
                mapping.guest, mapping.protocol
            ));
        }
        if let HostPort::Fixed(host) = mapping.host
            && earlier.into_iter().any(|other| {
                other.host == HostPort::Fixed(host) && other.protocol == mapping.protocol
            })
        {
            problems.push(format!(
                "host port {host}/{} is used more than once",
                mapping.protocol
            ));
        }
    }

    if problems.is_empty() {
        Ok(mappings)
    } else {
        Err(problems)
    }
}

fn parse_entry(entry: &str) -> Result<PortMapping, String> {
    let Some((host_raw, rest)) = entry.split_once(':') else {
        return Err(format!("'{entry}' must be host:guest or auto:guest"));
    };

    let (guest_raw, protocol) = match rest.split_once('/') {
        None => (rest, Protocol::Tcp),
        Some((guest, proto)) => match proto.trim().to_ascii_lowercase().as_str() {
            "tcp" => (guest, Protocol::Tcp),
            "udp" => (guest, Protocol::Udp),
            other => return Err(format!("'{entry}' has unknown protocol '{other}'")),
        },
    };

    let host_text = host_raw.trim();
    let host = if host_text.eq_ignore_ascii_case(AUTO_MARKER) {
        HostPort::Auto
    } else {
        HostPort::Fixed(parse_port(host_text, entry)?)
    };
    let guest = parse_port(guest_raw.trim(), entry)?;

    Ok(PortMapping {
        host,
        guest,
        protocol,
    })
}

fn parse_port(raw: &str, entry: &str) -> Result<u16, String> {
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!(
            "'{raw}' in '{entry}' is not a port between 1 and 65535"
        )),
        Ok(port) => Ok(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_fixed_auto_and_protocols_in_order() {
        let mappings = parse_ports("8080:80, auto:443 ,5353:53/udp").expect("valid ports");

        assert_eq!(
            mappings,
            vec![
                PortMapping {
                    host: HostPort::Fixed(8080),
                    guest: 80,
                    protocol: Protocol::Tcp,
                },
                PortMapping {
                    host: HostPort::Auto,
                    guest: 443,
                    protocol: Protocol::Tcp,
                },
                PortMapping {
                    host: HostPort::Fixed(5353),
                    guest: 53,
                    protocol: Protocol::Udp,
                },
            ]
        );
    }

    #[test]
    fn ignores_empty_entries() {
        let mappings = parse_ports("8080:80,,").expect("valid ports");
        assert_eq!(mappings.len(), 1);
    }

    #[rstest]
    #[case("8080")]
    #[case("0:80")]
    #[case("8080:0")]
    #[case("70000:80")]
    #[case("http:80")]
    #[case("8080:80/sctp")]
    fn rejects_malformed_entries(#[case] raw: &str) {
        let problems = parse_ports(raw).expect_err("should be rejected");
        assert_eq!(problems.len(), 1, "{problems:?}");
    }

    #[test]
    fn reports_every_bad_entry() {
        let problems = parse_ports("x:1,2:y,8080:80").expect_err("should be rejected");
        assert_eq!(problems.len(), 2, "{problems:?}");
    }

    #[test]
    fn rejects_duplicate_guest_ports() {
        let problems = parse_ports("8080:80,auto:80").expect_err("duplicate guest");
        assert!(problems[0].contains("guest port 80/tcp"), "{problems:?}");
    }

    #[test]
    fn allows_same_guest_port_on_different_protocols() {
        let mappings = parse_ports("5353:53/udp,5354:53").expect("distinct protocols");
        assert_eq!(mappings.len(), 2);
    }

    #[test]
    fn rejects_duplicate_fixed_host_ports() {
        let problems = parse_ports("8080:80,8080:81").expect_err("duplicate host");
        assert!(problems[0].contains("host port 8080/tcp"), "{problems:?}");
    }
}
