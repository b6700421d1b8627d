use std::str::FromStr;

use portd_allocator::{manager::pool_key, protocol::Protocol};

use crate::controller::error::Error;

const HOST_PORT_SUFFIX: &str = "/hostport";
const ALL_PROTOCOLS: &str = "ALL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRef {
    Number(u16),
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedProtocol {
    Single(Protocol),
    // the same port on every protocol of the pool item
    All,
}

/// One entry of the port request annotation:
/// `<poolName>[.<namespace>] [<protocol>] <portNameOrNumber>[/hostport]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRequest {
    pub pool_name: String,
    pub pool_namespace: String,
    pub protocol: Option<RequestedProtocol>,
    pub port: PortRef,
    pub host_port: bool,
}

impl PortRequest {
    pub fn pool_key(&self) -> String {
        pool_key(&self.pool_name, &self.pool_namespace)
    }
}

impl std::fmt::Display for PortRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let port = match &self.port {
            PortRef::Number(n) => n.to_string(),
            PortRef::Name(n) => n.clone(),
        };
        write!(f, "{}.{} {}", self.pool_name, self.pool_namespace, port)
    }
}

/// Entries are separated by `;` or newlines. Blank entries are skipped.
pub fn parse_port_requests(value: &str, default_namespace: &str) -> Result<Vec<PortRequest>, Error> {
    value
        .split(|c| c == ';' || c == '\n')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| parse_entry(entry, default_namespace))
        .collect()
}

fn parse_entry(entry: &str, default_namespace: &str) -> Result<PortRequest, Error> {
    let tokens = entry.split_whitespace().collect::<Vec<&str>>();
    let (pool, protocol, port) = match tokens.as_slice() {
        [pool, port] => (*pool, None, *port),
        [pool, protocol, port] => (*pool, Some(*protocol), *port),
        _ => {
            return Err(Error::InvalidPortRequest(format!(
                "{entry}: expected <pool>[.<namespace>] [<protocol>] <port>[/hostport]"
            )))
        }
    };

    let (pool_name, pool_namespace) = match pool.rsplit_once('.') {
        Some((name, ns)) if !name.is_empty() && !ns.is_empty() => (name, ns),
        Some(_) => return Err(Error::InvalidPortRequest(format!("{entry}: invalid pool"))),
        None => (pool, default_namespace),
    };

    let protocol = match protocol {
        None => None,
        Some(p) if p.eq_ignore_ascii_case(ALL_PROTOCOLS) => Some(RequestedProtocol::All),
        Some(p) => Some(RequestedProtocol::Single(
            Protocol::from_str(p).map_err(|e| Error::InvalidPortRequest(format!("{entry}: {e}")))?,
        )),
    };

    let (port, host_port) = match port.strip_suffix(HOST_PORT_SUFFIX) {
        Some(p) => (p, true),
        None => (port, false),
    };
    if port.is_empty() {
        return Err(Error::InvalidPortRequest(format!("{entry}: empty port")));
    }
    let port = match port.parse::<u16>() {
        Ok(0) => return Err(Error::InvalidPortRequest(format!("{entry}: port 0"))),
        Ok(n) => PortRef::Number(n),
        Err(_) if port.chars().all(|c| c.is_ascii_digit()) => {
            return Err(Error::InvalidPortRequest(format!("{entry}: port out of range")))
        }
        Err(_) => PortRef::Name(port.to_string()),
    };

    Ok(PortRequest {
        pool_name: pool_name.to_string(),
        pool_namespace: pool_namespace.to_string(),
        protocol,
        port,
        host_port,
    })
}

/// Environment variable carrying the bound addresses of one container port.
pub fn env_name(pool_name: &str, rs_port: u16, protocol: Protocol) -> String {
    let pool = pool_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect::<String>();
    format!("PORTD_{pool}_{rs_port}_{protocol}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn request(
        pool_name: &str,
        pool_namespace: &str,
        protocol: Option<RequestedProtocol>,
        port: PortRef,
        host_port: bool,
    ) -> PortRequest {
        PortRequest {
            pool_name: pool_name.to_string(),
            pool_namespace: pool_namespace.to_string(),
            protocol,
            port,
            host_port,
        }
    }

    #[rstest(
        input,
        expected,
        case("p1 http", vec![request("p1", "app", None, PortRef::Name("http".to_string()), false)]),
        case("p1.infra 8080", vec![request("p1", "infra", None, PortRef::Number(8080), false)]),
        case(
            "p1 udp 53/hostport",
            vec![request("p1", "app", Some(RequestedProtocol::Single(Protocol::UDP)), PortRef::Number(53), true)]
        ),
        case(
            "p1 all dns; p2.infra 9090\n",
            vec![
                request("p1", "app", Some(RequestedProtocol::All), PortRef::Name("dns".to_string()), false),
                request("p2", "infra", None, PortRef::Number(9090), false),
            ]
        ),
        case("  ;\n", vec![]),
    )]
    fn works_parse_port_requests(input: &str, expected: Vec<PortRequest>) {
        assert_eq!(parse_port_requests(input, "app").unwrap(), expected);
    }

    #[rstest(
        input,
        case("p1"),
        case("p1 tcp http extra"),
        case("p1 sctp 80"),
        case("p1 0"),
        case("p1 70000"),
        case(".infra 80"),
        case("p1 /hostport"),
    )]
    fn rejects_invalid_port_requests(input: &str) {
        assert!(parse_port_requests(input, "app").is_err());
    }

    #[rstest(
        pool,
        rs_port,
        protocol,
        expected,
        case("p1", 8080, Protocol::TCP, "PORTD_P1_8080_TCP"),
        case("game-server.pool", 7777, Protocol::UDP, "PORTD_GAME_SERVER_POOL_7777_UDP"),
    )]
    fn works_env_name(pool: &str, rs_port: u16, protocol: Protocol, expected: &str) {
        assert_eq!(env_name(pool, rs_port, protocol), expected);
    }
}
