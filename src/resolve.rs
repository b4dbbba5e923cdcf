//! Host resolution oracle used by the connection and acceptor factories.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// Address family of a resolved host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ipv4,
    Ipv6,
}

impl Protocol {
    fn of(addr: &SocketAddr) -> Protocol {
        match addr {
            SocketAddr::V4(_) => Protocol::Ipv4,
            SocketAddr::V6(_) => Protocol::Ipv6,
        }
    }
}

/// Resolves `host` to an address and its family. With a preferred family the
/// first matching address wins; when no address of that family exists the
/// first address of any family is returned instead, so a preference never
/// turns a resolvable host into a resolution failure.
pub fn native_address(host: &str, preferred: Option<Protocol>) -> Option<(IpAddr, Protocol)> {
    let mut fallback = None;
    for addr in (host, 0u16).to_socket_addrs().ok()? {
        let proto = Protocol::of(&addr);
        match preferred {
            None => return Some((addr.ip(), proto)),
            Some(p) if p == proto => return Some((addr.ip(), proto)),
            Some(_) => {
                if fallback.is_none() {
                    fallback = Some((addr.ip(), proto));
                }
            }
        }
    }
    fallback
}
