//! Host and peer name lookups.

use std::net::{IpAddr, SocketAddr};

use tracing::{debug, warn};

use crate::session::UNKNOWN_HOSTNAME;
use crate::{Error, Result};

/// Name of this host.
pub fn local_hostname() -> Result<String> {
    Ok(dns_lookup::get_hostname()?)
}

/// The first IPv4 address of network interface `name`.
pub fn interface_ipv4(name: &str) -> Result<Option<IpAddr>> {
    Ok(if_addrs::get_if_addrs()?
        .iter()
        .filter(|iface| iface.name == name)
        .map(|iface| iface.ip())
        .find(IpAddr::is_ipv4))
}

/// The address clients should use to reach a server listening on `listen`.
///
/// A specific listen address is used as is. Otherwise the IPv4 address of
/// `interface` is taken, falling back to any non-loopback IPv4 address.
pub fn advertised_ip(interface: &str, listen: SocketAddr) -> Result<IpAddr> {
    if !listen.ip().is_unspecified() {
        return Ok(listen.ip());
    }
    if let Some(ip) = interface_ipv4(interface)? {
        return Ok(ip);
    }
    let fallback = if_addrs::get_if_addrs()?
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .map(|iface| iface.ip())
        .find(IpAddr::is_ipv4);
    match fallback {
        Some(ip) => {
            warn!("no IPv4 address on interface {interface}, advertising {ip}");
            Ok(ip)
        }
        None => Err(Error::Config(format!(
            "unable to get the IP address of interface {interface}"
        ))),
    }
}

/// Reverse lookup of a peer, or [UNKNOWN_HOSTNAME].
pub async fn peer_hostname(ip: IpAddr) -> String {
    match tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip)).await {
        Ok(Ok(name)) => name,
        Ok(Err(e)) => {
            debug!("reverse lookup of {ip} failed: {e}");
            UNKNOWN_HOSTNAME.to_string()
        }
        Err(e) => {
            warn!("reverse lookup of {ip} did not complete: {e}");
            UNKNOWN_HOSTNAME.to_string()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn specific_listen_address_is_advertised() {
        let listen: SocketAddr = "192.0.2.7:915".parse().unwrap();
        assert_eq!(
            advertised_ip("no-such-interface", listen).unwrap(),
            listen.ip()
        );
    }

    #[test]
    fn missing_interface_has_no_address() {
        assert_eq!(interface_ipv4("no-such-interface0").unwrap(), None);
    }

    #[tokio::test]
    async fn peer_lookup_never_fails() {
        let name = peer_hostname("127.0.0.1".parse().unwrap()).await;
        assert!(!name.is_empty());
    }
}
