use local_ip_address::list_afinet_netifas;
use std::net::{IpAddr, SocketAddr};
use str0m::{net::Protocol, Candidate};
use systemstat::{Platform, System};
use tracing::{debug, info, warn};

/// Pick an IPv4 address that can be shared with a remote peer.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses. The first routable interface
/// is returned; `None` when the host exposes no usable IPv4 address.
pub fn select_host_address() -> Option<IpAddr> {
    let system = System::new();
    let networks = match system.networks() {
        Ok(networks) => networks,
        Err(e) => {
            warn!("Failed to list network interfaces: {}", e);
            return None;
        }
    };

    for net in networks.values() {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() {
                    return Some(IpAddr::V4(v));
                }
            }
        }
    }

    None
}

/// Host candidates for every routable IPv4 interface, sharing the port of `local`.
///
/// When the socket is bound to a specific address only that address is used.
pub fn host_candidates(local: SocketAddr) -> Vec<Candidate> {
    if !local.ip().is_unspecified() {
        return Candidate::host(local, Protocol::Udp).into_iter().collect();
    }

    let mut candidates: Vec<Candidate> = vec![];
    match list_afinet_netifas() {
        Ok(network_interfaces) => {
            for (name, ip) in network_interfaces {
                let IpAddr::V4(ip4) = ip else {
                    continue;
                };
                if ip4.is_loopback() || ip4.is_link_local() {
                    continue;
                }

                info!("iface: {} / {:?}", name, ip);
                match Candidate::host(SocketAddr::new(ip, local.port()), Protocol::Udp) {
                    Ok(candidate) => candidates.push(candidate),
                    Err(e) => debug!("Skipping interface {}: {}", name, e),
                }
            }
        }
        Err(e) => warn!("Failed to list network interfaces: {}", e),
    }

    candidates
}
