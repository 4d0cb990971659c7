//! Instance address extraction.
//!
//! An instance spec says how a matching container is reached: `fixed`
//! trusts the container's own network address, `mapped` goes through a
//! published host port. `None` here means "this container is not an
//! instance of this spec", never an error.

use std::net::IpAddr;

use tether_model::{AddressMode, AddressSpec};

use crate::runtime::ContainerSnapshot;

/// Derive `(ip, port)` for a container under the given address spec.
pub fn extract_address(
    spec: &AddressSpec,
    container: &ContainerSnapshot,
    host_ip: IpAddr,
) -> Option<(IpAddr, u16)> {
    match spec.mode {
        AddressMode::Fixed => {
            let ip: IpAddr = container.network.ip_address.parse().ok()?;
            Some((ip, spec.port))
        }
        AddressMode::Mapped => {
            let bindings = container.network.ports.get(&format!("{}/tcp", spec.port))?;
            let host_ip_text = host_ip.to_string();
            for binding in bindings {
                // Accept a binding on our address, on all addresses, or
                // with no address recorded at all.
                if binding.host_ip == host_ip_text
                    || binding.host_ip.is_empty()
                    || binding.host_ip == "0.0.0.0"
                {
                    let port = binding.host_port.parse().ok()?;
                    return Some((host_ip, port));
                }
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{NetworkSettings, PortBinding};
    use std::collections::HashMap;

    const HOST_IP: &str = "10.0.0.1";

    fn host_ip() -> IpAddr {
        HOST_IP.parse().unwrap()
    }

    fn mapped(port: u16) -> AddressSpec {
        AddressSpec {
            mode: AddressMode::Mapped,
            port,
        }
    }

    fn container_with_bindings(port: u16, bindings: Vec<PortBinding>) -> ContainerSnapshot {
        let mut ports = HashMap::new();
        ports.insert(format!("{port}/tcp"), bindings);
        ContainerSnapshot {
            id: "c1".to_string(),
            network: NetworkSettings {
                ip_address: "172.17.0.2".to_string(),
                ports,
            },
            ..Default::default()
        }
    }

    fn binding(host_ip: &str, host_port: &str) -> PortBinding {
        PortBinding {
            host_ip: host_ip.to_string(),
            host_port: host_port.to_string(),
        }
    }

    #[test]
    fn fixed_uses_container_address_and_spec_port() {
        let spec = AddressSpec {
            mode: AddressMode::Fixed,
            port: 9000,
        };
        let container = container_with_bindings(8080, vec![]);
        let (ip, port) = extract_address(&spec, &container, host_ip()).unwrap();
        assert_eq!(ip.to_string(), "172.17.0.2");
        assert_eq!(port, 9000);
    }

    #[test]
    fn fixed_with_unparseable_address_is_no_match() {
        let spec = AddressSpec {
            mode: AddressMode::Fixed,
            port: 9000,
        };
        let mut container = container_with_bindings(8080, vec![]);
        container.network.ip_address = String::new();
        assert!(extract_address(&spec, &container, host_ip()).is_none());
    }

    #[test]
    fn mapped_accepts_wildcard_empty_and_own_host_ip() {
        for accepted in ["0.0.0.0", "", HOST_IP] {
            let container =
                container_with_bindings(8080, vec![binding(accepted, "31000")]);
            let (ip, port) = extract_address(&mapped(8080), &container, host_ip()).unwrap();
            assert_eq!(ip, host_ip());
            assert_eq!(port, 31000);
        }
    }

    #[test]
    fn mapped_skips_foreign_host_bindings() {
        let container = container_with_bindings(
            8080,
            vec![binding("192.168.9.9", "30999"), binding("0.0.0.0", "31000")],
        );
        let (_, port) = extract_address(&mapped(8080), &container, host_ip()).unwrap();
        assert_eq!(port, 31000);
    }

    #[test]
    fn mapped_without_acceptable_binding_is_no_match() {
        let container = container_with_bindings(8080, vec![binding("192.168.9.9", "30999")]);
        assert!(extract_address(&mapped(8080), &container, host_ip()).is_none());

        let container = container_with_bindings(9090, vec![binding("", "31000")]);
        assert!(extract_address(&mapped(8080), &container, host_ip()).is_none());
    }

    #[test]
    fn mapped_with_unparseable_port_is_no_match() {
        let container = container_with_bindings(8080, vec![binding("", "not-a-port")]);
        assert!(extract_address(&mapped(8080), &container, host_ip()).is_none());
    }
}
