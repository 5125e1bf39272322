//! Per-host VTEP configuration built from the daemon config and its lease.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;

use super::netlink::{Link, NetAdapter};
use crate::config::DaemonConfig;
use crate::error::VtepError;
use crate::lease::{HardwareAddr, Lease};
use crate::multi_cidr::MultiCidrNetwork;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtepConfig {
    pub vtep_name: String,
    pub underlay_interface: Link,
    pub underlay_ip: Ipv4Addr,
    /// First address of the local lease
    pub lease_ip: Ipv4Addr,
    pub overlay_hardware_addr: HardwareAddr,
    pub vni: u32,
    pub vtep_port: u16,
    pub overlay_networks: MultiCidrNetwork,
}

pub struct ConfigCreator {
    net_adapter: Arc<dyn NetAdapter>,
}

impl ConfigCreator {
    pub fn new(net_adapter: Arc<dyn NetAdapter>) -> Self {
        Self { net_adapter }
    }

    pub fn create(&self, config: &DaemonConfig, lease: &Lease) -> Result<VtepConfig, VtepError> {
        if config.vtep_name.is_empty() {
            return Err(VtepError::EmptyName);
        }
        if config.vtep_port == 0 {
            return Err(VtepError::InvalidPort);
        }
        if config.underlay_ip.is_unspecified() {
            return Err(VtepError::UnderlayIp(config.underlay_ip.to_string()));
        }

        let underlay_interface = match &config.vxlan_interface_name {
            Some(name) if !name.is_empty() => {
                self.net_adapter
                    .interface_by_name(name)
                    .map_err(|e| VtepError::DeviceByName {
                        name: name.clone(),
                        reason: e.to_string(),
                    })?
            }
            _ => self
                .locate_interface(config.underlay_ip)
                .map_err(|reason| VtepError::DeviceByIp {
                    ip: config.underlay_ip.to_string(),
                    reason,
                })?,
        };

        let lease_ip = lease
            .overlay_subnet
            .parse::<Ipv4Net>()
            .map(|net| net.addr())
            .map_err(|_| {
                VtepError::OverlayIp(format!("invalid CIDR address: {}", lease.overlay_subnet))
            })?;

        let overlay_hardware_addr = lease
            .overlay_hardware_addr
            .parse::<HardwareAddr>()
            .map_err(VtepError::HardwareAddr)?;

        if config.overlay_networks.is_empty() {
            return Err(VtepError::NoOverlayNetworks);
        }
        let overlay_networks =
            MultiCidrNetwork::new(&config.overlay_networks[..]).map_err(VtepError::OverlayNetwork)?;

        if overlay_networks.smallest_mask() >= config.subnet_prefix_length {
            return Err(VtepError::PrefixTooLarge {
                overlay: overlay_networks.smallest_mask(),
                subnet: config.subnet_prefix_length,
            });
        }

        Ok(VtepConfig {
            vtep_name: config.vtep_name.clone(),
            underlay_interface,
            underlay_ip: config.underlay_ip,
            lease_ip,
            overlay_hardware_addr,
            vni: config.vni,
            vtep_port: config.vtep_port,
            overlay_networks,
        })
    }

    /// Find the interface carrying `to_find`.
    fn locate_interface(&self, to_find: Ipv4Addr) -> Result<Link, String> {
        let ifaces = self
            .net_adapter
            .interfaces()
            .map_err(|e| format!("find interfaces: {}", e))?;

        for iface in ifaces {
            let addrs = self
                .net_adapter
                .interface_addrs(&iface)
                .map_err(|e| format!("get addresses: {}", e))?;
            if addrs.iter().any(|addr| addr.addr() == to_find) {
                return Ok(iface);
            }
        }

        Err(format!("no interface with address {}", to_find))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vtep::netlink::MockNetAdapter;

    fn daemon_config() -> DaemonConfig {
        DaemonConfig {
            underlay_ip: "172.255.30.2".parse().unwrap(),
            overlay_networks: vec!["10.255.0.0/16".to_string(), "10.250.0.0/16".to_string()],
            subnet_prefix_length: 24,
            vtep_name: "weft-vtep".to_string(),
            vni: 99,
            vtep_port: 4913,
            ..DaemonConfig::default()
        }
    }

    fn lease() -> Lease {
        Lease {
            underlay_ip: "172.255.30.2".to_string(),
            overlay_subnet: "10.255.30.0/24".to_string(),
            overlay_hardware_addr: "ee:ee:0a:ff:1e:00".to_string(),
        }
    }

    fn eth0() -> Link {
        Link {
            index: 2,
            name: "eth0".to_string(),
            mtu: 1500,
            hardware_addr: None,
        }
    }

    fn eth1() -> Link {
        Link {
            index: 3,
            name: "eth1".to_string(),
            mtu: 9000,
            hardware_addr: None,
        }
    }

    fn adapter_with_interfaces() -> MockNetAdapter {
        let mut mock = MockNetAdapter::new();
        mock.expect_interfaces()
            .returning(|| Ok(vec![eth0(), eth1()]));
        mock.expect_interface_addrs().returning(|iface| {
            if iface.name == "eth0" {
                Ok(vec!["10.0.2.15/24".parse().unwrap()])
            } else {
                Ok(vec!["172.255.30.2/24".parse().unwrap()])
            }
        });
        mock
    }

    fn create(mock: MockNetAdapter, config: &DaemonConfig, lease: &Lease) -> Result<VtepConfig, VtepError> {
        ConfigCreator::new(Arc::new(mock)).create(config, lease)
    }

    #[test]
    fn test_create_locates_interface_by_underlay_ip() {
        let config = create(adapter_with_interfaces(), &daemon_config(), &lease()).unwrap();

        assert_eq!(config.vtep_name, "weft-vtep");
        assert_eq!(config.underlay_interface, eth1());
        assert_eq!(config.underlay_ip, "172.255.30.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(config.lease_ip, "10.255.30.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(
            config.overlay_hardware_addr,
            HardwareAddr([0xee, 0xee, 0x0a, 0xff, 0x1e, 0x00])
        );
        assert_eq!(config.vni, 99);
        assert_eq!(config.vtep_port, 4913);
        assert_eq!(config.overlay_networks.len(), 2);
    }

    #[test]
    fn test_create_uses_named_interface() {
        let mut mock = MockNetAdapter::new();
        mock.expect_interface_by_name()
            .withf(|name| name == "eth0")
            .times(1)
            .returning(|_| Ok(eth0()));
        mock.expect_interfaces().never();

        let mut config = daemon_config();
        config.vxlan_interface_name = Some("eth0".to_string());
        assert_eq!(create(mock, &config, &lease()).unwrap().underlay_interface, eth0());
    }

    #[test]
    fn test_named_interface_lookup_fails() {
        let mut mock = MockNetAdapter::new();
        mock.expect_interface_by_name()
            .returning(|_| Err(anyhow::anyhow!("no such network interface")));

        let mut config = daemon_config();
        config.vxlan_interface_name = Some("eth9".to_string());
        assert_eq!(
            create(mock, &config, &lease()).unwrap_err().to_string(),
            "find device from name eth9: no such network interface"
        );
    }

    #[test]
    fn test_no_interface_has_underlay_ip() {
        let mut config = daemon_config();
        config.underlay_ip = "172.255.30.9".parse().unwrap();
        assert_eq!(
            create(adapter_with_interfaces(), &config, &lease())
                .unwrap_err()
                .to_string(),
            "find device from ip 172.255.30.9: no interface with address 172.255.30.9"
        );
    }

    #[test]
    fn test_interface_listing_fails() {
        let mut mock = MockNetAdapter::new();
        mock.expect_interfaces()
            .returning(|| Err(anyhow::anyhow!("pineapple")));
        assert_eq!(
            create(mock, &daemon_config(), &lease()).unwrap_err().to_string(),
            "find device from ip 172.255.30.2: find interfaces: pineapple"
        );
    }

    #[test]
    fn test_address_listing_fails() {
        let mut mock = MockNetAdapter::new();
        mock.expect_interfaces().returning(|| Ok(vec![eth0()]));
        mock.expect_interface_addrs()
            .returning(|_| Err(anyhow::anyhow!("kiwi")));
        assert_eq!(
            create(mock, &daemon_config(), &lease()).unwrap_err().to_string(),
            "find device from ip 172.255.30.2: get addresses: kiwi"
        );
    }

    #[test]
    fn test_empty_vtep_name() {
        let mut config = daemon_config();
        config.vtep_name = String::new();
        assert_eq!(
            create(MockNetAdapter::new(), &config, &lease()).unwrap_err(),
            VtepError::EmptyName
        );
    }

    #[test]
    fn test_zero_vtep_port() {
        let mut config = daemon_config();
        config.vtep_port = 0;
        assert_eq!(
            create(MockNetAdapter::new(), &config, &lease())
                .unwrap_err()
                .to_string(),
            "vtep port must be greater than 0"
        );
    }

    #[test]
    fn test_malformed_lease_subnet() {
        let mut bad = lease();
        bad.overlay_subnet = "banana".to_string();
        assert_eq!(
            create(adapter_with_interfaces(), &daemon_config(), &bad)
                .unwrap_err()
                .to_string(),
            "determine vtep overlay ip: invalid CIDR address: banana"
        );
    }

    #[test]
    fn test_malformed_hardware_addr() {
        let mut bad = lease();
        bad.overlay_hardware_addr = "banana".to_string();
        assert_eq!(
            create(adapter_with_interfaces(), &daemon_config(), &bad)
                .unwrap_err()
                .to_string(),
            "parsing hardware address: address banana: invalid MAC address"
        );
    }

    #[test]
    fn test_no_overlay_networks() {
        let mut config = daemon_config();
        config.overlay_networks.clear();
        assert_eq!(
            create(adapter_with_interfaces(), &config, &lease()).unwrap_err(),
            VtepError::NoOverlayNetworks
        );
    }

    #[test]
    fn test_invalid_overlay_network() {
        let mut config = daemon_config();
        config.overlay_networks.push("10.300.0.0/16".to_string());
        assert_eq!(
            create(adapter_with_interfaces(), &config, &lease())
                .unwrap_err()
                .to_string(),
            "creating multiple CIDR Network: invalid CIDR address: 10.300.0.0/16"
        );
    }

    #[test]
    fn test_overlay_prefix_not_smaller_than_subnet_prefix() {
        let mut config = daemon_config();
        config.overlay_networks.push("10.240.0.0/24".to_string());
        assert_eq!(
            create(adapter_with_interfaces(), &config, &lease())
                .unwrap_err()
                .to_string(),
            "overlay prefix 24 must be smaller than subnet prefix 24"
        );
    }
}
