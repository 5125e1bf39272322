//! Kernel network-stack adapter.
//!
//! [`NetlinkAdapter`] is the seam between the VTEP logic and the host. The
//! shipped implementation drives `ip -j` and `bridge -j` through
//! [`CommandExecutor`] and parses their JSON output.

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::cmd_abstraction::{args_to_strings, run_checked, CommandExecutor};
use crate::lease::HardwareAddr;

/// A network device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mtu: u32,
    pub hardware_addr: Option<HardwareAddr>,
}

/// Parameters of a VXLAN device to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanLink {
    pub name: String,
    pub hardware_addr: HardwareAddr,
    pub vni: u32,
    pub src_addr: Ipv4Addr,
    pub gbp: bool,
    pub port: u16,
    /// Underlay device the tunnel is bound to
    pub vtep_dev: String,
}

/// A universe-scope IPv4 route on one link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub link_index: u32,
    pub dst: Ipv4Net,
    pub gw: Option<Ipv4Addr>,
    pub src: Option<Ipv4Addr>,
    pub onlink: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NeighKind {
    /// Overlay IP to MAC
    Arp,
    /// MAC to underlay tunnel endpoint
    Fdb,
}

/// An ARP or FDB entry on one link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Neigh {
    pub link_index: u32,
    pub kind: NeighKind,
    pub ip: Ipv4Addr,
    pub hardware_addr: HardwareAddr,
    pub permanent: bool,
}

impl Neigh {
    pub fn arp(link_index: u32, ip: Ipv4Addr, hardware_addr: HardwareAddr) -> Self {
        Self {
            link_index,
            kind: NeighKind::Arp,
            ip,
            hardware_addr,
            permanent: true,
        }
    }

    pub fn fdb(link_index: u32, underlay_ip: Ipv4Addr, hardware_addr: HardwareAddr) -> Self {
        Self {
            link_index,
            kind: NeighKind::Fdb,
            ip: underlay_ip,
            hardware_addr,
            permanent: true,
        }
    }
}

/// Link, address, route and neighbor operations.
#[cfg_attr(test, automock)]
pub trait NetlinkAdapter: Send + Sync {
    fn link_by_name(&self, name: &str) -> Result<Link>;
    fn link_by_index(&self, index: u32) -> Result<Link>;
    fn link_add_vxlan(&self, link: &VxlanLink) -> Result<()>;
    fn link_set_up(&self, name: &str) -> Result<()>;
    fn link_del(&self, name: &str) -> Result<()>;
    /// Add `addr` (host bits kept) with link scope.
    fn addr_add_scope_link(&self, name: &str, addr: Ipv4Net) -> Result<()>;
    fn addr_list(&self, name: &str) -> Result<Vec<Ipv4Net>>;
    fn route_list(&self, link_index: u32) -> Result<Vec<Route>>;
    fn route_replace(&self, route: &Route) -> Result<()>;
    fn route_del(&self, route: &Route) -> Result<()>;
    fn arp_list(&self, link_index: u32) -> Result<Vec<Neigh>>;
    fn fdb_list(&self, link_index: u32) -> Result<Vec<Neigh>>;
    fn neigh_set(&self, neigh: &Neigh) -> Result<()>;
    fn neigh_del(&self, neigh: &Neigh) -> Result<()>;
}

/// Interface discovery used when building the VTEP config.
#[cfg_attr(test, automock)]
pub trait NetAdapter: Send + Sync {
    fn interfaces(&self) -> Result<Vec<Link>>;
    fn interface_addrs(&self, iface: &Link) -> Result<Vec<Ipv4Net>>;
    fn interface_by_name(&self, name: &str) -> Result<Link>;
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    address: Option<String>,
}

impl From<IpLink> for Link {
    fn from(l: IpLink) -> Self {
        Link {
            index: l.ifindex,
            name: l.ifname,
            mtu: l.mtu,
            hardware_addr: l.address.and_then(|a| a.parse().ok()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    #[serde(default)]
    family: String,
    local: Option<Ipv4Addr>,
    #[serde(default)]
    prefixlen: u8,
}

#[derive(Debug, Deserialize)]
struct IpAddrs {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    dst: String,
    gateway: Option<Ipv4Addr>,
    prefsrc: Option<Ipv4Addr>,
    #[serde(default)]
    flags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct IpNeigh {
    dst: Ipv4Addr,
    lladdr: Option<String>,
    #[serde(default)]
    state: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BridgeFdb {
    mac: String,
    dst: Option<String>,
    #[serde(default)]
    state: String,
}

/// `ip route` prints host routes without a prefix and `default` for 0/0.
fn parse_route_dst(dst: &str) -> Result<Ipv4Net> {
    if dst == "default" {
        return Ok(Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0)?);
    }
    if dst.contains('/') {
        return dst.parse::<Ipv4Net>().with_context(|| format!("parse route dst {}", dst));
    }
    let ip: Ipv4Addr = dst
        .parse()
        .with_context(|| format!("parse route dst {}", dst))?;
    Ok(Ipv4Net::new(ip, 32)?)
}

/// [`NetlinkAdapter`] and [`NetAdapter`] over the iproute2 tools.
pub struct IpCommandNetlink {
    executor: Arc<dyn CommandExecutor>,
}

impl IpCommandNetlink {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn ip(&self, args: &[&str]) -> Result<String> {
        debug!("ip {}", args.join(" "));
        run_checked(self.executor.as_ref(), "ip", &args_to_strings(args))
    }

    fn bridge(&self, args: &[&str]) -> Result<String> {
        debug!("bridge {}", args.join(" "));
        run_checked(self.executor.as_ref(), "bridge", &args_to_strings(args))
    }

    fn links(&self) -> Result<Vec<Link>> {
        let stdout = self.ip(&["-j", "link", "show"])?;
        let links: Vec<IpLink> = serde_json::from_str(&stdout).context("parse ip link output")?;
        Ok(links.into_iter().map(Link::from).collect())
    }

    fn name_of(&self, index: u32) -> Result<String> {
        self.link_by_index(index).map(|l| l.name)
    }
}

impl NetlinkAdapter for IpCommandNetlink {
    fn link_by_name(&self, name: &str) -> Result<Link> {
        let stdout = self.ip(&["-j", "link", "show", "dev", name])?;
        let links: Vec<IpLink> = serde_json::from_str(&stdout).context("parse ip link output")?;
        links
            .into_iter()
            .next()
            .map(Link::from)
            .ok_or_else(|| anyhow::anyhow!("Link not found"))
    }

    fn link_by_index(&self, index: u32) -> Result<Link> {
        self.links()?
            .into_iter()
            .find(|l| l.index == index)
            .ok_or_else(|| anyhow::anyhow!("Link not found"))
    }

    fn link_add_vxlan(&self, link: &VxlanLink) -> Result<()> {
        let mac = link.hardware_addr.to_string();
        let vni = link.vni.to_string();
        let src = link.src_addr.to_string();
        let port = link.port.to_string();
        let mut args: Vec<&str> = vec![
            "link",
            "add",
            link.name.as_str(),
            "address",
            mac.as_str(),
            "type",
            "vxlan",
            "id",
            vni.as_str(),
            "local",
            src.as_str(),
            "dev",
            link.vtep_dev.as_str(),
            "dstport",
            port.as_str(),
            "nolearning",
        ];
        if link.gbp {
            args.push("gbp");
        }
        self.ip(&args).map(|_| ())
    }

    fn link_set_up(&self, name: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "up"]).map(|_| ())
    }

    fn link_del(&self, name: &str) -> Result<()> {
        self.ip(&["link", "del", "dev", name]).map(|_| ())
    }

    fn addr_add_scope_link(&self, name: &str, addr: Ipv4Net) -> Result<()> {
        let addr = addr.to_string();
        self.ip(&["addr", "add", &addr, "dev", name, "scope", "link"])
            .map(|_| ())
    }

    fn addr_list(&self, name: &str) -> Result<Vec<Ipv4Net>> {
        let stdout = self.ip(&["-j", "-4", "addr", "show", "dev", name])?;
        let ifaces: Vec<IpAddrs> = serde_json::from_str(&stdout).context("parse ip addr output")?;
        Ok(ifaces
            .into_iter()
            .flat_map(|i| i.addr_info)
            .filter(|a| a.family == "inet")
            .filter_map(|a| a.local.and_then(|ip| Ipv4Net::new(ip, a.prefixlen).ok()))
            .collect())
    }

    fn route_list(&self, link_index: u32) -> Result<Vec<Route>> {
        let name = self.name_of(link_index)?;
        let stdout = self.ip(&["-j", "-4", "route", "show", "dev", &name])?;
        let routes: Vec<IpRoute> = serde_json::from_str(&stdout).context("parse ip route output")?;
        routes
            .into_iter()
            .map(|r| {
                Ok(Route {
                    link_index,
                    dst: parse_route_dst(&r.dst)?,
                    gw: r.gateway,
                    src: r.prefsrc,
                    onlink: r.flags.iter().any(|f| f == "onlink"),
                })
            })
            .collect()
    }

    fn route_replace(&self, route: &Route) -> Result<()> {
        let name = self.name_of(route.link_index)?;
        let dst = route.dst.to_string();
        let gw = route.gw.map(|g| g.to_string());
        let src = route.src.map(|s| s.to_string());

        let mut args: Vec<&str> = vec!["route", "replace", dst.as_str()];
        if let Some(gw) = &gw {
            args.extend(["via", gw.as_str()]);
        }
        args.extend(["dev", name.as_str()]);
        if let Some(src) = &src {
            args.extend(["src", src.as_str()]);
        }
        if route.onlink {
            args.push("onlink");
        }
        self.ip(&args).map(|_| ())
    }

    fn route_del(&self, route: &Route) -> Result<()> {
        let name = self.name_of(route.link_index)?;
        let dst = route.dst.to_string();
        let gw = route.gw.map(|g| g.to_string());

        let mut args: Vec<&str> = vec!["route", "del", dst.as_str()];
        if let Some(gw) = &gw {
            args.extend(["via", gw.as_str()]);
        }
        args.extend(["dev", name.as_str()]);
        self.ip(&args).map(|_| ())
    }

    fn arp_list(&self, link_index: u32) -> Result<Vec<Neigh>> {
        let name = self.name_of(link_index)?;
        let stdout = self.ip(&["-j", "-4", "neigh", "show", "dev", &name])?;
        let neighs: Vec<IpNeigh> = serde_json::from_str(&stdout).context("parse ip neigh output")?;
        Ok(neighs
            .into_iter()
            .filter_map(|n| {
                let hardware_addr = n.lladdr.as_deref()?.parse().ok()?;
                Some(Neigh {
                    link_index,
                    kind: NeighKind::Arp,
                    ip: n.dst,
                    hardware_addr,
                    permanent: n.state.iter().any(|s| s == "PERMANENT"),
                })
            })
            .collect())
    }

    fn fdb_list(&self, link_index: u32) -> Result<Vec<Neigh>> {
        let name = self.name_of(link_index)?;
        let stdout = self.bridge(&["-j", "fdb", "show", "dev", &name])?;
        let entries: Vec<BridgeFdb> = serde_json::from_str(&stdout).context("parse bridge fdb output")?;
        Ok(entries
            .into_iter()
            .filter_map(|e| {
                let ip = e.dst.as_deref()?.parse().ok()?;
                let hardware_addr = e.mac.parse().ok()?;
                Some(Neigh {
                    link_index,
                    kind: NeighKind::Fdb,
                    ip,
                    hardware_addr,
                    permanent: e.state == "permanent",
                })
            })
            .collect())
    }

    fn neigh_set(&self, neigh: &Neigh) -> Result<()> {
        let name = self.name_of(neigh.link_index)?;
        let ip = neigh.ip.to_string();
        let mac = neigh.hardware_addr.to_string();
        match neigh.kind {
            NeighKind::Arp => self
                .ip(&["neigh", "replace", &ip, "lladdr", &mac, "dev", &name, "nud", "permanent"])
                .map(|_| ()),
            NeighKind::Fdb => self
                .bridge(&["fdb", "replace", &mac, "dev", &name, "dst", &ip, "self", "permanent"])
                .map(|_| ()),
        }
    }

    fn neigh_del(&self, neigh: &Neigh) -> Result<()> {
        let name = self.name_of(neigh.link_index)?;
        let ip = neigh.ip.to_string();
        let mac = neigh.hardware_addr.to_string();
        match neigh.kind {
            NeighKind::Arp => self.ip(&["neigh", "del", &ip, "dev", &name]).map(|_| ()),
            NeighKind::Fdb => self
                .bridge(&["fdb", "del", &mac, "dev", &name, "dst", &ip, "self"])
                .map(|_| ()),
        }
    }
}

impl NetAdapter for IpCommandNetlink {
    fn interfaces(&self) -> Result<Vec<Link>> {
        self.links()
    }

    fn interface_addrs(&self, iface: &Link) -> Result<Vec<Ipv4Net>> {
        self.addr_list(&iface.name)
    }

    fn interface_by_name(&self, name: &str) -> Result<Link> {
        self.link_by_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_abstraction::{CommandOutput, MockCommandExecutor};

    const LINKS: &str = r#"[
        {"ifindex":1,"ifname":"lo","mtu":65536,"address":"00:00:00:00:00:00"},
        {"ifindex":4,"ifname":"eth4","mtu":1450,"address":"bb:bb:00:00:12:34"},
        {"ifindex":42,"ifname":"weft-vtep","mtu":1400,"address":"ee:ee:0a:ff:20:00"}
    ]"#;

    fn expect_links(mock: &mut MockCommandExecutor) {
        mock.expect_execute()
            .withf(|cmd, args| cmd == "ip" && args == ["-j", "link", "show"])
            .returning(|_, _| Ok(CommandOutput::ok(LINKS)));
    }

    #[test]
    fn test_parse_route_dst() {
        assert_eq!(
            parse_route_dst("default").unwrap(),
            "0.0.0.0/0".parse::<Ipv4Net>().unwrap()
        );
        assert_eq!(
            parse_route_dst("10.255.19.0/24").unwrap(),
            "10.255.19.0/24".parse::<Ipv4Net>().unwrap()
        );
        assert_eq!(
            parse_route_dst("10.255.1.11").unwrap(),
            "10.255.1.11/32".parse::<Ipv4Net>().unwrap()
        );
        assert!(parse_route_dst("banana").is_err());
    }

    #[test]
    fn test_link_by_index() {
        let mut mock = MockCommandExecutor::new();
        expect_links(&mut mock);
        let nl = IpCommandNetlink::new(Arc::new(mock));

        let link = nl.link_by_index(4).unwrap();
        assert_eq!(link.name, "eth4");
        assert_eq!(link.mtu, 1450);
        assert_eq!(
            link.hardware_addr,
            Some(HardwareAddr([0xbb, 0xbb, 0x00, 0x00, 0x12, 0x34]))
        );
        assert_eq!(nl.link_by_index(7).unwrap_err().to_string(), "Link not found");
    }

    #[test]
    fn test_addr_list_keeps_host_bits() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|_, args| args == ["-j", "-4", "addr", "show", "dev", "weft-vtep"])
            .returning(|_, _| {
                Ok(CommandOutput::ok(
                    r#"[{"ifname":"weft-vtep","addr_info":[
                        {"family":"inet","local":"10.255.32.0","prefixlen":16,"scope":"link"},
                        {"family":"inet","local":"10.250.0.0","prefixlen":16,"scope":"link"}]}]"#,
                ))
            });
        let nl = IpCommandNetlink::new(Arc::new(mock));

        let addrs = nl.addr_list("weft-vtep").unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].addr(), "10.255.32.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(addrs[0].prefix_len(), 16);
    }

    #[test]
    fn test_route_list_parses_gateway_and_onlink() {
        let mut mock = MockCommandExecutor::new();
        expect_links(&mut mock);
        mock.expect_execute()
            .withf(|_, args| args == ["-j", "-4", "route", "show", "dev", "weft-vtep"])
            .returning(|_, _| {
                Ok(CommandOutput::ok(
                    r#"[
                    {"dst":"10.255.0.0/16","protocol":"kernel","scope":"link","prefsrc":"10.255.32.0","flags":[]},
                    {"dst":"10.250.50.0/24","gateway":"10.250.50.0","prefsrc":"10.250.0.0","flags":["onlink"]}
                ]"#,
                ))
            });
        let nl = IpCommandNetlink::new(Arc::new(mock));

        let routes = nl.route_list(42).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].gw, None);
        assert_eq!(
            routes[1],
            Route {
                link_index: 42,
                dst: "10.250.50.0/24".parse().unwrap(),
                gw: Some("10.250.50.0".parse().unwrap()),
                src: Some("10.250.0.0".parse().unwrap()),
                onlink: true,
            }
        );
    }

    #[test]
    fn test_route_replace_command() {
        let mut mock = MockCommandExecutor::new();
        expect_links(&mut mock);
        mock.expect_execute()
            .withf(|_, args| {
                args == [
                    "route", "replace", "10.255.19.0/24", "via", "10.255.19.0", "dev", "weft-vtep",
                    "src", "10.255.0.66", "onlink",
                ]
            })
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));
        let nl = IpCommandNetlink::new(Arc::new(mock));

        nl.route_replace(&Route {
            link_index: 42,
            dst: "10.255.19.0/24".parse().unwrap(),
            gw: Some("10.255.19.0".parse().unwrap()),
            src: Some("10.255.0.66".parse().unwrap()),
            onlink: true,
        })
        .unwrap();
    }

    #[test]
    fn test_arp_and_fdb_lists() {
        let mut mock = MockCommandExecutor::new();
        expect_links(&mut mock);
        mock.expect_execute()
            .withf(|cmd, args| cmd == "ip" && args.iter().any(|a| a == "neigh"))
            .returning(|_, _| {
                Ok(CommandOutput::ok(
                    r#"[
                    {"dst":"10.255.19.0","lladdr":"ee:ee:aa:aa:aa:ff","state":["PERMANENT"]},
                    {"dst":"10.255.19.9","state":["FAILED"]}
                ]"#,
                ))
            });
        mock.expect_execute()
            .withf(|cmd, args| cmd == "bridge" && args == ["-j", "fdb", "show", "dev", "weft-vtep"])
            .returning(|_, _| {
                Ok(CommandOutput::ok(
                    r#"[
                    {"mac":"ee:ee:aa:aa:aa:ff","dst":"10.10.0.5","flags":["self"],"state":"permanent"},
                    {"mac":"33:33:00:00:00:01","flags":["self"],"state":"permanent"}
                ]"#,
                ))
            });
        let nl = IpCommandNetlink::new(Arc::new(mock));
        let mac: HardwareAddr = "ee:ee:aa:aa:aa:ff".parse().unwrap();

        assert_eq!(
            nl.arp_list(42).unwrap(),
            vec![Neigh::arp(42, "10.255.19.0".parse().unwrap(), mac)]
        );
        assert_eq!(
            nl.fdb_list(42).unwrap(),
            vec![Neigh::fdb(42, "10.10.0.5".parse().unwrap(), mac)]
        );
    }

    #[test]
    fn test_neigh_set_commands() {
        let mut mock = MockCommandExecutor::new();
        expect_links(&mut mock);
        mock.expect_execute()
            .withf(|cmd, args| {
                cmd == "ip"
                    && args
                        == [
                            "neigh", "replace", "10.255.19.0", "lladdr", "ee:ee:aa:aa:aa:ff", "dev",
                            "weft-vtep", "nud", "permanent",
                        ]
            })
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));
        mock.expect_execute()
            .withf(|cmd, args| {
                cmd == "bridge"
                    && args
                        == [
                            "fdb", "replace", "ee:ee:aa:aa:aa:ff", "dev", "weft-vtep", "dst",
                            "10.10.0.5", "self", "permanent",
                        ]
            })
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));
        let nl = IpCommandNetlink::new(Arc::new(mock));
        let mac: HardwareAddr = "ee:ee:aa:aa:aa:ff".parse().unwrap();

        nl.neigh_set(&Neigh::arp(42, "10.255.19.0".parse().unwrap(), mac))
            .unwrap();
        nl.neigh_set(&Neigh::fdb(42, "10.10.0.5".parse().unwrap(), mac))
            .unwrap();
    }

    #[test]
    fn test_link_add_vxlan_command() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|_, args| {
                args == [
                    "link", "add", "weft-vtep", "address", "ee:ee:0a:ff:20:00", "type", "vxlan",
                    "id", "99", "local", "172.255.0.0", "dev", "eth4", "dstport", "4913",
                    "nolearning", "gbp",
                ]
            })
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));
        let nl = IpCommandNetlink::new(Arc::new(mock));

        nl.link_add_vxlan(&VxlanLink {
            name: "weft-vtep".to_string(),
            hardware_addr: HardwareAddr([0xee, 0xee, 0x0a, 0xff, 0x20, 0x00]),
            vni: 99,
            src_addr: "172.255.0.0".parse().unwrap(),
            gbp: true,
            port: 4913,
            vtep_dev: "eth4".to_string(),
        })
        .unwrap();
    }
}
