use std::fs;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tempfile::TempDir;
use thiserror::Error;

use crate::address_set::AddressSet as SetDefinition;
use crate::exec::{CommandLine, Runner};
use crate::key::Key;
use crate::netns::NetNs;
use crate::supervisor::{self, Supervised};

/// Firewall mark reserved for already-encapsulated tunnel traffic, so
/// policy rules never re-route what the tunnel itself sends out.
pub const TUNNEL_FWMARK: u32 = 51820;
pub const TUNNEL_MTU: u16 = 1360;
pub const KEEPALIVE_SECS: u32 = 30;

/// Stands in for the on-disk private key path in rendered plans.
const KEY_PLACEHOLDER: &str = "<private-key>";

#[derive(Debug, Error)]
pub enum Error {
    #[error("subsystem rejected intent: {0}")]
    Exec(#[from] crate::exec::Error),
    #[error("supervision error: {0}")]
    Supervision(#[from] supervisor::Error),
    #[error("key material error: {0}")]
    KeyMaterial(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrError {
    #[error("link cidr must be a /30: {0}")]
    NotSlash30(String),
    #[error("link cidr network octet must be a multiple of 4: {0}")]
    Misaligned(String),
    #[error("invalid address in link cidr: {0}")]
    Address(String),
}

/// A `/30` carrying exactly one tunnel pair: base+1 for the initiator,
/// base+2 for the listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkCidr {
    base: Ipv4Addr,
}

impl LinkCidr {
    pub fn left_ip(&self) -> Ipv4Addr {
        let [a, b, c, d] = self.base.octets();
        Ipv4Addr::new(a, b, c, d + 1)
    }

    pub fn right_ip(&self) -> Ipv4Addr {
        let [a, b, c, d] = self.base.octets();
        Ipv4Addr::new(a, b, c, d + 2)
    }
}

impl FromStr for LinkCidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(base) = s.strip_suffix("/30") else {
            return Err(CidrError::NotSlash30(s.to_string()));
        };
        let base: Ipv4Addr = base.parse().map_err(|_| CidrError::Address(s.to_string()))?;
        if base.octets()[3] % 4 != 0 {
            return Err(CidrError::Misaligned(s.to_string()));
        }
        Ok(LinkCidr { base })
    }
}

impl std::fmt::Display for LinkCidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/30", self.base)
    }
}

/// One reversible unit of host configuration.
#[derive(Debug)]
pub enum Primitive {
    Namespace(Namespace),
    VirtualLink(VirtualLink),
    Tunnel(Tunnel),
    FilterRule(FilterRule),
    Route(Route),
    RouteRule(RouteRule),
    AddressSet(AddressSet),
    Supervised(Supervised),
}

impl Primitive {
    pub fn namespace(ns: &NetNs) -> Self {
        Primitive::Namespace(Namespace { ns: ns.clone() })
    }

    pub fn virtual_link(
        name: &str,
        left_addr: &str,
        right_addr: &str,
        left_ns: &NetNs,
        right_ns: &NetNs,
    ) -> Self {
        Primitive::VirtualLink(VirtualLink {
            name: name.to_string(),
            left_addr: left_addr.to_string(),
            right_addr: right_addr.to_string(),
            left_ns: left_ns.clone(),
            right_ns: right_ns.clone(),
        })
    }

    pub fn filter_rule(table: &str, chain: &str, spec: Vec<String>, ns: &NetNs) -> Self {
        Primitive::FilterRule(FilterRule {
            table: table.to_string(),
            chain: chain.to_string(),
            spec,
            ns: ns.clone(),
        })
    }

    pub fn route(dest: &str, via: &str, table: &str, ns: &NetNs) -> Self {
        Primitive::Route(Route {
            dest: dest.to_string(),
            via: via.to_string(),
            table: table.to_string(),
            ns: ns.clone(),
        })
    }

    pub fn route_rule(mark: u32, table: u32, ns: &NetNs) -> Self {
        Primitive::RouteRule(RouteRule { mark, table, ns: ns.clone() })
    }

    pub fn address_set(set: &SetDefinition, ns: &NetNs) -> Self {
        Primitive::AddressSet(AddressSet { set: set.clone(), ns: ns.clone() })
    }

    pub fn supervised(sup: Supervised) -> Self {
        Primitive::Supervised(sup)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Primitive::Namespace(_) => "namespace",
            Primitive::VirtualLink(_) => "virtual link",
            Primitive::Tunnel(_) => "tunnel",
            Primitive::FilterRule(_) => "filter rule",
            Primitive::Route(_) => "route",
            Primitive::RouteRule(_) => "route rule",
            Primitive::AddressSet(_) => "address set",
            Primitive::Supervised(_) => "supervised process",
        }
    }

    pub fn apply(&mut self, runner: &Arc<dyn Runner>) -> Result<(), Error> {
        if let Primitive::Supervised(sup) = self {
            return sup.start(runner).map_err(Error::from);
        }
        for cmd in self.up_cmds() {
            runner.run(&cmd)?;
        }
        Ok(())
    }

    pub fn revert(&mut self, runner: &Arc<dyn Runner>) -> Result<(), Error> {
        if let Primitive::Supervised(sup) = self {
            return sup.stop(runner).map_err(Error::from);
        }
        for cmd in self.down_cmds() {
            runner.run(&cmd)?;
        }
        Ok(())
    }

    /// Apply-side command text; secret paths are masked so identical
    /// declarations render identically.
    pub fn render(&self) -> Vec<String> {
        match self {
            Primitive::Tunnel(t) => t.up(KEY_PLACEHOLDER).iter().map(CommandLine::render).collect(),
            Primitive::Supervised(s) => vec![format!("spawn {}", s.command())],
            _ => self.up_cmds().iter().map(CommandLine::render).collect(),
        }
    }

    fn up_cmds(&self) -> Vec<CommandLine> {
        match self {
            Primitive::Namespace(p) => p.up(),
            Primitive::VirtualLink(p) => p.up(),
            Primitive::Tunnel(p) => p.up(&p.key_path().display().to_string()),
            Primitive::FilterRule(p) => vec![p.cmd("-A")],
            Primitive::Route(p) => vec![p.cmd("add")],
            Primitive::RouteRule(p) => vec![p.cmd("add")],
            Primitive::AddressSet(p) => p.up(),
            Primitive::Supervised(_) => Vec::new(),
        }
    }

    fn down_cmds(&self) -> Vec<CommandLine> {
        match self {
            Primitive::Namespace(p) => p.down(),
            Primitive::VirtualLink(p) => p.down(),
            Primitive::Tunnel(p) => p.down(),
            Primitive::FilterRule(p) => vec![p.cmd("-D")],
            Primitive::Route(p) => vec![p.cmd("del")],
            Primitive::RouteRule(p) => vec![p.cmd("del")],
            Primitive::AddressSet(p) => p.down(),
            Primitive::Supervised(_) => Vec::new(),
        }
    }
}

/// Isolated network context; a no-op for the global handle.
#[derive(Debug)]
pub struct Namespace {
    ns: NetNs,
}

impl Namespace {
    fn up(&self) -> Vec<CommandLine> {
        match self.ns.name() {
            None => Vec::new(),
            Some(name) => vec![CommandLine::new(
                NetNs::global(),
                vec!["ip".into(), "netns".into(), "add".into(), name.to_string()],
            )],
        }
    }

    fn down(&self) -> Vec<CommandLine> {
        match self.ns.name() {
            None => Vec::new(),
            Some(name) => vec![CommandLine::new(
                NetNs::global(),
                vec!["ip".into(), "netns".into(), "del".into(), name.to_string()],
            )],
        }
    }
}

/// Paired virtual interfaces `<name>-left` / `<name>-right` with the right
/// end moved into its own namespace.
#[derive(Debug)]
pub struct VirtualLink {
    name: String,
    left_addr: String,
    right_addr: String,
    left_ns: NetNs,
    right_ns: NetNs,
}

impl VirtualLink {
    fn up(&self) -> Vec<CommandLine> {
        let left = format!("{}-left", self.name);
        let right = format!("{}-right", self.name);
        let in_left = |argv: &[&str]| CommandLine::new(self.left_ns.clone(), argv.iter().map(|s| s.to_string()).collect());
        let in_right = |argv: &[&str]| CommandLine::new(self.right_ns.clone(), argv.iter().map(|s| s.to_string()).collect());
        let right_ns_name = self.right_ns.name().unwrap_or("1").to_string();

        vec![
            in_left(&["ip", "link", "add", &left, "type", "veth", "peer", "name", &right]),
            in_left(&["ip", "link", "set", &right, "netns", &right_ns_name]),
            in_left(&["ip", "link", "set", &left, "up"]),
            in_left(&["ip", "addr", "add", &self.left_addr, "dev", &left]),
            in_right(&["ip", "link", "set", &right, "up"]),
            in_right(&["ip", "addr", "add", &self.right_addr, "dev", &right]),
        ]
    }

    fn down(&self) -> Vec<CommandLine> {
        // deleting one end removes the peer as well
        let left = format!("{}-left", self.name);
        vec![CommandLine::new(
            self.left_ns.clone(),
            vec!["ip".into(), "link".into(), "del".into(), left],
        )]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Listener,
}

/// Encrypted tunnel endpoint. The private key is written into a throwaway
/// directory at construction and removed when the primitive is dropped.
#[derive(Debug)]
pub struct Tunnel {
    role: Role,
    name: String,
    local_addr: String,
    peer_public: String,
    peer_endpoint: Option<String>,
    port: u16,
    mtu: u16,
    ns: NetNs,
    key_dir: TempDir,
}

impl Tunnel {
    fn new(
        role: Role,
        name: &str,
        local_key: &Key,
        peer_public: &str,
        local_addr: String,
        peer_endpoint: Option<String>,
        port: u16,
        mtu: u16,
        ns: &NetNs,
    ) -> Result<Self, Error> {
        let key_dir = TempDir::new()?;
        let sk_path = key_dir.path().join("sk");
        fs::write(&sk_path, local_key.secret())?;
        fs::set_permissions(&sk_path, fs::Permissions::from_mode(0o600))?;

        Ok(Tunnel {
            role,
            name: name.to_string(),
            local_addr,
            peer_public: peer_public.to_string(),
            peer_endpoint,
            port,
            mtu,
            ns: ns.clone(),
            key_dir,
        })
    }

    fn key_path(&self) -> PathBuf {
        self.key_dir.path().join("sk")
    }

    fn up(&self, key_path: &str) -> Vec<CommandLine> {
        let in_ns = |argv: Vec<String>| CommandLine::new(self.ns.clone(), argv);
        let mut cmds = vec![
            in_ns(vec!["ip".into(), "link".into(), "add".into(), "dev".into(), self.name.clone(), "type".into(), "wireguard".into()]),
            in_ns(vec!["ip".into(), "address".into(), "add".into(), "dev".into(), self.name.clone(), self.local_addr.clone()]),
            in_ns(vec!["ip".into(), "link".into(), "set".into(), "mtu".into(), self.mtu.to_string(), "dev".into(), self.name.clone()]),
            // encrypted traffic carries the reserved mark
            in_ns(vec!["wg".into(), "set".into(), self.name.clone(), "fwmark".into(), TUNNEL_FWMARK.to_string()]),
        ];

        let mut peer = vec!["wg".to_string(), "set".to_string(), self.name.clone()];
        if self.role == Role::Listener {
            peer.extend(["listen-port".to_string(), self.port.to_string()]);
        }
        peer.extend(["private-key".to_string(), key_path.to_string(), "peer".to_string(), self.peer_public.clone()]);
        if let Some(endpoint) = &self.peer_endpoint {
            peer.extend(["endpoint".to_string(), endpoint.clone()]);
        }
        peer.extend([
            "allowed-ips".to_string(),
            "0.0.0.0/0".to_string(),
            "persistent-keepalive".to_string(),
            KEEPALIVE_SECS.to_string(),
        ]);
        cmds.push(in_ns(peer));

        cmds.push(in_ns(vec!["ip".into(), "link".into(), "set".into(), "up".into(), "dev".into(), self.name.clone()]));
        cmds
    }

    fn down(&self) -> Vec<CommandLine> {
        vec![CommandLine::new(
            self.ns.clone(),
            vec!["ip".into(), "link".into(), "del".into(), self.name.clone()],
        )]
    }
}

/// Both endpoints of one tunnel edge: the left host dials, the right host
/// listens and therefore needs a reachable WAN endpoint.
#[allow(clippy::too_many_arguments)]
pub fn tunnel_pair(
    name: &str,
    left_key: &Key,
    right_key: &Key,
    right_wan: Ipv4Addr,
    cidr: LinkCidr,
    port: u16,
    mtu: u16,
    left_ns: &NetNs,
    right_ns: &NetNs,
) -> Result<(Primitive, Primitive), Error> {
    let left = Tunnel::new(
        Role::Initiator,
        name,
        left_key,
        right_key.public(),
        format!("{}/30", cidr.left_ip()),
        Some(format!("{right_wan}:{port}")),
        port,
        mtu,
        left_ns,
    )?;
    let right = Tunnel::new(
        Role::Listener,
        name,
        right_key,
        left_key.public(),
        format!("{}/30", cidr.right_ip()),
        None,
        port,
        mtu,
        right_ns,
    )?;
    Ok((Primitive::Tunnel(left), Primitive::Tunnel(right)))
}

#[derive(Debug)]
pub struct FilterRule {
    table: String,
    chain: String,
    spec: Vec<String>,
    ns: NetNs,
}

impl FilterRule {
    fn cmd(&self, action: &str) -> CommandLine {
        let mut argv = vec![
            "iptables".to_string(),
            "-t".to_string(),
            self.table.clone(),
            action.to_string(),
            self.chain.clone(),
        ];
        argv.extend(self.spec.iter().cloned());
        CommandLine::new(self.ns.clone(), argv)
    }
}

#[derive(Debug)]
pub struct Route {
    dest: String,
    via: String,
    table: String,
    ns: NetNs,
}

impl Route {
    fn cmd(&self, action: &str) -> CommandLine {
        CommandLine::new(
            self.ns.clone(),
            vec![
                "ip".to_string(),
                "route".to_string(),
                action.to_string(),
                self.dest.clone(),
                "via".to_string(),
                self.via.clone(),
                "table".to_string(),
                self.table.clone(),
            ],
        )
    }
}

#[derive(Debug)]
pub struct RouteRule {
    mark: u32,
    table: u32,
    ns: NetNs,
}

impl RouteRule {
    fn cmd(&self, action: &str) -> CommandLine {
        CommandLine::new(
            self.ns.clone(),
            vec![
                "ip".to_string(),
                "rule".to_string(),
                action.to_string(),
                "fwmark".to_string(),
                self.mark.to_string(),
                "table".to_string(),
                self.table.to_string(),
            ],
        )
    }
}

/// A set definition bound to a namespace, created and bulk-loaded from its
/// textual dump.
#[derive(Debug)]
pub struct AddressSet {
    set: SetDefinition,
    ns: NetNs,
}

impl AddressSet {
    fn up(&self) -> Vec<CommandLine> {
        vec![
            CommandLine::new(
                self.ns.clone(),
                vec!["ipset".into(), "create".into(), self.set.name().to_string(), "hash:net".into()],
            ),
            CommandLine::new(self.ns.clone(), vec!["ipset".into(), "restore".into()])
                .with_stdin(self.set.restore_dump()),
        ]
    }

    fn down(&self) -> Vec<CommandLine> {
        vec![CommandLine::new(
            self.ns.clone(),
            vec!["ipset".into(), "destroy".into(), self.set.name().to_string()],
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("192.10.1.0/30", "192.10.1.1", "192.10.1.2")]
    #[case("192.10.1.4/30", "192.10.1.5", "192.10.1.6")]
    #[case("10.9.8.252/30", "10.9.8.253", "10.9.8.254")]
    fn link_cidr_derives_endpoint_addresses(#[case] cidr: &str, #[case] left: &str, #[case] right: &str) -> anyhow::Result<()> {
        let cidr: LinkCidr = cidr.parse()?;
        assert_eq!(cidr.left_ip().to_string(), left);
        assert_eq!(cidr.right_ip().to_string(), right);
        Ok(())
    }

    #[rstest]
    #[case("192.10.1.1/30")]
    #[case("192.10.1.2/30")]
    #[case("192.10.1.3/30")]
    fn link_cidr_rejects_misaligned_network_octet(#[case] cidr: &str) {
        assert!(matches!(cidr.parse::<LinkCidr>(), Err(CidrError::Misaligned(_))));
    }

    #[test]
    fn link_cidr_rejects_other_prefix_lengths() {
        assert!(matches!("192.10.1.0/24".parse::<LinkCidr>(), Err(CidrError::NotSlash30(_))));
        assert!(matches!("192.10.1.0".parse::<LinkCidr>(), Err(CidrError::NotSlash30(_))));
        assert!(matches!("not-an-ip/30".parse::<LinkCidr>(), Err(CidrError::Address(_))));
    }

    #[test]
    fn namespace_primitive_is_a_noop_for_the_global_context() {
        let global = Primitive::namespace(&NetNs::global());
        assert!(global.render().is_empty());

        let named = Primitive::namespace(&NetNs::named("edge"));
        assert_eq!(named.render(), ["ip netns add edge"]);
    }

    #[test]
    fn filter_rule_appends_and_deletes_the_same_spec() {
        let rule = Primitive::filter_rule(
            "nat",
            "POSTROUTING",
            vec!["-s".into(), "10.1.0.0/16".into(), "-j".into(), "MASQUERADE".into()],
            &NetNs::named("hub"),
        );
        assert_eq!(
            rule.render(),
            ["ip netns exec hub iptables -t nat -A POSTROUTING -s 10.1.0.0/16 -j MASQUERADE"]
        );
        let Primitive::FilterRule(inner) = &rule else { panic!("expected filter rule") };
        assert_eq!(
            inner.cmd("-D").render(),
            "ip netns exec hub iptables -t nat -D POSTROUTING -s 10.1.0.0/16 -j MASQUERADE"
        );
    }

    #[test]
    fn tunnel_pair_renders_both_roles() -> anyhow::Result<()> {
        let left_key = Key::from_parts("left-pub", "left-sec");
        let right_key = Key::from_parts("right-pub", "right-sec");
        let (left, right) = tunnel_pair(
            "a.b",
            &left_key,
            &right_key,
            "10.0.0.2".parse()?,
            "192.10.1.0/30".parse()?,
            51820,
            1360,
            &NetNs::global(),
            &NetNs::global(),
        )?;

        let left_lines = left.render();
        assert!(left_lines.contains(&"ip link add dev a.b type wireguard".to_string()));
        assert!(left_lines.contains(&"ip address add dev a.b 192.10.1.1/30".to_string()));
        assert!(left_lines.contains(&"wg set a.b fwmark 51820".to_string()));
        assert!(left_lines.contains(
            &"wg set a.b private-key <private-key> peer right-pub endpoint 10.0.0.2:51820 allowed-ips 0.0.0.0/0 persistent-keepalive 30"
                .to_string()
        ));

        let right_lines = right.render();
        assert!(right_lines.contains(
            &"wg set a.b listen-port 51820 private-key <private-key> peer left-pub allowed-ips 0.0.0.0/0 persistent-keepalive 30"
                .to_string()
        ));
        Ok(())
    }

    #[test]
    fn tunnel_writes_key_material_at_construction() -> anyhow::Result<()> {
        let left_key = Key::from_parts("left-pub", "left-sec");
        let right_key = Key::from_parts("right-pub", "right-sec");
        let (left, _right) = tunnel_pair(
            "a.b",
            &left_key,
            &right_key,
            "10.0.0.2".parse()?,
            "192.10.1.0/30".parse()?,
            51820,
            1360,
            &NetNs::global(),
            &NetNs::global(),
        )?;

        let Primitive::Tunnel(tunnel) = &left else { panic!("expected tunnel") };
        let key_path = tunnel.key_path();
        assert_eq!(std::fs::read_to_string(&key_path)?, "left-sec");

        drop(left);
        assert!(!key_path.exists());
        Ok(())
    }
}
