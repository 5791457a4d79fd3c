use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;

use thiserror::Error;

use crate::address_set::Bundle;
use crate::confset::{self, ConfSet};
use crate::exec::Runner;
use crate::host::{Host, PolicyRole};
use crate::key::Key;
use crate::netns::NetNs;
use crate::primitive::{self, LinkCidr, Primitive, TUNNEL_MTU, tunnel_pair};
use crate::supervisor::{DEFAULT_DNS_UPSTREAM, Supervised};

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown host: {0}")]
    UnknownHost(String),
    #[error("host already declared: {0}")]
    DuplicateHost(String),
    #[error("link endpoints must be distinct hosts: {0}")]
    SelfLink(String),
    #[error("listener host has no wan address: {0}")]
    ListenerWithoutWan(String),
    #[error("source and gateway must differ: {0}")]
    SourceIsGateway(String),
    #[error("no path from {src} to {gateway}")]
    NoPath { src: String, gateway: String },
    #[error("mock harness disabled")]
    MockDisabled,
    #[error("mock address space exhausted")]
    MockAddressesExhausted,
    #[error(transparent)]
    LinkCidr(#[from] primitive::CidrError),
    #[error(transparent)]
    Primitive(#[from] primitive::Error),
    #[error(transparent)]
    Transaction(#[from] confset::Error),
}

#[derive(Clone, Copy, Debug)]
struct Edge {
    peer: usize,
    /// This side's tunnel address on the link.
    local_ip: Ipv4Addr,
    /// The peer's tunnel address on the link.
    peer_ip: Ipv4Addr,
}

#[derive(Clone, Copy, Debug)]
struct PathEdge {
    from: usize,
    to: usize,
    from_ip: Ipv4Addr,
    to_ip: Ipv4Addr,
}

#[derive(Debug)]
struct EgressRequest {
    bundle: Bundle,
    src: usize,
    gateway: usize,
}

#[derive(Debug)]
struct MockNet {
    conf: ConfSet,
    hub_ns: NetNs,
    next_subnet: u8,
}

struct MockLink {
    local: String,
    hub: String,
    via: String,
    host_ip: String,
}

impl MockNet {
    fn new() -> Self {
        let hub_ns = NetNs::named("hub");
        let mut conf = ConfSet::new();
        conf.append(Primitive::namespace(&hub_ns));
        conf.append(Primitive::virtual_link("hub", "192.168.1.1/24", "192.168.1.2/24", &NetNs::global(), &hub_ns));
        conf.append(Primitive::route("default", "192.168.1.1", "main", &hub_ns));
        conf.append(Primitive::filter_rule(
            "nat",
            "POSTROUTING",
            ["-o", "hub-right", "-j", "MASQUERADE"].map(String::from).to_vec(),
            &hub_ns,
        ));
        conf.append(Primitive::filter_rule(
            "nat",
            "POSTROUTING",
            ["-s", "192.168.1.2", "-j", "MASQUERADE"].map(String::from).to_vec(),
            &NetNs::global(),
        ));
        MockNet { conf, hub_ns, next_subnet: 10 }
    }

    /// Pick the addresses of a host's link to the hub: the declared WAN
    /// address when present, a fresh `10.123.<n>.0/24` otherwise.
    fn allocate(&mut self, wan_ip: Option<Ipv4Addr>) -> Result<MockLink, Error> {
        match wan_ip {
            Some(wan) => {
                let [a, b, c, d] = wan.octets();
                let hub_octet = if d == 1 { 2 } else { 1 };
                Ok(MockLink {
                    local: format!("{wan}/24"),
                    hub: format!("{a}.{b}.{c}.{hub_octet}/24"),
                    via: format!("{a}.{b}.{c}.{hub_octet}"),
                    host_ip: wan.to_string(),
                })
            }
            None => {
                if self.next_subnet == u8::MAX {
                    return Err(Error::MockAddressesExhausted);
                }
                let n = self.next_subnet;
                self.next_subnet += 1;
                Ok(MockLink {
                    local: format!("10.123.{n}.2/24"),
                    hub: format!("10.123.{n}.1/24"),
                    via: format!("10.123.{n}.1"),
                    host_ip: format!("10.123.{n}.2"),
                })
            }
        }
    }
}

/// The declared mesh: hosts, tunnel edges and queued egress requests.
///
/// Declaration calls only accumulate data; the first `up` (or `plan`)
/// compiles it into per-host transactions, exactly once.
#[derive(Debug, Default)]
pub struct Network {
    hosts: Vec<Host>,
    index: HashMap<String, usize>,
    edges: Vec<Vec<Edge>>,
    requests: Vec<EgressRequest>,
    compiled: bool,
    mock: Option<MockNet>,
}

impl Network {
    pub fn new() -> Self {
        Network::default()
    }

    /// A network whose hosts live in namespaces wired to a hub, so the
    /// whole mesh can be exercised on one machine.
    pub fn mock() -> Self {
        Network { mock: Some(MockNet::new()), ..Network::default() }
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.index.get(name).map(|&i| &self.hosts[i])
    }

    fn resolve(&self, name: &str) -> Result<usize, Error> {
        self.index.get(name).copied().ok_or_else(|| Error::UnknownHost(name.to_string()))
    }

    pub fn add_host(&mut self, name: &str, wan_ip: Option<Ipv4Addr>, key: Key) -> Result<(), Error> {
        if self.index.contains_key(name) {
            return Err(Error::DuplicateHost(name.to_string()));
        }

        let ns = match &mut self.mock {
            Some(mock) => {
                let ns = NetNs::named(name);
                let hub_ns = mock.hub_ns.clone();
                let link = mock.allocate(wan_ip)?;
                mock.conf.append(Primitive::namespace(&ns));
                mock.conf.append(Primitive::virtual_link(name, &link.local, &link.hub, &ns, &hub_ns));
                mock.conf.append(Primitive::route("default", &link.via, "main", &ns));
                // source validation on the hub side of the host link
                mock.conf.append(Primitive::filter_rule(
                    "filter",
                    "FORWARD",
                    vec![
                        "-i".to_string(),
                        format!("{name}-right"),
                        "!".to_string(),
                        "-s".to_string(),
                        link.host_ip,
                        "-j".to_string(),
                        "DROP".to_string(),
                    ],
                    &hub_ns,
                ));
                ns
            }
            None => NetNs::global(),
        };

        self.index.insert(name.to_string(), self.hosts.len());
        self.hosts.push(Host::new(name, wan_ip, key, ns));
        self.edges.push(Vec::new());
        Ok(())
    }

    /// Declare a tunnel edge over a `/30`; `left` dials, `right` listens on
    /// `port` and therefore needs a WAN address.
    pub fn connect(&mut self, left: &str, right: &str, cidr: &str, port: u16) -> Result<(), Error> {
        self.connect_mtu(left, right, cidr, port, TUNNEL_MTU)
    }

    pub fn connect_mtu(&mut self, left: &str, right: &str, cidr: &str, port: u16, mtu: u16) -> Result<(), Error> {
        let cidr: LinkCidr = cidr.parse()?;
        let l = self.resolve(left)?;
        let r = self.resolve(right)?;
        if l == r {
            return Err(Error::SelfLink(left.to_string()));
        }
        let Some(wan) = self.hosts[r].wan_ip() else {
            return Err(Error::ListenerWithoutWan(right.to_string()));
        };

        let name = format!("{left}.{right}");
        let (left_end, right_end) = tunnel_pair(
            &name,
            self.hosts[l].key(),
            self.hosts[r].key(),
            wan,
            cidr,
            port,
            mtu,
            self.hosts[l].ns(),
            self.hosts[r].ns(),
        )?;
        self.hosts[l].transaction_mut().append(left_end);
        self.hosts[r].transaction_mut().append(right_end);

        let (left_ip, right_ip) = (cidr.left_ip(), cidr.right_ip());
        self.hosts[l].claim(left_ip.to_string());
        self.hosts[r].claim(right_ip.to_string());
        self.edges[l].push(Edge { peer: r, local_ip: left_ip, peer_ip: right_ip });
        self.edges[r].push(Edge { peer: l, local_ip: right_ip, peer_ip: left_ip });
        Ok(())
    }

    /// Queue a request to send traffic matching `bundle` from `src` through
    /// the mesh to `gateway`, which NATs it out.
    pub fn output_to_nat_gateway(&mut self, bundle: Bundle, src: &str, gateway: &str) -> Result<(), Error> {
        let src = self.resolve(src)?;
        let gateway_idx = self.resolve(gateway)?;
        if src == gateway_idx {
            return Err(Error::SourceIsGateway(gateway.to_string()));
        }
        self.requests.push(EgressRequest { bundle, src, gateway: gateway_idx });
        Ok(())
    }

    pub fn add_dns(&mut self, host: &str, listen: &str) -> Result<(), Error> {
        self.add_dns_upstream(host, listen, DEFAULT_DNS_UPSTREAM)
    }

    pub fn add_dns_upstream(&mut self, host: &str, listen: &str, upstream: &str) -> Result<(), Error> {
        let h = self.resolve(host)?;
        // a real system resolver would conflict on port 53; the sandbox has none
        let manage_resolver = self.mock.is_none();
        let ns = self.hosts[h].ns().clone();
        self.hosts[h]
            .transaction_mut()
            .append(Primitive::supervised(Supervised::recursive_dns(listen, upstream, manage_resolver, &ns)));
        Ok(())
    }

    /// Compile the declaration into per-host transactions and apply the
    /// named host's. Fails without touching the system when any queued
    /// egress request has no path.
    pub fn up(&mut self, host: &str, runner: &Arc<dyn Runner>) -> Result<(), Error> {
        let h = self.resolve(host)?;
        self.compile()?;
        self.hosts[h].transaction_mut().apply(runner)?;
        Ok(())
    }

    pub fn down(&mut self, host: &str, runner: &Arc<dyn Runner>) -> Result<(), Error> {
        let h = self.resolve(host)?;
        self.hosts[h].transaction_mut().revert(runner)?;
        Ok(())
    }

    /// The compiled transaction of one host as command text, without
    /// touching the system.
    pub fn plan(&mut self, host: &str) -> Result<Vec<String>, Error> {
        let h = self.resolve(host)?;
        self.compile()?;
        Ok(self.hosts[h].transaction().render())
    }

    pub fn up_mock(&mut self, runner: &Arc<dyn Runner>) -> Result<(), Error> {
        match &mut self.mock {
            Some(mock) => Ok(mock.conf.apply(runner)?),
            None => Err(Error::MockDisabled),
        }
    }

    pub fn down_mock(&mut self, runner: &Arc<dyn Runner>) -> Result<(), Error> {
        match &mut self.mock {
            Some(mock) => Ok(mock.conf.revert(runner)?),
            None => Err(Error::MockDisabled),
        }
    }

    pub fn plan_mock(&self) -> Result<Vec<String>, Error> {
        match &self.mock {
            Some(mock) => Ok(mock.conf.render()),
            None => Err(Error::MockDisabled),
        }
    }

    fn compile(&mut self) -> Result<(), Error> {
        if self.compiled {
            return Ok(());
        }
        // resolve every egress path before mutating any transaction, so a
        // failing request leaves the network as declared
        let mut resolved = Vec::with_capacity(self.requests.len());
        for request in &self.requests {
            let path = self.shortest_path(request.src, request.gateway)?;
            resolved.push((request.bundle.clone(), path));
        }

        self.distribute_static_routes();
        for (bundle, path) in &resolved {
            self.install_policy_path(bundle, path);
        }
        self.compiled = true;
        Ok(())
    }

    /// Pass 1: make every host's claimed ranges reachable from everywhere,
    /// shortest path first, ties broken by declaration order.
    fn distribute_static_routes(&mut self) {
        for start in 0..self.hosts.len() {
            let ranges = self.hosts[start].claimed().to_vec();
            let mut visited = vec![false; self.hosts.len()];
            visited[start] = true;
            let mut queue = VecDeque::from([start]);

            while let Some(u) = queue.pop_front() {
                let hops: Vec<(usize, Ipv4Addr)> = self.edges[u].iter().map(|e| (e.peer, e.local_ip)).collect();
                for (v, next_hop) in hops {
                    if visited[v] {
                        continue;
                    }
                    visited[v] = true;
                    queue.push_back(v);

                    let hop = next_hop.to_string();
                    let ns = self.hosts[v].ns().clone();
                    for range in &ranges {
                        if *range != hop {
                            self.hosts[v].transaction_mut().append(Primitive::route(range, &hop, "main", &ns));
                        }
                    }
                }
            }
        }
    }

    fn shortest_path(&self, src: usize, gateway: usize) -> Result<Vec<PathEdge>, Error> {
        let no_path = || Error::NoPath {
            src: self.hosts[src].name().to_string(),
            gateway: self.hosts[gateway].name().to_string(),
        };

        let mut prev: Vec<Option<PathEdge>> = vec![None; self.hosts.len()];
        let mut visited = vec![false; self.hosts.len()];
        visited[src] = true;
        let mut queue = VecDeque::from([src]);

        'bfs: while let Some(u) = queue.pop_front() {
            for edge in &self.edges[u] {
                if visited[edge.peer] {
                    continue;
                }
                visited[edge.peer] = true;
                prev[edge.peer] = Some(PathEdge {
                    from: u,
                    to: edge.peer,
                    from_ip: edge.local_ip,
                    to_ip: edge.peer_ip,
                });
                if edge.peer == gateway {
                    break 'bfs;
                }
                queue.push_back(edge.peer);
            }
        }

        if !visited[gateway] {
            return Err(no_path());
        }

        let mut path = Vec::new();
        let mut node = gateway;
        while node != src {
            match prev[node] {
                Some(edge) => {
                    path.push(edge);
                    node = edge.from;
                }
                None => return Err(no_path()),
            }
        }
        path.reverse();
        Ok(path)
    }

    /// Pass 2 for one request: distribute the bundle's sets along the path
    /// and give every hop its role.
    fn install_policy_path(&mut self, bundle: &Bundle, path: &[PathEdge]) {
        let (Some(first), Some(last)) = (path.first(), path.last()) else {
            return;
        };

        let mut nodes = vec![first.from];
        nodes.extend(path.iter().map(|e| e.to));
        for &node in &nodes {
            for set in bundle.sets() {
                self.hosts[node].add_address_set(set);
            }
        }

        let src_ip = first.from_ip;
        self.hosts[first.from].install_policy_route(PolicyRole::LocalOutput { next_hop: first.to_ip }, src_ip, bundle);
        for edge in &path[1..] {
            self.hosts[edge.from].install_policy_route(PolicyRole::Transit { next_hop: edge.to_ip }, src_ip, bundle);
        }
        self.hosts[last.to].install_policy_route(PolicyRole::EgressNat, src_ip, bundle);
    }
}
