use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::address_set::{AddressSet, Bundle};
use crate::confset::ConfSet;
use crate::key::Key;
use crate::netns::NetNs;
use crate::primitive::Primitive;
use crate::supervisor::{PROXY_PORT, Supervised};

/// First routing table identifier handed out by a host; the allocated value
/// doubles as the firewall mark for that policy decision.
pub const TABLE_BASE: u32 = 100;

/// The part a host plays on one policy-route path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyRole {
    /// Traffic originating on this host; classified once per connection in
    /// the output chain and source-NAT'd onto the tunnel address.
    LocalOutput { next_hop: Ipv4Addr },
    /// Traffic passing through on its way to the gateway.
    Transit { next_hop: Ipv4Addr },
    /// Terminal hop: masquerade everything except TCP, which is redirected
    /// into the local transparent proxy.
    EgressNat,
}

/// A named node of the mesh: key pair, namespace, claimed ranges and the
/// transaction that materializes its configuration.
#[derive(Debug)]
pub struct Host {
    name: String,
    wan_ip: Option<Ipv4Addr>,
    key: Key,
    ns: NetNs,
    claimed: Vec<String>,
    confs: ConfSet,
    next_table: u32,
    egress_proxy: bool,
    sets: HashSet<String>,
}

impl Host {
    pub(crate) fn new(name: &str, wan_ip: Option<Ipv4Addr>, key: Key, ns: NetNs) -> Self {
        Host {
            name: name.to_string(),
            wan_ip,
            key,
            ns,
            claimed: Vec::new(),
            confs: ConfSet::new(),
            next_table: TABLE_BASE,
            egress_proxy: false,
            sets: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wan_ip(&self) -> Option<Ipv4Addr> {
        self.wan_ip
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn ns(&self) -> &NetNs {
        &self.ns
    }

    pub fn claimed(&self) -> &[String] {
        &self.claimed
    }

    pub fn transaction(&self) -> &ConfSet {
        &self.confs
    }

    pub(crate) fn transaction_mut(&mut self) -> &mut ConfSet {
        &mut self.confs
    }

    /// Record an address range reachable through this host.
    pub fn claim(&mut self, range: impl Into<String>) {
        self.claimed.push(range.into());
    }

    /// Install a set definition once per name, rebound to this host's
    /// namespace and placed before every rule that could reference it.
    pub fn add_address_set(&mut self, set: &AddressSet) {
        if !self.sets.insert(set.name().to_string()) {
            return;
        }
        self.confs.prepend(Primitive::address_set(set, &self.ns));
    }

    /// Emit the filter, route and route-rule primitives that divert traffic
    /// matching `bundle` (and originating from `src_ip` for non-local
    /// roles) along the policy path.
    pub fn install_policy_route(&mut self, role: PolicyRole, src_ip: Ipv4Addr, bundle: &Bundle) {
        if role == PolicyRole::EgressNat && !self.egress_proxy {
            self.egress_proxy = true;
            self.confs.append(Primitive::supervised(Supervised::transparent_proxy(&self.ns)));
        }

        let table = self.next_table;
        self.next_table += 1;
        let mark = table.to_string();

        let filter = bundle.filter_args();
        let src = src_ip.to_string();
        let mark_zero = ["-m", "mark", "--mark", "0"].map(String::from);
        let match_src = ["-s".to_string(), src.clone()];

        match role {
            PolicyRole::LocalOutput { .. } => {
                // connection marks keep transiting foreign traffic out of
                // this classification: only the first packet of a locally
                // originated connection is matched, the rest restore the mark
                let mut classify = filter.clone();
                classify.extend(mark_zero.clone());
                classify.extend(
                    ["-m", "state", "!", "--state", "ESTABLISHED,RELATED", "-j", "CONNMARK", "--set-mark"]
                        .map(String::from),
                );
                classify.push(mark.clone());
                self.confs.append(Primitive::filter_rule("mangle", "OUTPUT", classify, &self.ns));

                let restore = ["-m", "connmark", "--mark", mark.as_str(), "-j", "MARK", "--set-mark", mark.as_str()]
                    .map(String::from);
                self.confs.append(Primitive::filter_rule("mangle", "OUTPUT", restore.to_vec(), &self.ns));

                let snat = ["-m", "mark", "--mark", mark.as_str(), "-j", "SNAT", "--to-source", src.as_str()]
                    .map(String::from);
                self.confs.append(Primitive::filter_rule("nat", "POSTROUTING", snat.to_vec(), &self.ns));
            }
            PolicyRole::Transit { .. } => {
                let mut classify = filter.clone();
                classify.extend(mark_zero.clone());
                classify.extend(match_src.clone());
                classify.extend(["-j", "MARK", "--set-mark"].map(String::from));
                classify.push(mark.clone());
                self.confs.append(Primitive::filter_rule("mangle", "PREROUTING", classify, &self.ns));
            }
            PolicyRole::EgressNat => {
                let mut masquerade = filter.clone();
                masquerade.extend(mark_zero.clone());
                masquerade.extend(match_src.clone());
                masquerade.extend(["!", "-p", "tcp", "-j", "MASQUERADE"].map(String::from));
                self.confs.append(Primitive::filter_rule("nat", "POSTROUTING", masquerade, &self.ns));

                let mut redirect = filter.clone();
                redirect.extend(mark_zero.clone());
                redirect.extend(match_src.clone());
                redirect.extend(["-p", "tcp", "-j", "REDIRECT", "--to-ports"].map(String::from));
                redirect.push(PROXY_PORT.to_string());
                self.confs.append(Primitive::filter_rule("nat", "PREROUTING", redirect, &self.ns));
            }
        }

        if let PolicyRole::LocalOutput { next_hop } | PolicyRole::Transit { next_hop } = role {
            self.confs.append(Primitive::route("default", &next_hop.to_string(), &mark, &self.ns));
            self.confs.append(Primitive::route_rule(table, table, &self.ns));
        }
    }
}
