use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::address_set::{self, AddressSet, Bundle};
use crate::key::{self, Key};
use crate::network::{self, Network};
use crate::primitive::TUNNEL_MTU;

pub const ENV_VAR: &str = "WG_WORLD_CONFIG";
pub const DEFAULT_PATH: &str = "/etc/wg_world/mesh.toml";

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("key error: {0}")]
    Key(#[from] key::Error),
    #[error("unknown address set: {0}")]
    UnknownSet(String),
    #[error("unknown builtin address set: {0}")]
    UnknownBuiltin(String),
    #[error("address set has no ranges: {0}")]
    EmptySet(String),
    #[error(transparent)]
    Network(#[from] network::Error),
}

/// Declarative mesh description loaded from a TOML file and replayed onto a
/// [`Network`] in declaration order.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    #[serde(default)]
    pub mock: bool,
    #[serde(default, rename = "host")]
    pub hosts: Vec<HostConfig>,
    #[serde(default, rename = "link")]
    pub links: Vec<LinkConfig>,
    #[serde(default, rename = "set")]
    pub sets: Vec<SetConfig>,
    #[serde(default, rename = "egress")]
    pub egress: Vec<EgressConfig>,
    #[serde(default, rename = "dns")]
    pub dns: Vec<DnsConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub name: String,
    pub wan_ip: Option<Ipv4Addr>,
    /// Persisted key record; generated and written when the file is absent,
    /// fresh and unpersisted when the field is.
    pub key_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    pub left: String,
    pub right: String,
    pub cidr: String,
    pub port: u16,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

fn default_mtu() -> u16 {
    TUNNEL_MTU
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetConfig {
    pub name: String,
    /// Currently only `"private"`.
    pub builtin: Option<String>,
    /// Newline separated range listing, e.g. a by-country file.
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub ranges: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EgressConfig {
    pub src: String,
    pub gateway: String,
    #[serde(default, rename = "match")]
    pub match_sets: Vec<String>,
    #[serde(default)]
    pub not_match: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    pub host: String,
    pub listen: String,
    pub upstream: Option<String>,
}

impl MeshConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Replay the description onto a fresh network.
    pub fn build(&self) -> Result<Network, Error> {
        let mut network = if self.mock { Network::mock() } else { Network::new() };

        for host in &self.hosts {
            let key = match &host.key_file {
                Some(path) if path.exists() => Key::load(path)?,
                Some(path) => {
                    let key = Key::generate()?;
                    key.dump(path)?;
                    key
                }
                None => Key::generate()?,
            };
            network.add_host(&host.name, host.wan_ip, key)?;
        }

        for link in &self.links {
            network.connect_mtu(&link.left, &link.right, &link.cidr, link.port, link.mtu)?;
        }

        let sets = self.resolve_sets()?;
        for egress in &self.egress {
            let bundle = Bundle::new(
                lookup_sets(&sets, &egress.match_sets)?,
                lookup_sets(&sets, &egress.not_match)?,
            );
            network.output_to_nat_gateway(bundle, &egress.src, &egress.gateway)?;
        }

        for dns in &self.dns {
            match &dns.upstream {
                Some(upstream) => network.add_dns_upstream(&dns.host, &dns.listen, upstream)?,
                None => network.add_dns(&dns.host, &dns.listen)?,
            }
        }

        Ok(network)
    }

    fn resolve_sets(&self) -> Result<Vec<AddressSet>, Error> {
        self.sets.iter().map(|set| set.resolve()).collect()
    }
}

impl SetConfig {
    fn resolve(&self) -> Result<AddressSet, Error> {
        if let Some(builtin) = &self.builtin {
            if builtin != "private" {
                return Err(Error::UnknownBuiltin(builtin.clone()));
            }
            return Ok(AddressSet::new(&self.name, address_set::private_ranges()));
        }
        if let Some(file) = &self.file {
            let text = fs::read_to_string(file)?;
            return Ok(AddressSet::from_lines(&self.name, &text));
        }
        if self.ranges.is_empty() {
            return Err(Error::EmptySet(self.name.clone()));
        }
        Ok(AddressSet::new(&self.name, self.ranges.clone()))
    }
}

fn lookup_sets(sets: &[AddressSet], names: &[String]) -> Result<Vec<AddressSet>, Error> {
    names
        .iter()
        .map(|name| {
            sets.iter()
                .find(|set| set.name() == name.as_str())
                .cloned()
                .ok_or_else(|| Error::UnknownSet(name.clone()))
        })
        .collect()
}
