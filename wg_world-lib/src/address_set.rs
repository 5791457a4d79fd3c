/// Named collection of address ranges, installed on hosts as a kernel set
/// and referenced by packet filter predicates.
///
/// Pure data; the namespace is bound by the primitive that installs it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressSet {
    name: String,
    ranges: Vec<String>,
}

pub fn private_ranges() -> Vec<String> {
    vec!["192.168.0.0/16".into(), "172.16.0.0/12".into(), "10.0.0.0/8".into()]
}

impl AddressSet {
    pub fn new(name: impl Into<String>, ranges: Vec<String>) -> Self {
        AddressSet { name: name.into(), ranges }
    }

    /// The RFC1918 triple.
    pub fn private() -> Self {
        AddressSet::new("private", private_ranges())
    }

    /// Build from a newline separated range listing, e.g. a by-country file.
    pub fn from_lines(name: impl Into<String>, text: &str) -> Self {
        AddressSet::new(name, text.split_whitespace().map(str::to_string).collect())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ranges(&self) -> &[String] {
        &self.ranges
    }

    /// Textual dump in the restore format of the address set subsystem.
    pub fn restore_dump(&self) -> String {
        let mut dump = String::new();
        for range in &self.ranges {
            dump.push_str(&format!("add {} {}\n", self.name, range));
        }
        dump
    }
}

/// Destination predicate over address sets: a packet matches when its
/// destination is in every `matches` set and in none of the `excludes`.
#[derive(Clone, Debug, Default)]
pub struct Bundle {
    matches: Vec<AddressSet>,
    excludes: Vec<AddressSet>,
}

impl Bundle {
    pub fn new(matches: Vec<AddressSet>, excludes: Vec<AddressSet>) -> Self {
        Bundle { matches, excludes }
    }

    pub fn matching(set: AddressSet) -> Self {
        Bundle::new(vec![set], Vec::new())
    }

    /// Every set referenced by the predicate, matches first.
    pub fn sets(&self) -> impl Iterator<Item = &AddressSet> {
        self.matches.iter().chain(self.excludes.iter())
    }

    /// Packet filter arguments selecting destinations by set membership.
    pub fn filter_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for set in &self.matches {
            args.extend(["-m", "set", "--match-set", set.name(), "dst"].map(String::from));
        }
        for set in &self.excludes {
            args.extend(["-m", "set", "!", "--match-set", set.name(), "dst"].map(String::from));
        }
        args
    }
}
