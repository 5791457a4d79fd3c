use std::fmt;

/// Handle for an OS network isolation context.
///
/// The distinguished [`NetNs::global`] value stands for the ambient context;
/// commands scoped to it run unwrapped, everything else goes through
/// `ip netns exec`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NetNs(Option<String>);

impl NetNs {
    pub fn global() -> Self {
        NetNs(None)
    }

    pub fn named(name: impl Into<String>) -> Self {
        NetNs(Some(name.into()))
    }

    pub fn is_global(&self) -> bool {
        self.0.is_none()
    }

    pub fn name(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Scope an argv to this context.
    pub fn wrap(&self, argv: &[String]) -> Vec<String> {
        match &self.0 {
            None => argv.to_vec(),
            Some(name) => {
                let mut scoped = vec!["ip".to_string(), "netns".to_string(), "exec".to_string(), name.clone()];
                scoped.extend(argv.iter().cloned());
                scoped
            }
        }
    }
}

impl fmt::Display for NetNs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => write!(f, "global"),
            Some(name) => write!(f, "{name}"),
        }
    }
}
