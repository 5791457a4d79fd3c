use std::fmt;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    FromUtf8Error(#[from] std::string::FromUtf8Error),
    #[error("key record error: {0}")]
    Record(#[from] serde_json::Error),
    #[error("wireguard error [status: {0}]: {1}")]
    WgError(i32, String),
}

/// Asymmetric key pair for one tunnel endpoint.
///
/// Persisted as the two field record `{"pk": …, "sk": …}`. The secret half
/// never appears in log or display output.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Key {
    pk: String,
    sk: String,
}

impl Key {
    /// Generate a fresh pair with the wireguard tooling.
    pub fn generate() -> Result<Self, Error> {
        let output = Command::new("wg").arg("genkey").output()?;
        if !output.status.success() {
            return Err(Error::WgError(
                output.status.code().unwrap_or_default(),
                format!("wg genkey failed: {}", String::from_utf8_lossy(&output.stderr)),
            ));
        }
        let sk = String::from_utf8(output.stdout)?.trim().to_string();
        let pk = derive_public(&sk)?;
        Ok(Key { pk, sk })
    }

    pub fn from_parts(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Key { pk: pk.into(), sk: sk.into() }
    }

    pub fn public(&self) -> &str {
        &self.pk
    }

    pub(crate) fn secret(&self) -> &str {
        &self.sk
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let record = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&record)?)
    }

    pub fn dump(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, serde_json::to_string(self)?)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pub: {}, secret: ******", self.pk)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key").field("pk", &self.pk).field("sk", &"******").finish()
    }
}

fn derive_public(sk: &str) -> Result<String, Error> {
    let mut command = Command::new("wg")
        .arg("pubkey")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(stdin) = command.stdin.as_mut() {
        stdin.write_all(sk.as_bytes())?
    }

    let output = command.wait_with_output()?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(Error::WgError(
            output.status.code().unwrap_or_default(),
            format!("wg pubkey failed: {}", String::from_utf8_lossy(&output.stderr)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_key_round_trips() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("edge.json");

        let key = Key::from_parts("public-part", "secret-part");
        key.dump(&path)?;
        let loaded = Key::load(&path)?;

        assert_eq!(loaded, key);
        Ok(())
    }

    #[test]
    fn record_uses_two_field_layout() -> anyhow::Result<()> {
        let key = Key::from_parts("p", "s");
        let record: serde_json::Value = serde_json::from_str(&serde_json::to_string(&key)?)?;

        assert_eq!(record["pk"], "p");
        assert_eq!(record["sk"], "s");
        Ok(())
    }

    #[test]
    fn display_and_debug_redact_the_secret() {
        let key = Key::from_parts("public-part", "secret-part");

        assert!(!format!("{key}").contains("secret-part"));
        assert!(!format!("{key:?}").contains("secret-part"));
    }
}
