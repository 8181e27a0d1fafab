//! Location descriptors for drift:// and local paths

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Local,
    Remote,
}

/// An immutable location: a plain local path, or a remote peer given as
/// `drift://host[:port]/path[?local_sync_disabled=true]`. `drifts://`
/// selects TLS.
#[derive(Debug, Clone)]
pub struct Vfs {
    original: String,
    scheme: Scheme,
    host: String,
    port: u16,
    path: PathBuf,
    tls: bool,
    local_sync_disabled: bool,
}

impl Vfs {
    pub fn parse(s: &str) -> Result<Self> {
        let s_trim = s.trim();
        let lower = s_trim.to_ascii_lowercase();
        let tls = if lower.starts_with("drift://") {
            false
        } else if lower.starts_with("drifts://") {
            true
        } else {
            // Anything without a drift scheme is a local path.
            return Ok(Self {
                original: s_trim.to_string(),
                scheme: Scheme::Local,
                host: String::new(),
                port: 0,
                path: PathBuf::from(s_trim),
                tls: false,
                local_sync_disabled: false,
            });
        };

        let rest = &s_trim[s_trim.find("//").unwrap() + 2..];
        let (rest, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (hp, p) = rest.split_once('/').unwrap_or((rest, ""));
        if hp.is_empty() {
            bail!("remote url missing host: {}", s_trim);
        }
        let (host, port) = match hp.split_once(':') {
            Some((h, pr)) => match pr.parse::<u16>() {
                Ok(p) if p > 0 => (h.to_string(), p),
                _ => bail!("invalid port in remote url: {}", s_trim),
            },
            None => (hp.to_string(), DEFAULT_PORT),
        };
        let local_sync_disabled = query
            .split('&')
            .any(|kv| kv == "local_sync_disabled=true");
        Ok(Self {
            original: s_trim.to_string(),
            scheme: Scheme::Remote,
            host,
            port,
            path: if p.is_empty() {
                PathBuf::from("/")
            } else {
                PathBuf::from(format!("/{}", p))
            },
            tls,
            local_sync_disabled,
        })
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn is_remote(&self) -> bool {
        self.scheme == Scheme::Remote
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    pub fn local_sync_disabled(&self) -> bool {
        self.local_sync_disabled
    }

    /// Absolute form of a local location.
    pub fn abs(&self) -> Result<PathBuf> {
        if self.is_remote() {
            bail!("remote location has no local absolute path: {}", self.original);
        }
        let p = &self.path;
        if p.is_absolute() {
            return Ok(p.clone());
        }
        let cwd = std::env::current_dir()
            .map_err(|e| anyhow!("resolve working directory: {}", e))?;
        Ok(cwd.join(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_path() {
        let v = Vfs::parse("/tmp/src").unwrap();
        assert_eq!(v.scheme(), Scheme::Local);
        assert_eq!(v.path(), Path::new("/tmp/src"));
        assert!(!v.tls());
    }

    #[test]
    fn parses_remote_with_port_and_path() {
        let v = Vfs::parse("drift://10.0.0.2:9000/data").unwrap();
        assert!(v.is_remote());
        assert_eq!(v.host(), "10.0.0.2");
        assert_eq!(v.port(), 9000);
        assert_eq!(v.path(), Path::new("/data"));
        assert!(!v.tls());
    }

    #[test]
    fn default_port_and_tls_scheme() {
        let v = Vfs::parse("drifts://example.org/mirror").unwrap();
        assert_eq!(v.port(), DEFAULT_PORT);
        assert!(v.tls());
    }

    #[test]
    fn query_flag_disables_local_sync() {
        let v = Vfs::parse("drift://h:8105/p?local_sync_disabled=true").unwrap();
        assert!(v.local_sync_disabled());
        let v = Vfs::parse("drift://h:8105/p").unwrap();
        assert!(!v.local_sync_disabled());
    }

    #[test]
    fn rejects_bad_remote_urls() {
        assert!(Vfs::parse("drift://").is_err());
        assert!(Vfs::parse("drift://host:0/p").is_err());
        assert!(Vfs::parse("drift://host:notaport/p").is_err());
    }

    #[test]
    fn abs_of_remote_is_an_error() {
        let v = Vfs::parse("drift://h/p").unwrap();
        assert!(v.abs().is_err());
    }
}
