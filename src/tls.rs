//! Client TLS with trust-on-first-use certificate pinning.
//!
//! Drift peers are usually self-hosted file servers with self-signed
//! certificates, so the client does not chase webpki roots. Instead it pins
//! the SHA-256 fingerprint of the first certificate a peer presents and
//! refuses to reconnect if that fingerprint ever changes.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};

/// Where drift keeps client-side state such as pinned fingerprints.
pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    if let Ok(appdata) = std::env::var("APPDATA") {
        return PathBuf::from(appdata).join("Drift");
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".config").join("drift"),
        Err(_) => PathBuf::from(".drift"),
    }
}

/// Outcome of checking a peer certificate against the pin store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinCheck {
    /// The peer presented the fingerprint on record.
    Matched,
    /// The peer was unknown; its fingerprint is now on record.
    FirstUse,
    /// The peer presented a different fingerprint than the one on record.
    Changed,
}

/// Persistent `peer fingerprint` pairs, one per line, `#` for comments.
#[derive(Debug)]
pub struct PinStore {
    path: PathBuf,
}

impl PinStore {
    pub fn open_default() -> Self {
        Self {
            path: config_dir().join("known_hosts"),
        }
    }

    pub fn at<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Check `fingerprint` for `peer`, pinning it when the peer is new.
    /// A failed save is tolerated: the pin is then re-learned next time.
    pub fn check(&self, peer: &str, fingerprint: &str) -> PinCheck {
        let mut pins = self.load();
        match pins.get(peer) {
            Some(saved) if saved == fingerprint => PinCheck::Matched,
            Some(_) => PinCheck::Changed,
            None => {
                pins.insert(peer.to_string(), fingerprint.to_string());
                if let Err(e) = self.save(&pins) {
                    tracing::warn!(path = %self.path.display(), error = %e, "pin store save failed");
                }
                PinCheck::FirstUse
            }
        }
    }

    fn load(&self) -> BTreeMap<String, String> {
        let Ok(text) = fs::read_to_string(&self.path) else {
            return BTreeMap::new();
        };
        let mut pins = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            if let (Some(peer), Some(fp)) = (fields.next(), fields.next()) {
                pins.insert(peer.to_string(), fp.to_string());
            }
        }
        pins
    }

    /// Write-to-temp then rename, so a crash cannot truncate the store.
    fn save(&self, pins: &BTreeMap<String, String>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = self.path.with_extension("tmp");
        {
            let mut f = fs::File::create(&temp)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = f.metadata()?.permissions();
                perms.set_mode(0o600);
                f.set_permissions(perms)?;
            }
            writeln!(f, "# drift pinned server fingerprints (sha256)")?;
            for (peer, fp) in pins {
                writeln!(f, "{} {}", peer, fp)?;
            }
            f.sync_all()?;
        }
        fs::rename(&temp, &self.path)
    }
}

fn sha256_fingerprint(cert: &CertificateDer<'_>) -> String {
    Sha256::digest(cert.as_ref())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Certificate verifier that trusts by pinned fingerprint but still checks
/// handshake signatures with the crypto provider.
#[derive(Debug)]
struct PinnedCertVerifier {
    peer: String,
    store: PinStore,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _dns_name: &ServerName,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.store.check(&self.peer, &sha256_fingerprint(end_entity)) {
            PinCheck::Matched | PinCheck::FirstUse => Ok(ServerCertVerified::assertion()),
            PinCheck::Changed => Err(rustls::Error::General(format!(
                "certificate for {} changed since it was pinned; refusing connection",
                self.peer
            ))),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Client config for one peer, verified against the default pin store.
pub fn client_config(host: &str, port: u16) -> ClientConfig {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let verifier = PinnedCertVerifier {
        peer: format!("{}:{}", host, port),
        store: PinStore::open_default(),
        algorithms: provider.signature_verification_algorithms,
    };
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth()
}

/// SNI value for a host that may be an IP literal or a DNS name.
pub fn server_name(host: &str) -> ServerName<'static> {
    match host.parse::<IpAddr>() {
        Ok(ip) => ServerName::IpAddress(ip.into()),
        Err(_) => ServerName::try_from(host.to_string())
            .unwrap_or_else(|_| ServerName::IpAddress(IpAddr::from([127, 0, 0, 1]).into())),
    }
}
