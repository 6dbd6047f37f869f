//! Connection settings and TLS credential shapes.
//!
//! Credential loading here validates shape only — the cryptography behind a
//! credential is supplied by the caller's `quic` transport (see [`crate::quic`]);
//! TLS machinery itself is out of scope for this crate.

use std::time::Duration;

/// The values this endpoint advertises in its SETTINGS frame (RFC 9114 section 7.2.4),
/// plus transport timeouts forwarded to (not interpreted by) the QUIC layer.
#[derive(Debug, Clone)]
pub struct Settings {
    pub qpack_max_table_capacity: u64,
    pub qpack_blocked_streams: u64,
    pub max_field_section_size: u64,
    /// Recorded only: extended CONNECT is a non-goal of this crate.
    pub enable_connect_protocol: bool,
    /// Recorded only: HTTP/3 DATAGRAM is a non-goal of this crate.
    pub datagram_enabled: bool,
    pub send_grease: bool,
    pub idle_timeout: Duration,
    pub keep_alive_interval: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            qpack_max_table_capacity: 4096,
            qpack_blocked_streams: 16,
            max_field_section_size: u64::MAX,
            enable_connect_protocol: false,
            datagram_enabled: false,
            send_grease: true,
            idle_timeout: Duration::from_secs(30),
            keep_alive_interval: None,
        }
    }
}

/// TLS credential shape. Variant data only — loading one never touches a filesystem
/// or crypto library; it's handed to the transport's own configuration hook.
#[derive(Debug)]
pub enum Credential {
    /// No credential: client connections, or a server running in test mode.
    None,
    /// Generate an ephemeral self-signed certificate. Test/demo use only.
    SelfSigned,
    CertificateFile { cert_path: String, key_path: String },
    CertificateFileProtected { cert_path: String, key_path: String, password: String },
    Pkcs12 { blob: Vec<u8>, password: String },
    CertificateHash { hash: [u8; 20] },
    CertificateHashStore { store: String, hash: [u8; 20] },
    /// An opaque, caller-supplied credential context passed straight through to the
    /// transport; this crate never inspects it.
    Native(Box<dyn std::any::Any + Send + Sync>),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CredentialError {
    #[error("certificate path is empty")]
    EmptyCertPath,
    #[error("private key path is empty")]
    EmptyKeyPath,
    #[error("pkcs12 blob is empty")]
    EmptyPkcs12Blob,
}

impl Credential {
    /// Validate the credential's shape (non-empty paths/blobs). Does not touch disk.
    pub fn validate(&self) -> Result<(), CredentialError> {
        match self {
            Credential::CertificateFile { cert_path, key_path }
            | Credential::CertificateFileProtected { cert_path, key_path, .. } => {
                if cert_path.is_empty() {
                    return Err(CredentialError::EmptyCertPath);
                }
                if key_path.is_empty() {
                    return Err(CredentialError::EmptyKeyPath);
                }
                Ok(())
            }
            Credential::Pkcs12 { blob, .. } if blob.is_empty() => Err(CredentialError::EmptyPkcs12Blob),
            _ => Ok(()),
        }
    }
}

bitflags::bitflags! {
    /// Flags accompanying a loaded [`Credential`].
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct CredentialFlags: u32 {
        const CLIENT = 0x1;
        const NO_CERT_VALIDATION = 0x2;
        const REQUIRE_CLIENT_AUTH = 0x4;
    }
}

/// A loaded configuration: SETTINGS values plus a TLS credential, ready to hand to a
/// [`crate::quic::Connection`]'s own setup.
///
/// This crate never touches a credential's bytes or a filesystem path itself —
/// [`Configuration::load_credential`] only validates shape (see [`Credential::validate`]);
/// the transport is what actually consumes it.
#[derive(Debug)]
pub struct Configuration {
    pub settings: Settings,
    credential: Credential,
    flags: CredentialFlags,
}

impl Configuration {
    /// Open a configuration from a set of SETTINGS values. No credential is loaded yet.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            credential: Credential::None,
            flags: CredentialFlags::empty(),
        }
    }

    /// Validate and attach a credential. Replaces any credential loaded earlier.
    pub fn load_credential(&mut self, credential: Credential, flags: CredentialFlags) -> Result<(), CredentialError> {
        credential.validate()?;
        self.credential = credential;
        self.flags = flags;
        Ok(())
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn credential_flags(&self) -> CredentialFlags {
        self.flags
    }
}
