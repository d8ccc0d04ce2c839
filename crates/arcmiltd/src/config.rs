use crate::cidrset::CidrSet;
use arc_seal::{ArcPrivateKey, Sealer, SealerBuilder};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {err}", path.display())]
    Io {
        path: PathBuf,
        err: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("parameter \"{param}\" {reason}")]
    Parameter { param: &'static str, reason: String },
}

fn parameter(param: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Parameter {
        param,
        reason: reason.into(),
    }
}

/// Operating disposition of the filter. When unset, the InternalHosts
/// table decides per connection: internal hosts are signed and
/// verified, external ones only verified.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    #[serde(rename = "s")]
    Sign,
    #[serde(rename = "v")]
    Verify,
    #[serde(rename = "sv")]
    SignVerify,
}

impl Mode {
    pub fn signs(&self) -> bool {
        matches!(self, Self::Sign | Self::SignVerify)
    }

    pub fn verifies(&self) -> bool {
        matches!(self, Self::Verify | Self::SignVerify)
    }
}

/// The on-disk configuration. Key names follow the conventions of
/// the milter it replaces.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// d= of the produced seals
    #[serde(rename = "Domain")]
    pub domain: Option<String>,
    /// s= of the produced seals
    #[serde(rename = "Selector")]
    pub selector: Option<String>,
    /// Path to the PEM private key
    #[serde(rename = "KeyFile")]
    pub key_file: Option<PathBuf>,
    /// The identity used to filter inbound Authentication-Results and
    /// to label outbound ones
    #[serde(rename = "AuthservID")]
    pub authserv_id: Option<String>,
    #[serde(rename = "Mode")]
    pub mode: Option<Mode>,
    /// Static public key file consulted ahead of DNS
    #[serde(rename = "TestKeys")]
    pub test_keys: Option<PathBuf>,
    /// Connections from these addresses are accepted immediately
    #[serde(rename = "PeerList", default)]
    pub peer_list: CidrSet,
    /// Addresses treated as internal when Mode is unset
    #[serde(rename = "InternalHosts", default)]
    pub internal_hosts: CidrSet,
    /// Let an upstream arc= statement override the computed chain state
    #[serde(rename = "PermitAuthenticationOverrides", default)]
    pub permit_authentication_overrides: bool,
    /// Refuse keys readable or writable by group/other
    #[serde(rename = "RequireSafeKeys", default)]
    pub require_safe_keys: bool,
    /// Freeze the t= tag; test configurations only
    #[serde(rename = "FixedTimestamp")]
    pub fixed_timestamp: Option<i64>,
    /// Include smtp.remote-ip in the outbound Authentication-Results
    #[serde(rename = "AuthResIP", default = "default_true")]
    pub auth_res_ip: bool,
    /// Insert an ARC-Filter header naming this filter
    #[serde(rename = "SoftwareHeader", default)]
    pub software_header: bool,
    /// DNS query timeout in seconds
    #[serde(rename = "DnsTimeout")]
    pub dns_timeout: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// The resolved runtime configuration, shared read-only by every
/// session.
#[derive(Debug)]
pub struct Config {
    pub authserv_id: String,
    pub mode: Option<Mode>,
    pub sealer: Option<Arc<Sealer>>,
    pub test_keys: Option<PathBuf>,
    pub peer_list: CidrSet,
    pub internal_hosts: CidrSet,
    pub permit_authentication_overrides: bool,
    pub auth_res_ip: bool,
    pub software_header: bool,
    pub dns_timeout: Duration,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.to_path_buf(),
            err,
        })?;
        let file: ConfigFile = toml::from_str(&data)?;
        Self::resolve(file)
    }

    pub fn resolve(file: ConfigFile) -> Result<Self, ConfigError> {
        let authserv_id = file
            .authserv_id
            .ok_or_else(|| parameter("AuthservID", "is required"))?;

        // Signing applies when the mode says so, or may apply per
        // connection when the mode is unset
        let may_sign = file.mode.map(|mode| mode.signs()).unwrap_or(true);
        let sign_configured =
            file.domain.is_some() || file.selector.is_some() || file.key_file.is_some();

        let sealer = if may_sign && (sign_configured || file.mode.map_or(false, |m| m.signs())) {
            let domain = file
                .domain
                .ok_or_else(|| parameter("Domain", "required when signing"))?;
            let selector = file
                .selector
                .ok_or_else(|| parameter("Selector", "required when signing"))?;
            let key_file = file
                .key_file
                .ok_or_else(|| parameter("KeyFile", "required when signing"))?;

            if file.require_safe_keys {
                check_key_permissions(&key_file)?;
            }

            let key = ArcPrivateKey::key_file(&key_file)
                .map_err(|err| parameter("KeyFile", format!("{err}")))?;

            let mut builder = SealerBuilder::new()
                .with_domain(domain)
                .with_selector(selector)
                .with_private_key(Arc::new(key));
            if let Some(timestamp) = file.fixed_timestamp {
                builder = builder.with_timestamp(timestamp);
            }
            Some(Arc::new(builder.build().map_err(|err| {
                parameter("KeyFile", format!("{err}"))
            })?))
        } else {
            None
        };

        Ok(Self {
            authserv_id,
            mode: file.mode,
            sealer,
            test_keys: file.test_keys,
            peer_list: file.peer_list,
            internal_hosts: file.internal_hosts,
            permit_authentication_overrides: file.permit_authentication_overrides,
            auth_res_ip: file.auth_res_ip,
            software_header: file.software_header,
            dns_timeout: file
                .dns_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_DNS_TIMEOUT),
        })
    }
}

#[cfg(unix)]
fn check_key_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(path).map_err(|err| ConfigError::Io {
        path: path.to_path_buf(),
        err,
    })?;
    if meta.mode() & 0o077 != 0 {
        return Err(parameter(
            "KeyFile",
            format!("{} can be read or written by other users", path.display()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;
    use std::io::Write;

    fn write_key(dir: &Path, mode: u32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let mut rng = rand::thread_rng();
        let key = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let pem = key.to_pkcs8_pem(rsa::pkcs8::LineEnding::LF).unwrap();

        let path = dir.join("private.key");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(pem.as_bytes()).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    fn base_file() -> ConfigFile {
        ConfigFile {
            authserv_id: Some("example.com".to_string()),
            ..ConfigFile::default()
        }
    }

    #[test]
    fn minimal_verify_only() {
        let config = Config::resolve(ConfigFile {
            mode: Some(Mode::Verify),
            ..base_file()
        })
        .unwrap();
        assert!(config.sealer.is_none());
        assert_eq!(config.dns_timeout, DEFAULT_DNS_TIMEOUT);
    }

    #[test]
    fn authserv_id_required() {
        let err = Config::resolve(ConfigFile::default()).unwrap_err();
        assert_eq!(err.to_string(), "parameter \"AuthservID\" is required");
    }

    #[test]
    fn key_file_required_when_signing() {
        let err = Config::resolve(ConfigFile {
            mode: Some(Mode::SignVerify),
            domain: Some("example.com".to_string()),
            selector: Some("sel".to_string()),
            ..base_file()
        })
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "parameter \"KeyFile\" required when signing"
        );
    }

    #[test]
    fn signing_config_loads() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = write_key(dir.path(), 0o600);

        let config = Config::resolve(ConfigFile {
            mode: Some(Mode::SignVerify),
            domain: Some("example.com".to_string()),
            selector: Some("sel".to_string()),
            key_file: Some(key_path),
            require_safe_keys: true,
            ..base_file()
        })
        .unwrap();
        assert!(config.sealer.is_some());
    }

    #[test]
    fn unsafe_key_refused() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = write_key(dir.path(), 0o644);

        let err = Config::resolve(ConfigFile {
            mode: Some(Mode::SignVerify),
            domain: Some("example.com".to_string()),
            selector: Some("sel".to_string()),
            key_file: Some(key_path),
            require_safe_keys: true,
            ..base_file()
        })
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("can be read or written by other users"));
    }

    #[test]
    fn toml_shape() {
        let file: ConfigFile = toml::from_str(
            r#"
AuthservID = "example.com"
Mode = "sv"
Domain = "example.com"
Selector = "elpmaxe"
KeyFile = "/etc/arcmiltd/private.key"
TestKeys = "/etc/arcmiltd/public.key"
PeerList = ["127.0.0.0/8"]
InternalHosts = ["10.0.0.0/8", "192.168.0.0/16"]
PermitAuthenticationOverrides = true
RequireSafeKeys = true
FixedTimestamp = 1234567890
AuthResIP = true
SoftwareHeader = true
DnsTimeout = 8
"#,
        )
        .unwrap();
        assert_eq!(file.mode, Some(Mode::SignVerify));
        assert!(file.peer_list.contains("127.0.0.1".parse().unwrap()));
        assert_eq!(file.dns_timeout, Some(8));

        // unknown keys are a configuration error
        assert!(toml::from_str::<ConfigFile>("Bogus = 1").is_err());
    }
}
