//! EAP server configuration
//!
//! The embedded RADIUS server authenticates stations by MAC, but carries
//! the EAP server settings of the access-point integration: the method
//! registry, the TLS material paths and the compatibility switches.

use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

/// Identity the server announces in EAP exchanges.
pub const EAP_SERVER_IDENTITY: &str = "edgesec";

pub const DEFAULT_MAX_AUTH_ROUNDS: u32 = 100;
pub const DEFAULT_MAX_AUTH_ROUNDS_SHORT: u32 = 50;

/// Registered EAP methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EapMethod {
    Identity,
    Md5,
    Tls,
    MsChapV2,
    Peap,
    Gtc,
    Ttls,
    Pax,
    Psk,
    Sake,
    Gpsk,
}

impl EapMethod {
    /// The full registry, in registration order.
    pub fn all() -> &'static [EapMethod] {
        &[
            EapMethod::Identity,
            EapMethod::Md5,
            EapMethod::Tls,
            EapMethod::MsChapV2,
            EapMethod::Peap,
            EapMethod::Gtc,
            EapMethod::Ttls,
            EapMethod::Pax,
            EapMethod::Psk,
            EapMethod::Sake,
            EapMethod::Gpsk,
        ]
    }
}

impl FromStr for EapMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "identity" => Ok(EapMethod::Identity),
            "md5" => Ok(EapMethod::Md5),
            "tls" => Ok(EapMethod::Tls),
            "mschapv2" => Ok(EapMethod::MsChapV2),
            "peap" => Ok(EapMethod::Peap),
            "gtc" => Ok(EapMethod::Gtc),
            "ttls" => Ok(EapMethod::Ttls),
            "pax" => Ok(EapMethod::Pax),
            "psk" => Ok(EapMethod::Psk),
            "sake" => Ok(EapMethod::Sake),
            "gpsk" => Ok(EapMethod::Gpsk),
            _ => Err(()),
        }
    }
}

/// EAP server settings derived from the radius configuration section.
#[derive(Debug, Clone)]
pub struct EapConfig {
    pub methods: Vec<EapMethod>,
    pub server_id: String,
    pub max_auth_rounds: u32,
    pub max_auth_rounds_short: u32,
    pub ca_cert: Option<PathBuf>,
    pub server_cert: Option<PathBuf>,
    pub server_key: Option<PathBuf>,
    pub dh_params: Option<PathBuf>,
    /// TLSv1.3 stays off for supplicant compatibility.
    pub disable_tlsv13: bool,
}

impl Default for EapConfig {
    fn default() -> Self {
        Self {
            methods: EapMethod::all().to_vec(),
            server_id: EAP_SERVER_IDENTITY.to_string(),
            max_auth_rounds: DEFAULT_MAX_AUTH_ROUNDS,
            max_auth_rounds_short: DEFAULT_MAX_AUTH_ROUNDS_SHORT,
            ca_cert: None,
            server_cert: None,
            server_key: None,
            dh_params: None,
            disable_tlsv13: true,
        }
    }
}

impl EapConfig {
    pub fn has_method(&self, method: EapMethod) -> bool {
        self.methods.contains(&method)
    }

    /// TLS-based methods need the certificate material configured.
    pub fn tls_ready(&self) -> bool {
        self.server_cert.is_some() && self.server_key.is_some()
    }
}
