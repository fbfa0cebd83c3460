use axum::http::HeaderName;
use clap::Parser;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::{AuthPolicy, DEFAULT_API_KEY_HEADER};
use crate::error::ConfigError;
use crate::rate_limit::{DEFAULT_WINDOW, RateLimitPolicy};
use crate::routes::ServiceDefinition;

pub const DEFAULT_PORT: u16 = 8080;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "agent-gateway")]
#[command(about = "Routing gateway with per-service auth and rate limits")]
#[command(version)]
pub struct Args {
    // Gateway config file (YAML)
    #[arg(env = "GATEWAY_CONFIG", default_value = "gateway.yaml")]
    pub config: PathBuf,

    // Port to run the server on, overrides the config file
    #[arg(short, long, env = "GATEWAY_PORT")]
    pub port: Option<u16>,

    // Port for /health and /metrics, disabled when unset
    #[arg(long, env = "GATEWAY_ADMIN_PORT")]
    pub admin_port: Option<u16>,

    // How long in-flight requests get to finish on shutdown
    #[arg(long, default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    // Deadline for an upstream to return response headers
    #[arg(long, default_value_t = 30)]
    pub upstream_timeout_secs: u64,

    #[arg(long, default_value_t = 5)]
    pub connect_timeout_secs: u64,

    // Idle rate limit window sweep, 0 disables it
    #[arg(long, default_value_t = 60)]
    pub sweep_interval_secs: u64,

    // Log filter, RUST_LOG wins when set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

// gateway.yaml
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub port: u16,
    #[serde(default, deserialize_with = "unique_services")]
    pub services: BTreeMap<String, ServiceConfig>,
}

// serde_yaml keeps the last of two equal keys; a repeated service is an error here
fn unique_services<'de, D>(deserializer: D) -> Result<BTreeMap<String, ServiceConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ServicesVisitor;

    impl<'de> Visitor<'de> for ServicesVisitor {
        type Value = BTreeMap<String, ServiceConfig>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping of service name to service definition")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut services = BTreeMap::new();
            while let Some((name, service)) = access.next_entry::<String, ServiceConfig>()? {
                if services.contains_key(&name) {
                    return Err(serde::de::Error::custom(format!(
                        "duplicate service {name:?}"
                    )));
                }
                services.insert(name, service);
            }
            Ok(services)
        }
    }

    deserializer.deserialize_map(ServicesVisitor)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub target: String,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub kind: AuthKind,
    #[serde(default)]
    pub tokens: Vec<String>,
    // apikey only
    #[serde(default)]
    pub header: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Bearer,
    ApiKey,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    #[serde(default)]
    pub window_secs: Option<u64>,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn listen_port(&self) -> u16 {
        if self.port == 0 { DEFAULT_PORT } else { self.port }
    }

    pub fn service_definitions(&self) -> Result<Vec<ServiceDefinition>, ConfigError> {
        self.services
            .iter()
            .map(|(name, svc)| {
                Ok(ServiceDefinition {
                    name: name.clone(),
                    target: svc.target.clone(),
                    auth: auth_policy(name, svc.auth.as_ref())?,
                    rate_limit: svc.rate_limit.as_ref().map(rate_limit_policy),
                })
            })
            .collect()
    }
}

fn auth_policy(service: &str, auth: Option<&AuthConfig>) -> Result<AuthPolicy, ConfigError> {
    let Some(auth) = auth else {
        return Ok(AuthPolicy::None);
    };
    let tokens = auth.tokens.iter().cloned().collect();

    match auth.kind {
        AuthKind::Bearer => Ok(AuthPolicy::BearerToken {
            valid_tokens: tokens,
        }),
        AuthKind::ApiKey => {
            let name = auth.header.as_deref().unwrap_or(DEFAULT_API_KEY_HEADER);
            let header =
                HeaderName::from_bytes(name.as_bytes()).map_err(|_| ConfigError::InvalidHeader {
                    service: service.to_string(),
                    header: name.to_string(),
                })?;
            Ok(AuthPolicy::ApiKey {
                header,
                valid_keys: tokens,
            })
        }
    }
}

fn rate_limit_policy(cfg: &RateLimitConfig) -> RateLimitPolicy {
    RateLimitPolicy {
        requests_per_window: cfg.requests_per_minute,
        window: cfg.window_secs.map_or(DEFAULT_WINDOW, Duration::from_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
port: 9000
services:
  models:
    target: http://localhost:4000
    auth:
      type: bearer
      tokens: [alpha, beta]
    rate_limit:
      requests_per_minute: 30
  search:
    target: http://localhost:4001/api
    auth:
      type: apikey
      tokens: [k1]
  public:
    target: http://localhost:4002
    rate_limit:
      requests_per_minute: 5
      window_secs: 10
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = GatewayConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.listen_port(), 9000);

        let defs = cfg.service_definitions().unwrap();
        assert_eq!(defs.len(), 3);

        let models = defs.iter().find(|d| d.name == "models").unwrap();
        assert!(matches!(&models.auth, AuthPolicy::BearerToken { valid_tokens } if valid_tokens.len() == 2));
        assert_eq!(
            models.rate_limit,
            Some(RateLimitPolicy {
                requests_per_window: 30,
                window: Duration::from_secs(60)
            })
        );

        let search = defs.iter().find(|d| d.name == "search").unwrap();
        match &search.auth {
            AuthPolicy::ApiKey { header, valid_keys } => {
                assert_eq!(header.as_str(), "x-api-key");
                assert!(valid_keys.contains("k1"));
            }
            other => panic!("unexpected policy {other:?}"),
        }
        assert!(search.rate_limit.is_none());

        let public = defs.iter().find(|d| d.name == "public").unwrap();
        assert!(matches!(public.auth, AuthPolicy::None));
        assert_eq!(public.rate_limit.unwrap().window, Duration::from_secs(10));
    }

    #[test]
    fn test_default_port() {
        let cfg = GatewayConfig::from_yaml("services: {}").unwrap();
        assert_eq!(cfg.listen_port(), DEFAULT_PORT);
    }

    #[test]
    fn test_unknown_auth_type_rejected() {
        let raw = r#"
services:
  svc:
    target: http://localhost:4000
    auth:
      type: oauth
      tokens: [x]
"#;
        assert!(matches!(
            GatewayConfig::from_yaml(raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_duplicate_service_key_rejected() {
        let raw = r#"
services:
  svc:
    target: http://localhost:4000
  svc:
    target: http://localhost:4001
"#;
        match GatewayConfig::from_yaml(raw) {
            Err(ConfigError::Parse(e)) => {
                assert!(e.to_string().contains("duplicate service \"svc\""), "{e}")
            }
            other => panic!("expected a duplicate service error, got {other:?}"),
        }
    }

    #[test]
    fn test_custom_api_key_header() {
        let raw = r#"
services:
  svc:
    target: http://localhost:4000
    auth:
      type: apikey
      header: X-Service-Key
      tokens: [x]
"#;
        let defs = GatewayConfig::from_yaml(raw)
            .unwrap()
            .service_definitions()
            .unwrap();
        assert!(matches!(&defs[0].auth, AuthPolicy::ApiKey { header, .. } if header == "x-service-key"));

        let bad = raw.replace("X-Service-Key", "not a header");
        let err = GatewayConfig::from_yaml(&bad)
            .unwrap()
            .service_definitions()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHeader { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let cfg = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(cfg.services.len(), 3);

        let missing = GatewayConfig::load(Path::new("/nonexistent/gateway.yaml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
