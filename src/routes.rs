use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use crate::auth::AuthPolicy;
use crate::error::ConfigError;
use crate::rate_limit::RateLimitPolicy;

// One backend service the gateway fronts

#[derive(Debug)]
pub struct ServiceRoute {
    pub name: String,
    pub upstream: Url,
    pub auth: AuthPolicy,
    pub rate_limit: Option<RateLimitPolicy>,
}

// Input for building a route, before the target is validated
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub name: String,
    pub target: String,
    pub auth: AuthPolicy,
    pub rate_limit: Option<RateLimitPolicy>,
}

/// Immutable name -> route snapshot. Lookups need no locking; a config
/// reload builds a whole new table.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<String, Arc<ServiceRoute>>,
}

impl RoutingTable {
    pub fn new(definitions: Vec<ServiceDefinition>) -> Result<Self, ConfigError> {
        let mut routes = HashMap::with_capacity(definitions.len());

        for def in definitions {
            if def.name.is_empty() || def.name.contains('/') {
                return Err(ConfigError::InvalidServiceName(def.name));
            }
            if routes.contains_key(&def.name) {
                return Err(ConfigError::DuplicateService(def.name));
            }

            let upstream = parse_target(&def.name, &def.target)?;
            if let Some(policy) = &def.rate_limit {
                if policy.window.is_zero() {
                    return Err(ConfigError::InvalidRateWindow { service: def.name });
                }
            }

            let route = ServiceRoute {
                name: def.name.clone(),
                upstream,
                auth: def.auth,
                rate_limit: def.rate_limit,
            };
            routes.insert(def.name, Arc::new(route));
        }

        Ok(Self { routes })
    }

    pub fn lookup(&self, service: &str) -> Option<Arc<ServiceRoute>> {
        self.routes.get(service).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceRoute> {
        self.routes.values().map(|r| r.as_ref())
    }
}

// Upstream must be an absolute http(s) URL with a host
fn parse_target(service: &str, target: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidTarget {
        service: service.to_string(),
        reason,
    };

    let url = Url::parse(target).map_err(|e| invalid(format!("{target:?}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {:?}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid(format!("{target:?} has no host")));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid(format!("{target:?} must not carry a query or fragment")));
    }

    Ok(url)
}
