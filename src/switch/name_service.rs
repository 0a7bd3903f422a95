//! Name-service bindings (DNS, CLB, Polaris) and their release
//!
//! Every provider is attempted independently. One provider failing never
//! stops the others; the caller gets an aggregate error that still lists
//! what was released.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::metrics::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Dns,
    Clb,
    Polaris,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Dns, Provider::Clb, Provider::Polaris];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Dns => "dns",
            Provider::Clb => "clb",
            Provider::Polaris => "polaris",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registration: a domain, load balancer or service name pointing at ip:port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

impl Binding {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port,
        }
    }
}

/// Every name-service registration bound to an instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindEntry {
    #[serde(default)]
    pub dns: Vec<Binding>,
    #[serde(default)]
    pub clb: Vec<Binding>,
    #[serde(default)]
    pub polaris: Vec<Binding>,
}

impl BindEntry {
    pub fn bindings(&self, provider: Provider) -> &[Binding] {
        match provider {
            Provider::Dns => &self.dns,
            Provider::Clb => &self.clb,
            Provider::Polaris => &self.polaris,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dns.is_empty() && self.clb.is_empty() && self.polaris.is_empty()
    }
}

/// A binding released by this switch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub provider: Provider,
    pub binding: Binding,
}

#[derive(Debug, thiserror::Error)]
pub enum NameServiceError {
    #[error("{provider} call for {name} failed: {message}")]
    Provider {
        provider: Provider,
        name: String,
        message: String,
    },
    #[error("{provider} call for {name} timed out")]
    Timeout { provider: Provider, name: String },
    #[error("No {0} provider configured")]
    NotConfigured(Provider),
    #[error("Name-service release incomplete ({} released): {}", .released.len(), .failures.join("; "))]
    Partial {
        released: Vec<Released>,
        failures: Vec<String>,
    },
}

/// One name-service backend
#[async_trait]
pub trait NameServiceProvider: Send + Sync {
    fn kind(&self) -> Provider;

    async fn register(&self, binding: &Binding) -> Result<(), NameServiceError>;

    async fn deregister(&self, binding: &Binding) -> Result<(), NameServiceError>;

    /// Addresses currently bound under `name`
    async fn bound_address_count(&self, name: &str) -> Result<usize, NameServiceError>;
}

fn provider_for(
    providers: &[Arc<dyn NameServiceProvider>],
    kind: Provider,
) -> Option<&Arc<dyn NameServiceProvider>> {
    providers.iter().find(|p| p.kind() == kind)
}

async fn with_timeout<T, F>(
    provider: Provider,
    name: &str,
    limit: Duration,
    fut: F,
) -> Result<T, NameServiceError>
where
    F: std::future::Future<Output = Result<T, NameServiceError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(NameServiceError::Timeout {
            provider,
            name: name.to_string(),
        }),
    }
}

/// Release every binding in `entry` from its provider.
///
/// Returns the released bindings when all succeeded, otherwise
/// [`NameServiceError::Partial`] carrying both the released bindings and
/// the failures.
pub async fn delete_name_service(
    entry: &BindEntry,
    providers: &[Arc<dyn NameServiceProvider>],
    call_timeout: Duration,
) -> Result<Vec<Released>, NameServiceError> {
    let mut released = Vec::new();
    let mut failures = Vec::new();

    for kind in Provider::ALL {
        let bindings = entry.bindings(kind);
        if bindings.is_empty() {
            continue;
        }
        let Some(provider) = provider_for(providers, kind) else {
            metrics().record_name_service_failure(kind.as_str());
            failures.push(NameServiceError::NotConfigured(kind).to_string());
            continue;
        };

        for binding in bindings {
            match with_timeout(kind, &binding.name, call_timeout, provider.deregister(binding)).await
            {
                Ok(()) => {
                    info!(provider = %kind, name = %binding.name, ip = %binding.ip, port = binding.port, "Released name-service binding");
                    released.push(Released {
                        provider: kind,
                        binding: binding.clone(),
                    });
                }
                Err(e) => {
                    warn!(provider = %kind, name = %binding.name, error = %e, "Failed to release name-service binding");
                    metrics().record_name_service_failure(kind.as_str());
                    failures.push(e.to_string());
                }
            }
        }
    }

    if failures.is_empty() {
        Ok(released)
    } else {
        Err(NameServiceError::Partial { released, failures })
    }
}

/// Put released bindings back. Attempts all of them and returns the failures.
pub async fn restore_name_service(
    released: &[Released],
    providers: &[Arc<dyn NameServiceProvider>],
    call_timeout: Duration,
) -> Vec<String> {
    let mut failures = Vec::new();
    for item in released {
        let Some(provider) = provider_for(providers, item.provider) else {
            failures.push(NameServiceError::NotConfigured(item.provider).to_string());
            continue;
        };
        let result = with_timeout(
            item.provider,
            &item.binding.name,
            call_timeout,
            provider.register(&item.binding),
        )
        .await;
        if let Err(e) = result {
            warn!(provider = %item.provider, name = %item.binding.name, error = %e, "Failed to restore name-service binding");
            failures.push(e.to_string());
        }
    }
    failures
}

/// Domains whose only bound address is this instance.
///
/// Releasing such a domain would leave the service unreachable, so any
/// non-empty result must stop the switch before a provider is called.
pub async fn single_address_domains(
    entry: &BindEntry,
    providers: &[Arc<dyn NameServiceProvider>],
    call_timeout: Duration,
) -> Result<Vec<String>, NameServiceError> {
    if entry.dns.is_empty() {
        return Ok(Vec::new());
    }
    let provider = provider_for(providers, Provider::Dns)
        .ok_or(NameServiceError::NotConfigured(Provider::Dns))?;

    let mut domains = Vec::new();
    for binding in &entry.dns {
        let count = with_timeout(
            Provider::Dns,
            &binding.name,
            call_timeout,
            provider.bound_address_count(&binding.name),
        )
        .await?;
        if count == 1 {
            domains.push(binding.name.clone());
        }
    }
    Ok(domains)
}
