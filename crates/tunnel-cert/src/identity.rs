//! Resolves this endpoint's instance identity and public IP from the
//! hosting platform (§4.2). The concrete HTTP calls are cloud-specific and
//! out of scope (§1), so they sit behind [`MetadataSource`];
//! [`HttpMetadataSource`] is the one generic, cloud-agnostic implementation
//! this crate ships.

use std::env;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

/// An opaque, printable string uniquely identifying a running server
/// instance; used as the TLS subject common name on both endpoints'
/// certificates (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceIdentity(String);

impl InstanceIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("identity/address not available from any discovery tier")]
pub struct NotAvailable;

/// Where `discover_instance_id`/`discover_public_ip` are allowed to look.
/// A fake implementation backs unit tests; `HttpMetadataSource` is the real
/// (but still cloud-agnostic) HTTP-based default.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn container_instance_id(&self) -> Option<String>;
    async fn container_public_ip(&self) -> Option<String>;
    async fn host_instance_id(&self) -> Option<String>;
    async fn host_public_ip(&self) -> Option<String>;
}

/// Generic HTTP-based metadata source. The container tier reads a metadata
/// base URI from the environment (the shape ECS/Kubernetes sidecars use:
/// `$CONTAINER_METADATA_URI` pointing at a local JSON endpoint); the host
/// tier speaks an IMDS-style `GET /latest/instance-id` / `/latest/public-ip`
/// against a configurable base (defaulting to the well-known
/// `169.254.169.254` link-local address every major cloud uses for this).
pub struct HttpMetadataSource {
    client: reqwest::Client,
    host_metadata_base: String,
}

const CONTAINER_METADATA_ENV: &str = "CONTAINER_METADATA_URI";
const ENV_INSTANCE_ID: &str = "TUNNEL_INSTANCE_ID";
const DEFAULT_HOST_METADATA_BASE: &str = "http://169.254.169.254/latest";
const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(100);

impl HttpMetadataSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(DISCOVERY_TIMEOUT)
                .build()
                .expect("failed to build metadata HTTP client"),
            host_metadata_base: DEFAULT_HOST_METADATA_BASE.to_string(),
        }
    }

    async fn get_text(&self, url: &str) -> Option<String> {
        let resp = self.client.get(url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.text().await.ok().map(|s| s.trim().to_string())
    }
}

impl Default for HttpMetadataSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn container_instance_id(&self) -> Option<String> {
        let base = env::var(CONTAINER_METADATA_ENV).ok()?;
        self.get_text(&format!("{}/task", base.trim_end_matches('/')))
            .await
    }

    async fn container_public_ip(&self) -> Option<String> {
        let base = env::var(CONTAINER_METADATA_ENV).ok()?;
        self.get_text(&format!("{}/network", base.trim_end_matches('/')))
            .await
    }

    async fn host_instance_id(&self) -> Option<String> {
        self.get_text(&format!("{}/instance-id", self.host_metadata_base))
            .await
    }

    async fn host_public_ip(&self) -> Option<String> {
        self.get_text(&format!("{}/public-ipv4", self.host_metadata_base))
            .await
    }
}

/// `discover_instance_id()`: container metadata, then `$TUNNEL_INSTANCE_ID`,
/// then host metadata. Completes in well under 100ms on a healthy host
/// because each HTTP tier carries its own short timeout.
pub async fn discover_instance_id(
    source: &dyn MetadataSource,
) -> Result<InstanceIdentity, NotAvailable> {
    if let Some(id) = source.container_instance_id().await {
        debug!("instance id resolved from container metadata");
        return Ok(InstanceIdentity::new(id));
    }
    if let Ok(id) = env::var(ENV_INSTANCE_ID) {
        if !id.is_empty() {
            debug!("instance id resolved from process environment");
            return Ok(InstanceIdentity::new(id));
        }
    }
    if let Some(id) = source.host_instance_id().await {
        debug!("instance id resolved from host metadata service");
        return Ok(InstanceIdentity::new(id));
    }
    warn!("instance id not available from any discovery tier");
    Err(NotAvailable)
}

/// `discover_public_ip()`: container metadata, then host metadata.
pub async fn discover_public_ip(source: &dyn MetadataSource) -> Result<String, NotAvailable> {
    if let Some(ip) = source.container_public_ip().await {
        debug!("public ip resolved from container metadata");
        return Ok(ip);
    }
    if let Some(ip) = source.host_public_ip().await {
        debug!("public ip resolved from host metadata service");
        return Ok(ip);
    }
    warn!("public ip not available from any discovery tier");
    Err(NotAvailable)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub container_id: Mutex<Option<String>>,
        pub container_ip: Mutex<Option<String>>,
        pub host_id: Mutex<Option<String>>,
        pub host_ip: Mutex<Option<String>>,
    }

    #[async_trait]
    impl MetadataSource for FakeSource {
        async fn container_instance_id(&self) -> Option<String> {
            self.container_id.lock().unwrap().clone()
        }
        async fn container_public_ip(&self) -> Option<String> {
            self.container_ip.lock().unwrap().clone()
        }
        async fn host_instance_id(&self) -> Option<String> {
            self.host_id.lock().unwrap().clone()
        }
        async fn host_public_ip(&self) -> Option<String> {
            self.host_ip.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn falls_through_to_host_tier_when_container_tier_is_absent() {
        let source = FakeSource::default();
        *source.host_id.lock().unwrap() = Some("arn:aws:ecs:task/abc".into());
        let id = discover_instance_id(&source).await.unwrap();
        assert_eq!(id.as_str(), "arn:aws:ecs:task/abc");
    }

    #[tokio::test]
    async fn prefers_container_tier_over_host_tier() {
        let source = FakeSource::default();
        *source.container_id.lock().unwrap() = Some("container-id".into());
        *source.host_id.lock().unwrap() = Some("host-id".into());
        let id = discover_instance_id(&source).await.unwrap();
        assert_eq!(id.as_str(), "container-id");
    }

    #[tokio::test]
    async fn returns_not_available_when_every_tier_is_empty() {
        let source = FakeSource::default();
        assert!(discover_public_ip(&source).await.is_err());
    }
}
