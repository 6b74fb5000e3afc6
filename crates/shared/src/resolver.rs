//! Backend descriptor resolution
//!
//! Turns an opaque session credential into the ordered list of backends the
//! session may reach. The proxy core only ever sees the resulting
//! [`BackendDescriptor`]s; the credential is passed through once and dropped.
//!
//! Two implementations are provided:
//!
//! - [`StaticResolver`]: reads the key file and servers file written by the
//!   server manager (`api_keys.json`, `servers_config.json`)
//! - [`HttpResolver`]: asks the manager's HTTP API (`GET /api/servers`)

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::error::ResolveError;
use crate::types::{BackendDescriptor, BackendTransport};

/// Maximum number of retry attempts against the resolver API
const MAX_RETRIES: usize = 3;

/// Initial backoff duration for retries (100ms)
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Maximum backoff duration for retries (2 seconds)
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Timeout for a single resolver HTTP request
const RESOLVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves a session credential to backend descriptors
#[async_trait]
pub trait DescriptorResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<Vec<BackendDescriptor>, ResolveError>;
}

// =============================================================================
// File-backed resolver
// =============================================================================

/// Entry in the key file: which servers a key unlocks
#[derive(Debug, Clone, Deserialize)]
struct KeyRecord {
    servers: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)] // Written by the manager, informational only
    created: i64,
}

/// Entry in the servers file. Entries without a `type` are stdio commands.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ServerEntry {
    Tagged(BackendTransport),
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
}

impl From<ServerEntry> for BackendTransport {
    fn from(entry: ServerEntry) -> Self {
        match entry {
            ServerEntry::Tagged(transport) => transport,
            ServerEntry::Command { command, args, env } => {
                BackendTransport::Stdio { command, args, env }
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ServersFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: HashMap<String, ServerEntry>,
}

/// Resolver backed by the manager's JSON files
///
/// Both files are re-read on every call so keys issued or revoked while the
/// proxy runs take effect for the next session.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    keys_path: PathBuf,
    servers_path: PathBuf,
}

impl StaticResolver {
    pub fn new(keys_path: impl Into<PathBuf>, servers_path: impl Into<PathBuf>) -> Self {
        Self {
            keys_path: keys_path.into(),
            servers_path: servers_path.into(),
        }
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(path: &PathBuf) -> Result<T, ResolveError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ResolveError::ResolverUnavailable(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ResolveError::ResolverUnavailable(format!("cannot parse {}: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl DescriptorResolver for StaticResolver {
    async fn resolve(&self, credential: &str) -> Result<Vec<BackendDescriptor>, ResolveError> {
        if credential.is_empty() {
            return Err(ResolveError::InvalidCredential);
        }

        let keys: HashMap<String, KeyRecord> = Self::read_json(&self.keys_path).await?;

        // Compare against every key so the lookup time doesn't depend on which one matched
        let mut matched: Option<&KeyRecord> = None;
        for (key, record) in &keys {
            if constant_time_compare(key, credential) {
                matched = Some(record);
            }
        }
        let record = matched.ok_or(ResolveError::InvalidCredential)?;

        if record.servers.is_empty() {
            return Err(ResolveError::Forbidden);
        }

        let mut servers: ServersFile = Self::read_json(&self.servers_path).await?;

        let mut descriptors = Vec::with_capacity(record.servers.len());
        for name in &record.servers {
            match servers.mcp_servers.remove(name) {
                Some(entry) => descriptors.push(BackendDescriptor::new(name.clone(), entry.into())),
                None => {
                    tracing::warn!(backend = %name, "Key references a server missing from the servers file");
                }
            }
        }

        tracing::debug!(count = descriptors.len(), "Resolved backends from key file");
        Ok(descriptors)
    }
}

/// Constant-time string comparison
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        let dummy = vec![0u8; a.len()];
        let _ = a.as_bytes().ct_eq(&dummy);
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// =============================================================================
// HTTP resolver
// =============================================================================

#[derive(Debug, Deserialize)]
struct ServersResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    servers: Vec<BackendDescriptor>,
}

/// Resolver that queries the manager API
pub struct HttpResolver {
    http_client: reqwest::Client,
    base_url: String,
    max_retries: usize,
    retry_base_delay: Duration,
}

impl HttpResolver {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ResolveError> {
        let http_client = reqwest::Client::builder()
            .timeout(RESOLVER_TIMEOUT)
            .build()
            .map_err(|e| ResolveError::ResolverUnavailable(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retries: MAX_RETRIES,
            retry_base_delay: RETRY_BASE_DELAY,
        })
    }

    /// Override the retry policy
    pub fn with_retries(mut self, max_retries: usize, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    async fn fetch_once(&self, credential: &str) -> Result<Vec<BackendDescriptor>, ResolveError> {
        let url = format!("{}/api/servers", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| ResolveError::ResolverUnavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ResolveError::InvalidCredential);
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(ResolveError::Forbidden);
        }
        if !status.is_success() {
            return Err(ResolveError::ResolverUnavailable(format!(
                "resolver returned HTTP {}",
                status
            )));
        }

        let body: ServersResponse = response
            .json()
            .await
            .map_err(|e| ResolveError::ResolverUnavailable(format!("invalid response: {}", e)))?;

        if !body.success {
            return Err(ResolveError::ResolverUnavailable(
                "resolver reported failure".to_string(),
            ));
        }

        Ok(body.servers)
    }
}

#[async_trait]
impl DescriptorResolver for HttpResolver {
    async fn resolve(&self, credential: &str) -> Result<Vec<BackendDescriptor>, ResolveError> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::RetryIf;

        if credential.is_empty() {
            return Err(ResolveError::InvalidCredential);
        }

        let retry_strategy =
            ExponentialBackoff::from_millis(self.retry_base_delay.as_millis().max(1) as u64)
                .max_delay(RETRY_MAX_DELAY)
                .take(self.max_retries)
                .map(jitter);

        RetryIf::start(
            retry_strategy,
            || self.fetch_once(credential),
            |e: &ResolveError| {
                let transient = matches!(e, ResolveError::ResolverUnavailable(_));
                if transient {
                    tracing::debug!(error = %e, "Resolver unavailable - will retry");
                }
                transient
            },
        )
        .await
    }
}
