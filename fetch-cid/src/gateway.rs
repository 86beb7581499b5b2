//! HTTP gateway access
//!
//! A [`Gateway`] turns a CID into a stream of content bytes. The
//! production implementation, [`HttpGateway`], issues a plain `GET` for
//! `gateway_base_url + cid` through `reqwest`. Timeouts and other transport
//! policy live here on the client, never in the cache layer.

use crate::cache::types::ByteStream;
use crate::error::{FetchError, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Public gateway used when no other is configured
pub const DEFAULT_GATEWAY_BASE_URL: &str = "https://ipfs.io/ipfs/";

/// Environment variable overriding the gateway base URL
pub const GATEWAY_ENV: &str = "FETCH_CID_GATEWAY";

/// Environment variable setting the request timeout in seconds
pub const TIMEOUT_ENV: &str = "FETCH_CID_TIMEOUT_SECS";

/// Options for resolving CIDs over HTTP
///
/// Any field left out of a deserialized document takes its default, so a
/// partial configuration is merged over [`FetchOptions::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Prefix the CID is appended to; include the trailing slash
    pub gateway_base_url: String,

    /// Whole-request timeout applied by the HTTP client
    pub timeout: Option<Duration>,

    /// `User-Agent` header sent with every request
    pub user_agent: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            gateway_base_url: DEFAULT_GATEWAY_BASE_URL.to_string(),
            timeout: None,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetchOptions {
    /// Create a new builder for fetch options
    pub fn builder() -> FetchOptionsBuilder {
        FetchOptionsBuilder::default()
    }

    /// Defaults overridden by `FETCH_CID_GATEWAY` and `FETCH_CID_TIMEOUT_SECS`
    ///
    /// A `.env` file in the working directory is loaded first.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut options = Self::default();

        if let Ok(url) = std::env::var(GATEWAY_ENV) {
            if !url.is_empty() {
                options.gateway_base_url = url;
            }
        }

        if let Ok(secs) = std::env::var(TIMEOUT_ENV) {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                FetchError::ConfigError(format!("{} must be a whole number of seconds", TIMEOUT_ENV))
            })?;
            options.timeout = Some(Duration::from_secs(secs));
        }

        options.validate()?;
        Ok(options)
    }

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.gateway_base_url).map_err(|e| {
            FetchError::ConfigError(format!(
                "invalid gateway_base_url {:?}: {}",
                self.gateway_base_url, e
            ))
        })?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(FetchError::ConfigError(format!(
                "gateway_base_url must use http or https, got {}",
                url.scheme()
            )));
        }

        if self.timeout == Some(Duration::ZERO) {
            return Err(FetchError::ConfigError(
                "timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Address of the resource for `cid`
    pub fn resource_url(&self, cid: &str) -> String {
        format!("{}{}", self.gateway_base_url, cid)
    }
}

/// Builder for fetch options
#[derive(Debug, Default)]
pub struct FetchOptionsBuilder {
    gateway_base_url: Option<String>,
    timeout: Option<Duration>,
    user_agent: Option<String>,
}

impl FetchOptionsBuilder {
    /// Set the gateway base URL
    pub fn gateway_base_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_base_url = Some(url.into());
        self
    }

    /// Set the request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Build the options; unset fields keep their defaults
    pub fn build(self) -> FetchOptions {
        let defaults = FetchOptions::default();

        FetchOptions {
            gateway_base_url: self.gateway_base_url.unwrap_or(defaults.gateway_base_url),
            timeout: self.timeout.or(defaults.timeout),
            user_agent: self.user_agent.unwrap_or(defaults.user_agent),
        }
    }
}

/// Source of content for a CID
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Start retrieving `cid`
    ///
    /// Resolves once the response is known to be good; the body follows
    /// as a stream. Transport errors after that point arrive as `Err`
    /// items in the stream.
    async fn fetch(&self, cid: &str) -> Result<ByteStream>;
}

/// [`Gateway`] backed by an HTTP(S) IPFS gateway
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    options: FetchOptions,
}

impl HttpGateway {
    /// Create a gateway client from options
    pub fn new(options: FetchOptions) -> Result<Self> {
        options.validate()?;

        let mut builder = reqwest::Client::builder().user_agent(options.user_agent.clone());
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        Ok(Self { client, options })
    }

    /// Reuse an existing client
    pub fn with_client(client: reqwest::Client, options: FetchOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { client, options })
    }

    /// Options this gateway was built with
    pub fn options(&self) -> &FetchOptions {
        &self.options
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn fetch(&self, cid: &str) -> Result<ByteStream> {
        let url = self.options.resource_url(cid);
        debug!("GET {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("Gateway returned {} for {}", status, url);
            return Err(FetchError::Status {
                status: status.as_u16(),
                url,
            });
        }

        Ok(response.bytes_stream().map_err(FetchError::from).boxed())
    }
}
