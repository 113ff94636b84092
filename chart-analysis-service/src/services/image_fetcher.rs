//! Downloads chart images referenced by URL in webhook payloads.

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::{header, redirect, Client, Url};
use service_core::error::AppError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const MAX_REDIRECTS: usize = 3;

#[derive(Debug, Error)]
pub enum ImageFetchError {
    #[error("Invalid image URL: {0}")]
    InvalidUrl(String),

    #[error("Timed out downloading the chart image")]
    Timeout,

    #[error("Image host answered with status {0}")]
    Status(u16),

    #[error("Chart image exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Failed to download chart image: {0}")]
    Network(String),
}

impl From<ImageFetchError> for AppError {
    fn from(err: ImageFetchError) -> Self {
        match err {
            ImageFetchError::InvalidUrl(_) => AppError::BadRequest(anyhow::anyhow!(err)),
            ImageFetchError::Timeout => AppError::GatewayTimeout(err.to_string()),
            ImageFetchError::TooLarge(_) => AppError::PayloadTooLarge(err.to_string()),
            ImageFetchError::Status(_) | ImageFetchError::Network(_) => {
                AppError::BadGateway(err.to_string())
            }
        }
    }
}

/// A downloaded image and the content type the host declared.
#[derive(Debug)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Addresses a webhook URL must not reach: loopback, private, link-local,
/// shared (CGNAT), multicast, broadcast, documentation and unspecified.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_v4(v4),
            None => is_public_v6(v6),
        },
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    !(ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        || ip.is_multicast()
        || a == 0
        || (a == 100 && (64..128).contains(&b)))
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
        || first == 0x2001 && ip.segments()[1] == 0x0db8)
}

/// System resolver that drops non-public answers, so a host cannot pass the
/// pre-flight check and then rebind to an internal address.
struct PublicOnlyResolver;

impl Resolve for PublicOnlyResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await?
                .filter(|addr| is_public_ip(addr.ip()))
                .collect();
            if addrs.is_empty() {
                return Err(format!("{} has no public address", host).into());
            }
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}

fn literal_ip(url: &Url) -> Option<IpAddr> {
    url.host_str()?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

#[derive(Clone)]
pub struct ImageFetcher {
    client: Client,
    max_bytes: usize,
    allow_private: bool,
}

impl ImageFetcher {
    pub fn new(timeout: Duration, max_bytes: usize, allow_private: bool) -> Result<Self, AppError> {
        let mut builder = Client::builder().timeout(timeout);
        builder = if allow_private {
            builder.redirect(redirect::Policy::limited(MAX_REDIRECTS))
        } else {
            builder
                .dns_resolver(Arc::new(PublicOnlyResolver))
                .redirect(redirect::Policy::custom(|attempt| {
                    if attempt.previous().len() >= MAX_REDIRECTS {
                        attempt.error("too many redirects")
                    } else if literal_ip(attempt.url()).is_some_and(|ip| !is_public_ip(ip)) {
                        attempt.error("redirect to a non-public address")
                    } else {
                        attempt.follow()
                    }
                }))
        };
        let client = builder
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            max_bytes,
            allow_private,
        })
    }

    pub fn parse_url(raw: &str) -> Result<Url, ImageFetchError> {
        let url = Url::parse(raw.trim()).map_err(|e| ImageFetchError::InvalidUrl(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ImageFetchError::InvalidUrl(format!(
                "scheme '{}' is not allowed",
                other
            ))),
        }
    }

    /// Refuse hosts that are, or only resolve to, non-public addresses.
    async fn check_public_host(url: &Url) -> Result<(), ImageFetchError> {
        if let Some(ip) = literal_ip(url) {
            return if is_public_ip(ip) {
                Ok(())
            } else {
                Err(ImageFetchError::InvalidUrl(format!("address {} is not allowed", ip)))
            };
        }

        let host = url
            .host_str()
            .ok_or_else(|| ImageFetchError::InvalidUrl("URL has no host".to_string()))?;
        let port = url.port_or_known_default().unwrap_or(443);
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ImageFetchError::Network(format!("cannot resolve {}: {}", host, e)))?
            .collect();

        if addrs.iter().any(|addr| is_public_ip(addr.ip())) {
            Ok(())
        } else {
            Err(ImageFetchError::InvalidUrl(format!(
                "host {} does not resolve to a public address",
                host
            )))
        }
    }

    /// Download `raw_url`, stopping as soon as the body passes the size cap.
    pub async fn fetch(&self, raw_url: &str) -> Result<FetchedImage, ImageFetchError> {
        let url = Self::parse_url(raw_url)?;
        if !self.allow_private {
            Self::check_public_host(&url).await?;
        }
        let host = url.host_str().unwrap_or_default().to_string();

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            return Err(ImageFetchError::Status(response.status().as_u16()));
        }

        if let Some(length) = response.content_length() {
            if length as usize > self.max_bytes {
                return Err(ImageFetchError::TooLarge(self.max_bytes));
            }
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(ImageFetchError::TooLarge(self.max_bytes));
            }
            bytes.extend_from_slice(&chunk);
        }

        tracing::debug!(host = %host, size = bytes.len(), "Fetched chart image");

        Ok(FetchedImage {
            bytes,
            content_type,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ImageFetchError {
    if err.is_timeout() {
        ImageFetchError::Timeout
    } else {
        ImageFetchError::Network(err.without_url().to_string())
    }
}
