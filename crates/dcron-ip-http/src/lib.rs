// # HTTP IP Source and Propagation Verifier
//
// Two HTTP capabilities the watcher needs around a DNS update.
//
// ## HttpIpSource
//
// Asks public "what is my IP" services for the node's address. Services are
// tried in order until one answers with an IPv4 address; the first service
// can be overridden with `DCRON_IP_SOURCE_URL`.
//
// Single-shot: no cache and no background polling. The cron schedule owns
// timing and the watcher owns the retry decision.
//
// ## HttpsPropagationVerifier
//
// Requests `https://{host}{path}` and reports the remote address of the
// socket that answered. After a DNS update this tells whether the host
// already resolves to the new address.

use async_trait::async_trait;
use dcron_core::traits::{IpSource, IpVersion, PropagationVerifier};
use dcron_core::{Error, Result};
use std::net::IpAddr;
use std::time::Duration;

/// Default IP check services, tried in order
pub const DEFAULT_IP_SERVICES: &[&str] = &[
    "https://api.ipify.org",  // plain text IP
    "https://ifconfig.me/ip", // plain text IP
    "https://icanhazip.com",  // plain text IP, trailing newline
];

/// Timeout for IP resolution requests
const IP_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for propagation checks
const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

fn build_client(builder: reqwest::ClientBuilder, timeout: Duration) -> reqwest::Client {
    builder
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to build HTTP client with timeout, using defaults: {}", e);
            reqwest::Client::new()
        })
}

/// Public IPv4 lookup over HTTP
#[derive(Debug, Clone)]
pub struct HttpIpSource {
    /// Services to ask, in order
    urls: Vec<String>,

    /// HTTP client
    client: reqwest::Client,
}

impl HttpIpSource {
    /// Create a source asking the given services in order
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            client: build_client(reqwest::Client::builder(), IP_LOOKUP_TIMEOUT),
        }
    }

    /// Default services, with `override_url` tried first when present
    pub fn with_override(override_url: Option<String>) -> Self {
        let mut urls: Vec<String> = override_url.into_iter().collect();
        let defaults: Vec<String> = DEFAULT_IP_SERVICES
            .iter()
            .map(|s| s.to_string())
            .filter(|s| !urls.contains(s))
            .collect();
        urls.extend(defaults);
        Self::new(urls)
    }

    /// Services in lookup order
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Fetch one service's answer
    async fn fetch_ip(&self, url: &str) -> Result<IpAddr> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::http(format!("Request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::http(format!(
                "{} answered HTTP {}",
                url,
                response.status()
            )));
        }

        let ip_text = response
            .text()
            .await
            .map_err(|e| Error::http(format!("Failed to read response from {}: {}", url, e)))?;
        let ip_text = ip_text.trim();

        let ip: IpAddr = ip_text
            .parse()
            .map_err(|_| Error::ip_source(format!("{} returned an invalid IP: {}", url, ip_text)))?;

        if !ip.is_ipv4() {
            return Err(Error::ip_source(format!("Expected IPv4 from {}, got: {}", url, ip)));
        }

        Ok(ip)
    }
}

impl Default for HttpIpSource {
    fn default() -> Self {
        Self::with_override(None)
    }
}

#[async_trait]
impl IpSource for HttpIpSource {
    async fn current(&self) -> Result<IpAddr> {
        let mut last_error = None;

        for url in &self.urls {
            match self.fetch_ip(url).await {
                Ok(ip) => {
                    tracing::debug!("{} reported public IP {}", url, ip);
                    return Ok(ip);
                }
                Err(e) => {
                    tracing::warn!("IP lookup via {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::ip_source("No IP services configured")))
    }

    fn version(&self) -> Option<IpVersion> {
        Some(IpVersion::V4)
    }
}

/// Propagation check through a live HTTPS request
#[derive(Debug, Clone)]
pub struct HttpsPropagationVerifier {
    scheme: String,
    client: reqwest::Client,
}

impl HttpsPropagationVerifier {
    pub fn new() -> Self {
        Self {
            scheme: "https".to_string(),
            // Every check resolves and connects afresh
            client: build_client(
                reqwest::Client::builder().pool_max_idle_per_host(0),
                VERIFY_TIMEOUT,
            ),
        }
    }

    /// Use another URL scheme (plain `http` in tests)
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    fn url(&self, host: &str, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}://{}{}", self.scheme, host, path)
        } else {
            format!("{}://{}/{}", self.scheme, host, path)
        }
    }
}

impl Default for HttpsPropagationVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PropagationVerifier for HttpsPropagationVerifier {
    async fn remote_addr(&self, host: &str, path: &str) -> Result<IpAddr> {
        let url = self.url(host, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::verification(format!("Request to {} failed: {}", url, e)))?;

        // Any status will do, only the peer address matters
        tracing::debug!("{} answered HTTP {}", url, response.status());

        response
            .remote_addr()
            .map(|addr| addr.ip())
            .ok_or_else(|| Error::verification(format!("No remote address for {}", url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[tokio::test]
    async fn test_ip_lookup_trims_answer() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .with_status(200)
            .with_body("203.0.113.9\n")
            .create_async()
            .await;

        let source = HttpIpSource::new(vec![server.url()]);
        let ip = source.current().await.unwrap();
        assert_eq!(ip, "203.0.113.9".parse::<IpAddr>().unwrap());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ip_lookup_fails_over() {
        let mut server = Server::new_async().await;
        let broken = server
            .mock("GET", "/broken")
            .with_status(503)
            .create_async()
            .await;
        let good = server
            .mock("GET", "/ip")
            .with_status(200)
            .with_body("198.51.100.7")
            .create_async()
            .await;

        let source = HttpIpSource::new(vec![
            format!("{}/broken", server.url()),
            format!("{}/ip", server.url()),
        ]);
        let ip = source.current().await.unwrap();
        assert_eq!(ip, "198.51.100.7".parse::<IpAddr>().unwrap());

        broken.assert_async().await;
        good.assert_async().await;
    }

    #[tokio::test]
    async fn test_ipv6_answer_is_rejected() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(200)
            .with_body("2001:db8::1")
            .create_async()
            .await;

        let source = HttpIpSource::new(vec![server.url()]);
        assert!(source.current().await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_answer_is_rejected() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(200)
            .with_body("<html>rate limited</html>")
            .create_async()
            .await;

        let source = HttpIpSource::new(vec![server.url()]);
        assert!(source.current().await.is_err());
    }

    #[tokio::test]
    async fn test_no_services_is_an_error() {
        let source = HttpIpSource::new(Vec::new());
        assert!(source.current().await.is_err());
    }

    #[test]
    fn test_override_goes_first() {
        let source = HttpIpSource::with_override(Some("http://ip.internal".to_string()));
        assert_eq!(source.urls()[0], "http://ip.internal");
        assert_eq!(source.urls().len(), DEFAULT_IP_SERVICES.len() + 1);

        let source = HttpIpSource::with_override(Some(DEFAULT_IP_SERVICES[1].to_string()));
        assert_eq!(source.urls()[0], DEFAULT_IP_SERVICES[1]);
        assert_eq!(source.urls().len(), DEFAULT_IP_SERVICES.len());
    }

    #[tokio::test]
    async fn test_verifier_reports_peer_address() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(404)
            .create_async()
            .await;

        let verifier = HttpsPropagationVerifier::new().with_scheme("http");
        let addr = verifier
            .remote_addr(&server.host_with_port(), "/health")
            .await
            .unwrap();
        assert!(addr.is_loopback());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_verifier_opens_a_new_connection_per_check() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = std::thread::spawn(move || {
            use std::io::{BufRead, BufReader, Write};

            let mut connections = 0;
            for stream in listener.incoming().take(2) {
                let mut stream = stream.unwrap();
                connections += 1;
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
                    line.clear();
                }
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                    .unwrap();
            }
            connections
        });

        let verifier = HttpsPropagationVerifier::new().with_scheme("http");
        let host = addr.to_string();
        verifier.remote_addr(&host, "/").await.unwrap();
        // A pooled keep-alive connection would leave the second accept waiting
        verifier.remote_addr(&host, "/").await.unwrap();

        assert_eq!(accepted.join().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_verifier_connection_refused() {
        let verifier = HttpsPropagationVerifier::new().with_scheme("http");
        assert!(verifier.remote_addr("127.0.0.1:1", "/").await.is_err());
    }

    #[test]
    fn test_verifier_url() {
        let verifier = HttpsPropagationVerifier::new();
        assert_eq!(verifier.url("example.com", "/"), "https://example.com/");
        assert_eq!(verifier.url("example.com", "api"), "https://example.com/api");
    }
}
