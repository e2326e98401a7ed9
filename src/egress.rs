//! ==============================================================================
//! egress.rs - best-effort batch upload to the cloud endpoint
//! ==============================================================================
//!
//! purpose:
//!     send_all() posts the gateway's own reading and then one request per
//!     known node. each request is its own attempt: a failure is logged and
//!     the batch moves on. nothing is retried within a batch; the next cycle
//!     sends whatever the table holds by then.
//!
//! wire format:
//!     one HTTP/1.0 POST per reading on a fresh connection (no pooling):
//!
//! ```text
//!         POST /data HTTP/1.0
//!         Host: <host>[:<port> unless 80]
//!         User-Agent: <agent>
//!         Content-Type: application/json
//!         Content-Length: <n>
//!         <origin header>: <address of the node that produced the reading>
//! ```
//!
//! ```text
//!         <envelope>
//! ```
//!
//! ```text
//!     the response body is read within the read timeout, logged, and
//!     discarded. a non-2xx status still counts as delivered.
//! ```
//!
//! relationships:
//!     - used by: manager.rs (send_all_now), workers.rs (HttpEgressWorker)
//!     - uses: codec.rs, node_table.rs
//!
//! ==============================================================================

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Version};
use serde::Serialize;
use std::time::Duration;

use crate::codec::{self, EnvelopeFlavor};
use crate::config::CloudConfig;
use crate::domain::SensorReading;
use crate::error::EgressError;
use crate::node_table::NodeEntry;

/// what came back from one successful post
#[derive(Debug, Clone)]
pub struct Delivery {
    pub status: u16,
    pub response_bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EgressSummary {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct CloudEgress {
    config: CloudConfig,
    client: Client,
    url: String,
}

impl CloudEgress {
    pub fn new(config: &CloudConfig) -> Result<Self, EgressError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .user_agent(config.user_agent.clone())
            .http1_only()
            .http1_title_case_headers()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(EgressError::Client)?;

        Ok(Self {
            url: format!("http://{}:{}{}", config.host, config.port, config.path),
            config: config.clone(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// self reading first (full precision), then every node (rounded)
    pub async fn send_all(&self, own: &SensorReading, nodes: &[NodeEntry]) -> EgressSummary {
        tracing::info!(nodes = nodes.len(), url = %self.url, "cloud upload starting");
        let mut summary = EgressSummary::default();

        let own_body = codec::encode(own, EnvelopeFlavor::SelfReading);
        self.tally(&mut summary, &own.address, self.send_one(&own.address, &own_body).await);

        for entry in nodes {
            let body = codec::encode(&entry.reading, EnvelopeFlavor::Relay);
            self.tally(&mut summary, &entry.address, self.send_one(&entry.address, &body).await);
        }

        tracing::info!(
            attempted = summary.attempted,
            delivered = summary.delivered,
            failed = summary.failed,
            "cloud upload finished"
        );
        summary
    }

    fn tally(&self, summary: &mut EgressSummary, origin: &str, result: Result<Delivery, EgressError>) {
        summary.attempted += 1;
        match result {
            Ok(d) => {
                summary.delivered += 1;
                tracing::info!(origin, status = d.status, bytes = d.response_bytes, "reading delivered");
            }
            Err(e) => {
                summary.failed += 1;
                tracing::error!(origin, error = %e, "reading not delivered");
            }
        }
    }

    /// request line, the headers we set, and the body; what max_request_bytes is checked against
    pub fn request_head(&self, origin: &str, body: &str) -> String {
        let c = &self.config;
        let host = if c.port == 80 {
            c.host.clone()
        } else {
            format!("{}:{}", c.host, c.port)
        };
        format!(
            "POST {} HTTP/1.0\r\n\
             Host: {}\r\n\
             User-Agent: {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             {}: {}\r\n\
             \r\n\
             {}",
            c.path,
            host,
            c.user_agent,
            body.len(),
            c.origin_header,
            origin,
            body
        )
    }

    /// one post on its own connection
    pub async fn send_one(&self, origin: &str, body: &str) -> Result<Delivery, EgressError> {
        let size = self.request_head(origin, body).len();
        if size >= self.config.max_request_bytes {
            return Err(EgressError::RequestTooLarge {
                size,
                limit: self.config.max_request_bytes,
            });
        }

        let read_timeout = Duration::from_millis(self.config.read_timeout_ms);
        let wait = Duration::from_millis(self.config.connect_timeout_ms) + read_timeout;
        let request = self
            .client
            .post(&self.url)
            .version(Version::HTTP_10)
            .header(CONTENT_TYPE, "application/json")
            .header(self.config.origin_header.as_str(), origin)
            .body(body.to_string())
            .send();

        let response = match tokio::time::timeout(wait, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) if source.is_connect() => {
                return Err(EgressError::Connect {
                    url: self.url.clone(),
                    source,
                })
            }
            Ok(Err(source)) if source.is_timeout() => {
                return Err(EgressError::Timeout {
                    url: self.url.clone(),
                    after: wait,
                })
            }
            Ok(Err(source)) => {
                return Err(EgressError::Request {
                    url: self.url.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(EgressError::Timeout {
                    url: self.url.clone(),
                    after: wait,
                })
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(origin, status = %status, "cloud answered with an error status");
        }

        let response_bytes = match tokio::time::timeout(read_timeout, response.bytes()).await {
            Ok(Ok(bytes)) => bytes.len(),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "response read failed");
                0
            }
            Err(_) => {
                tracing::debug!(after = ?read_timeout, "response read timed out");
                0
            }
        };

        Ok(Delivery {
            status: status.as_u16(),
            response_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChannelValues;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(port: u16) -> CloudConfig {
        CloudConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout_ms: 500,
            read_timeout_ms: 200,
            ..CloudConfig::default()
        }
    }

    /// accepts `n` connections, answers each, returns the raw requests
    async fn fake_cloud(n: usize) -> (u16, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..n {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut req = Vec::new();
                let mut buf = [0u8; 512];
                loop {
                    let n = sock.read(&mut buf).await.unwrap();
                    req.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&req).to_string();
                    if let Some(split) = text.find("\r\n\r\n") {
                        let len: usize = text
                            .lines()
                            .find_map(|l| l.strip_prefix("Content-Length: "))
                            .and_then(|v| v.trim().parse().ok())
                            .unwrap_or(0);
                        if req.len() >= split + 4 + len {
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                sock.write_all(b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\n{}").await.unwrap();
                drop(sock);
                seen.push(String::from_utf8_lossy(&req).to_string());
            }
            seen
        });
        (port, handle)
    }

    fn reading(addr: &str, t: f64) -> SensorReading {
        SensorReading::new(
            addr,
            "2024-01-01T00:00:00",
            ChannelValues {
                temperature: t,
                air_humidity: 1.0,
                soil_moisture: 2.0,
                particulates: 3.0,
            },
        )
    }

    fn entry(addr: &str, t: f64) -> NodeEntry {
        NodeEntry {
            address: addr.to_string(),
            reading: reading(addr, t),
            last_update: "2024-01-01T00:00:00".to_string(),
            last_update_ms: 0,
            last_update_at: None,
        }
    }

    #[test]
    fn test_request_head() {
        let egress = CloudEgress::new(&CloudConfig::default()).unwrap();
        assert_eq!(egress.url(), "http://localhost:80/data");
        assert_eq!(
            egress.request_head("fd00::1", "{}"),
            "POST /data HTTP/1.0\r\nHost: localhost\r\nUser-Agent: meshlink-gateway\r\n\
             Content-Type: application/json\r\nContent-Length: 2\r\nX-Origin-Node: fd00::1\r\n\r\n{}"
        );

        // the port only shows up when it is not the default
        let egress = CloudEgress::new(&config(8080)).unwrap();
        assert!(egress.request_head("n1", "{}").contains("\r\nHost: 127.0.0.1:8080\r\n"));
    }

    #[tokio::test]
    async fn test_send_one_delivers() {
        let (port, cloud) = fake_cloud(1).await;
        let egress = CloudEgress::new(&config(port)).unwrap();
        let d = egress.send_one("fd00::1", r#"{"e":"fd00::1"}"#).await.unwrap();
        assert_eq!(d.status, 200);
        assert_eq!(d.response_bytes, 2);

        let seen = cloud.await.unwrap();
        assert!(seen[0].starts_with("POST /data HTTP/1.0\r\n"));
        assert!(seen[0].contains(&format!("Host: 127.0.0.1:{}\r\n", port)));
        assert!(seen[0].contains("X-Origin-Node: fd00::1\r\n"));
        assert!(seen[0].contains("Content-Type: application/json\r\n"));
        assert!(seen[0].contains("User-Agent: meshlink-gateway\r\n"));
        assert!(seen[0].ends_with(r#"{"e":"fd00::1"}"#));
    }

    #[tokio::test]
    async fn test_send_all_order_and_flavors() {
        let (port, cloud) = fake_cloud(3).await;
        let egress = CloudEgress::new(&config(port)).unwrap();
        let own = reading("gw", 21.456);
        let nodes = vec![entry("n1", 10.004), entry("n2", 11.0)];

        let summary = egress.send_all(&own, &nodes).await;
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.delivered, 3);

        let seen = cloud.await.unwrap();
        assert!(seen[0].contains("X-Origin-Node: gw\r\n"));
        assert!(seen[0].contains(r#""t":21.456"#));
        assert!(seen[1].contains("X-Origin-Node: n1\r\n"));
        assert!(seen[1].contains(r#""t":10.0"#));
        assert!(seen[2].contains("X-Origin-Node: n2\r\n"));
    }

    #[tokio::test]
    async fn test_failed_entry_does_not_stop_batch() {
        // a port nobody listens on
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let egress = CloudEgress::new(&config(port)).unwrap();
        let summary = egress.send_all(&reading("gw", 1.0), &[entry("n1", 1.0), entry("n2", 2.0)]).await;
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.failed, 3);
        assert!(matches!(
            egress.send_one("gw", "{}").await,
            Err(EgressError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_request_is_refused() {
        let egress = CloudEgress::new(&config(9)).unwrap();
        let body = "x".repeat(2000);
        assert!(matches!(
            egress.send_one("gw", &body).await,
            Err(EgressError::RequestTooLarge { limit: 1024, .. })
        ));
    }
}
