use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use rand::Rng;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::config::{DohClientConfiguration, DohTransport};
use crate::doh_json::decode_json_response;
use crate::metrics::Metrics;

const DNS_MESSAGE_MIME: &str = "application/dns-message";
const DNS_JSON_MIME: &str = "application/dns-json";

/// RFC 8484 section 6 upper bound on response bodies.
const MAX_RESPONSE_BYTES: usize = 65_535;

/// RFC 8467 section 4.1 recommends padding requests to 128-byte blocks.
const PAD_BLOCK_BYTES: usize = 128;
const DEFAULT_UDP_PAYLOAD: u16 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum DohError {
    #[error("upstream concurrency limit reached before acquire timeout")]
    Overloaded,
    #[error("upstream request timed out")]
    Timeout,
    #[error("unexpected upstream http status {0}")]
    BadStatus(u16),
    #[error("upstream response body exceeds 65535 bytes")]
    ResponseTooLarge,
    #[error("failed to decode upstream response: {0}")]
    Decode(String),
    #[error("upstream transport error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Upstream resolver speaking DNS-over-HTTPS.
///
/// A weighted semaphore caps concurrent outbound requests; callers that
/// cannot acquire a permit within the configured window are turned away
/// instead of queueing without bound. Each request additionally runs under
/// its own deadline.
pub struct DohClient {
    http: reqwest::Client,
    urls: Vec<String>,
    transport: DohTransport,
    limiter: Semaphore,
    acquire_timeout: Duration,
    request_timeout: Duration,
    pad_requests: bool,
    metrics: Arc<Metrics>,
}

impl DohClient {
    pub fn new(
        cfg: &DohClientConfiguration,
        pad_requests: bool,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        // Keep connections warm so steady-state queries reuse TLS/H2 sessions.
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .tcp_keepalive(Duration::from_secs(60))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .http2_keep_alive_while_idle(true)
            .build()
            .context("build doh http client")?;

        Ok(Self {
            http,
            urls: cfg.url.clone(),
            transport: cfg.transport,
            limiter: Semaphore::new(cfg.max_concurrent_requests),
            acquire_timeout: cfg.semaphore_acquire_timeout(),
            request_timeout: cfg.request_timeout(),
            pad_requests,
            metrics,
        })
    }

    /// Resolve one request upstream. The permit is held for the whole
    /// exchange and released on every exit path when it drops.
    pub async fn query(&self, mut request: Message) -> Result<Message, DohError> {
        let permit = match timeout(self.acquire_timeout, self.limiter.acquire()).await {
            Ok(Ok(permit)) => permit,
            _ => return Err(DohError::Overloaded),
        };
        let _permit = permit;

        // Requests are cached under their canonical form.
        request.set_id(0);

        let exchange = async {
            match self.transport {
                DohTransport::Post => self.query_post(&mut request).await,
                DohTransport::Json => self.query_json(&request).await,
            }
        };
        match timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(DohError::Timeout),
        }
    }

    async fn query_post(&self, request: &mut Message) -> Result<Message, DohError> {
        if self.pad_requests {
            pad_request(request)?;
        }
        let body = request
            .to_vec()
            .map_err(|err| DohError::Decode(format!("pack request: {err}")))?;

        let response = self
            .http
            .post(self.pick_url())
            .header(CONTENT_TYPE, DNS_MESSAGE_MIME)
            .header(ACCEPT, DNS_MESSAGE_MIME)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(DohError::BadStatus(status.as_u16()));
        }
        let body = response.bytes().await?;
        if body.len() > MAX_RESPONSE_BYTES {
            return Err(DohError::ResponseTooLarge);
        }
        Message::from_vec(&body).map_err(|err| DohError::Decode(err.to_string()))
    }

    async fn query_json(&self, request: &Message) -> Result<Message, DohError> {
        let query = request
            .queries()
            .first()
            .ok_or_else(|| DohError::Decode("request has no question".to_string()))?;
        let name = query.name().to_lowercase().to_string();
        let qtype = query.query_type().to_string();

        let response = self
            .http
            .get(self.pick_url())
            .query(&[("name", name.as_str()), ("type", qtype.as_str())])
            .header(ACCEPT, DNS_JSON_MIME)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(DohError::BadStatus(status.as_u16()));
        }
        let body = response.bytes().await?;
        if body.len() > MAX_RESPONSE_BYTES {
            return Err(DohError::ResponseTooLarge);
        }
        decode_json_response(request, &body, &self.metrics)
            .map_err(|err| DohError::Decode(format!("{err:#}")))
    }

    fn pick_url(&self) -> &str {
        if self.urls.len() == 1 {
            return &self.urls[0];
        }
        let idx = rand::thread_rng().gen_range(0..self.urls.len());
        &self.urls[idx]
    }
}

/// Pad the request to the next 128-byte block with an EDNS0 padding option,
/// replacing any padding already present. Installs an OPT when the request
/// carries none.
fn pad_request(request: &mut Message) -> Result<(), DohError> {
    let edns = request.extensions_mut().get_or_insert_with(|| {
        let mut edns = Edns::new();
        edns.set_version(0);
        edns.set_max_payload(DEFAULT_UDP_PAYLOAD);
        edns
    });
    edns.options_mut().remove(EdnsCode::Padding);

    let unpadded_len = request
        .to_vec()
        .map_err(|err| DohError::Decode(format!("pack request for padding: {err}")))?
        .len();
    // The padding option itself costs a 4-byte option header.
    let needed = PAD_BLOCK_BYTES - ((unpadded_len + 4) % PAD_BLOCK_BYTES);

    if let Some(edns) = request.extensions_mut() {
        edns.options_mut().insert(EdnsOption::Unknown(
            u16::from(EdnsCode::Padding),
            vec![0u8; needed],
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DohClientConfiguration;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_request(name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x1111);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(
            Name::from_str(name).expect("name"),
            RecordType::A,
        ));
        msg
    }

    fn client_config(url: String) -> DohClientConfiguration {
        serde_json::from_value(serde_json::json!({
            "url": url,
            "maxConcurrentRequests": 2,
            "semaphoreAcquireTimeoutMilliseconds": 100,
            "requestTimeoutMilliseconds": 2000
        }))
        .expect("config")
    }

    #[test]
    fn padding_rounds_packed_length_to_block() {
        let mut request = test_request("example.com.");
        pad_request(&mut request).expect("pad");
        let packed = request.to_vec().expect("pack");
        assert_eq!(packed.len() % PAD_BLOCK_BYTES, 0);

        let edns = request.extensions().as_ref().expect("edns installed");
        assert!(edns.option(EdnsCode::Padding).is_some());
    }

    #[test]
    fn padding_replaces_existing_padding_option() {
        let mut request = test_request("example.com.");
        let mut edns = Edns::new();
        edns.options_mut().insert(EdnsOption::Unknown(
            u16::from(EdnsCode::Padding),
            vec![0u8; 7],
        ));
        *request.extensions_mut() = Some(edns);

        pad_request(&mut request).expect("pad");
        let packed = request.to_vec().expect("pack");
        assert_eq!(packed.len() % PAD_BLOCK_BYTES, 0);
    }

    #[test]
    fn padding_is_stable_when_reapplied() {
        let mut request = test_request("example.com.");
        pad_request(&mut request).expect("pad");
        let first = request.to_vec().expect("pack").len();
        pad_request(&mut request).expect("pad again");
        let second = request.to_vec().expect("pack").len();
        assert_eq!(first, second);
    }

    /// Minimal one-shot HTTP server returning a canned status line.
    async fn serve_status(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/dns-query")
    }

    #[tokio::test]
    async fn non_200_status_maps_to_bad_status() {
        let url = serve_status("HTTP/1.1 502 Bad Gateway").await;
        let client = DohClient::new(&client_config(url), false, Arc::new(Metrics::new()))
            .expect("client");

        match client.query(test_request("example.org.")).await {
            Err(DohError::BadStatus(502)) => {}
            other => panic!("expected BadStatus(502), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permit_is_released_after_a_failed_request() {
        let client = {
            let url = serve_status("HTTP/1.1 500 Internal Server Error").await;
            DohClient::new(&client_config(url), false, Arc::new(Metrics::new())).expect("client")
        };

        let _ = client.query(test_request("a.example.")).await;
        assert_eq!(client.limiter.available_permits(), 2);
    }

    #[tokio::test]
    async fn exhausted_semaphore_reports_overloaded() {
        let url = serve_status("HTTP/1.1 200 OK").await;
        let client = DohClient::new(&client_config(url), false, Arc::new(Metrics::new()))
            .expect("client");

        let first = client.limiter.acquire().await.expect("permit");
        let second = client.limiter.acquire().await.expect("permit");

        match client.query(test_request("example.net.")).await {
            Err(DohError::Overloaded) => {}
            other => panic!("expected Overloaded, got {other:?}"),
        }
        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn garbage_binary_body_maps_to_decode_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let body = b"\x01\x02";
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/dns-message\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.write_all(body).await;
            }
        });

        let client = DohClient::new(
            &client_config(format!("http://{addr}/dns-query")),
            false,
            Arc::new(Metrics::new()),
        )
        .expect("client");

        match client.query(test_request("example.com.")).await {
            Err(DohError::Decode(_)) => {}
            other => panic!("expected Decode error, got {other:?}"),
        }
    }
}
