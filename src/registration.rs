//! Device registration against the lighting server.
//!
//! The server hands out the numeric id the broker topics are derived from. A
//! stored id is verified first; when the server no longer knows it, the id is
//! dropped and the device registers again, once.

use crate::persistence::{self, ConfigStore, StoreError};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Server answered {status} for {url}")]
    Status { url: String, status: StatusCode },

    #[error("Unexpected registration response: {0}")]
    Body(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of looking up a stored id on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Exists,
    Deleted,
}

#[derive(Debug, Deserialize)]
struct RegisteredDevice {
    id: u32,
}

pub fn devices_url(server: &str) -> String {
    format!("{}/api/devices/", server.trim_end_matches('/'))
}

pub fn device_url(server: &str, id: u32) -> String {
    format!("{}/api/devices/{}", server.trim_end_matches('/'), id)
}

pub fn registration_body(led_count: u32) -> serde_json::Value {
    serde_json::json!({ "type": "strip", "length": led_count })
}

/// A 404 or an empty body means the server forgot the device.
pub fn classify_lookup(url: &str, status: StatusCode, body: &str) -> Result<Lookup, RegistrationError> {
    if status == StatusCode::NOT_FOUND || (status.is_success() && body.trim().is_empty()) {
        return Ok(Lookup::Deleted);
    }
    if !status.is_success() {
        return Err(RegistrationError::Status {
            url: url.to_string(),
            status,
        });
    }
    Ok(Lookup::Exists)
}

pub fn parse_registered_id(body: &str) -> Result<u32, RegistrationError> {
    serde_json::from_str::<RegisteredDevice>(body)
        .map(|device| device.id)
        .map_err(|e| RegistrationError::Body(format!("{}: {}", e, body)))
}

pub struct HttpRegistrar {
    client: reqwest::Client,
    led_count: u32,
}

impl HttpRegistrar {
    pub fn new(led_count: u32, timeout: Duration) -> Result<Self, RegistrationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(RegistrationError::Client)?;
        Ok(Self { client, led_count })
    }

    /// Makes sure the store holds an id the server knows.
    ///
    /// Returns `Ok(None)` when no server url is configured.
    pub async fn ensure_registered(
        &self,
        store: &dyn ConfigStore,
    ) -> Result<Option<u32>, RegistrationError> {
        let Some(server) = persistence::load_server_url(store)? else {
            info!("Missing server url, skipping registration");
            return Ok(None);
        };

        if let Some(id) = persistence::load_device_id(store)? {
            match self.lookup(&server, id).await? {
                Lookup::Exists => {
                    info!("Device {} is known to {}", id, server);
                    return Ok(Some(id));
                }
                Lookup::Deleted => {
                    warn!("Device {} has been deleted on the server, registering again", id);
                    persistence::delete_device_id(store)?;
                }
            }
        }

        let id = self.register(&server).await?;
        persistence::save_device_id(store, id)?;
        info!("Registered as device {}", id);
        Ok(Some(id))
    }

    async fn lookup(&self, server: &str, id: u32) -> Result<Lookup, RegistrationError> {
        let url = device_url(server, id);
        debug!("Request path: {}", url);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|source| request_failed(&url, source))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| request_failed(&url, source))?;
        debug!("Status = {}, content_length = {}", status, body.len());

        classify_lookup(&url, status, &body)
    }

    async fn register(&self, server: &str) -> Result<u32, RegistrationError> {
        let url = devices_url(server);
        debug!("Request path: {}", url);

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&registration_body(self.led_count))
            .send()
            .await
            .map_err(|source| request_failed(&url, source))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistrationError::Status { url, status });
        }

        let body = response
            .text()
            .await
            .map_err(|source| request_failed(&url, source))?;
        parse_registered_id(&body)
    }
}

fn request_failed(url: &str, source: reqwest::Error) -> RegistrationError {
    if source.is_connect() {
        error!(
            "Connection to {} failed. Check that the server is running and the url is correct.",
            url
        );
    }
    RegistrationError::Request {
        url: url.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryConfigStore;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn urls_ignore_trailing_slashes() {
        assert_eq!(devices_url("http://srv:8080/"), "http://srv:8080/api/devices/");
        assert_eq!(device_url("http://srv:8080", 7), "http://srv:8080/api/devices/7");
    }

    #[test]
    fn body_describes_the_strip() {
        let body = registration_body(30);
        assert_eq!(body["type"], "strip");
        assert_eq!(body["length"], 30);
    }

    #[test]
    fn lookup_classification() {
        let url = "http://srv/api/devices/7";
        assert_eq!(
            classify_lookup(url, StatusCode::OK, r#"{"id":7}"#).unwrap(),
            Lookup::Exists
        );
        assert_eq!(
            classify_lookup(url, StatusCode::OK, "").unwrap(),
            Lookup::Deleted
        );
        assert_eq!(
            classify_lookup(url, StatusCode::NOT_FOUND, "gone").unwrap(),
            Lookup::Deleted
        );
        assert!(matches!(
            classify_lookup(url, StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            Err(RegistrationError::Status { .. })
        ));
    }

    #[test]
    fn registered_id_is_read_from_json() {
        assert_eq!(parse_registered_id(r#"{"id":12,"type":"strip"}"#).unwrap(), 12);
        assert!(matches!(
            parse_registered_id("<html>"),
            Err(RegistrationError::Body(_))
        ));
    }

    /// Answers each connection with the next canned response and records the
    /// request lines it saw.
    async fn serve(responses: Vec<(&'static str, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request).to_string();
                    if let Some(end) = text.find("\r\n\r\n") {
                        let length = text
                            .lines()
                            .find_map(|l| {
                                let (name, value) = l.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())
                                    .flatten()
                            })
                            .unwrap_or(0);
                        if request.len() >= end + 4 + length {
                            break;
                        }
                    }
                }
                let text = String::from_utf8_lossy(&request).to_string();
                log.lock().unwrap().push(text.lines().next().unwrap_or_default().to_string());

                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });

        (url, seen)
    }

    #[tokio::test]
    async fn missing_server_url_skips_registration() {
        let store = MemoryConfigStore::new();
        let registrar = HttpRegistrar::new(30, Duration::from_secs(2)).unwrap();

        assert_eq!(registrar.ensure_registered(&store).await.unwrap(), None);
    }

    #[tokio::test]
    async fn fresh_device_registers_and_persists_its_id() {
        let (url, seen) = serve(vec![("201 Created", r#"{"id":12}"#)]).await;
        let store = MemoryConfigStore::with_entries([("server_url", url.as_str())]);
        let registrar = HttpRegistrar::new(30, Duration::from_secs(2)).unwrap();

        assert_eq!(registrar.ensure_registered(&store).await.unwrap(), Some(12));
        assert_eq!(persistence::load_device_id(&store).unwrap(), Some(12));
        assert_eq!(seen.lock().unwrap().as_slice(), ["POST /api/devices/ HTTP/1.1"]);
    }

    #[tokio::test]
    async fn deleted_device_registers_again_once() {
        let (url, seen) = serve(vec![("404 Not Found", ""), ("201 Created", r#"{"id":13}"#)]).await;
        let store =
            MemoryConfigStore::with_entries([("server_url", url.as_str()), ("device_id", "7")]);
        let registrar = HttpRegistrar::new(30, Duration::from_secs(2)).unwrap();

        assert_eq!(registrar.ensure_registered(&store).await.unwrap(), Some(13));
        assert_eq!(persistence::load_device_id(&store).unwrap(), Some(13));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["GET /api/devices/7 HTTP/1.1", "POST /api/devices/ HTTP/1.1"]
        );
    }

    #[tokio::test]
    async fn known_device_keeps_its_id() {
        let (url, _) = serve(vec![("200 OK", r#"{"id":7,"type":"strip"}"#)]).await;
        let store =
            MemoryConfigStore::with_entries([("server_url", url.as_str()), ("device_id", "7")]);
        let registrar = HttpRegistrar::new(30, Duration::from_secs(2)).unwrap();

        assert_eq!(registrar.ensure_registered(&store).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let store = MemoryConfigStore::with_entries([("server_url", url.as_str())]);
        let registrar = HttpRegistrar::new(30, Duration::from_secs(2)).unwrap();

        assert!(matches!(
            registrar.ensure_registered(&store).await,
            Err(RegistrationError::Request { .. })
        ));
        assert_eq!(persistence::load_device_id(&store).unwrap(), None);
    }
}
