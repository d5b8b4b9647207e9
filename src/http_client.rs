use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use reqwest::redirect::Policy;
use reqwest::{Client, Method, Response, StatusCode};
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{FetchError, InitializationError};

/// Configuration for the HTTP client
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    /// Limit for receiving the response once connected
    pub read_timeout: Duration,
    pub max_redirects: usize,
    /// Cap on requests in flight at once, `None` for no cap
    pub max_concurrent_requests: Option<usize>,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(60_000),
            read_timeout: Duration::from_millis(60_000),
            max_redirects: 4,
            max_concurrent_requests: None,
            user_agent: format!("validate-xml/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpClientConfig {
    /// Settings for persistent identifier probes
    pub fn for_handles() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5_000),
            read_timeout: Duration::from_millis(10_000),
            max_concurrent_requests: Some(8),
            ..Default::default()
        }
    }
}

/// Blocking HTTP client for worker threads.
///
/// Owns a small tokio runtime and drives the async reqwest client on it, so any
/// number of OS threads can issue requests while connections stay pooled. Must not be
/// used or dropped from inside an async context.
pub struct HttpClient {
    runtime: Runtime,
    client: Client,
    config: HttpClientConfig,
    permits: Option<Arc<Semaphore>>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, InitializationError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("validate-xml-http")
            .enable_all()
            .build()
            .map_err(|e| InitializationError::HttpClient {
                details: e.to_string(),
            })?;

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(Policy::limited(config.max_redirects))
            .user_agent(&config.user_agent)
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| InitializationError::HttpClient {
                details: e.to_string(),
            })?;

        let permits = config
            .max_concurrent_requests
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        Ok(Self {
            runtime,
            client,
            config,
            permits,
        })
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// GET `url` and return the body. 404 maps to `NotFound`, any other
    /// non-success status to `Transport`.
    pub fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.runtime.block_on(async {
            let response = self.send(Method::GET, url).await?;
            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Err(FetchError::NotFound {
                    uri: url.to_string(),
                });
            }
            if !status.is_success() {
                return Err(FetchError::Transport {
                    uri: url.to_string(),
                    details: format!("unexpected status {}", status.as_u16()),
                });
            }

            let body = timeout(self.config.read_timeout, response.bytes())
                .await
                .map_err(|_| FetchError::Timeout {
                    uri: url.to_string(),
                })?
                .map_err(|e| classify(url, &e))?;
            debug!("downloaded {} ({} bytes)", url, body.len());
            Ok(body.to_vec())
        })
    }

    /// HEAD `url` and return the final status code, whatever it is
    pub fn head(&self, url: &str) -> Result<u16, FetchError> {
        self.runtime.block_on(async {
            let response = self.send(Method::HEAD, url).await?;
            trace!("HEAD {} -> {}", url, response.status());
            Ok(response.status().as_u16())
        })
    }

    async fn send(&self, method: Method, url: &str) -> Result<Response, FetchError> {
        let _permit = match &self.permits {
            Some(permits) => Some(permits.acquire().await.map_err(|e| FetchError::Transport {
                uri: url.to_string(),
                details: e.to_string(),
            })?),
            None => None,
        };

        let request = self.client.request(method, url).send();
        timeout(self.config.connect_timeout + self.config.read_timeout, request)
            .await
            .map_err(|_| FetchError::Timeout {
                uri: url.to_string(),
            })?
            .map_err(|e| classify(url, &e))
    }
}

/// Map a reqwest failure onto the fetch error kinds
fn classify(url: &str, error: &reqwest::Error) -> FetchError {
    if error.is_timeout() {
        return FetchError::Timeout {
            uri: url.to_string(),
        };
    }
    if is_unknown_host(error) {
        return FetchError::UnknownHost {
            uri: url.to_string(),
            host: host_of(url).unwrap_or_default(),
        };
    }
    FetchError::Transport {
        uri: url.to_string(),
        details: describe(error),
    }
}

/// True if any error in the source chain is a failed name lookup
fn is_unknown_host(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        let text = err.to_string().to_lowercase();
        if text.contains("dns error")
            || text.contains("failed to lookup address")
            || text.contains("name or service not known")
            || text.contains("no such host")
            || text.contains("nodename nor servname")
        {
            return true;
        }
        current = err.source();
    }
    false
}

/// Error text including its sources
fn describe(error: &(dyn StdError + 'static)) -> String {
    let mut text = error.to_string();
    let mut current = error.source();
    while let Some(err) = current {
        text.push_str(": ");
        text.push_str(&err.to_string());
        current = err.source();
    }
    text
}

pub(crate) fn host_of(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mock_server() -> (Runtime, MockServer) {
        let runtime = Runtime::new().unwrap();
        let server = runtime.block_on(MockServer::start());
        (runtime, server)
    }

    fn mount(runtime: &Runtime, server: &MockServer, verb: &str, at: &str, response: ResponseTemplate) {
        runtime.block_on(
            Mock::given(method(verb))
                .and(path(at))
                .respond_with(response)
                .mount(server),
        );
    }

    #[test]
    fn test_http_client_creation() {
        assert!(HttpClient::new(HttpClientConfig::default()).is_ok());
        let handles = HttpClientConfig::for_handles();
        assert_eq!(handles.max_concurrent_requests, Some(8));
        assert_eq!(handles.connect_timeout, Duration::from_millis(5_000));
    }

    #[test]
    fn test_get_returns_body() {
        let (runtime, server) = mock_server();
        mount(
            &runtime,
            &server,
            "GET",
            "/schema.xsd",
            ResponseTemplate::new(200).set_body_string("<xs:schema/>"),
        );

        let client = HttpClient::new(HttpClientConfig::default()).unwrap();
        let body = client.get(&format!("{}/schema.xsd", server.uri())).unwrap();
        assert_eq!(body, b"<xs:schema/>");
    }

    #[test]
    fn test_get_maps_status_codes() {
        let (runtime, server) = mock_server();
        mount(&runtime, &server, "GET", "/missing.xsd", ResponseTemplate::new(404));
        mount(&runtime, &server, "GET", "/broken.xsd", ResponseTemplate::new(500));

        let client = HttpClient::new(HttpClientConfig::default()).unwrap();

        let missing = format!("{}/missing.xsd", server.uri());
        assert_eq!(
            client.get(&missing),
            Err(FetchError::NotFound { uri: missing.clone() })
        );

        match client.get(&format!("{}/broken.xsd", server.uri())) {
            Err(FetchError::Transport { details, .. }) => assert!(details.contains("500")),
            other => panic!("Expected transport error, got {:?}", other),
        }
    }

    #[test]
    fn test_slow_response_is_a_timeout() {
        let (runtime, server) = mock_server();
        mount(
            &runtime,
            &server,
            "GET",
            "/slow.xsd",
            ResponseTemplate::new(200).set_delay(Duration::from_millis(800)),
        );

        let client = HttpClient::new(HttpClientConfig {
            connect_timeout: Duration::from_millis(100),
            read_timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .unwrap();

        let url = format!("{}/slow.xsd", server.uri());
        assert_eq!(client.get(&url), Err(FetchError::Timeout { uri: url.clone() }));
    }

    #[test]
    fn test_head_returns_status() {
        let (runtime, server) = mock_server();
        mount(&runtime, &server, "HEAD", "/protected", ResponseTemplate::new(403));
        mount(&runtime, &server, "HEAD", "/ok", ResponseTemplate::new(200));

        let client = HttpClient::new(HttpClientConfig::for_handles()).unwrap();
        assert_eq!(client.head(&format!("{}/protected", server.uri())), Ok(403));
        assert_eq!(client.head(&format!("{}/ok", server.uri())), Ok(200));
    }

    #[test]
    fn test_redirects_are_bounded() {
        let (runtime, server) = mock_server();
        let target = format!("{}/loop", server.uri());
        mount(
            &runtime,
            &server,
            "GET",
            "/loop",
            ResponseTemplate::new(302).insert_header("Location", target.as_str()),
        );

        let client = HttpClient::new(HttpClientConfig::default()).unwrap();
        assert!(matches!(client.get(&target), Err(FetchError::Transport { .. })));
    }

    #[derive(Debug)]
    struct Layer {
        text: &'static str,
        source: Option<Box<Layer>>,
    }

    impl fmt::Display for Layer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.text)
        }
    }

    impl StdError for Layer {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            self.source.as_deref().map(|s| s as &(dyn StdError + 'static))
        }
    }

    #[test]
    fn test_unknown_host_found_in_source_chain() {
        let error = Layer {
            text: "error sending request",
            source: Some(Box::new(Layer {
                text: "client error (Connect)",
                source: Some(Box::new(Layer {
                    text: "dns error: failed to lookup address information",
                    source: None,
                })),
            })),
        };
        assert!(is_unknown_host(&error));
        assert!(describe(&error).ends_with("failed to lookup address information"));

        let refused = Layer {
            text: "connection refused",
            source: None,
        };
        assert!(!is_unknown_host(&refused));
    }

    #[test]
    fn test_host_of() {
        assert_eq!(
            host_of("http://hdl.handle.net/1839/00-0000"),
            Some("hdl.handle.net".to_string())
        );
        assert_eq!(host_of("not a url"), None);
    }
}
