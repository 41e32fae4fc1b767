//! Session provider speaking the W3C WebDriver protocol.
//!
//! Works against chromedriver or geckodriver. Each channel gets its own
//! WebDriver session; the browser can be routed through the intercepting
//! proxy so its game traffic is decoded.
//!
//! Error mapping:
//!
//! | WebDriver outcome                                  | [`SessionError`] |
//! |----------------------------------------------------|------------------|
//! | `invalid session id`, `no such window`, transport  | `Dead`           |
//! | request timed out                                  | `Timeout`        |
//! | anything else                                      | `Failed`         |

use super::command::{ChannelId, WaitState};
use super::error::{SessionError, SessionResult};
use super::session::{AutomationSession, SessionProvider};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Key under which WebDriver returns element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Default WebDriver endpoint (chromedriver's default port).
pub const DEFAULT_WEBDRIVER_URL: &str = "http://127.0.0.1:9515";
/// Default timeout for `wait_for`.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Browser driven through WebDriver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chrome,
    Firefox,
}

/// How sessions are created.
#[derive(Debug, Clone)]
pub struct WebDriverOptions {
    pub url: String,
    pub browser: Browser,
    pub headless: bool,
    /// `host:port` of an HTTP proxy for the browser.
    pub proxy: Option<String>,
    pub wait_timeout: Duration,
}

impl Default for WebDriverOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_WEBDRIVER_URL.to_string(),
            browser: Browser::default(),
            headless: true,
            proxy: None,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl WebDriverOptions {
    /// New-session capabilities for these options.
    pub fn capabilities(&self) -> Value {
        let mut always = json!({
            "browserName": match self.browser {
                Browser::Chrome => "chrome",
                Browser::Firefox => "firefox",
            },
            "acceptInsecureCerts": self.proxy.is_some(),
        });

        match self.browser {
            Browser::Chrome => {
                let mut args = vec!["--no-sandbox", "--disable-dev-shm-usage"];
                if self.headless {
                    args.push("--headless=new");
                }
                always["goog:chromeOptions"] = json!({ "args": args });
            }
            Browser::Firefox => {
                let args: Vec<&str> = if self.headless { vec!["-headless"] } else { Vec::new() };
                always["moz:firefoxOptions"] = json!({ "args": args });
            }
        }

        if let Some(proxy) = &self.proxy {
            always["proxy"] = json!({
                "proxyType": "manual",
                "httpProxy": proxy,
                "sslProxy": proxy,
            });
        }

        json!({ "capabilities": { "alwaysMatch": always } })
    }
}

/// Thin JSON-over-HTTP client for one WebDriver endpoint.
struct WebDriverClient {
    base: String,
    http: Client<HttpConnector, Full<Bytes>>,
}

impl WebDriverClient {
    fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            http: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Send one command and return its `value` member.
    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> SessionResult<Value> {
        let uri = format!("{}{}", self.base, path);
        let payload = match &body {
            Some(body) => Bytes::from(body.to_string()),
            None => Bytes::new(),
        };
        let request = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .body(Full::new(payload))
            .map_err(|e| SessionError::Failed(format!("Invalid request to {}: {}", uri, e)))?;

        let exchange = async {
            let response = self
                .http
                .request(request)
                .await
                .map_err(|e| SessionError::Dead(format!("WebDriver unreachable at {}: {}", self.base, e)))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| SessionError::Dead(format!("WebDriver connection lost: {}", e)))?
                .to_bytes();
            Ok::<_, SessionError>((status, body))
        };
        let (status, body) = tokio::time::timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| SessionError::Timeout)??;

        debug!("WebDriver {} {} -> {}", method, path, status);
        let reply: Value = serde_json::from_slice(&body)
            .map_err(|e| SessionError::Failed(format!("Malformed WebDriver reply ({}): {}", status, e)))?;
        let value = reply.get("value").cloned().unwrap_or(Value::Null);

        if status.is_success() {
            Ok(value)
        } else {
            Err(classify(&value))
        }
    }
}

/// Map a WebDriver error object to a [`SessionError`].
fn classify(value: &Value) -> SessionError {
    let code = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
    let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
    let text = if message.is_empty() {
        code.to_string()
    } else {
        format!("{}: {}", code, message)
    };

    match code {
        "invalid session id" | "no such window" | "session not created" => SessionError::Dead(text),
        "timeout" | "script timeout" => SessionError::Timeout,
        _ => SessionError::Failed(text),
    }
}

/// Creates one WebDriver session per channel.
pub struct WebDriverProvider {
    client: Arc<WebDriverClient>,
    options: WebDriverOptions,
}

impl WebDriverProvider {
    pub fn new(options: WebDriverOptions) -> Self {
        Self {
            client: Arc::new(WebDriverClient::new(&options.url)),
            options,
        }
    }

    pub fn options(&self) -> &WebDriverOptions {
        &self.options
    }
}

#[async_trait]
impl SessionProvider for WebDriverProvider {
    type Session = WebDriverSession;

    async fn create(&self, channel: &ChannelId) -> SessionResult<WebDriverSession> {
        let value = self
            .client
            .command(Method::POST, "/session", Some(self.options.capabilities()))
            .await?;
        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Failed("New session reply has no sessionId".into()))?
            .to_string();

        info!("WebDriver session {} created for channel {}", id, channel);
        let mut session = WebDriverSession {
            client: self.client.clone(),
            id,
            pages: 0,
            wait_timeout: self.options.wait_timeout,
        };
        session.refresh_pages().await?;
        Ok(session)
    }

    async fn is_alive(&self, session: &mut WebDriverSession) -> bool {
        match session.refresh_pages().await {
            Ok(pages) => pages > 0,
            Err(e) => {
                debug!("WebDriver session {} failed liveness probe: {}", session.id, e);
                false
            }
        }
    }
}

/// One WebDriver session.
pub struct WebDriverSession {
    client: Arc<WebDriverClient>,
    id: String,
    pages: usize,
    wait_timeout: Duration,
}

impl WebDriverSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> SessionResult<Value> {
        self.client
            .command(method, &format!("/session/{}{}", self.id, path), body)
            .await
    }

    async fn refresh_pages(&mut self) -> SessionResult<usize> {
        let handles = self.call(Method::GET, "/window/handles", None).await?;
        self.pages = handles.as_array().map_or(0, Vec::len);
        Ok(self.pages)
    }

    async fn find(&self, selector: &str) -> SessionResult<String> {
        let value = self
            .call(
                Method::POST,
                "/element",
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await?;
        element_id(&value).ok_or_else(|| SessionError::Failed(format!("No element reference for {}", selector)))
    }

    async fn find_all(&self, selector: &str) -> SessionResult<Vec<String>> {
        let value = self
            .call(
                Method::POST,
                "/elements",
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await?;
        Ok(value
            .as_array()
            .map(|items| items.iter().filter_map(element_id).collect())
            .unwrap_or_default())
    }

    async fn displayed(&self, element: &str) -> SessionResult<bool> {
        let value = self
            .call(Method::GET, &format!("/element/{}/displayed", element), None)
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn reached(&self, selector: &str, state: WaitState) -> SessionResult<bool> {
        let elements = self.find_all(selector).await?;
        Ok(match state {
            WaitState::Attached => !elements.is_empty(),
            WaitState::Detached => elements.is_empty(),
            WaitState::Visible | WaitState::Hidden => {
                let mut visible = false;
                for element in &elements {
                    match self.displayed(element).await {
                        Ok(true) => {
                            visible = true;
                            break;
                        }
                        Ok(false) => {}
                        // Element went stale between the two calls.
                        Err(SessionError::Failed(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                visible == (state == WaitState::Visible)
            }
        })
    }
}

fn element_id(value: &Value) -> Option<String> {
    value.get(ELEMENT_KEY).and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl AutomationSession for WebDriverSession {
    async fn navigate(&mut self, url: &str) -> SessionResult<()> {
        self.call(Method::POST, "/url", Some(json!({ "url": url }))).await?;
        self.refresh_pages().await?;
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> SessionResult<()> {
        let element = self.find(selector).await?;
        self.call(Method::POST, &format!("/element/{}/click", element), Some(json!({})))
            .await?;
        self.refresh_pages().await?;
        Ok(())
    }

    async fn fill(&mut self, selector: &str, text: &str) -> SessionResult<()> {
        let element = self.find(selector).await?;
        self.call(Method::POST, &format!("/element/{}/clear", element), Some(json!({})))
            .await?;
        self.call(
            Method::POST,
            &format!("/element/{}/value", element),
            Some(json!({ "text": text })),
        )
        .await?;
        Ok(())
    }

    async fn upload(&mut self, selector: &str, path: &Path) -> SessionResult<()> {
        let absolute = std::path::absolute(path)
            .map_err(|e| SessionError::Failed(format!("Invalid upload path {}: {}", path.display(), e)))?;
        if !absolute.is_file() {
            return Err(SessionError::Failed(format!("No such file: {}", absolute.display())));
        }
        let element = self.find(selector).await?;
        self.call(
            Method::POST,
            &format!("/element/{}/value", element),
            Some(json!({ "text": absolute.to_string_lossy() })),
        )
        .await?;
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, state: WaitState) -> SessionResult<()> {
        let deadline = tokio::time::Instant::now() + self.wait_timeout;
        loop {
            if self.reached(selector, state).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SessionError::Failed(format!(
                    "{} did not become {} within {:?}",
                    selector, state, self.wait_timeout
                )));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    async fn screenshot(&mut self, path: &Path) -> SessionResult<PathBuf> {
        let value = self.call(Method::GET, "/screenshot", None).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| SessionError::Failed("Screenshot reply is not a string".into()))?;
        let png = BASE64
            .decode(encoded)
            .map_err(|e| SessionError::Failed(format!("Screenshot is not valid base64: {}", e)))?;
        tokio::fs::write(path, png)
            .await
            .map_err(|e| SessionError::Failed(format!("Failed to write {}: {}", path.display(), e)))?;
        Ok(path.to_path_buf())
    }

    fn page_count(&self) -> usize {
        self.pages
    }

    async fn close(&mut self) -> SessionResult<()> {
        self.client
            .command(Method::DELETE, &format!("/session/{}", self.id), None)
            .await?;
        self.pages = 0;
        debug!("WebDriver session {} deleted", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    #[test]
    fn test_chrome_capabilities_with_proxy() {
        let options = WebDriverOptions {
            proxy: Some("127.0.0.1:9000".into()),
            ..WebDriverOptions::default()
        };
        let caps = options.capabilities();
        let always = &caps["capabilities"]["alwaysMatch"];
        assert_eq!(always["browserName"], "chrome");
        assert_eq!(always["acceptInsecureCerts"], true);
        assert_eq!(always["proxy"]["sslProxy"], "127.0.0.1:9000");
        let args = always["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(args.iter().any(|a| a == "--headless=new"));
    }

    #[test]
    fn test_firefox_capabilities_headed() {
        let options = WebDriverOptions {
            browser: Browser::Firefox,
            headless: false,
            ..WebDriverOptions::default()
        };
        let caps = options.capabilities();
        let always = &caps["capabilities"]["alwaysMatch"];
        assert_eq!(always["browserName"], "firefox");
        assert!(always["moz:firefoxOptions"]["args"].as_array().unwrap().is_empty());
        assert!(always.get("proxy").is_none());
    }

    #[test]
    fn test_classify_errors() {
        assert!(classify(&json!({"error": "invalid session id", "message": "gone"})).is_dead());
        assert!(classify(&json!({"error": "no such window"})).is_dead());
        assert_eq!(classify(&json!({"error": "timeout"})), SessionError::Timeout);
        assert_eq!(
            classify(&json!({"error": "no such element", "message": "#missing"})),
            SessionError::Failed("no such element: #missing".into())
        );
    }

    /// Minimal driver: one session "s1" with one window; `#missing` is never found.
    async fn fake_driver(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        let body = req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();
        let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

        let (status, value) = match (method, path.as_str()) {
            (Method::POST, "/session") => (StatusCode::OK, json!({ "sessionId": "s1", "capabilities": {} })),
            (Method::GET, "/session/s1/window/handles") => (StatusCode::OK, json!(["w1"])),
            (Method::POST, "/session/s1/url") => (StatusCode::OK, Value::Null),
            (Method::POST, "/session/s1/element") if request["value"] == "#missing" => (
                StatusCode::NOT_FOUND,
                json!({ "error": "no such element", "message": "#missing" }),
            ),
            (Method::POST, "/session/s1/element") => (StatusCode::OK, json!({ ELEMENT_KEY: "e1" })),
            (Method::POST, "/session/s1/elements") => (StatusCode::OK, json!([{ ELEMENT_KEY: "e1" }])),
            (Method::GET, "/session/s1/element/e1/displayed") => (StatusCode::OK, json!(true)),
            (Method::POST, "/session/s1/element/e1/click") => (StatusCode::OK, Value::Null),
            (Method::GET, "/session/s1/screenshot") => (StatusCode::OK, json!(BASE64.encode(b"png"))),
            (Method::DELETE, "/session/s1") => (StatusCode::OK, Value::Null),
            _ => (
                StatusCode::NOT_FOUND,
                json!({ "error": "invalid session id", "message": path }),
            ),
        };

        let mut response = Response::new(Full::new(Bytes::from(json!({ "value": value }).to_string())));
        *response.status_mut() = status;
        Ok(response)
    }

    async fn spawn_fake_driver() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(fake_driver))
                        .await;
                });
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_session_against_fake_driver() {
        let url = spawn_fake_driver().await;
        let provider = WebDriverProvider::new(WebDriverOptions {
            url: url.clone(),
            wait_timeout: Duration::from_millis(300),
            ..WebDriverOptions::default()
        });

        let mut session = provider.create(&ChannelId::from("42")).await.unwrap();
        assert_eq!(session.id(), "s1");
        assert_eq!(session.page_count(), 1);
        assert!(provider.is_alive(&mut session).await);

        session.navigate("https://example.com").await.unwrap();
        session.click("#play").await.unwrap();
        session.wait_for("#play", WaitState::Visible).await.unwrap();
        assert!(session.wait_for("#play", WaitState::Detached).await.is_err());

        let err = session.click("#missing").await.unwrap_err();
        assert!(!err.is_dead());

        let dir = tempfile::tempdir().unwrap();
        let shot = session.screenshot(&dir.path().join("a.png")).await.unwrap();
        assert_eq!(std::fs::read(shot).unwrap(), b"png");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_driver_is_dead() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = WebDriverProvider::new(WebDriverOptions {
            url: format!("http://{}", addr),
            ..WebDriverOptions::default()
        });
        let err = provider.create(&ChannelId::from("42")).await.err().unwrap();
        assert!(err.is_dead());
    }
}
