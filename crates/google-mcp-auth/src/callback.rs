//! OAuth Callback Server
//!
//! Single-shot local HTTP listener for one authorization attempt.
//!
//! `GET /` serves a page with a manual sign-in link (for when the browser
//! could not be opened programmatically). `GET <redirect path>` reads `code`
//! or `error` from the query, renders a short result page and hands exactly
//! one outcome to the waiting flow. Later callbacks, and callbacks carrying
//! another attempt's `state`, are answered but ignored.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{AuthError, Result};

/// How long shutdown waits for in-flight responses before aborting them
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Per-connection budget for reading the request head
const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on header lines read from one request
const MAX_HEADER_LINES: usize = 100;

/// What the browser brought back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Code(String),
    Error(String),
}

// ── Binding ─────────────────────────────────────────────────────────────────

/// A listener bound for one attempt, before the authorization URL exists.
///
/// Binding comes first because the port may differ from the registered one,
/// and the authorization URL must carry the redirect URI actually in use.
pub struct BoundListener {
    listener: TcpListener,
    redirect_uri: String,
    callback_path: String,
    port: u16,
}

impl BoundListener {
    /// Bind the port named in `redirect_uri`, falling back to an ephemeral port.
    pub async fn bind(redirect_uri: &str) -> Result<Self> {
        let mut url = url::Url::parse(redirect_uri)
            .map_err(|e| AuthError::Config(format!("invalid redirect URI {}: {}", redirect_uri, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| AuthError::Config(format!("redirect URI has no host: {}", redirect_uri)))?
            .to_string();
        let bind_host = if host == "localhost" { "127.0.0.1" } else { host.as_str() };
        let wanted = url.port_or_known_default().unwrap_or(80);

        let listener = match TcpListener::bind((bind_host, wanted)).await {
            Ok(l) => l,
            Err(e) => {
                warn!(
                    "Could not bind callback port {} ({}), using an ephemeral port",
                    wanted, e
                );
                TcpListener::bind((bind_host, 0)).await?
            }
        };

        let port = listener.local_addr()?.port();
        if port != wanted {
            url.set_port(Some(port)).map_err(|_| {
                AuthError::Config(format!("cannot set port on redirect URI {}", redirect_uri))
            })?;
        }

        let callback_path = match url.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };

        info!("OAuth callback server listening on {}", url);

        Ok(Self {
            listener,
            redirect_uri: url.to_string(),
            callback_path,
            port,
        })
    }

    /// Redirect URI to put in the authorization URL (port already adjusted)
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start answering requests. `auth_url` backs the manual-link page;
    /// `expected_state` is the anti-replay value the callback must echo.
    pub fn serve(self, auth_url: String, expected_state: String) -> CallbackServer {
        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let session = Arc::new(Session {
            callback_path: self.callback_path,
            auth_url,
            expected_state,
            result_tx: Mutex::new(Some(result_tx)),
        });

        let task = tokio::spawn(accept_loop(self.listener, session, shutdown_rx));

        CallbackServer {
            redirect_uri: self.redirect_uri,
            port: self.port,
            result_rx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

// ── Running server ──────────────────────────────────────────────────────────

pub struct CallbackServer {
    redirect_uri: String,
    port: u16,
    result_rx: oneshot::Receiver<CallbackOutcome>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CallbackServer {
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the single outcome. Cancel-safe.
    pub async fn wait(&mut self) -> Result<CallbackOutcome> {
        (&mut self.result_rx)
            .await
            .map_err(|_| AuthError::Http("callback server stopped before a result arrived".into()))
    }

    /// Stop accepting, give in-flight responses a bounded grace period, then abort.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("Callback server did not stop within {:?}, aborting", SHUTDOWN_GRACE);
                task.abort();
            }
        }
        debug!("Callback server on port {} shut down", self.port);
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        // Reached when the waiting future is dropped without shutdown().
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Session {
    callback_path: String,
    auth_url: String,
    expected_state: String,
    result_tx: Mutex<Option<oneshot::Sender<CallbackOutcome>>>,
}

impl Session {
    /// Hand over the outcome if nothing has been delivered yet.
    fn deliver(&self, outcome: CallbackOutcome) -> bool {
        let sender = match self.result_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<Session>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let session = Arc::clone(&session);
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(socket, peer, &session).await {
                            debug!("Callback connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Callback accept error: {}", e),
            }
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    session: &Session,
) -> std::io::Result<()> {
    let target = match tokio::time::timeout(READ_TIMEOUT, read_request_target(&mut socket)).await {
        Ok(result) => result?,
        Err(_) => return Ok(()),
    };
    let Some(target) = target else {
        return send_response(&mut socket, "400 Bad Request", result_page("Bad request", "Malformed request.")).await;
    };

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target.as_str(), ""),
    };
    debug!("Callback request from {}: {}", peer, path);

    let params = parse_query_params(query);
    let is_callback = path == session.callback_path
        && (path != "/" || params.contains_key("code") || params.contains_key("error"));

    if is_callback {
        let Some(outcome) = callback_outcome(&params, &session.expected_state) else {
            debug!("Ignoring callback from {} with a stale or missing state", peer);
            return send_response(
                &mut socket,
                "400 Bad Request",
                result_page(
                    "Sign-in link expired",
                    "This response belongs to an older sign-in attempt. Use the most recent sign-in window.",
                ),
            )
            .await;
        };
        let (status, page) = match (&outcome, session.deliver(outcome.clone())) {
            (_, false) => (
                "200 OK",
                result_page(
                    "Already completed",
                    "This sign-in attempt has already finished. You can close this window.",
                ),
            ),
            (CallbackOutcome::Code(_), true) => (
                "200 OK",
                result_page(
                    "Authentication successful!",
                    "You can now close this window and return to the application.",
                ),
            ),
            (CallbackOutcome::Error(msg), true) => (
                "400 Bad Request",
                result_page(
                    "Authentication failed",
                    &format!("Error: {}. Please close this window and try again.", msg),
                ),
            ),
        };
        send_response(&mut socket, status, page).await
    } else if path == "/" {
        send_response(&mut socket, "200 OK", root_page(&session.auth_url)).await
    } else {
        send_response(&mut socket, "404 Not Found", result_page("Not found", "Nothing here.")).await
    }
}

/// `None` when the callback carries another attempt's state; such a
/// response is answered but never consumes this attempt's outcome.
fn callback_outcome(params: &HashMap<String, String>, expected_state: &str) -> Option<CallbackOutcome> {
    let state = params.get("state").map(String::as_str);
    if state.is_some_and(|s| s != expected_state) {
        return None;
    }
    if let Some(error) = params.get("error") {
        let desc = params
            .get("error_description")
            .map(|d| format!(" - {}", d))
            .unwrap_or_default();
        return Some(CallbackOutcome::Error(format!("{}{}", error, desc)));
    }
    match params.get("code").filter(|c| !c.is_empty()) {
        // A code is only accepted together with this attempt's state
        Some(code) if state == Some(expected_state) => Some(CallbackOutcome::Code(code.clone())),
        Some(_) => None,
        None => Some(CallbackOutcome::Error("no authorization code received".to_string())),
    }
}

/// Read the request line and drain the headers; returns the request target of a GET.
async fn read_request_target(socket: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut reader = BufReader::new(socket);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    // Drain headers so closing the socket does not reset the connection
    let mut line = String::new();
    for _ in 0..MAX_HEADER_LINES {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    // "GET /path?query HTTP/1.1"
    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => Ok(Some(target.to_string())),
        _ => Ok(None),
    }
}

/// Parse URL query parameters into a HashMap
fn parse_query_params(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|part| {
            let mut split = part.splitn(2, '=');
            match (split.next(), split.next()) {
                (Some(key), Some(value)) => {
                    let value = value.replace('+', " ");
                    let decoded_value = urlencoding::decode(&value).ok()?;
                    Some((key.to_string(), decoded_value.into_owned()))
                }
                _ => None,
            }
        })
        .collect()
}

/// Send HTTP response to the browser
async fn send_response(socket: &mut TcpStream, status: &str, html: String) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        html.len(),
        html
    );
    socket.write_all(response.as_bytes()).await?;
    socket.flush().await?;
    Ok(())
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Google MCP - {}</title>
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; text-align: center; padding: 50px; }}
        .button {{ background-color: #4285f4; color: white; padding: 12px 24px; text-decoration: none; border-radius: 4px; display: inline-block; margin-top: 20px; }}
    </style>
</head>
<body>
{}
</body>
</html>"#,
        html_escape(title),
        body
    )
}

/// Success/error result page
fn result_page(title: &str, message: &str) -> String {
    page(
        title,
        &format!("    <h1>{}</h1>\n    <p>{}</p>", html_escape(title), html_escape(message)),
    )
}

/// Manual-link fallback page
fn root_page(auth_url: &str) -> String {
    page(
        "Sign in",
        &format!(
            "    <h1>Google MCP Authentication</h1>\n    <p>Click the button below to authenticate with Google:</p>\n    <a href=\"{}\" class=\"button\">Authenticate with Google</a>",
            html_escape(auth_url)
        ),
    )
}
