use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::ReadinessProbe;
use crate::upstream::DialTarget;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll `target` until a connect succeeds and, if `probe` is set, a
/// subsequent HTTP request returns a non-error status. Returns `Ok(())` on
/// success or `Err(())` if `deadline` elapses first.
pub async fn wait_until_ready(
    target: &DialTarget,
    probe: Option<&ReadinessProbe>,
    deadline: Duration,
) -> Result<(), ()> {
    let start = Instant::now();
    loop {
        if start.elapsed() >= deadline {
            warn!(target = %target, "readiness deadline exceeded");
            return Err(());
        }

        if try_connect(target).await {
            match probe {
                None => return Ok(()),
                Some(probe) => {
                    let remaining = deadline.saturating_sub(start.elapsed());
                    if probe_http(target, probe, remaining).await {
                        return Ok(());
                    }
                }
            }
        }

        sleep(POLL_INTERVAL).await;
    }
}

async fn try_connect(target: &DialTarget) -> bool {
    match target {
        DialTarget::Tcp(addr) => TcpStream::connect(addr).await.is_ok(),
        DialTarget::Unix(path) => UnixStream::connect(path).await.is_ok(),
    }
}

async fn probe_http(target: &DialTarget, probe: &ReadinessProbe, timeout: Duration) -> bool {
    let addr = match target {
        DialTarget::Tcp(addr) => addr.clone(),
        DialTarget::Unix(path) => return probe_http_unix(path, probe, timeout).await,
    };
    let url = format!("http://{addr}{}", probe.path);

    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to build readiness probe client");
            return false;
        }
    };

    let method = match probe.method.as_str() {
        "GET" => reqwest::Method::GET,
        "POST" => reqwest::Method::POST,
        "HEAD" => reqwest::Method::HEAD,
        other => {
            warn!(method = %other, "unsupported readiness_check method, treating as GET");
            reqwest::Method::GET
        }
    };

    match client.request(method, &url).send().await {
        Ok(resp) => {
            let ok = resp.status().is_success() || resp.status().is_redirection();
            debug!(url = %url, status = %resp.status(), ready = ok, "readiness probe response");
            ok
        }
        Err(e) => {
            debug!(url = %url, error = %e, "readiness probe request failed");
            false
        }
    }
}

/// Issue the same HTTP readiness request reqwest would build, but over a
/// Unix domain socket, since reqwest has no stock UDS transport. Writes a
/// minimal HTTP/1.1 request by hand and parses just the status line out of
/// the response.
async fn probe_http_unix(path: &std::path::Path, probe: &ReadinessProbe, timeout: Duration) -> bool {
    let attempt = async {
        let mut stream = UnixStream::connect(path)
            .await
            .map_err(|e| e.to_string())?;

        let request = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            probe.method, probe.path,
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| e.to_string())?;

        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .await
            .map_err(|e| e.to_string())?;

        parse_status_code(&response).ok_or_else(|| "malformed HTTP response".to_string())
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(status)) => {
            let ok = (200..400).contains(&status);
            debug!(path = %path.display(), status, ready = ok, "unix readiness probe response");
            ok
        }
        Ok(Err(e)) => {
            debug!(path = %path.display(), error = %e, "unix readiness probe failed");
            false
        }
        Err(_) => {
            debug!(path = %path.display(), "unix readiness probe timed out");
            false
        }
    }
}

/// Extract the numeric status code from a raw `HTTP/1.1 200 OK\r\n...`
/// response. Returns `None` if the status line is missing or malformed.
fn parse_status_code(response: &[u8]) -> Option<u16> {
    let line_end = response.windows(2).position(|w| w == b"\r\n")?;
    let status_line = std::str::from_utf8(&response[..line_end]).ok()?;
    let mut parts = status_line.split_whitespace();
    parts.next()?; // "HTTP/1.1"
    parts.next()?.parse().ok()
}
