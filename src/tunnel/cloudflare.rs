use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::{ProviderKind, TunnelCleanup, TunnelProvider, TunnelResult};

const START_TIMEOUT: Duration = Duration::from_secs(10);

static QUICK_TUNNEL_URL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com").ok());

/// Find the quick-tunnel URL `cloudflared` prints to stderr.
pub fn extract_quick_tunnel_url(output: &str) -> Option<Url> {
    let found = QUICK_TUNNEL_URL.as_ref()?.find(output)?;
    Url::parse(found.as_str()).ok()
}

/// `cloudflared tunnel --url http://localhost:<port>` quick tunnel.
pub struct CloudflareProvider {
    binary: String,
    timeout: Duration,
}

impl Default for CloudflareProvider {
    fn default() -> Self {
        Self::new("cloudflared", START_TIMEOUT)
    }
}

impl CloudflareProvider {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TunnelProvider for CloudflareProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloudflare
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn start(&self, port: u16) -> TunnelResult {
        let mut child = match Command::new(&self.binary)
            .args(["tunnel", "--url", &format!("http://localhost:{port}")])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to launch {}: {}", self.binary, e);
                return TunnelResult::failed(ProviderKind::Cloudflare);
            }
        };
        let Some(stderr) = child.stderr.take() else {
            return TunnelResult::failed(ProviderKind::Cloudflare);
        };
        let mut lines = BufReader::new(stderr).lines();

        let found = tokio::time::timeout(self.timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("cloudflared: {}", line);
                if let Some(url) = extract_quick_tunnel_url(&line) {
                    return Some(url);
                }
            }
            None
        })
        .await;

        match found {
            Ok(Some(url)) => {
                info!("Cloudflare tunnel established at {}", url);
                tokio::spawn(drain_stderr(lines));
                TunnelResult::established(
                    ProviderKind::Cloudflare,
                    url,
                    false,
                    Box::new(CloudflaredProcess {
                        child: Mutex::new(child),
                    }),
                )
            }
            Ok(None) => {
                warn!("cloudflared exited before publishing a tunnel URL");
                stop(&mut child).await;
                TunnelResult::failed(ProviderKind::Cloudflare)
            }
            Err(_) => {
                warn!(
                    "cloudflared did not publish a tunnel URL within {:?}",
                    self.timeout
                );
                stop(&mut child).await;
                TunnelResult::failed(ProviderKind::Cloudflare)
            }
        }
    }
}

/// Keeps the pipe empty so cloudflared never blocks on a write.
async fn drain_stderr(mut lines: Lines<BufReader<ChildStderr>>) {
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("cloudflared: {}", line);
    }
}

async fn stop(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!("cloudflared already gone: {}", e);
    }
}

struct CloudflaredProcess {
    child: Mutex<Child>,
}

#[async_trait]
impl TunnelCleanup for CloudflaredProcess {
    async fn cleanup(self: Box<Self>) {
        let mut child = self.child.into_inner();
        stop(&mut child).await;
        info!("Cloudflare tunnel stopped");
    }
}
