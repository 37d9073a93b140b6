use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

use super::{ProviderKind, TunnelCleanup, TunnelProvider, TunnelResult};

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const START_TIMEOUT: Duration = Duration::from_secs(15);
const FUNNEL_UNAVAILABLE: &str = "Funnel not available";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailscaleMode {
    /// Tailnet-only HTTPS proxy.
    Serve,
    /// Public HTTPS proxy.
    Funnel,
}

impl TailscaleMode {
    fn subcommand(self) -> &'static str {
        match self {
            TailscaleMode::Serve => "serve",
            TailscaleMode::Funnel => "funnel",
        }
    }

    fn kind(self) -> ProviderKind {
        match self {
            TailscaleMode::Serve => ProviderKind::TailscaleServe,
            TailscaleMode::Funnel => ProviderKind::TailscaleFunnel,
        }
    }

    fn is_private(self) -> bool {
        self == TailscaleMode::Serve
    }
}

/// Subset of `tailscale status --json`.
#[derive(Debug, Deserialize)]
pub(crate) struct TailscaleStatus {
    #[serde(rename = "BackendState", default)]
    backend_state: String,
    #[serde(rename = "Self")]
    self_node: Option<SelfNode>,
}

#[derive(Debug, Deserialize)]
struct SelfNode {
    #[serde(rename = "DNSName", default)]
    dns_name: String,
}

impl TailscaleStatus {
    pub(crate) fn parse(json: &[u8]) -> Option<Self> {
        serde_json::from_slice(json).ok()
    }

    fn is_running(&self) -> bool {
        self.backend_state == "Running"
    }

    /// `https://<machine>.<tailnet>.ts.net`, from the node's DNS name.
    fn https_url(&self) -> Option<Url> {
        let host = self.self_node.as_ref()?.dns_name.trim_end_matches('.');
        if host.is_empty() {
            return None;
        }
        Url::parse(&format!("https://{host}")).ok()
    }
}

pub struct TailscaleProvider {
    binary: String,
    mode: TailscaleMode,
}

impl TailscaleProvider {
    pub fn new(mode: TailscaleMode) -> Self {
        Self::with_binary("tailscale", mode)
    }

    pub fn with_binary(binary: impl Into<String>, mode: TailscaleMode) -> Self {
        Self {
            binary: binary.into(),
            mode,
        }
    }

    async fn status(&self) -> Option<TailscaleStatus> {
        let output = tokio::time::timeout(
            STATUS_TIMEOUT,
            Command::new(&self.binary)
                .args(["status", "--json"])
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .ok()?
        .ok()?;
        if !output.status.success() {
            debug!("tailscale status exited with {}", output.status);
            return None;
        }
        TailscaleStatus::parse(&output.stdout)
    }
}

#[async_trait]
impl TunnelProvider for TailscaleProvider {
    fn kind(&self) -> ProviderKind {
        self.mode.kind()
    }

    async fn is_available(&self) -> bool {
        let version_ok = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false);
        if !version_ok {
            return false;
        }
        self.status().await.is_some_and(|status| status.is_running())
    }

    async fn start(&self, port: u16) -> TunnelResult {
        let kind = self.kind();
        let Some(url) = self.status().await.and_then(|status| status.https_url()) else {
            warn!("Could not determine this node's tailnet hostname");
            return TunnelResult::failed(kind);
        };

        let subcommand = self.mode.subcommand();
        let target = format!("http://localhost:{port}");
        let output = tokio::time::timeout(
            START_TIMEOUT,
            Command::new(&self.binary)
                .args([subcommand, "--bg", &target])
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let output = match output {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Failed to run tailscale {}: {}", subcommand, e);
                return TunnelResult::failed(kind);
            }
            Err(_) => {
                warn!("tailscale {} timed out after {:?}", subcommand, START_TIMEOUT);
                return TunnelResult::failed(kind);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains(FUNNEL_UNAVAILABLE) {
                warn!("Tailscale Funnel is not enabled for this device.");
                warn!("Enable it at: https://login.tailscale.com/admin/machines");
            } else {
                warn!("tailscale {} failed: {}", subcommand, stderr.trim());
            }
            return TunnelResult::failed(kind);
        }

        info!("Tailscale {} established at {}", subcommand, url);
        TunnelResult::established(
            kind,
            url,
            self.mode.is_private(),
            Box::new(TailscaleReset {
                binary: self.binary.clone(),
                mode: self.mode,
            }),
        )
    }
}

/// Runs `tailscale <serve|funnel> reset`. Only handed out once serving is up.
struct TailscaleReset {
    binary: String,
    mode: TailscaleMode,
}

#[async_trait]
impl TunnelCleanup for TailscaleReset {
    async fn cleanup(self: Box<Self>) {
        let subcommand = self.mode.subcommand();
        let reset = tokio::time::timeout(
            STATUS_TIMEOUT,
            Command::new(&self.binary)
                .args([subcommand, "reset"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await;
        match reset {
            Ok(Ok(status)) if status.success() => info!("Tailscale {} reset", subcommand),
            Ok(Ok(status)) => debug!("tailscale {} reset exited with {}", subcommand, status),
            Ok(Err(e)) => debug!("tailscale {} reset failed: {}", subcommand, e),
            Err(_) => debug!("tailscale {} reset timed out", subcommand),
        }
    }
}
