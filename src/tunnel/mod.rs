//! # Public URL tunnels
//!
//! At startup the server can expose its local port through an external helper:
//!
//! - **cloudflare**: a `cloudflared` quick tunnel on `*.trycloudflare.com` (public)
//! - **tailscale-serve**: `tailscale serve`, reachable from the tailnet only
//! - **tailscale-funnel**: `tailscale funnel`, public through Tailscale
//!
//! [`TunnelCoordinator::select_and_start`] picks a provider. In `auto` mode it
//! walks the preference order strictly one provider at a time and keeps the
//! first one that produces a URL. Every failure degrades to a result without a
//! URL; nothing here is fatal.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use tracing::{info, warn};
use url::Url;

mod cloudflare;
mod tailscale;

pub use cloudflare::{CloudflareProvider, extract_quick_tunnel_url};
pub use tailscale::{TailscaleMode, TailscaleProvider};

/// Tunnel requested on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum TunnelType {
    /// Try cloudflare, then tailscale-serve.
    #[default]
    Auto,
    Cloudflare,
    TailscaleServe,
    TailscaleFunnel,
    /// Do not start a tunnel.
    None,
}

impl TunnelType {
    /// The single provider an explicit request names, if any.
    pub fn provider(self) -> Option<ProviderKind> {
        match self {
            TunnelType::Cloudflare => Some(ProviderKind::Cloudflare),
            TunnelType::TailscaleServe => Some(ProviderKind::TailscaleServe),
            TunnelType::TailscaleFunnel => Some(ProviderKind::TailscaleFunnel),
            TunnelType::Auto | TunnelType::None => None,
        }
    }
}

/// A concrete tunnel backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Cloudflare,
    TailscaleServe,
    TailscaleFunnel,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Cloudflare => "cloudflare",
            ProviderKind::TailscaleServe => "tailscale-serve",
            ProviderKind::TailscaleFunnel => "tailscale-funnel",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reverses whatever a provider set up. Consumed on use.
#[async_trait]
pub trait TunnelCleanup: Send + Sync {
    async fn cleanup(self: Box<Self>);
}

/// Outcome of a tunnel attempt.
pub struct TunnelResult {
    pub url: Option<Url>,
    pub provider: Option<ProviderKind>,
    /// Reachable only from the tailnet.
    pub is_private: bool,
    cleanup: Option<Box<dyn TunnelCleanup>>,
}

impl TunnelResult {
    /// No tunnel and nothing to clean up.
    pub fn none() -> Self {
        Self {
            url: None,
            provider: None,
            is_private: false,
            cleanup: None,
        }
    }

    /// `provider` was tried (or asked for) but produced no URL.
    pub fn failed(provider: ProviderKind) -> Self {
        Self {
            provider: Some(provider),
            ..Self::none()
        }
    }

    pub fn established(
        provider: ProviderKind,
        url: Url,
        is_private: bool,
        cleanup: Box<dyn TunnelCleanup>,
    ) -> Self {
        Self {
            url: Some(url),
            provider: Some(provider),
            is_private,
            cleanup: Some(cleanup),
        }
    }

    /// Tear the tunnel down. Later calls do nothing.
    pub async fn cleanup(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.cleanup().await;
        }
    }
}

impl fmt::Debug for TunnelResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelResult")
            .field("url", &self.url.as_ref().map(Url::as_str))
            .field("provider", &self.provider)
            .field("is_private", &self.is_private)
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

#[async_trait]
pub trait TunnelProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Cheap availability check with no lasting side effects.
    async fn is_available(&self) -> bool;

    /// Bring the tunnel up for `port`. Bounded in time; failure yields no URL.
    async fn start(&self, port: u16) -> TunnelResult;
}

pub struct TunnelCoordinator {
    /// Every provider that may be requested explicitly.
    providers: Vec<Arc<dyn TunnelProvider>>,
    /// Preference order for `auto`.
    auto_order: Vec<Arc<dyn TunnelProvider>>,
}

impl Default for TunnelCoordinator {
    fn default() -> Self {
        let cloudflare: Arc<dyn TunnelProvider> = Arc::new(CloudflareProvider::default());
        let serve: Arc<dyn TunnelProvider> = Arc::new(TailscaleProvider::new(TailscaleMode::Serve));
        let funnel: Arc<dyn TunnelProvider> =
            Arc::new(TailscaleProvider::new(TailscaleMode::Funnel));
        Self {
            providers: vec![cloudflare.clone(), serve.clone(), funnel],
            auto_order: vec![cloudflare, serve],
        }
    }
}

impl TunnelCoordinator {
    pub fn new(
        providers: Vec<Arc<dyn TunnelProvider>>,
        auto_order: Vec<Arc<dyn TunnelProvider>>,
    ) -> Self {
        Self {
            providers,
            auto_order,
        }
    }

    pub async fn select_and_start(&self, port: u16, requested: TunnelType) -> TunnelResult {
        match (requested, requested.provider()) {
            (TunnelType::None, _) => {
                info!("Tunnel disabled");
                TunnelResult::none()
            }
            (_, Some(kind)) => self.start_explicit(port, kind).await,
            _ => self.start_auto(port).await,
        }
    }

    async fn start_explicit(&self, port: u16, kind: ProviderKind) -> TunnelResult {
        let Some(provider) = self.providers.iter().find(|p| p.kind() == kind) else {
            warn!("{} tunnel provider is not configured", kind);
            return TunnelResult::failed(kind);
        };
        if !provider.is_available().await {
            warn!("{} is not available", kind);
            return TunnelResult::failed(kind);
        }
        provider.start(port).await
    }

    async fn start_auto(&self, port: u16) -> TunnelResult {
        for provider in &self.auto_order {
            let kind = provider.kind();
            if !provider.is_available().await {
                info!("Skipping {} tunnel: not available", kind);
                continue;
            }
            info!("Starting {} tunnel", kind);
            let mut result = provider.start(port).await;
            if result.url.is_some() {
                return result;
            }
            warn!("{} tunnel did not produce a URL", kind);
            result.cleanup().await;
        }
        info!("No tunnel available");
        TunnelResult::none()
    }
}
