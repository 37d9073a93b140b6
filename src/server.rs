//! Process wiring: token, registry, listener, tunnel, banner and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use url::Url;

use crate::auth::{MAX_TOKEN_BYTES, TokenAuth, TokenValidator, issue_token};
use crate::config::Args;
use crate::pty::NativePtySpawner;
use crate::session::SessionRegistry;
use crate::shutdown::Shutdown;
use crate::tunnel::{TunnelCoordinator, TunnelResult, TunnelType};
use crate::web::{AppState, router};

/// Run until the first termination signal, then tear everything down.
///
/// Shutdown order: stop accepting and close every socket, destroy all
/// sessions, then undo the tunnel.
pub async fn run_server(args: Args) -> Result<()> {
    let token = args
        .token
        .clone()
        .filter(|token| !token.is_empty())
        .unwrap_or_else(issue_token);
    let auth: Arc<dyn TokenValidator> = {
        let token = token.clone();
        let auth = tokio::task::spawn_blocking(move || TokenAuth::new(&token))
            .await?
            .with_context(|| format!("Access token must be at most {MAX_TOKEN_BYTES} bytes"))?;
        Arc::new(auth)
    };

    let default_cwd = match args.cwd.clone() {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("Failed to read the current directory")?,
    };
    let spawner = Arc::new(NativePtySpawner::new(args.shell.clone()));
    let registry = Arc::new(SessionRegistry::new(spawner, args.history_bytes));
    let shutdown = Shutdown::new();

    let app = router(AppState {
        registry: registry.clone(),
        auth,
        default_cwd: default_cwd.clone(),
        shutdown: shutdown.clone(),
    });

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let local_addr = listener.local_addr()?;
    info!(
        "Server listening on {} (shell: {}, default cwd: {})",
        local_addr,
        args.shell,
        default_cwd.display()
    );

    let mut server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.wait().await })
                .await
        }
    });

    install_signal_handler(shutdown.clone());

    let mut tunnel = TunnelCoordinator::default()
        .select_and_start(local_addr.port(), args.tunnel)
        .await;
    print_banner(local_addr, &token, args.tunnel, &tunnel);

    let finished_early = tokio::select! {
        joined = &mut server => Some(joined),
        _ = shutdown.wait() => None,
    };
    let joined = match finished_early {
        Some(joined) => {
            error!("Server stopped unexpectedly");
            shutdown.trigger();
            joined
        }
        None => {
            info!("Shutting down...");
            server.await
        }
    };

    registry.destroy_all().await;
    tunnel.cleanup().await;
    info!("Shutdown complete");

    joined?.context("Server error")?;
    Ok(())
}

fn install_signal_handler(shutdown: Shutdown) {
    let result = ctrlc::set_handler(move || {
        if shutdown.trigger() {
            info!("Received termination signal");
        } else {
            warn!("Shutdown already in progress");
        }
    });
    if let Err(e) = result {
        error!("Failed to set signal handler: {}", e);
    }
}

/// `base` with `?token=<token>` appended.
pub fn connect_url(base: &Url, token: &str) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut().append_pair("token", token);
    url
}

fn print_banner(local_addr: SocketAddr, token: &str, requested: TunnelType, tunnel: &TunnelResult) {
    let port = local_addr.port();
    println!();
    println!("=================================");
    println!("  shellmux");
    println!("=================================");
    println!();
    match Url::parse(&format!("http://localhost:{port}")) {
        Ok(local) => println!("Local:  {}", connect_url(&local, token)),
        Err(_) => println!("Local:  http://{local_addr}"),
    }

    match (&tunnel.url, tunnel.provider) {
        (Some(url), provider) => {
            let label = if tunnel.is_private { "Tailnet" } else { "Public" };
            println!("{label}: {}", connect_url(url, token));
            if let Some(provider) = provider {
                println!("        via {provider}");
            }
            if tunnel.is_private {
                println!("        (private: reachable only from devices on your tailnet)");
            }
        }
        (None, _) if requested == TunnelType::None => {}
        (None, _) => {
            println!();
            println!("No tunnel. Use ngrok or cloudflared:");
            println!("  cloudflared tunnel --url http://localhost:{port}");
        }
    }

    println!();
    println!("=================================");
    println!();
}
