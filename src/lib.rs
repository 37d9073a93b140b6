//! # shellmux - persistent shell sessions over one WebSocket
//!
//! shellmux runs shell processes on the host inside pseudo-terminals and lets
//! any number of browser clients create, list, attach to, resize and destroy
//! them over a single authenticated WebSocket per client. Sessions outlive the
//! connections that created them; a client that attaches later gets the
//! recent output replayed before the live stream.
//!
//! ## Quick Start
//!
//! ```bash
//! # Serve on port 3456 and expose it through the first available tunnel
//! shellmux
//!
//! # Local only, fixed token
//! shellmux --tunnel none --token s3cret
//! ```
//!
//! ## Library Usage
//!
//! ```rust,no_run
//! use clap::Parser;
//! use shellmux::config::Args;
//! use shellmux::server::run_server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let args = Args::parse_from(["shellmux", "--tunnel", "none", "--port", "4000"]);
//! run_server(args).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ text: JSON control  ┌──────────────┐       ┌──────────────┐
//! │  Browser     │◄───────────────────►│  Connection  │──────►│  Session     │
//! │  (WebSocket) │ binary: terminal IO │  (web)       │  ids  │  Registry    │
//! └──────────────┘                     └──────────────┘       └──────┬───────┘
//!                                             ▲                      │ spawn
//!                                             │ broadcast            ▼
//!                                      ┌──────┴───────┐       ┌──────────────┐
//!                                      │  Session     │◄──────│  PTY         │
//!                                      │  (history)   │output │  (shell)     │
//!                                      └──────────────┘       └──────────────┘
//! ```
//!
//! - **[Sessions](session)**: registry, capped output history, per-session fan-out
//! - **[Web](web)**: axum router, per-connection state machine, control envelopes
//! - **[PTY](pty)**: spawner abstraction and the `portable-pty` implementation
//! - **[Tunnels](tunnel)**: cloudflared and Tailscale providers behind one coordinator
//!
//! ## Security
//!
//! A single shared token is issued at startup (or supplied with `--token`).
//! Only its bcrypt hash is kept. Every connection must send `auth` before any
//! other control message; the HTTP listing accepts it as a bearer token.

pub mod auth;
pub mod config;
pub mod error;
pub mod pty;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod tunnel;
pub mod web;
