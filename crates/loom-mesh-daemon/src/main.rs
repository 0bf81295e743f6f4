// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Mesh endpoint discovery daemon binary.

use anyhow::Context;
use clap::Parser;
use loom_mesh_daemon::config::{LoggingConfigLayer, SignalingConfigLayer, WatcherConfigLayer};
use loom_mesh_daemon::{init_tracing, load_config, Components, MeshConfigLayer, MeshDaemon};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

/// loom-mesh - ICE endpoint discovery for WireGuard interfaces.
#[derive(Parser, Debug)]
#[command(name = "loom-mesh", about = "ICE endpoint discovery for WireGuard interfaces", version)]
struct Args {
	/// Config file replacing /etc/loom/mesh.toml
	#[arg(short, long, env = "LOOM_MESH_CONFIG")]
	config: Option<PathBuf>,

	/// Log level or filter directive
	#[arg(long)]
	log_level: Option<String>,

	/// Emit JSON log lines
	#[arg(long)]
	log_json: bool,

	/// Regular expression selecting the interfaces to manage
	#[arg(short, long)]
	interface_filter: Option<String>,

	/// Signaling backend URL, may be repeated
	#[arg(short, long = "backend")]
	backends: Vec<String>,

	/// Seconds between status log lines, 0 disables them
	#[arg(long, default_value_t = 0)]
	status_interval: u64,
}

impl Args {
	fn overrides(&self) -> MeshConfigLayer {
		MeshConfigLayer {
			watcher: Some(WatcherConfigLayer {
				interface_filter: self.interface_filter.clone(),
				..Default::default()
			}),
			signaling: Some(SignalingConfigLayer {
				backends: (!self.backends.is_empty()).then(|| self.backends.clone()),
			}),
			logging: Some(LoggingConfigLayer {
				level: self.log_level.clone(),
				json: self.log_json.then_some(true),
			}),
			..Default::default()
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let config = load_config(args.config.clone(), args.overrides()).context("failed to load configuration")?;
	init_tracing(&config.logging).context("failed to initialize logging")?;

	tracing::info!(
		interface_filter = %config.watcher.interface_filter,
		backends = ?config.signaling.backends,
		"starting loom-mesh"
	);

	let components = Components::from_config(&config).context("failed to set up components")?;
	let daemon = MeshDaemon::new(&config, components)
		.await
		.context("failed to start mesh daemon")?;

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	tokio::spawn(async move {
		wait_for_signal().await;
		tracing::info!("received shutdown signal");
		let _ = shutdown_tx.send(true);
	});

	let status_interval = (args.status_interval > 0).then(|| Duration::from_secs(args.status_interval));
	daemon.run(shutdown_rx, status_interval).await.context("mesh daemon failed")?;
	Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
	use tokio::signal::unix::{signal, SignalKind};

	match signal(SignalKind::terminate()) {
		Ok(mut sigterm) => {
			tokio::select! {
				_ = tokio::signal::ctrl_c() => {}
				_ = sigterm.recv() => {}
			}
		}
		Err(e) => {
			tracing::warn!(error = %e, "failed to install SIGTERM handler");
			let _ = tokio::signal::ctrl_c().await;
		}
	}
}

#[cfg(not(unix))]
async fn wait_for_signal() {
	let _ = tokio::signal::ctrl_c().await;
}
