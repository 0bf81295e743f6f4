// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Sources that request an immediate sync.

use crate::error::Result;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Follows `ip monitor link` and triggers on every reported change.
pub async fn monitor_links(
	ip_binary: String,
	trigger: mpsc::Sender<()>,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	let mut child = match Command::new(&ip_binary)
		.args(["monitor", "link"])
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::null())
		.kill_on_drop(true)
		.spawn()
	{
		Ok(child) => child,
		Err(e) => {
			warn!(error = %e, "link notifications unavailable");
			return;
		}
	};

	let Some(stdout) = child.stdout.take() else {
		return;
	};
	let mut lines = BufReader::new(stdout).lines();

	loop {
		tokio::select! {
			biased;

			_ = shutdown_rx.changed() => {
				debug!("link monitor stopped");
				break;
			}

			line = lines.next_line() => {
				match line {
					Ok(Some(line)) => {
						trace!(%line, "link change");
						let _ = trigger.try_send(());
					}
					Ok(None) => {
						warn!("link monitor exited");
						break;
					}
					Err(e) => {
						warn!(error = %e, "failed to read link monitor output");
						break;
					}
				}
			}
		}
	}

	let _ = child.kill().await;
}

/// Watches the userspace control-socket directory for sockets appearing or
/// disappearing.
///
/// The returned watcher must be kept alive.
pub fn watch_socket_dir(dir: &Path, trigger: mpsc::Sender<()>) -> Result<RecommendedWatcher> {
	let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
		Ok(event) => {
			if matches!(event.kind, EventKind::Create(_) | EventKind::Remove(_)) {
				let is_socket = event
					.paths
					.iter()
					.any(|p| p.extension().is_some_and(|ext| ext == "sock"));
				if is_socket {
					let _ = trigger.try_send(());
				}
			}
		}
		Err(e) => warn!(error = %e, "socket directory watch error"),
	})?;

	watcher.watch(dir, RecursiveMode::NonRecursive)?;
	debug!(dir = %dir.display(), "watching userspace socket directory");
	Ok(watcher)
}
