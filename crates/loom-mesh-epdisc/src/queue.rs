// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use loom_mesh_watcher::{Event, EventHandler};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Handles watcher events on its own task.
#[async_trait]
pub trait AsyncEventHandler: Send + Sync {
	async fn handle_event(&self, event: &Event);
}

enum Item {
	Event(Event),
	Flush(oneshot::Sender<()>),
	Stop,
}

/// Moves events off the watcher's synchronous dispatch and hands them to
/// an [`AsyncEventHandler`] one at a time, in arrival order.
pub struct EventQueue {
	tx: mpsc::UnboundedSender<Item>,
	task: StdMutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
	pub fn spawn(handler: Arc<dyn AsyncEventHandler>) -> Arc<Self> {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let task = tokio::spawn(async move {
			while let Some(item) = rx.recv().await {
				match item {
					Item::Event(event) => {
						trace!(kind = event.kind(), intf = event.interface_name(), "handling event");
						handler.handle_event(&event).await;
					}
					Item::Flush(done) => {
						let _ = done.send(());
					}
					Item::Stop => break,
				}
			}
			debug!("event queue stopped");
		});

		Arc::new(Self {
			tx,
			task: StdMutex::new(Some(task)),
		})
	}

	/// Waits until every event queued so far has been handled.
	pub async fn settled(&self) {
		let (done_tx, done_rx) = oneshot::channel();
		if self.tx.send(Item::Flush(done_tx)).is_ok() {
			let _ = done_rx.await;
		}
	}

	/// Handles what is queued, then stops.
	pub async fn close(&self) {
		let _ = self.tx.send(Item::Stop);
		let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
		if let Some(task) = task {
			let _ = task.await;
		}
	}
}

impl EventHandler for EventQueue {
	fn on_event(&self, event: &Event) {
		if self.tx.send(Item::Event(event.clone())).is_err() {
			trace!(kind = event.kind(), "event queue closed, dropping event");
		}
	}
}
