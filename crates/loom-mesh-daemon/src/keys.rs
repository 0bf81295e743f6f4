// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use loom_mesh_common::WgPrivateKey;
use loom_mesh_device::{DeviceConfig, WireGuardClient};
use loom_mesh_epdisc::AsyncEventHandler;
use loom_mesh_watcher::Event;
use std::sync::Arc;
use tracing::{info, warn};

/// Also read from the file named by `LOOM_MESH_PRIVATE_KEY_FILE`.
pub const PRIVATE_KEY_ENV: &str = "LOOM_MESH_PRIVATE_KEY";

/// Gives interfaces without a private key the configured one.
///
/// The following sync reports the change like any other key rotation.
pub struct KeyAssigner {
	client: Arc<dyn WireGuardClient>,
	private_key: WgPrivateKey,
}

impl KeyAssigner {
	pub fn new(client: Arc<dyn WireGuardClient>, private_key: WgPrivateKey) -> Self {
		Self { client, private_key }
	}
}

#[async_trait]
impl AsyncEventHandler for KeyAssigner {
	async fn handle_event(&self, event: &Event) {
		let Event::InterfaceAdded(intf) = event else {
			return;
		};
		if intf.private_key.is_set() {
			return;
		}

		let config = DeviceConfig::new().with_private_key(self.private_key.clone());
		match self.client.configure_device(&intf.name, config).await {
			Ok(()) => info!(intf = %intf.name, public_key = %self.private_key.public_key(), "assigned private key"),
			Err(e) => warn!(intf = %intf.name, error = %e, "failed to assign private key"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_mesh_device::{InterfaceType, MemoryWireGuard};

	#[tokio::test]
	async fn only_keyless_interfaces_get_the_key() {
		let client = Arc::new(MemoryWireGuard::new());
		let keyless = client
			.add_device("wg0", InterfaceType::Kernel, WgPrivateKey::from_bytes([0u8; 32]), 0)
			.await
			.unwrap();
		let own = WgPrivateKey::generate();
		let keyed = client
			.add_device("wg1", InterfaceType::Kernel, own.clone(), 0)
			.await
			.unwrap();

		let key = WgPrivateKey::generate();
		let assigner = KeyAssigner::new(client.clone(), key.clone());
		assigner.handle_event(&Event::InterfaceAdded(keyless)).await;
		assigner.handle_event(&Event::InterfaceAdded(keyed)).await;

		assert_eq!(client.get_device("wg0").await.unwrap().public_key, key.public_key());
		assert_eq!(client.get_device("wg1").await.unwrap().public_key, own.public_key());
	}
}
