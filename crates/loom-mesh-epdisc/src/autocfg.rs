// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Assigns the key-derived link-local addresses to watched interfaces.

use crate::queue::AsyncEventHandler;
use async_trait::async_trait;
use ipnet::IpNet;
use loom_mesh_common::WgPublicKey;
use loom_mesh_device::{DeviceError, InterfaceModifier, WireGuardClient};
use loom_mesh_watcher::Event;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct AddressConfigurator {
	client: Arc<dyn WireGuardClient>,
}

fn addresses_of(public_key: &WgPublicKey) -> [IpNet; 2] {
	[public_key.ipv4_address(), public_key.ipv6_address()]
}

impl AddressConfigurator {
	pub fn new(client: Arc<dyn WireGuardClient>) -> Self {
		Self { client }
	}

	async fn add(&self, name: &str, public_key: &WgPublicKey) {
		for addr in addresses_of(public_key) {
			match self.client.add_address(name, addr).await {
				Ok(()) => info!(intf = name, %addr, "assigned link-local address"),
				Err(DeviceError::AlreadyExists(_)) => debug!(intf = name, %addr, "address already assigned"),
				Err(e) => warn!(intf = name, %addr, error = %e, "failed to assign address"),
			}
		}
	}

	async fn delete(&self, name: &str, public_key: &WgPublicKey) {
		for addr in addresses_of(public_key) {
			if let Err(e) = self.client.delete_address(name, addr).await {
				debug!(intf = name, %addr, error = %e, "failed to remove address");
			}
		}
	}
}

#[async_trait]
impl AsyncEventHandler for AddressConfigurator {
	async fn handle_event(&self, event: &Event) {
		match event {
			Event::InterfaceAdded(intf) if intf.public_key.is_set() => {
				self.add(&intf.name, &intf.public_key).await;
			}
			Event::InterfaceModified {
				interface,
				old,
				modified,
			} if modified.contains(InterfaceModifier::PRIVATE_KEY) => {
				if old.public_key.is_set() {
					self.delete(&interface.name, &old.public_key).await;
				}
				if interface.public_key.is_set() {
					self.add(&interface.name, &interface.public_key).await;
				}
			}
			_ => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_mesh_common::WgPrivateKey;
	use loom_mesh_device::{InterfaceType, MemoryWireGuard};

	#[tokio::test]
	async fn added_interface_gets_both_addresses() {
		let client = Arc::new(MemoryWireGuard::new());
		let snapshot = client
			.add_device("wg0", InterfaceType::Kernel, WgPrivateKey::generate(), 51820)
			.await
			.unwrap();
		let autocfg = AddressConfigurator::new(client.clone());

		autocfg.handle_event(&Event::InterfaceAdded(snapshot.clone())).await;
		autocfg.handle_event(&Event::InterfaceAdded(snapshot.clone())).await;

		let addrs = client.addresses("wg0").await.unwrap();
		assert_eq!(addrs.len(), 2);
		assert!(addrs.contains(&snapshot.public_key.ipv4_address()));
		assert!(addrs.contains(&snapshot.public_key.ipv6_address()));
	}

	#[tokio::test]
	async fn key_change_swaps_addresses() {
		let client = Arc::new(MemoryWireGuard::new());
		let old = client
			.add_device("wg0", InterfaceType::Kernel, WgPrivateKey::generate(), 51820)
			.await
			.unwrap();
		let autocfg = AddressConfigurator::new(client.clone());
		autocfg.handle_event(&Event::InterfaceAdded(old.clone())).await;

		let mut new = old.clone();
		let key = WgPrivateKey::generate();
		new.public_key = key.public_key();
		new.private_key = key;
		autocfg
			.handle_event(&Event::InterfaceModified {
				interface: new.clone(),
				old: old.clone(),
				modified: InterfaceModifier::PRIVATE_KEY,
			})
			.await;

		let addrs = client.addresses("wg0").await.unwrap();
		assert_eq!(addrs.len(), 2);
		assert!(addrs.contains(&new.public_key.ipv4_address()));
		assert!(!addrs.contains(&old.public_key.ipv4_address()));
		assert!(!addrs.contains(&old.public_key.ipv6_address()));
	}

	#[test]
	fn unset_key_assigns_nothing() {
		let client = Arc::new(MemoryWireGuard::new());
		let autocfg = AddressConfigurator::new(client.clone());
		let addrs = tokio_test::block_on(async {
			let snapshot = client
				.add_device("wg0", InterfaceType::Kernel, WgPrivateKey::from_bytes([0u8; 32]), 0)
				.await
				.unwrap();
			autocfg.handle_event(&Event::InterfaceAdded(snapshot)).await;
			client.addresses("wg0").await.unwrap()
		});
		assert!(addrs.is_empty());
	}

	#[tokio::test]
	async fn listen_port_change_leaves_addresses() {
		let client = Arc::new(MemoryWireGuard::new());
		let old = client
			.add_device("wg0", InterfaceType::Kernel, WgPrivateKey::generate(), 51820)
			.await
			.unwrap();
		let autocfg = AddressConfigurator::new(client.clone());
		autocfg.handle_event(&Event::InterfaceAdded(old.clone())).await;

		let mut new = old.clone();
		new.listen_port = 51821;
		autocfg
			.handle_event(&Event::InterfaceModified {
				interface: new,
				old,
				modified: InterfaceModifier::LISTEN_PORT,
			})
			.await;
		assert_eq!(client.addresses("wg0").await.unwrap().len(), 2);
	}
}
