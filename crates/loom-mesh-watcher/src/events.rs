// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::IpNet;
use loom_mesh_common::{ConnectionState, WgPublicKey};
use loom_mesh_device::{InterfaceModifier, InterfaceSnapshot, PeerModifier, PeerSnapshot};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A change observed on a WireGuard interface or one of its peers.
#[derive(Debug, Clone)]
pub enum Event {
	InterfaceAdded(InterfaceSnapshot),
	InterfaceRemoved(InterfaceSnapshot),
	InterfaceModified {
		interface: InterfaceSnapshot,
		old: InterfaceSnapshot,
		modified: InterfaceModifier,
	},
	PeerAdded {
		interface: String,
		peer: PeerSnapshot,
	},
	PeerRemoved {
		interface: String,
		peer: PeerSnapshot,
	},
	PeerModified {
		interface: String,
		peer: PeerSnapshot,
		old: PeerSnapshot,
		modified: PeerModifier,
		ips_added: Vec<IpNet>,
		ips_removed: Vec<IpNet>,
	},
	PeerStateChanged {
		interface: String,
		peer: WgPublicKey,
		new_state: ConnectionState,
		prev_state: ConnectionState,
	},
}

impl Event {
	pub fn interface_name(&self) -> &str {
		match self {
			Event::InterfaceAdded(i) | Event::InterfaceRemoved(i) => &i.name,
			Event::InterfaceModified { interface, .. } => &interface.name,
			Event::PeerAdded { interface, .. }
			| Event::PeerRemoved { interface, .. }
			| Event::PeerModified { interface, .. }
			| Event::PeerStateChanged { interface, .. } => interface,
		}
	}

	pub fn is_peer_event(&self) -> bool {
		matches!(
			self,
			Event::PeerAdded { .. }
				| Event::PeerRemoved { .. }
				| Event::PeerModified { .. }
				| Event::PeerStateChanged { .. }
		)
	}

	pub fn kind(&self) -> &'static str {
		match self {
			Event::InterfaceAdded(_) => "interface_added",
			Event::InterfaceRemoved(_) => "interface_removed",
			Event::InterfaceModified { .. } => "interface_modified",
			Event::PeerAdded { .. } => "peer_added",
			Event::PeerRemoved { .. } => "peer_removed",
			Event::PeerModified { .. } => "peer_modified",
			Event::PeerStateChanged { .. } => "peer_state_changed",
		}
	}
}

/// Receives events synchronously. Implementations must not block.
pub trait EventHandler: Send + Sync {
	fn on_event(&self, event: &Event);
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
	lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
	lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Handler lists for interface events and per-interface peer events.
#[derive(Default)]
pub struct Handlers {
	all: RwLock<Vec<Arc<dyn EventHandler>>>,
	interface: RwLock<Vec<Arc<dyn EventHandler>>>,
	peer: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl Handlers {
	pub fn new() -> Self {
		Self::default()
	}

	/// Interface events, plus peer events of every interface added afterwards.
	pub fn on_all(&self, handler: Arc<dyn EventHandler>) {
		write(&self.all).push(handler);
	}

	/// Interface events only.
	pub fn on_interface(&self, handler: Arc<dyn EventHandler>) {
		write(&self.interface).push(handler);
	}

	/// Peer events of one interface.
	pub fn on_peer(&self, interface: &str, handler: Arc<dyn EventHandler>) {
		write(&self.peer)
			.entry(interface.to_string())
			.or_default()
			.push(handler);
	}

	pub fn dispatch(&self, event: &Event) {
		if let Event::InterfaceAdded(intf) = event {
			let all = read(&self.all).clone();
			write(&self.peer)
				.entry(intf.name.clone())
				.or_default()
				.extend(all);
		}

		if event.is_peer_event() {
			let handlers = read(&self.peer)
				.get(event.interface_name())
				.cloned()
				.unwrap_or_default();
			for handler in handlers {
				handler.on_event(event);
			}
		} else {
			let handlers: Vec<_> = read(&self.all)
				.iter()
				.chain(read(&self.interface).iter())
				.cloned()
				.collect();
			for handler in handlers {
				handler.on_event(event);
			}
		}

		if let Event::InterfaceRemoved(intf) = event {
			write(&self.peer).remove(&intf.name);
		}
	}
}

impl EventHandler for Handlers {
	fn on_event(&self, event: &Event) {
		self.dispatch(event);
	}
}
