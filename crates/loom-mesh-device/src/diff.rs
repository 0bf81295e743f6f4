// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Three-way diffs between device snapshots.

use crate::modifier::{InterfaceModifier, PeerModifier};
use crate::snapshot::{InterfaceSnapshot, PeerSnapshot};
use ipnet::IpNet;
use std::collections::BTreeMap;

/// Items only in `new`, only in `old`, and in both as `(old, new)`.
///
/// Each list is sorted by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<T> {
	pub added: Vec<T>,
	pub removed: Vec<T>,
	pub kept: Vec<(T, T)>,
}

impl<T> SetDiff<T> {
	pub fn is_empty(&self) -> bool {
		self.added.is_empty() && self.removed.is_empty()
	}
}

pub fn diff_by_key<T, K, F>(old: &[T], new: &[T], key: F) -> SetDiff<T>
where
	T: Clone,
	K: Ord,
	F: Fn(&T) -> K,
{
	let old_map: BTreeMap<K, &T> = old.iter().map(|t| (key(t), t)).collect();
	let new_map: BTreeMap<K, &T> = new.iter().map(|t| (key(t), t)).collect();

	let mut diff = SetDiff {
		added: Vec::new(),
		removed: Vec::new(),
		kept: Vec::new(),
	};

	for (k, n) in &new_map {
		match old_map.get(k) {
			Some(o) => diff.kept.push(((*o).clone(), (*n).clone())),
			None => diff.added.push((*n).clone()),
		}
	}
	for (k, o) in &old_map {
		if !new_map.contains_key(k) {
			diff.removed.push((*o).clone());
		}
	}

	diff
}

pub fn diff_interfaces(old: &[InterfaceSnapshot], new: &[InterfaceSnapshot]) -> SetDiff<InterfaceSnapshot> {
	diff_by_key(old, new, |i| i.name.clone())
}

pub fn diff_peers(old: &[PeerSnapshot], new: &[PeerSnapshot]) -> SetDiff<PeerSnapshot> {
	diff_by_key(old, new, |p| p.public_key)
}

/// Interface-level modifier bits between `old` and `new`.
///
/// `PEERS` is set when the peer set differs by membership.
pub fn interface_modifier(old: &InterfaceSnapshot, new: &InterfaceSnapshot) -> InterfaceModifier {
	let mut mods = InterfaceModifier::NONE;
	if old.name != new.name {
		mods |= InterfaceModifier::NAME;
	}
	if old.interface_type != new.interface_type {
		mods |= InterfaceModifier::TYPE;
	}
	if old.private_key.expose_bytes() != new.private_key.expose_bytes() {
		mods |= InterfaceModifier::PRIVATE_KEY;
	}
	if old.listen_port != new.listen_port {
		mods |= InterfaceModifier::LISTEN_PORT;
	}
	if old.firewall_mark != new.firewall_mark {
		mods |= InterfaceModifier::FIREWALL_MARK;
	}
	if !diff_peers(&old.peers, &new.peers).is_empty() {
		mods |= InterfaceModifier::PEERS;
	}
	mods
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerDiff {
	pub modified: PeerModifier,
	pub ips_added: Vec<IpNet>,
	pub ips_removed: Vec<IpNet>,
}

pub fn peer_diff(old: &PeerSnapshot, new: &PeerSnapshot) -> PeerDiff {
	let mut mods = PeerModifier::NONE;
	if old.preshared_key != new.preshared_key {
		mods |= PeerModifier::PRESHARED_KEY;
	}
	if old.endpoint != new.endpoint {
		mods |= PeerModifier::ENDPOINT;
	}
	if old.persistent_keepalive != new.persistent_keepalive {
		mods |= PeerModifier::KEEPALIVE_INTERVAL;
	}
	if old.last_handshake != new.last_handshake {
		mods |= PeerModifier::HANDSHAKE_TIME;
	}
	if old.rx_bytes != new.rx_bytes {
		mods |= PeerModifier::RECEIVE_BYTES;
	}
	if old.tx_bytes != new.tx_bytes {
		mods |= PeerModifier::TRANSMIT_BYTES;
	}
	if old.protocol_version != new.protocol_version {
		mods |= PeerModifier::PROTOCOL_VERSION;
	}
	if old.name != new.name {
		mods |= PeerModifier::NAME;
	}

	let ips = diff_by_key(&old.allowed_ips, &new.allowed_ips, |n| *n);
	if !ips.is_empty() {
		mods |= PeerModifier::ALLOWED_IPS;
	}

	PeerDiff {
		modified: mods,
		ips_added: ips.added,
		ips_removed: ips.removed,
	}
}
