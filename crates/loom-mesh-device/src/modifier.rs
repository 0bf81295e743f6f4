// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

macro_rules! modifier_set {
	(
		$(#[$meta:meta])*
		$name:ident { $($flag:ident = $bit:expr => $label:literal,)* }
	) => {
		$(#[$meta])*
		#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
		pub struct $name(u32);

		impl $name {
			pub const NONE: $name = $name(0);
			$(pub const $flag: $name = $name(1 << $bit);)*

			const ALL: &'static [($name, &'static str)] = &[$(($name::$flag, $label),)*];

			pub fn bits(&self) -> u32 {
				self.0
			}

			pub fn is_empty(&self) -> bool {
				self.0 == 0
			}

			pub fn contains(&self, other: $name) -> bool {
				other.0 != 0 && self.0 & other.0 == other.0
			}

			pub fn insert(&mut self, other: $name) {
				self.0 |= other.0;
			}

			/// Names of the set flags, in declaration order.
			pub fn names(&self) -> Vec<&'static str> {
				Self::ALL
					.iter()
					.filter(|(flag, _)| self.contains(*flag))
					.map(|(_, label)| *label)
					.collect()
			}
		}

		impl BitOr for $name {
			type Output = $name;

			fn bitor(self, rhs: $name) -> $name {
				$name(self.0 | rhs.0)
			}
		}

		impl BitOrAssign for $name {
			fn bitor_assign(&mut self, rhs: $name) {
				self.0 |= rhs.0;
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				if self.is_empty() {
					return f.write_str("none");
				}
				f.write_str(&self.names().join("|"))
			}
		}

		impl fmt::Debug for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}({})", stringify!($name), self)
			}
		}
	};
}

modifier_set! {
	/// Interface attributes that changed between two snapshots.
	InterfaceModifier {
		NAME = 0 => "name",
		TYPE = 1 => "type",
		PRIVATE_KEY = 2 => "private-key",
		LISTEN_PORT = 3 => "listen-port",
		FIREWALL_MARK = 4 => "firewall-mark",
		PEERS = 5 => "peers",
	}
}

modifier_set! {
	/// Peer attributes that changed between two snapshots.
	PeerModifier {
		PRESHARED_KEY = 0 => "preshared-key",
		ENDPOINT = 1 => "endpoint",
		KEEPALIVE_INTERVAL = 2 => "keepalive-interval",
		HANDSHAKE_TIME = 3 => "handshake-time",
		RECEIVE_BYTES = 4 => "receive-bytes",
		TRANSMIT_BYTES = 5 => "transmit-bytes",
		ALLOWED_IPS = 6 => "allowed-ips",
		PROTOCOL_VERSION = 7 => "protocol-version",
		NAME = 8 => "name",
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_set_displays_none() {
		assert_eq!(InterfaceModifier::NONE.to_string(), "none");
		assert!(PeerModifier::default().is_empty());
	}

	#[test]
	fn combined_flags_display_in_order() {
		let mods = PeerModifier::ALLOWED_IPS | PeerModifier::ENDPOINT;
		assert_eq!(mods.to_string(), "endpoint|allowed-ips");
		assert!(mods.contains(PeerModifier::ENDPOINT));
		assert!(!mods.contains(PeerModifier::NAME));
		assert!(!mods.contains(PeerModifier::NONE));
	}

	#[test]
	fn insert_accumulates() {
		let mut mods = InterfaceModifier::NONE;
		mods.insert(InterfaceModifier::LISTEN_PORT);
		mods |= InterfaceModifier::PRIVATE_KEY;
		assert_eq!(mods.bits(), (1 << 2) | (1 << 3));
		assert_eq!(mods.names(), vec!["private-key", "listen-port"]);
	}
}
