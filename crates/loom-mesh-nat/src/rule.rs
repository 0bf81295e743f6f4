// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_mesh_conn::STUN_MAGIC_COOKIE;
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// The filter hook a chain attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
	Input,
	Output,
}

impl Hook {
	pub fn as_str(&self) -> &'static str {
		match self {
			Hook::Input => "input",
			Hook::Output => "output",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Chain {
	pub name: &'static str,
	pub hook: Hook,
}

pub const INGRESS: Chain = Chain {
	name: "ingress",
	hook: Hook::Input,
};

pub const EGRESS: Chain = Chain {
	name: "egress",
	hook: Hook::Output,
};

/// A stateless port rewrite. Both kinds skip connection tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
	/// Sends non-STUN datagrams arriving on the mux port to WireGuard.
	RedirectNonStun { mux_port: u16, listen_port: u16 },
	/// Makes WireGuard's datagrams to `remote` leave from the candidate port.
	MasqueradeSource {
		listen_port: u16,
		remote: SocketAddr,
		candidate_port: u16,
	},
}

impl Rule {
	pub fn chain(&self) -> &'static Chain {
		match self {
			Rule::RedirectNonStun { .. } => &INGRESS,
			Rule::MasqueradeSource { .. } => &EGRESS,
		}
	}

	/// The rule in `nft` syntax. `@th,96,32` is the STUN magic cookie
	/// position: UDP header plus four bytes into the STUN header.
	pub fn to_nft(&self) -> String {
		match self {
			Rule::RedirectNonStun {
				mux_port,
				listen_port,
			} => format!(
				"udp dport {} @th,96,32 != {:#010x} notrack udp dport set {}",
				mux_port, STUN_MAGIC_COOKIE, listen_port
			),
			Rule::MasqueradeSource {
				listen_port,
				remote,
				candidate_port,
			} => {
				let family = match remote.ip() {
					IpAddr::V4(_) => "ip",
					IpAddr::V6(_) => "ip6",
				};
				format!(
					"{} daddr {} udp sport {} udp dport {} notrack udp sport set {}",
					family,
					remote.ip(),
					listen_port,
					remote.port(),
					candidate_port
				)
			}
		}
	}
}

impl fmt::Display for Rule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_nft())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn redirect_matches_everything_but_stun() {
		let rule = Rule::RedirectNonStun {
			mux_port: 40000,
			listen_port: 51820,
		};
		assert_eq!(
			rule.to_nft(),
			"udp dport 40000 @th,96,32 != 0x2112a442 notrack udp dport set 51820"
		);
		assert_eq!(rule.chain(), &INGRESS);
		assert_eq!(INGRESS.hook.as_str(), "input");
	}

	#[test]
	fn masquerade_is_scoped_to_remote() {
		let rule = Rule::MasqueradeSource {
			listen_port: 51820,
			remote: "198.51.100.4:33000".parse().unwrap(),
			candidate_port: 40000,
		};
		assert_eq!(
			rule.to_nft(),
			"ip daddr 198.51.100.4 udp sport 51820 udp dport 33000 notrack udp sport set 40000"
		);
		assert_eq!(rule.chain().hook, Hook::Output);
	}

	#[test]
	fn masquerade_uses_ip6_for_v6_remotes() {
		let rule = Rule::MasqueradeSource {
			listen_port: 51820,
			remote: "[2001:db8::1]:33000".parse().unwrap(),
			candidate_port: 40000,
		};
		assert!(rule.to_nft().starts_with("ip6 daddr 2001:db8::1 "));
	}
}
