// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared types for the loom mesh: WireGuard keys, signaling messages,
//! engine connection states and the datagram connection contract.
//!
//! # Example
//!
//! ```ignore
//! use loom_mesh_common::{KeyPair, WgKeyPair};
//!
//! let a = WgKeyPair::generate();
//! let b = WgKeyPair::generate();
//! let kp = KeyPair::new(a.private_key().clone(), *b.public_key());
//! assert_eq!(kp.public().is_controlling(), !kp.public().reversed().is_controlling());
//! ```

pub mod conn;
pub mod keys;
pub mod keys_file;
pub mod message;
pub mod state;

pub use conn::PacketConn;
pub use keys::{
	link_local_v4, link_local_v6, KeyError, KeyPair, PublicKeyPair, WgKeyPair, WgPrivateKey,
	WgPublicKey, KEY_LENGTH,
};
pub use keys_file::{
	default_config_dir, load_key_env, load_key_from_file, save_key_to_file, KeyFileError,
};
pub use message::{
	Candidate, CandidateType, Credentials, Message, NetworkType, PeerDescription,
	PeerDescriptionChange, RelatedAddress, RelayProtocol, TcpType,
};
pub use state::{AtomicConnectionState, ConnectionState};
