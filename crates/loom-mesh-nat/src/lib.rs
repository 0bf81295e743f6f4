// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Stateless port rewriting for kernel WireGuard peers.
//!
//! A kernel WireGuard device owns its listen port, so ICE runs on separate mux
//! sockets. Two kinds of rules join them back together:
//!
//! - non-STUN datagrams reaching a mux port are redirected to the listen port
//! - WireGuard's datagrams to a selected remote leave from the candidate port
//!
//! ```ignore
//! let nat = Nat::new(Arc::new(NftFilter::new()), "wg0").await?;
//! let redirect = nat.redirect_non_stun(mux.port(), 51820).await?;
//! ```

pub mod error;
pub mod filter;
pub mod nat;
pub mod rule;

pub use error::{NatError, Result};
pub use filter::{parse_handle, MemoryFilter, NftFilter, PacketFilter};
pub use nat::{table_name, Nat, NatRule};
pub use rule::{Chain, Hook, Rule, EGRESS, INGRESS};
