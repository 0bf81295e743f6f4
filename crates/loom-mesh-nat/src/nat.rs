// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use crate::filter::PacketFilter;
use crate::rule::{Rule, EGRESS, INGRESS};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// The rule table owned by one WireGuard interface.
pub struct Nat {
	filter: Arc<dyn PacketFilter>,
	table: String,
	degraded: AtomicBool,
}

impl Nat {
	/// Creates the interface's table with both chains, removing leftovers
	/// from a previous run.
	#[instrument(skip(filter), fields(filter = filter.kind()))]
	pub async fn new(filter: Arc<dyn PacketFilter>, interface: &str) -> Result<Self> {
		let table = table_name(interface);
		filter.create_table(&table).await?;
		filter.add_chain(&table, &INGRESS).await?;
		filter.add_chain(&table, &EGRESS).await?;
		debug!(%table, "created NAT table");
		Ok(Self {
			filter,
			table,
			degraded: AtomicBool::new(false),
		})
	}

	pub fn table(&self) -> &str {
		&self.table
	}

	/// Marks the ingress redirects as incomplete. Source rewrites are of no
	/// use then and peers must be relayed in userspace.
	pub fn set_degraded(&self, degraded: bool) {
		self.degraded.store(degraded, Ordering::Release);
	}

	pub fn is_degraded(&self) -> bool {
		self.degraded.load(Ordering::Acquire)
	}

	/// Redirects non-STUN traffic arriving on a mux port to WireGuard.
	pub async fn redirect_non_stun(&self, mux_port: u16, listen_port: u16) -> Result<NatRule> {
		self.install(Rule::RedirectNonStun {
			mux_port,
			listen_port,
		})
		.await
	}

	/// Rewrites WireGuard's source port towards `remote` to the candidate port.
	pub async fn masquerade_source(
		&self,
		listen_port: u16,
		remote: SocketAddr,
		candidate_port: u16,
	) -> Result<NatRule> {
		self.install(Rule::MasqueradeSource {
			listen_port,
			remote,
			candidate_port,
		})
		.await
	}

	async fn install(&self, rule: Rule) -> Result<NatRule> {
		let handle = self.filter.add_rule(&self.table, &rule).await?;
		debug!(table = %self.table, handle, %rule, "installed NAT rule");
		Ok(NatRule {
			filter: Arc::clone(&self.filter),
			table: self.table.clone(),
			handle,
			rule,
			deleted: AtomicBool::new(false),
		})
	}

	/// Removes the table and every rule in it.
	pub async fn close(&self) -> Result<()> {
		self.filter.delete_table(&self.table).await
	}
}

impl fmt::Debug for Nat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Nat")
			.field("table", &self.table)
			.field("filter", &self.filter.kind())
			.field("degraded", &self.is_degraded())
			.finish()
	}
}

pub fn table_name(interface: &str) -> String {
	format!("mesh-{}", interface)
}

/// An installed rule. Dropping it removes the rule in the background.
pub struct NatRule {
	filter: Arc<dyn PacketFilter>,
	table: String,
	handle: u64,
	rule: Rule,
	deleted: AtomicBool,
}

impl NatRule {
	pub fn rule(&self) -> &Rule {
		&self.rule
	}

	pub fn handle(&self) -> u64 {
		self.handle
	}

	pub async fn delete(&self) -> Result<()> {
		if self.deleted.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		self.filter
			.delete_rule(&self.table, self.rule.chain(), self.handle)
			.await
	}
}

impl fmt::Debug for NatRule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("NatRule")
			.field("table", &self.table)
			.field("handle", &self.handle)
			.field("rule", &self.rule)
			.finish()
	}
}

impl Drop for NatRule {
	fn drop(&mut self) {
		if self.deleted.swap(true, Ordering::AcqRel) {
			return;
		}
		let Ok(runtime) = tokio::runtime::Handle::try_current() else {
			warn!(table = %self.table, handle = self.handle, "no runtime to remove NAT rule");
			return;
		};
		let filter = Arc::clone(&self.filter);
		let table = self.table.clone();
		let chain = self.rule.chain();
		let handle = self.handle;
		runtime.spawn(async move {
			// The table may already be gone with its interface.
			if let Err(e) = filter.delete_rule(&table, chain, handle).await {
				debug!(%table, handle, error = %e, "NAT rule cleanup failed");
			}
		});
	}
}
