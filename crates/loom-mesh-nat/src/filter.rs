// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{NatError, Result};
use crate::rule::{Chain, Rule};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, trace};

const FAMILY: &str = "inet";

/// Packet filter able to hold the mesh's port rewriting rules.
#[async_trait]
pub trait PacketFilter: Send + Sync {
	/// Creates `table`, replacing any leftover table of the same name.
	async fn create_table(&self, table: &str) -> Result<()>;

	/// Adds a chain on its hook at raw priority.
	async fn add_chain(&self, table: &str, chain: &Chain) -> Result<()>;

	/// Installs a rule and returns its handle.
	async fn add_rule(&self, table: &str, rule: &Rule) -> Result<u64>;

	async fn delete_rule(&self, table: &str, chain: &Chain, handle: u64) -> Result<()>;

	/// Removes the table with all of its chains and rules.
	async fn delete_table(&self, table: &str) -> Result<()>;

	fn kind(&self) -> &'static str;
}

/// Drives nftables through the `nft(8)` command.
pub struct NftFilter {
	binary: String,
}

impl NftFilter {
	pub fn new() -> Self {
		Self {
			binary: "nft".to_string(),
		}
	}

	pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
		self.binary = binary.into();
		self
	}

	async fn nft(&self, args: &[&str]) -> Result<String> {
		trace!(binary = %self.binary, ?args, "running nft");
		let output = Command::new(&self.binary)
			.args(args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.output()
			.await?;

		if !output.status.success() {
			return Err(NatError::Command {
				command: format!("{} {}", self.binary, args.join(" ")),
				stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			});
		}
		Ok(String::from_utf8_lossy(&output.stdout).into_owned())
	}
}

impl Default for NftFilter {
	fn default() -> Self {
		Self::new()
	}
}

/// Extracts the handle from `nft --echo --handle` output.
pub fn parse_handle(output: &str) -> Option<u64> {
	output
		.lines()
		.filter_map(|line| line.rsplit_once("# handle "))
		.find_map(|(_, handle)| handle.trim().parse().ok())
}

#[async_trait]
impl PacketFilter for NftFilter {
	async fn create_table(&self, table: &str) -> Result<()> {
		if self.nft(&["delete", "table", FAMILY, table]).await.is_ok() {
			debug!(table, "removed stale table");
		}
		self.nft(&["add", "table", FAMILY, table]).await?;
		Ok(())
	}

	async fn add_chain(&self, table: &str, chain: &Chain) -> Result<()> {
		let definition = format!("{{ type filter hook {} priority raw ; }}", chain.hook.as_str());
		self.nft(&["add", "chain", FAMILY, table, chain.name, &definition]).await?;
		Ok(())
	}

	async fn add_rule(&self, table: &str, rule: &Rule) -> Result<u64> {
		let expr = rule.to_nft();
		let output = self
			.nft(&["--echo", "--handle", "add", "rule", FAMILY, table, rule.chain().name, &expr])
			.await
			.map_err(|e| NatError::RuleInstall(e.to_string()))?;
		parse_handle(&output).ok_or_else(|| NatError::RuleInstall(format!("no handle in nft output for `{}`", expr)))
	}

	async fn delete_rule(&self, table: &str, chain: &Chain, handle: u64) -> Result<()> {
		let handle = handle.to_string();
		self.nft(&["delete", "rule", FAMILY, table, chain.name, "handle", &handle])
			.await?;
		Ok(())
	}

	async fn delete_table(&self, table: &str) -> Result<()> {
		self.nft(&["delete", "table", FAMILY, table]).await?;
		Ok(())
	}

	fn kind(&self) -> &'static str {
		"nftables"
	}
}

#[derive(Default)]
struct MemoryTable {
	chains: HashMap<&'static str, Vec<(u64, Rule)>>,
}

/// Filter kept in memory, for tests and hosts without nftables.
#[derive(Default)]
pub struct MemoryFilter {
	tables: Mutex<HashMap<String, MemoryTable>>,
	next_handle: AtomicU64,
	reject_rules: AtomicBool,
}

impl MemoryFilter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Makes every subsequent `add_rule` fail.
	pub fn reject_rules(&self, reject: bool) {
		self.reject_rules.store(reject, Ordering::Relaxed);
	}

	pub async fn has_table(&self, table: &str) -> bool {
		self.tables.lock().await.contains_key(table)
	}

	/// All rules of a table in installation order per chain.
	pub async fn rules(&self, table: &str) -> Vec<Rule> {
		let tables = self.tables.lock().await;
		let Some(t) = tables.get(table) else {
			return Vec::new();
		};
		let mut rules: Vec<(u64, Rule)> = t.chains.values().flatten().copied().collect();
		rules.sort_by_key(|(handle, _)| *handle);
		rules.into_iter().map(|(_, rule)| rule).collect()
	}
}

#[async_trait]
impl PacketFilter for MemoryFilter {
	async fn create_table(&self, table: &str) -> Result<()> {
		self.tables
			.lock()
			.await
			.insert(table.to_string(), MemoryTable::default());
		Ok(())
	}

	async fn add_chain(&self, table: &str, chain: &Chain) -> Result<()> {
		let mut tables = self.tables.lock().await;
		let t = tables
			.get_mut(table)
			.ok_or_else(|| NatError::TableNotFound(table.to_string()))?;
		t.chains.entry(chain.name).or_default();
		Ok(())
	}

	async fn add_rule(&self, table: &str, rule: &Rule) -> Result<u64> {
		if self.reject_rules.load(Ordering::Relaxed) {
			return Err(NatError::RuleInstall(format!("rejected `{}`", rule)));
		}
		let mut tables = self.tables.lock().await;
		let t = tables
			.get_mut(table)
			.ok_or_else(|| NatError::TableNotFound(table.to_string()))?;
		let chain = t
			.chains
			.get_mut(rule.chain().name)
			.ok_or_else(|| NatError::RuleInstall(format!("no chain {}", rule.chain().name)))?;
		let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
		chain.push((handle, *rule));
		Ok(handle)
	}

	async fn delete_rule(&self, table: &str, chain: &Chain, handle: u64) -> Result<()> {
		let mut tables = self.tables.lock().await;
		let t = tables
			.get_mut(table)
			.ok_or_else(|| NatError::TableNotFound(table.to_string()))?;
		let rules = t.chains.get_mut(chain.name).ok_or(NatError::RuleNotFound(handle))?;
		let before = rules.len();
		rules.retain(|(h, _)| *h != handle);
		if rules.len() == before {
			return Err(NatError::RuleNotFound(handle));
		}
		Ok(())
	}

	async fn delete_table(&self, table: &str) -> Result<()> {
		self.tables
			.lock()
			.await
			.remove(table)
			.map(|_| ())
			.ok_or_else(|| NatError::TableNotFound(table.to_string()))
	}

	fn kind(&self) -> &'static str {
		"memory"
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rule::{EGRESS, INGRESS};

	#[test]
	fn handle_is_parsed_from_echo_output() {
		let output = "add rule inet mesh-wg0 ingress udp dport 40000 @th,96,32 != 0x2112a442 notrack udp dport set 51820 # handle 7\n";
		assert_eq!(parse_handle(output), Some(7));
		assert_eq!(parse_handle("add table inet mesh-wg0\n"), None);
	}

	#[tokio::test]
	async fn memory_rules_follow_chains() {
		let filter = MemoryFilter::new();
		filter.create_table("t").await.unwrap();
		filter.add_chain("t", &INGRESS).await.unwrap();

		let snat = Rule::MasqueradeSource {
			listen_port: 1,
			remote: "192.0.2.1:2".parse().unwrap(),
			candidate_port: 3,
		};
		assert!(matches!(filter.add_rule("t", &snat).await, Err(NatError::RuleInstall(_))));

		filter.add_chain("t", &EGRESS).await.unwrap();
		let handle = filter.add_rule("t", &snat).await.unwrap();
		assert_eq!(filter.rules("t").await, vec![snat]);

		filter.delete_rule("t", &EGRESS, handle).await.unwrap();
		assert!(filter.rules("t").await.is_empty());
		assert!(matches!(
			filter.delete_rule("t", &EGRESS, handle).await,
			Err(NatError::RuleNotFound(_))
		));
	}

	#[tokio::test]
	async fn missing_nft_binary_is_an_error() {
		let filter = NftFilter::new().with_binary("/nonexistent/nft");
		assert!(matches!(filter.delete_table("t").await, Err(NatError::Io(_))));
	}
}
