// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::bind::UserBind;
use crate::config::DeviceConfig;
use crate::error::Result;
use crate::snapshot::InterfaceSnapshot;
use async_trait::async_trait;
use ipnet::IpNet;
use std::sync::Arc;

/// Access to the WireGuard devices of the host.
#[async_trait]
pub trait WireGuardClient: Send + Sync {
	async fn list_devices(&self) -> Result<Vec<InterfaceSnapshot>>;

	async fn get_device(&self, name: &str) -> Result<InterfaceSnapshot>;

	async fn configure_device(&self, name: &str, config: DeviceConfig) -> Result<()>;

	async fn addresses(&self, name: &str) -> Result<Vec<IpNet>>;

	async fn add_address(&self, name: &str, addr: IpNet) -> Result<()>;

	async fn delete_address(&self, name: &str, addr: IpNet) -> Result<()>;

	/// The in-process bind of a userspace device, when this client owns one.
	async fn user_bind(&self, _name: &str) -> Option<Arc<dyn UserBind>> {
		None
	}

	fn kind(&self) -> &'static str;
}
