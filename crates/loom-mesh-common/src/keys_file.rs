// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::{KeyError, WgKeyPair, WgPrivateKey};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum KeyFileError {
	#[error("failed to read key file: {0}")]
	Read(#[from] std::io::Error),

	#[error("invalid key format: {0}")]
	InvalidFormat(#[from] KeyError),

	#[error("failed to get home directory")]
	NoHomeDir,
}

pub type Result<T> = std::result::Result<T, KeyFileError>;

/// Reads a `wg genkey` style file: one base64 private key, surrounding whitespace ignored.
#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn load_key_from_file(path: impl AsRef<Path>) -> Result<WgKeyPair> {
	let content = Zeroizing::new(fs::read_to_string(path.as_ref()).await?);
	let private = WgPrivateKey::from_base64(content.trim())?;
	Ok(WgKeyPair::from_private_key(private))
}

/// Looks up `var_name`, then `{var_name}_FILE` naming a key file.
#[instrument(skip(var_name), fields(var = %var_name))]
pub fn load_key_env(var_name: &str) -> Result<Option<WgKeyPair>> {
	if let Ok(value) = std::env::var(var_name) {
		let value = Zeroizing::new(value);
		let private = WgPrivateKey::from_base64(value.trim())?;
		return Ok(Some(WgKeyPair::from_private_key(private)));
	}

	let file_var = format!("{}_FILE", var_name);
	if let Ok(path) = std::env::var(&file_var) {
		debug!(%path, "loading private key from file");
		let content = Zeroizing::new(std::fs::read_to_string(&path)?);
		let private = WgPrivateKey::from_base64(content.trim())?;
		return Ok(Some(WgKeyPair::from_private_key(private)));
	}

	Ok(None)
}

#[instrument(skip(key), fields(path = %path.as_ref().display(), public_key = %key.public_key()))]
pub async fn save_key_to_file(key: &WgKeyPair, path: impl AsRef<Path>) -> Result<()> {
	let path = path.as_ref();

	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await?;
	}

	let encoded = key.private_key().to_base64();
	let content = Zeroizing::new(format!("{}\n", encoded.as_str()));

	#[cfg(unix)]
	{
		use tokio::fs::OpenOptions;
		use tokio::io::AsyncWriteExt;

		let mut file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(0o600)
			.open(path)
			.await?;
		file.write_all(content.as_bytes()).await?;
	}

	#[cfg(not(unix))]
	{
		fs::write(path, content.as_bytes()).await?;
	}

	Ok(())
}

pub fn default_config_dir() -> Result<PathBuf> {
	dirs::config_dir()
		.or_else(|| dirs::home_dir().map(|h| h.join(".config")))
		.map(|d| d.join("loom").join("mesh"))
		.ok_or(KeyFileError::NoHomeDir)
}
