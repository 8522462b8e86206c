//! Resolves collection descriptors and materializes remote collection files locally.
//!
//! A descriptor document lists the collections a serving tier should load:
//!
//! ```json
//! {"Collections": [{"Collection": "users", "Partition": 0, "Path": "hdfs:///data/users/0"}]}
//! ```
//!
//! Paths on the remote filesystem are copied into a content-addressed local cache, named after the
//! SHA-256 of the remote path. Files already present in the cache are reused.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::process::Command;

use crate::config::Fetch;

/// File extension of cached collection files.
const CACHE_EXTENSION: &str = "hfile";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescriptorList {
    #[serde(default)]
    collections: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Descriptor {
    collection: String,
    partition: i64,
    path: String,
}

/// A collection to be served, identified by `collection/partition`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionConfig {
    /// Name of the collection, including its partition.
    pub name: String,
    /// Location of the collection's data.
    pub path: String,
}

/// Parses a descriptor document.
pub fn parse_descriptors(json: &[u8]) -> Result<Vec<CollectionConfig>> {
    let list: DescriptorList =
        serde_json::from_slice(json).context("failed to parse collection descriptors")?;

    Ok(list
        .collections
        .into_iter()
        .map(|descriptor| CollectionConfig {
            name: format!("{}/{}", descriptor.collection, descriptor.partition),
            path: descriptor.path,
        })
        .collect())
}

/// Downloads and parses the descriptor document at `url`.
pub async fn descriptors_from_url(url: &str) -> Result<Vec<CollectionConfig>> {
    tracing::debug!(url, "fetching collection descriptors");
    let body = reqwest::get(url)
        .await
        .and_then(|response| response.error_for_status())
        .with_context(|| format!("failed to fetch collection descriptors from {url}"))?
        .bytes()
        .await?;

    let collections = parse_descriptors(&body)?;
    tracing::debug!(count = collections.len(), "parsed collection descriptors");
    Ok(collections)
}

/// Copies remote collection files into the local cache.
#[derive(Debug)]
pub struct Fetcher {
    remote_prefix: Option<String>,
    cache_path: PathBuf,
    copy_command: Vec<String>,
}

impl Fetcher {
    /// Creates a fetcher from the `fetch` configuration.
    pub fn new(config: &Fetch) -> Self {
        Self {
            // Prefixes of a single character would match nearly every absolute path.
            remote_prefix: config
                .remote_prefix
                .clone()
                .filter(|prefix| prefix.len() > 1),
            cache_path: config.cache_path.clone(),
            copy_command: config.copy_command.clone(),
        }
    }

    /// Returns the path on the remote filesystem if `path` refers to one.
    pub fn remote_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        path.strip_prefix(self.remote_prefix.as_deref()?)
    }

    /// Returns the cache location for a remote path.
    pub fn cache_file(&self, remote: &str) -> PathBuf {
        let digest = Sha256::digest(remote.as_bytes());
        let name = format!("{}.{CACHE_EXTENSION}", hex::encode(digest));
        self.cache_path.join(name)
    }

    /// Replaces remote paths with paths to local copies, fetching them as needed.
    ///
    /// Local paths are returned unchanged. Fails on the first collection that cannot be copied.
    pub async fn materialize(
        &self,
        collections: Vec<CollectionConfig>,
    ) -> Result<Vec<CollectionConfig>> {
        let mut fetched = Vec::with_capacity(collections.len());

        for mut collection in collections {
            match self.remote_path(&collection.path) {
                Some(remote) => {
                    let local = self.fetch(&collection.name, remote).await?;
                    collection.path = local.to_string_lossy().into_owned();
                }
                None => tracing::debug!(
                    collection = %collection.name,
                    path = %collection.path,
                    "using local path"
                ),
            }
            fetched.push(collection);
        }

        Ok(fetched)
    }

    async fn fetch(&self, name: &str, remote: &str) -> Result<PathBuf> {
        let local = self.cache_file(remote);

        let exists = tokio::fs::try_exists(&local)
            .await
            .with_context(|| format!("failed to check cached file {}", local.display()))?;
        if exists {
            tracing::debug!(collection = name, path = %local.display(), "reusing cached file");
            return Ok(local);
        }

        tokio::fs::create_dir_all(&self.cache_path)
            .await
            .with_context(|| format!("failed to create {}", self.cache_path.display()))?;

        tracing::info!(
            collection = name,
            remote,
            local = %local.display(),
            "fetching remote file"
        );
        self.copy(remote, &local)
            .await
            .with_context(|| format!("failed to fetch {name} from {remote}"))?;

        Ok(local)
    }

    async fn copy(&self, remote: &str, local: &Path) -> Result<()> {
        let Some((program, args)) = self.copy_command.split_first() else {
            bail!("no copy command configured");
        };

        let output = Command::new(program)
            .args(args)
            .arg(remote)
            .arg(local)
            .output()
            .await
            .with_context(|| format!("failed to run {program}"))?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{program} exited with {}:\n{}{}",
                output.status,
                stdout,
                stderr
            );
        }

        Ok(())
    }
}

/// Resolves the descriptors at `url` and materializes all remote collections.
pub async fn load_from_url(url: &str, config: &Fetch) -> Result<Vec<CollectionConfig>> {
    let collections = descriptors_from_url(url).await?;
    tracing::info!(count = collections.len(), "found collections");
    Fetcher::new(config).materialize(collections).await
}
