//! Shared fixtures for charm agent integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use plfm_charm_agent::cancel::CancelSignal;
use plfm_charm_agent::charm::{
    CharmDeployer, ContentDigest, DeployerConfig, DownloadError, DownloadRequest, Downloader,
};
use plfm_charm_agent::reconciler::DesiredStateProvider;
use plfm_charm_agent::status::{StatusPhase, StatusSink};
use plfm_charm_agent::{DesiredSpec, WorkloadId};

/// Build a gzipped charm tarball from `(path, contents)` pairs.
pub fn charm_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *contents).unwrap();
    }
    let mut encoder = builder.into_inner().unwrap();
    encoder.flush().unwrap();
    encoder.finish().unwrap()
}

/// A minimal charm whose metadata names it.
pub fn simple_charm(name: &str) -> Vec<u8> {
    let metadata = format!("name: {name}\nsummary: test charm\n");
    charm_archive(&[
        ("metadata.yaml", metadata.as_bytes()),
        ("hooks/install", b"#!/bin/sh\nexit 0\n"),
    ])
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn desired(locator: &str, archive: &[u8], generation: i64) -> DesiredSpec {
    DesiredSpec {
        locator: locator.to_string(),
        content_digest: sha256_hex(archive),
        modification_generation: generation,
    }
}

/// Serves archives from memory, verifying digests like the HTTP downloader.
#[derive(Default)]
pub struct MemoryDownloader {
    archives: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
    hang: AtomicBool,
}

impl MemoryDownloader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, locator: &str, archive: Vec<u8>) {
        self.archives
            .lock()
            .unwrap()
            .insert(locator.to_string(), archive);
    }

    /// Make every fetch block until cancelled.
    pub fn hang_until_cancelled(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Downloader for MemoryDownloader {
    async fn fetch(
        &self,
        request: DownloadRequest<'_>,
        cancel: &CancelSignal,
    ) -> Result<PathBuf, DownloadError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if self.hang.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(DownloadError::Cancelled);
        }

        let expected = ContentDigest::parse(request.expected_digest)?;
        let archive = self
            .archives
            .lock()
            .unwrap()
            .get(request.locator)
            .cloned()
            .ok_or_else(|| DownloadError::Status {
                status: 404,
                url: request.locator.to_string(),
            })?;

        let actual = ContentDigest::of_bytes(&archive);
        if actual != expected {
            return Err(DownloadError::DigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        tokio::fs::create_dir_all(request.target_dir).await?;
        let path = request
            .target_dir
            .join(format!("{}-mem{n}.charm", expected.short()));
        tokio::fs::write(&path, &archive).await?;
        Ok(path)
    }
}

pub fn deployer(root: &Path, downloader: Arc<dyn Downloader>, owner: &str) -> CharmDeployer {
    CharmDeployer::new(
        DeployerConfig {
            root: root.to_path_buf(),
            lock_stale_after: Duration::from_secs(900),
        },
        downloader,
        owner,
    )
}

/// Desired state provider backed by a settable value.
pub struct StaticProvider {
    spec: Mutex<Option<DesiredSpec>>,
    calls: AtomicUsize,
}

impl StaticProvider {
    pub fn new(spec: Option<DesiredSpec>) -> Arc<Self> {
        Arc::new(Self {
            spec: Mutex::new(spec),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, spec: Option<DesiredSpec>) {
        *self.spec.lock().unwrap() = spec;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DesiredStateProvider for StaticProvider {
    async fn desired_spec(&self, _workload_id: &WorkloadId) -> anyhow::Result<DesiredSpec> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.spec
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("control plane unavailable"))
    }
}

/// Status sink that records every accepted status.
#[derive(Default)]
pub struct RecordingSink {
    statuses: Mutex<Vec<(StatusPhase, String)>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn statuses(&self) -> Vec<(StatusPhase, String)> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<(StatusPhase, String)> {
        self.statuses.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn set_status(&self, phase: StatusPhase, detail: &str) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("status endpoint unavailable");
        }
        self.statuses
            .lock()
            .unwrap()
            .push((phase, detail.to_string()));
        Ok(())
    }
}

/// Names of the entries directly under `dir`, sorted. Empty if missing.
pub fn entries(dir: &Path) -> Vec<String> {
    let Ok(read) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = read
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
