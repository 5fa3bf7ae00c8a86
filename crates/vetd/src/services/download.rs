use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use vet_core::config::{ConfigError, DownloadSettings, SOURCE_REPOSITORY_URL};
use vet_core::types::{Package, Stage};

use super::{
    default_claim_lease, lease_cutoff, BatchResult, ItemOutcome, ServiceContext, ServiceError,
    StageService,
};
use crate::selector::BatchSelector;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("artifact {name} not found in source repository")]
    NotFound { name: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Retrieves the source artifact of a package into a local directory.
pub trait ArtifactFetcher: Send {
    fn fetch(&self, package: &Package, dest_dir: &Path) -> Result<PathBuf, FetchError>;
}

/// Artifact file name inside the repository and the download directory.
pub fn artifact_file_name(package: &Package) -> String {
    let name = package
        .name
        .trim_start_matches('@')
        .replace(['/', '\\'], "_");
    format!("{name}-{}.tar.gz", package.version)
}

/// Copies artifacts out of a local mirror (`file://` URL or plain directory).
#[derive(Debug, Clone)]
pub struct MirrorFetcher {
    root: PathBuf,
}

impl MirrorFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let trimmed = url.trim();
        if let Some(path) = trimmed.strip_prefix("file://") {
            return Ok(Self::new(path));
        }
        if trimmed.contains("://") {
            return Err(ConfigError::InvalidValue {
                name: SOURCE_REPOSITORY_URL.to_string(),
                value: url.to_string(),
                reason: "only file:// URLs and directory paths are supported".to_string(),
            });
        }
        Ok(Self::new(trimmed))
    }
}

impl ArtifactFetcher for MirrorFetcher {
    fn fetch(&self, package: &Package, dest_dir: &Path) -> Result<PathBuf, FetchError> {
        let file_name = artifact_file_name(package);
        let source = self.root.join(&file_name);
        if !source.is_file() {
            return Err(FetchError::NotFound { name: file_name });
        }
        fs::create_dir_all(dest_dir).map_err(|source| FetchError::Io {
            path: dest_dir.to_path_buf(),
            source,
        })?;

        // Copy beside the target and rename so a crash never leaves a partial artifact.
        let target = dest_dir.join(&file_name);
        let partial = dest_dir.join(format!(".{file_name}.{}.part", package.id));
        fs::copy(&source, &partial).map_err(|err| FetchError::Io {
            path: source.clone(),
            source: err,
        })?;
        fs::rename(&partial, &target).map_err(|source| FetchError::Io {
            path: target.clone(),
            source,
        })?;
        Ok(target)
    }
}

/// Fetches artifacts for `LicenseChecked` packages and moves them to
/// `Downloaded`.
///
/// Each package is claimed before its fetch, so concurrent instances never
/// fetch the same artifact. A failed fetch releases the claim; a claim left
/// by a crashed instance expires after `claim_lease`.
pub struct DownloadService {
    ctx: ServiceContext,
    fetcher: Box<dyn ArtifactFetcher>,
    download_dir: PathBuf,
    claim_lease: Duration,
}

impl DownloadService {
    pub fn new(
        ctx: ServiceContext,
        fetcher: Box<dyn ArtifactFetcher>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ctx,
            fetcher,
            download_dir: download_dir.into(),
            claim_lease: default_claim_lease(),
        }
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn from_settings(ctx: ServiceContext, settings: DownloadSettings) -> Result<Self, ServiceError> {
        let fetcher = MirrorFetcher::from_url(&settings.source_repository_url)?;
        Ok(Self::new(ctx, Box::new(fetcher), settings.download_dir)
            .with_claim_lease(settings.claim_lease))
    }

    fn download(&self, package: &Package) -> Result<ItemOutcome, ServiceError> {
        if !self.ctx.claim(package, self.claim_lease)? {
            return Ok(ItemOutcome::Conflict);
        }
        match self.fetcher.fetch(package, &self.download_dir) {
            Ok(path) => {
                self.ctx
                    .store
                    .set_artifact_path(&package.id, &path.to_string_lossy())?;
                self.ctx.advance(package, Stage::Download.postcondition())
            }
            Err(err) => self.ctx.fail_item(Stage::Download, package, &err.to_string()),
        }
    }
}

impl StageService for DownloadService {
    fn process_batch(&mut self, limit: usize) -> Result<BatchResult, ServiceError> {
        let cutoff = lease_cutoff(Utc::now(), self.claim_lease);
        let packages = BatchSelector::new(&self.ctx.store).claimable(
            Stage::Download.precondition(),
            cutoff,
            limit,
        )?;
        let mut result = BatchResult::empty();
        for package in &packages {
            let outcome = self.download(package)?;
            result.record(&outcome);
        }
        Ok(result)
    }
}
