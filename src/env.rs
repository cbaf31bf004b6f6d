use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::artifact::Artifact;
use crate::fetch::{Downloader, Fetcher, FileFetcher};
use crate::mode::ExecutionMode;

const DEFAULT_REPOSITORY: &str = "https://repo.maven.apache.org/maven2";

/// Run-wide configuration, shared by every step of every pipeline.
///
/// It is fixed before any pipeline is compiled and passed around explicitly
/// (usually as `Arc<Environment>`), so two environments can coexist in one
/// process without leaking state into each other.
#[derive(Debug)]
pub struct Environment {
    /// Offline / cache-only policy.
    pub mode: ExecutionMode,
    /// Where pipelines place their step outputs.
    pub build_dir: Utf8PathBuf,
    /// Download cache shared between pipelines, e.g. tool and library jars.
    pub cache_dir: Utf8PathBuf,
    /// The `java` executable used to run external tools.
    pub java: Utf8PathBuf,
    /// Maven repository libraries are resolved from.
    pub repository: String,
    pub downloader: Downloader,
}

impl Environment {
    pub fn builder(build_dir: impl Into<Utf8PathBuf>) -> EnvironmentBuilder {
        EnvironmentBuilder::new(build_dir.into())
    }

    /// Downloads `url` to `target`, honoring the execution mode.
    pub fn download(&self, url: &str, target: &Utf8Path) -> anyhow::Result<()> {
        self.downloader.download(&self.mode, url, target)
    }

    /// Resolves a library from [`Environment::repository`].
    pub fn library(&self, artifact: &Artifact) -> anyhow::Result<Utf8PathBuf> {
        self.artifact(&self.repository, artifact)
    }

    /// Resolves an artifact into the shared download cache.
    pub fn artifact(&self, repo: &str, artifact: &Artifact) -> anyhow::Result<Utf8PathBuf> {
        self.downloader
            .artifact(&self.mode, repo, artifact, &self.cache_dir)
    }
}

pub struct EnvironmentBuilder {
    build_dir: Utf8PathBuf,
    cache_dir: Option<Utf8PathBuf>,
    java: Utf8PathBuf,
    repository: String,
    offline: bool,
    cache_only: bool,
    fetcher: Arc<dyn Fetcher>,
}

impl EnvironmentBuilder {
    fn new(build_dir: Utf8PathBuf) -> Self {
        Self {
            build_dir,
            cache_dir: None,
            java: Utf8PathBuf::from("java"),
            repository: String::from(DEFAULT_REPOSITORY),
            offline: false,
            cache_only: false,
            fetcher: Arc::new(FileFetcher),
        }
    }

    /// Defaults to `<build>/cache`.
    pub fn cache_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn java(mut self, java: impl Into<Utf8PathBuf>) -> Self {
        self.java = java.into();
        self
    }

    pub fn repository(mut self, url: impl Into<String>) -> Self {
        self.repository = url.into();
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn cache_only(mut self, cache_only: bool) -> Self {
        self.cache_only = cache_only;
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn finish(self) -> Arc<Environment> {
        let cache_dir = self
            .cache_dir
            .unwrap_or_else(|| self.build_dir.join("cache"));

        Arc::new(Environment {
            mode: ExecutionMode::new(self.offline, self.cache_only),
            build_dir: self.build_dir,
            cache_dir,
            java: self.java,
            repository: self.repository,
            downloader: Downloader::new(self.fetcher),
        })
    }
}
