//! The declarative side of a pipeline: `config.json` and the zip archive it
//! ships in.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::sync::Arc;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use zip::ZipArchive;

use crate::cache::CacheManifest;
use crate::engine::Task;
use crate::env::Environment;
use crate::error::ConfigError;
use crate::pipeline::step::Step;
use crate::utils::{ensure_parent, is_contained};

const CONFIG_ENTRY: &str = "config.json";

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub spec: u32,
    #[serde(default)]
    pub version: Option<String>,
    /// Entries shipped inside the config archive, by key.
    #[serde(default)]
    pub data: BTreeMap<String, DataEntry>,
    /// Step lists, by side.
    pub steps: BTreeMap<String, Vec<Step>>,
    /// Custom external tools, by step type.
    #[serde(default)]
    pub functions: BTreeMap<String, Function>,
    /// Library coordinates, by side.
    #[serde(default)]
    pub libraries: BTreeMap<String, Vec<String>>,
}

/// Either one path for every side, or a path per side. A path ending in `/`
/// is a directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DataEntry {
    Path(String),
    Sided(BTreeMap<String, String>),
}

impl DataEntry {
    pub fn for_side(&self, side: &str) -> Option<&str> {
        match self {
            DataEntry::Path(path) => Some(path),
            DataEntry::Sided(paths) => paths.get(side).map(String::as_str),
        }
    }
}

/// An external tool run as `java <jvmargs> -jar <tool> <args>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Function {
    /// Coordinate of the tool jar.
    pub version: String,
    /// Repository the tool jar is downloaded from.
    pub repo: String,
    #[serde(default)]
    pub jvmargs: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_ext")]
    pub ext: String,
    #[serde(default)]
    pub java_version: Option<u32>,
}

fn default_ext() -> String {
    String::from("jar")
}

impl PipelineConfig {
    pub fn from_json(artifact: &str, json: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(json).map_err(|source| ConfigError::Json {
            artifact: artifact.to_string(),
            source,
        })?;

        if !matches!(config.spec, 1 | 2) {
            return Err(ConfigError::UnsupportedSpec {
                artifact: artifact.to_string(),
                spec: config.spec,
            });
        }

        config.check_paths(artifact)?;
        Ok(config)
    }

    /// Data keys, step names and function extensions all end up as path
    /// components below the build directory.
    fn check_paths(&self, artifact: &str) -> Result<(), ConfigError> {
        let keys = self.data.keys().cloned();
        let names = self.steps.values().flatten().map(|step| step.name.clone());
        let outputs = self
            .functions
            .values()
            .map(|function| format!("output.{}", function.ext));

        match keys.chain(names).chain(outputs).find(|path| !is_contained(path)) {
            Some(path) => Err(ConfigError::UnsafePath {
                artifact: artifact.to_string(),
                path,
            }),
            None => Ok(()),
        }
    }
}

/// A config zip: `config.json` at its root plus the data entries it names.
#[derive(Debug, Clone)]
pub struct ConfigArchive {
    path: Utf8PathBuf,
    identity: String,
    config: Arc<PipelineConfig>,
}

impl ConfigArchive {
    /// Reads and validates `config.json`. The archive's file stem identifies
    /// the artifact in error messages.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let identity = path.file_stem().unwrap_or(path.as_str()).to_string();

        let archive_error = |source: zip::result::ZipError| ConfigError::Archive {
            artifact: identity.clone(),
            source,
        };

        let file = File::open(&path).map_err(|err| archive_error(err.into()))?;
        let mut archive = ZipArchive::new(file).map_err(archive_error)?;
        let mut json = Vec::new();
        archive
            .by_name(CONFIG_ENTRY)
            .map_err(archive_error)?
            .read_to_end(&mut json)
            .map_err(|err| archive_error(err.into()))?;

        let config = PipelineConfig::from_json(&identity, &json)?;
        tracing::debug!("loaded {identity} (spec {})", config.spec);

        Ok(Self {
            path,
            identity,
            config: Arc::new(config),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &Arc<PipelineConfig> {
        &self.config
    }

    /// One extraction task per data entry available on `side`. Entries go to
    /// `<root>/data/<key>`, keeping the entry's extension for files.
    pub fn data_tasks(&self, env: &Arc<Environment>, side: &str, root: &Utf8Path) -> BTreeMap<String, Task> {
        self.config
            .data
            .iter()
            .filter_map(|(key, entry)| Some((key, entry.for_side(side)?)))
            .map(|(key, entry)| {
                let task = match entry.strip_suffix('/') {
                    Some(prefix) => self.directory_task(env, key, prefix, root),
                    None => self.file_task(env, key, entry, root),
                };
                (key.clone(), task)
            })
            .collect()
    }

    fn file_task(&self, env: &Arc<Environment>, key: &str, entry: &str, root: &Utf8Path) -> Task {
        let target = match Utf8Path::new(entry).extension() {
            Some(ext) => root.join("data").join(format!("{key}.{ext}")),
            None => root.join("data").join(key),
        };

        let env = env.clone();
        let archive = self.path.clone();
        let entry = entry.to_string();
        let name = format!("data:{key}");

        Task::builder(name.clone()).run(move || {
            let bytes = read_entry(&archive, &entry)?;

            let mut cache = CacheManifest::from_file(&target);
            cache.add_bytes("entry", &bytes)?;

            if cache.is_up_to_date(&target) {
                return Ok(target.clone());
            }

            env.mode.assert_not_cache_only(&name)?;
            cache.discard()?;
            ensure_parent(&target)?;
            fs::write(&target, &bytes).with_context(|| format!("couldn't write {target}"))?;
            cache.save()?;

            Ok(target.clone())
        })
    }

    fn directory_task(&self, env: &Arc<Environment>, key: &str, prefix: &str, root: &Utf8Path) -> Task {
        let target = root.join("data").join(key);

        let env = env.clone();
        let archive = self.path.clone();
        let prefix = format!("{prefix}/");
        let name = format!("data:{key}");

        Task::builder(name.clone()).run(move || {
            let entries = read_tree(&archive, &prefix)?;

            let mut cache = CacheManifest::from_directory(&target);
            track_tree(&mut cache, &entries, &target)?;

            if cache.is_up_to_date(&target) {
                return Ok(target.clone());
            }

            env.mode.assert_not_cache_only(&name)?;

            if target.exists() {
                fs::remove_dir_all(&target)
                    .with_context(|| format!("couldn't clear {target}"))?;
            }

            for (rel, bytes) in &entries {
                let path = target.join(rel);
                ensure_parent(&path)?;
                fs::write(&path, bytes).with_context(|| format!("couldn't write {path}"))?;
            }
            fs::create_dir_all(&target)?;

            // the tree is part of the record, so it can only be taken now
            cache.clear();
            track_tree(&mut cache, &entries, &target)?;
            cache.save()?;

            Ok(target.clone())
        })
    }
}

/// Records the archived entries and, when it exists, the extracted tree.
fn track_tree(cache: &mut CacheManifest, entries: &[(String, Vec<u8>)], target: &Utf8Path) -> io::Result<()> {
    for (rel, bytes) in entries {
        cache.add_bytes(&format!("entry/{rel}"), bytes)?;
    }

    if target.is_dir() {
        cache.add_file("tree", target)?;
    }

    Ok(())
}

fn read_entry(archive: &Utf8Path, entry: &str) -> anyhow::Result<Vec<u8>> {
    let mut zip = ZipArchive::new(File::open(archive)?)
        .with_context(|| format!("couldn't open {archive}"))?;
    let mut file = zip
        .by_name(entry)
        .with_context(|| format!("{archive} has no entry {entry}"))?;

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Every file below `prefix`, keyed by its path relative to it.
fn read_tree(archive: &Utf8Path, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
    let mut zip = ZipArchive::new(File::open(archive)?)
        .with_context(|| format!("couldn't open {archive}"))?;

    let mut entries = Vec::new();
    for index in 0..zip.len() {
        let mut file = zip.by_index(index)?;
        if file.is_dir() {
            continue;
        }

        let name = file.name().to_string();
        let Some(rel) = name.strip_prefix(prefix) else {
            continue;
        };

        if file.enclosed_name().is_none() || !is_contained(rel) {
            anyhow::bail!("{archive}: entry {name} would be extracted outside of {prefix}");
        }

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        entries.push((rel.to_string(), bytes));
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}
