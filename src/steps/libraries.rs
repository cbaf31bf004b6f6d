use std::fs::{self, File};
use std::io::{self, Read};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use zip::ZipArchive;

use crate::artifact::Artifact;
use crate::cache::CacheManifest;
use crate::engine::Task;
use crate::env::Environment;
use crate::error::ConfigError;
use crate::steps::{StepContext, guarded};
use crate::utils::is_contained;

const LIBRARIES_LIST: &str = "META-INF/libraries.list";
const LIBRARIES_DIR: &str = "META-INF/libraries";

/// Where a listed library comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    Repository(Artifact),
    /// An entry of the bundle jar.
    Bundle(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Library {
    origin: Origin,
    path: Utf8PathBuf,
}

pub(super) fn compile(ctx: &StepContext<'_>) -> Result<Task, ConfigError> {
    let artifacts = ctx
        .config
        .libraries
        .get(ctx.side)
        .into_iter()
        .flatten()
        .map(|coordinate| coordinate.parse::<Artifact>())
        .collect::<Result<Vec<_>, _>>()?;

    let bundle = ctx.file_opt("bundle")?;

    let env = ctx.env.clone();
    let name = ctx.name().to_string();
    let output = ctx.output("txt");

    let task = Task::builder(name.clone())
        .depends_on_opt(bundle.as_ref())
        .run(move || {
            let bundle = bundle.as_ref().map(Task::path).transpose()?;
            let libraries = plan(&env, &artifacts, bundle.as_deref())?;

            let listing: String = libraries
                .iter()
                .map(|lib| format!("-e={}\n", lib.path))
                .collect();

            let mut cache = CacheManifest::from_file(&output);
            cache.add_str("libraries", &listing)?;
            if let Some(bundle) = &bundle {
                cache.add_file("bundle", bundle)?;
            }

            // the listing is only valid while every listed file is in place
            if libraries.iter().any(|lib| !lib.path.exists()) {
                cache.discard()?;
            }

            guarded(&env, &name, &output, &mut cache, || {
                for lib in &libraries {
                    resolve(&env, lib, bundle.as_deref())?;
                }
                fs::write(&output, &listing).with_context(|| format!("couldn't write {output}"))?;
                Ok(())
            })
        });

    Ok(task)
}

/// Decides where every library will live, without fetching anything.
fn plan(env: &Environment, artifacts: &[Artifact], bundle: Option<&Utf8Path>) -> anyhow::Result<Vec<Library>> {
    let cache = env.cache_dir.join("libraries");
    let mut libraries: Vec<Library> = artifacts
        .iter()
        .map(|artifact| Library {
            origin: Origin::Repository(artifact.clone()),
            path: cache.join(artifact.path()),
        })
        .collect();

    if let Some(bundle) = bundle {
        for maven in bundled(bundle)? {
            let path = cache.join(&maven);
            if libraries.iter().all(|lib| lib.path != path) {
                libraries.push(Library {
                    origin: Origin::Bundle(format!("{LIBRARIES_DIR}/{maven}")),
                    path,
                });
            }
        }
    }

    Ok(libraries)
}

/// Maven paths listed in the bundle's `META-INF/libraries.list`, whose lines
/// are `<hash>\t<coordinate>\t<path>`.
fn bundled(bundle: &Utf8Path) -> anyhow::Result<Vec<String>> {
    let mut zip = ZipArchive::new(File::open(bundle)?)
        .with_context(|| format!("couldn't open {bundle}"))?;

    let mut text = String::new();
    match zip.by_name(LIBRARIES_LIST) {
        Ok(mut file) => file.read_to_string(&mut text)?,
        Err(zip::result::ZipError::FileNotFound) => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let paths: Vec<String> = text
        .lines()
        .filter_map(|line| line.split('\t').nth(2))
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .collect();

    if let Some(path) = paths.iter().find(|path| !is_contained(path)) {
        anyhow::bail!("{bundle} lists a library outside of the repository layout: {path}");
    }

    Ok(paths)
}

fn resolve(env: &Environment, lib: &Library, bundle: Option<&Utf8Path>) -> anyhow::Result<()> {
    match (&lib.origin, bundle) {
        (Origin::Repository(artifact), _) => {
            env.library(artifact)?;
        }
        (Origin::Bundle(_), _) if lib.path.exists() => {}
        (Origin::Bundle(entry), Some(bundle)) => {
            env.downloader.ensure(&lib.path, |part| {
                let mut zip = ZipArchive::new(File::open(bundle)?)?;
                let mut file = zip
                    .by_name(entry)
                    .with_context(|| format!("{bundle} has no entry {entry}"))?;

                io::copy(&mut file, &mut File::create(part)?)?;
                Ok(())
            })?;
        }
        (Origin::Bundle(entry), None) => anyhow::bail!("no bundle to extract {entry} from"),
    }

    Ok(())
}
