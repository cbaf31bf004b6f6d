use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};

use anyhow::Context;
use camino::Utf8Path;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::cache::CacheManifest;
use crate::engine::Task;
use crate::error::ConfigError;
use crate::steps::{StepContext, guarded};
use crate::utils::walk_files;

const SIDECAR: &str = ".cache";

pub(super) fn compile(ctx: &StepContext<'_>) -> Result<Task, ConfigError> {
    let input = ctx.file("input")?;
    let inject = ctx.file("inject")?;

    let env = ctx.env.clone();
    let name = ctx.name().to_string();
    let output = ctx.output("jar");

    let task = Task::builder(name.clone())
        .depends_on(&input)
        .depends_on(&inject)
        .run(move || {
            let input = input.path()?;
            let inject = inject.path()?;

            let mut cache = CacheManifest::from_file(&output);
            cache
                .add_file("input", &input)?
                .add_file("inject", &inject)?;

            guarded(&env, &name, &output, &mut cache, || {
                inject_dir(&input, &inject, &output)
            })
        });

    Ok(task)
}

/// Copies `input` to `output`, adding every file of `dir`. Files of `dir`
/// replace same-named entries of `input`.
fn inject_dir(input: &Utf8Path, dir: &Utf8Path, output: &Utf8Path) -> anyhow::Result<()> {
    let files: Vec<_> = walk_files(dir)
        .with_context(|| format!("couldn't list {dir}"))?
        .into_iter()
        .filter(|rel| rel.as_str() != SIDECAR)
        .collect();

    let replaced: HashSet<&str> = files.iter().map(|rel| rel.as_str()).collect();

    let mut zip = ZipArchive::new(File::open(input)?)
        .with_context(|| format!("couldn't open {input}"))?;
    let mut out = ZipWriter::new(BufWriter::new(File::create(output)?));

    for index in 0..zip.len() {
        let file = zip.by_index_raw(index)?;
        if replaced.contains(file.name()) {
            continue;
        }
        out.raw_copy_file(file)?;
    }

    for rel in &files {
        let bytes = fs::read(dir.join(rel))?;
        out.start_file(rel.as_str(), SimpleFileOptions::default())?;
        out.write_all(&bytes)?;
    }

    out.finish()?;
    tracing::debug!("injected {} files into {output}", files.len());

    Ok(())
}
