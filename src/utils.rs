use std::fmt::Display;
use std::fs;
use std::io;
use std::time::Instant;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

/// Renders the time elapsed since `s` as a short, colored suffix.
pub fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

pub(crate) fn get_style_graph() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

pub(crate) fn get_style_task() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")?)
}

/// Lists every regular file beneath `root`, recursively, as paths relative to
/// `root` using `/` separators. The result is sorted so that callers get a
/// stable order regardless of the platform's directory iteration order.
pub fn walk_files(root: &Utf8Path) -> io::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    walk_rec(root, Utf8Path::new(""), &mut files)?;
    files.sort();
    Ok(files)
}

fn walk_rec(root: &Utf8Path, rel: &Utf8Path, acc: &mut Vec<Utf8PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(root.join(rel))? {
        let entry = entry?;
        let name = entry
            .file_name()
            .into_string()
            .map_err(|name| io::Error::other(format!("non UTF-8 file name {name:?}")))?;

        let path = if rel.as_str().is_empty() {
            Utf8PathBuf::from(name)
        } else {
            Utf8PathBuf::from(format!("{rel}/{name}"))
        };

        if entry.file_type()?.is_dir() {
            walk_rec(root, &path, acc)?;
        } else {
            acc.push(path);
        }
    }

    Ok(())
}

/// Creates the parent directory of `path` if it has one.
pub(crate) fn ensure_parent(path: &Utf8Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_str().is_empty() => fs::create_dir_all(dir),
        _ => Ok(()),
    }
}

/// Whether `path` is a non-empty relative path that cannot leave the
/// directory it is joined onto.
pub(crate) fn is_contained(path: &str) -> bool {
    let path = Utf8Path::new(path);
    path.components().next().is_some()
        && path
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)))
}

/// Installs a `tracing` subscriber that prints to stderr and renders task
/// progress bars. The filter is read from `RUST_LOG`, defaulting to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()?;

    Ok(())
}
