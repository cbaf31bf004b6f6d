use std::collections::HashSet;
use std::fs::{self, File};
use std::io::BufWriter;

use anyhow::Context;
use camino::Utf8Path;
use zip::{ZipArchive, ZipWriter};

use crate::cache::CacheManifest;
use crate::engine::Task;
use crate::error::ConfigError;
use crate::steps::{StepContext, guarded};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Keep the mapped classes, drop everything else.
    Whitelist,
    /// Drop the mapped classes, keep everything else.
    Blacklist,
}

impl Mode {
    fn parse(ctx: &StepContext<'_>) -> Result<Self, ConfigError> {
        match ctx.literal("mode") {
            None | Some("whitelist") => Ok(Mode::Whitelist),
            Some("blacklist") => Ok(Mode::Blacklist),
            Some(_) => Err(ctx.missing("mode")),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Mode::Whitelist => "whitelist",
            Mode::Blacklist => "blacklist",
        }
    }
}

pub(super) fn compile(ctx: &StepContext<'_>) -> Result<Task, ConfigError> {
    let input = ctx.file("input")?;
    let mappings = ctx.file("mappings")?;
    let mode = Mode::parse(ctx)?;

    let env = ctx.env.clone();
    let name = ctx.name().to_string();
    let output = ctx.output("jar");

    let task = Task::builder(name.clone())
        .depends_on(&input)
        .depends_on(&mappings)
        .run(move || {
            let input = input.path()?;
            let mappings = mappings.path()?;

            let mut cache = CacheManifest::from_file(&output);
            cache
                .add_file("input", &input)?
                .add_file("mappings", &mappings)?
                .add_str("mode", mode.as_str())?;

            guarded(&env, &name, &output, &mut cache, || {
                strip(&input, &mappings, mode, &output)
            })
        });

    Ok(task)
}

/// Top-level obfuscated class names declared by a TSRG or SRG file.
fn mapped_classes(text: &str) -> HashSet<String> {
    let mut classes = HashSet::new();

    for line in text.lines() {
        // members are indented in TSRG
        if line.starts_with([' ', '\t']) || line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        let mut tokens = line.split_whitespace();
        let class = match tokens.next() {
            Some("tsrg2") | Some("PK:") | Some("FD:") | Some("MD:") => continue,
            Some("CL:") => tokens.next(),
            other => other,
        };

        if let Some(class) = class {
            classes.insert(class.to_string());
        }
    }

    classes
}

fn keep(entry: &str, classes: &HashSet<String>, mode: Mode) -> bool {
    let mapped = entry
        .strip_suffix(".class")
        .map(|class| class.split('$').next().unwrap_or(class))
        .map(|class| classes.contains(class));

    match (mapped, mode) {
        (Some(mapped), Mode::Whitelist) => mapped,
        (Some(mapped), Mode::Blacklist) => !mapped,
        (None, Mode::Whitelist) => false,
        (None, Mode::Blacklist) => true,
    }
}

fn strip(input: &Utf8Path, mappings: &Utf8Path, mode: Mode, output: &Utf8Path) -> anyhow::Result<()> {
    let text = fs::read_to_string(mappings).with_context(|| format!("couldn't read {mappings}"))?;
    let classes = mapped_classes(&text);

    let mut zip = ZipArchive::new(File::open(input)?)
        .with_context(|| format!("couldn't open {input}"))?;
    let mut out = ZipWriter::new(BufWriter::new(File::create(output)?));

    let mut kept = 0usize;
    for index in 0..zip.len() {
        let file = zip.by_index_raw(index)?;
        if file.is_dir() || !keep(file.name(), &classes, mode) {
            continue;
        }

        out.raw_copy_file(file)?;
        kept += 1;
    }

    out.finish()?;
    tracing::debug!("kept {kept} of {} entries of {input}", zip.len());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::{read_zip, tmp, write_zip};

    const TSRG: &str = "tsrg2 left right\na net/example/Foo\n\tb bar\n\tc ()V baz\nd net/example/Bar\n";

    #[test]
    fn test_mapped_classes_tsrg_and_srg() {
        let tsrg = mapped_classes(TSRG);
        assert_eq!(tsrg, HashSet::from(["a".to_string(), "d".to_string()]));

        let srg = mapped_classes("PK: a net/example\nCL: a net/example/Foo\nFD: a/b net/example/Foo/bar\n");
        assert_eq!(srg, HashSet::from(["a".to_string()]));
    }

    #[test]
    fn test_keep_rules() {
        let classes = mapped_classes(TSRG);

        assert!(keep("a.class", &classes, Mode::Whitelist));
        assert!(keep("a$1.class", &classes, Mode::Whitelist));
        assert!(!keep("z.class", &classes, Mode::Whitelist));
        assert!(!keep("META-INF/MANIFEST.MF", &classes, Mode::Whitelist));

        assert!(!keep("a.class", &classes, Mode::Blacklist));
        assert!(keep("z.class", &classes, Mode::Blacklist));
        assert!(keep("META-INF/MANIFEST.MF", &classes, Mode::Blacklist));
    }

    #[test]
    fn test_strip_jar() {
        let (_dir, root) = tmp();
        let input = root.join("in.jar");
        let mappings = root.join("joined.tsrg");
        fs::write(&mappings, TSRG).unwrap();
        write_zip(
            &input,
            &[
                ("a.class", "A"),
                ("a$Inner.class", "AI"),
                ("com/lib/X.class", "X"),
                ("d.class", "D"),
                ("assets/icon.png", "png"),
            ],
        );

        let output = root.join("out.jar");
        strip(&input, &mappings, Mode::Whitelist, &output).unwrap();
        assert_eq!(
            read_zip(&output),
            vec![
                ("a.class".to_string(), "A".to_string()),
                ("a$Inner.class".to_string(), "AI".to_string()),
                ("d.class".to_string(), "D".to_string()),
            ]
        );

        strip(&input, &mappings, Mode::Blacklist, &output).unwrap();
        let names: Vec<_> = read_zip(&output).into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["com/lib/X.class", "assets/icon.png"]);
    }
}
