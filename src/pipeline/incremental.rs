//! End-to-end rebuild behavior of a compiled pipeline, with a shell script
//! standing in for `java`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::engine::Task;
use crate::env::Environment;
use crate::error::{ModeError, TaskError};
use crate::pipeline::{Checkpoint, ConfigArchive, Pipeline};
use crate::steps::testing::{read_zip, tmp, write_zip};

struct Fixture {
    _dir: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let (dir, root) = tmp();

        write_zip(
            &root.join("remote/client.jar"),
            &[
                ("a.class", "A"),
                ("b.class", "B"),
                ("c.class", "C"),
                ("META-INF/MANIFEST.MF", "Manifest-Version: 1.0"),
            ],
        );

        let tool = root.join("repo/net/example/tool/1.0/tool-1.0.jar");
        fs::create_dir_all(tool.parent().unwrap()).unwrap();
        fs::write(&tool, "tool").unwrap();

        let asm = root.join("mirror/org/ow2/asm/9.5/asm-9.5.jar");
        fs::create_dir_all(asm.parent().unwrap()).unwrap();
        fs::write(&asm, "asm").unwrap();

        // -jar <tool> <input> <output> <label>
        let java = root.join("java");
        fs::write(
            &java,
            format!(
                "#!/bin/sh\necho \"$5\" >> {}\ncp \"$3\" \"$4\"\n",
                root.join("runs")
            ),
        )
        .unwrap();
        fs::set_permissions(&java, fs::Permissions::from_mode(0o755)).unwrap();

        let fixture = Self { _dir: dir, root };
        fixture.write_config("a net/example/Foo\n");
        fixture
    }

    fn write_config(&self, mappings: &str) {
        let root = &self.root;
        let config = format!(
            r#"{{
                "spec": 2,
                "data": {{ "mappings": "config/joined.tsrg" }},
                "steps": {{ "joined": [
                    {{ "type": "download", "url": "file://{root}/remote/client.jar" }},
                    {{ "type": "strip", "input": "{{downloadOutput}}", "mappings": "{{mappings}}" }},
                    {{ "type": "decompile", "input": "{{stripOutput}}" }},
                    {{ "type": "listing", "input": "{{downloadOutput}}" }},
                    {{ "type": "listLibraries" }}
                ] }},
                "functions": {{
                    "decompile": {{ "version": "net.example:tool:1.0", "repo": "file://{root}/repo",
                                    "args": ["{{input}}", "{{output}}", "decompile"] }},
                    "listing": {{ "version": "net.example:tool:1.0", "repo": "file://{root}/repo",
                                  "args": ["{{input}}", "{{output}}", "listing"] }}
                }},
                "libraries": {{ "joined": ["org.ow2:asm:9.5"] }}
            }}"#
        );

        write_zip(
            &root.join("mcp_config-test.zip"),
            &[("config.json", &config), ("config/joined.tsrg", mappings)],
        );
    }

    fn env(&self, offline: bool, cache_only: bool) -> Arc<Environment> {
        Environment::builder(self.root.join("build"))
            .java(self.root.join("java"))
            .repository(format!("file://{}/mirror", self.root))
            .offline(offline)
            .cache_only(cache_only)
            .finish()
    }

    fn pipeline(&self, env: &Arc<Environment>) -> Pipeline {
        ConfigArchive::open(self.root.join("mcp_config-test.zip"))
            .unwrap()
            .pipeline(env, "joined")
            .unwrap()
    }

    /// Compiles a fresh pipeline, as a new process would, and builds every
    /// step of it.
    fn build(&self, offline: bool, cache_only: bool) -> Result<Pipeline, TaskError> {
        let pipeline = self.pipeline(&self.env(offline, cache_only));

        let ends: Vec<Task> = ["decompile", "listing", "listLibraries"]
            .into_iter()
            .filter_map(|name| pipeline.task(name))
            .collect();
        Task::builder("all")
            .depends_on_all(&ends)
            .run(|| Ok(Utf8PathBuf::from("/")))
            .execute()?;

        Ok(pipeline)
    }

    /// How often each labelled tool invocation ran so far.
    fn runs(&self, label: &str) -> usize {
        fs::read_to_string(self.root.join("runs"))
            .unwrap_or_default()
            .lines()
            .filter(|line| *line == label)
            .count()
    }

    fn entries(&self, path: &Utf8Path) -> Vec<String> {
        read_zip(path).into_iter().map(|(name, _)| name).collect()
    }
}

#[test]
fn test_unchanged_inputs_do_no_work() {
    let fx = Fixture::new();

    let pipeline = fx.build(false, false).unwrap();
    assert_eq!(fx.runs("decompile"), 1);
    assert_eq!(fx.runs("listing"), 1);

    let decompiled = pipeline.task("decompile").unwrap().output().unwrap();
    assert_eq!(decompiled, fx.root.join("build/joined/decompile/output.jar"));
    assert_eq!(fx.entries(&decompiled), vec!["a.class"]);

    let libraries = pipeline.task("listLibraries").unwrap().output().unwrap();
    assert_eq!(
        fs::read_to_string(libraries).unwrap(),
        format!(
            "-e={}\n",
            fx.root.join("build/cache/libraries/org/ow2/asm/9.5/asm-9.5.jar")
        )
    );

    // cache-only refuses any real work, so success proves there was none
    fx.build(false, true).unwrap();
    fx.build(true, true).unwrap();
    assert_eq!(fx.runs("decompile"), 1);
    assert_eq!(fx.runs("listing"), 1);
}

#[test]
fn test_changed_input_invalidates_downstream_only() {
    let fx = Fixture::new();
    fx.build(false, false).unwrap();

    fx.write_config("a net/example/Foo\nb net/example/Bar\n");

    // the change is noticed, and refused in cache-only mode
    let err = fx.build(false, true).unwrap_err();
    assert!(matches!(err.mode_violation(), Some(ModeError::CacheOnly { .. })));

    let pipeline = fx.build(false, false).unwrap();
    assert_eq!(fx.runs("decompile"), 2);
    assert_eq!(fx.runs("listing"), 1);

    let decompiled = pipeline.task("decompile").unwrap().output().unwrap();
    assert_eq!(fx.entries(&decompiled), vec!["a.class", "b.class"]);
}

#[test]
fn test_deleted_output_is_rebuilt() {
    let fx = Fixture::new();
    fx.build(false, false).unwrap();

    fs::remove_file(fx.root.join("build/joined/listing/output.jar")).unwrap();
    fx.build(false, false).unwrap();

    assert_eq!(fx.runs("listing"), 2);
    assert_eq!(fx.runs("decompile"), 1);
}

#[test]
fn test_offline_failure_is_a_mode_violation() {
    let fx = Fixture::new();

    let err = fx.build(true, false).unwrap_err();
    assert!(matches!(err.mode_violation(), Some(ModeError::Offline { .. })));
    assert_eq!(err.chain().first(), Some(&"all"));
    assert_eq!(fx.runs("decompile"), 0);
}

#[test]
fn test_branch_reruns_from_decompile() {
    let fx = Fixture::new();
    let env = fx.env(false, false);
    let parent = Arc::new(fx.pipeline(&env));

    let pre = parent.checkpoint(Checkpoint::PreDecompile).unwrap();
    let input = pre.clone();
    let target = fx.root.join("build/joined-at/transform/output.jar");
    let transform = Task::builder("transform")
        .depends_on(&pre)
        .run(move || {
            // keep everything but the first entry
            let entries = read_zip(&input.path()?);
            let kept: Vec<(&str, &str)> = entries
                .iter()
                .skip(1)
                .map(|(name, text)| (name.as_str(), text.as_str()))
                .collect();
            write_zip(&target, &kept);
            Ok(target.clone())
        });

    parent.task("decompile").unwrap().execute().unwrap();
    assert_eq!(fx.runs("decompile"), 1);

    let branch = Pipeline::branch(&parent, fx.root.join("build/joined-at"), transform).unwrap();
    let decompiled = branch.task("decompile").unwrap().execute().unwrap();

    assert_eq!(decompiled, fx.root.join("build/joined-at/decompile/output.jar"));
    assert_eq!(fx.runs("decompile"), 2);
    assert!(fx.entries(&decompiled).is_empty());

    // the shared strip task ran once, in the parent's graph
    assert!(Task::ptr_eq(
        &branch.task("strip").unwrap(),
        &parent.task("strip").unwrap()
    ));
    let (_, diagnostics) = branch
        .task("decompile")
        .unwrap()
        .execute_with_diagnostics()
        .unwrap();
    assert!(diagnostics.ran().is_empty());
}
