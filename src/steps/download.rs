use crate::cache::CacheManifest;
use crate::engine::Task;
use crate::error::ConfigError;
use crate::steps::{StepContext, guarded};

/// Extension of the last path segment of `url`, ignoring any query.
fn extension(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);

    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext,
        _ => "bin",
    }
}

pub(super) fn compile(ctx: &StepContext<'_>) -> Result<Task, ConfigError> {
    let url = ctx.literal("url").ok_or_else(|| ctx.missing("url"))?.to_string();

    let env = ctx.env.clone();
    let name = ctx.name().to_string();
    let output = ctx.output(extension(&url));

    Ok(Task::builder(name.clone()).run(move || {
        let mut cache = CacheManifest::from_file(&output);
        cache.add_str("url", &url)?;

        guarded(&env, &name, &output, &mut cache, || env.download(&url, &output))
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use super::*;
    use crate::env::Environment;
    use crate::pipeline::PipelineConfig;
    use crate::pipeline::step::Step;
    use crate::steps::Input;
    use crate::steps::testing::tmp;

    #[test]
    fn test_extension() {
        assert_eq!(extension("https://x.com/a/client.jar"), "jar");
        assert_eq!(extension("https://x.com/a/b.tar.gz?sig=1"), "gz");
        assert_eq!(extension("https://x.com/a/mappings"), "bin");
        assert_eq!(extension("https://x.com/a/.hidden"), "bin");
    }

    #[test]
    fn test_download_once_then_reuse() {
        let (_dir, root) = tmp();
        let source = root.join("remote/client.jar");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, "jar bytes").unwrap();

        let config = PipelineConfig::from_json("test", br#"{"spec": 1, "steps": {}}"#).unwrap();
        let step: Step = serde_json::from_str(r#"{"type": "download", "name": "downloadClient"}"#).unwrap();
        let url = format!("file://{source}");

        let build = |env: &std::sync::Arc<Environment>| {
            let data = |_: &str| -> Option<Task> { None };
            let ctx = StepContext {
                identity: "test",
                side: "joined",
                env,
                config: &config,
                step: &step,
                dir: root.join("joined/downloadClient"),
                args: BTreeMap::from([("url".to_string(), Input::Literal(url.clone()))]),
                data: &data,
            };
            compile(&ctx).unwrap()
        };

        let env = Environment::builder(&root).finish();
        let out = build(&env).execute().unwrap();
        assert_eq!(out, root.join("joined/downloadClient/output.jar"));
        assert_eq!(fs::read_to_string(&out).unwrap(), "jar bytes");

        // a second process would find it in place, even offline
        let offline = Environment::builder(&root).offline(true).cache_only(true).finish();
        assert_eq!(build(&offline).execute().unwrap(), out);

        // without its record the file has to be fetched again
        fs::write(root.join("joined/downloadClient/output.jar.cache"), "").unwrap();
        let err = build(&offline).execute().unwrap_err();
        assert!(err.mode_violation().is_some());
    }

    #[test]
    fn test_url_is_required() {
        let (_dir, root) = tmp();
        let config = PipelineConfig::from_json("test", br#"{"spec": 1, "steps": {}}"#).unwrap();
        let step: Step = serde_json::from_str(r#"{"type": "download"}"#).unwrap();
        let env = Environment::builder(&root).finish();
        let data = |_: &str| -> Option<Task> { None };

        let ctx = StepContext {
            identity: "test",
            side: "joined",
            env: &env,
            config: &config,
            step: &step,
            dir: root.join("download"),
            args: BTreeMap::new(),
            data: &data,
        };

        assert!(matches!(
            compile(&ctx),
            Err(ConfigError::MissingArgument { ref arg, .. }) if arg == "url"
        ));
    }
}
