use std::collections::BTreeMap;

use camino::Utf8PathBuf;

use crate::artifact::Artifact;
use crate::cache::CacheManifest;
use crate::engine::Task;
use crate::error::ConfigError;
use crate::pipeline::Function;
use crate::steps::{Input, StepContext, guarded};
use crate::tool::ExternalTool;

/// One argument of the tool's command line.
#[derive(Debug, Clone)]
enum Template {
    Literal(String),
    Output,
    Log,
    /// A literal argument of the step.
    Value(String),
    /// The output of a dependency, by the name it is known under.
    Path(String),
}

/// Splits a command line into templates, validating every placeholder and
/// collecting the tasks they refer to.
fn templates(
    ctx: &StepContext<'_>,
    args: &[String],
    deps: &mut BTreeMap<String, Task>,
) -> Result<Vec<Template>, ConfigError> {
    args.iter()
        .map(|arg| {
            let Some(token) = arg.strip_prefix('{').and_then(|rest| rest.strip_suffix('}')) else {
                return Ok(Template::Literal(arg.clone()));
            };

            let template = match token {
                "output" => Template::Output,
                "log" => Template::Log,
                _ => match ctx.args.get(token) {
                    Some(Input::Literal(value)) => Template::Value(value.clone()),
                    Some(Input::Task(task)) => {
                        deps.insert(token.to_string(), task.clone());
                        Template::Path(token.to_string())
                    }
                    None => match (ctx.data)(token) {
                        Some(task) => {
                            deps.insert(token.to_string(), task);
                            Template::Path(token.to_string())
                        }
                        None => {
                            return Err(ConfigError::UnknownPlaceholder {
                                artifact: ctx.identity.to_string(),
                                step: ctx.name().to_string(),
                                token: token.to_string(),
                            });
                        }
                    },
                },
            };

            Ok(template)
        })
        .collect()
}

fn render(
    templates: &[Template],
    output: &Utf8PathBuf,
    log: &Utf8PathBuf,
    paths: &BTreeMap<String, Utf8PathBuf>,
) -> anyhow::Result<Vec<String>> {
    templates
        .iter()
        .map(|template| {
            Ok(match template {
                Template::Literal(value) | Template::Value(value) => value.clone(),
                Template::Output => output.to_string(),
                Template::Log => log.to_string(),
                Template::Path(name) => paths
                    .get(name)
                    .ok_or_else(|| anyhow::anyhow!("no path for '{{{name}}}'"))?
                    .to_string(),
            })
        })
        .collect()
}

pub(super) fn compile(ctx: &StepContext<'_>, function: &Function) -> Result<Task, ConfigError> {
    let tool: Artifact = function.version.parse()?;

    let mut deps = BTreeMap::new();
    let jvmargs = templates(ctx, &function.jvmargs, &mut deps)?;
    let args = templates(ctx, &function.args, &mut deps)?;

    // step arguments that feed no placeholder still order the graph
    for (name, input) in &ctx.args {
        if let Input::Task(task) = input {
            deps.entry(name.clone()).or_insert_with(|| task.clone());
        }
    }

    let env = ctx.env.clone();
    let name = ctx.name().to_string();
    let repo = function.repo.clone();
    let java_version = function.java_version;
    let workdir = ctx.dir.clone();
    let output = ctx.output(&function.ext);
    let log = ctx.dir.join(format!("{name}.log"));

    let task = Task::builder(name.clone())
        .depends_on_all(deps.values())
        .run(move || {
            let jar = env.artifact(&repo, &tool)?;

            let paths = deps
                .iter()
                .map(|(name, task)| Ok((name.clone(), task.path()?)))
                .collect::<anyhow::Result<BTreeMap<_, _>>>()?;

            let tool = ExternalTool {
                java: env.java.clone(),
                jar,
                jvmargs: render(&jvmargs, &output, &log, &paths)?,
                args: render(&args, &output, &log, &paths)?,
                workdir: workdir.clone(),
                log: log.clone(),
            };

            let mut cache = CacheManifest::from_file(&output);
            cache
                .add_file("tool", &tool.jar)?
                .add_str("args", &format!("{} {}", tool.jvmargs.join(" "), tool.args.join(" ")))?;
            if let Some(version) = java_version {
                cache.add_str("java_version", &version.to_string())?;
            }
            for (name, path) in &paths {
                cache.add_file(name, path)?;
            }

            guarded(&env, &name, &output, &mut cache, || {
                tool.run_for(&output)?;
                Ok(())
            })
        });

    Ok(task)
}
