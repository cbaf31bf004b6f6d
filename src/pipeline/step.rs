use std::collections::BTreeMap;
use std::fmt::Display;

use serde::Deserialize;

use crate::error::ConfigError;

const OUTPUT_SUFFIX: &str = "Output";

/// One argument of a step, parsed once when the config is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    /// A plain value, passed through as-is.
    Literal(String),
    /// `{nameOutput}`: the output of an earlier step.
    Step(String),
    /// `{key}`: a data entry of the config.
    Data(String),
}

impl Argument {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let Some(token) = value
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
        else {
            return Ok(Argument::Literal(value.to_string()));
        };

        if token.is_empty() || token.contains(['{', '}']) {
            return Err(ConfigError::MalformedReference(value.to_string()));
        }

        match token.strip_suffix(OUTPUT_SUFFIX) {
            Some("") => Err(ConfigError::MalformedReference(value.to_string())),
            Some(step) => Ok(Argument::Step(step.to_string())),
            None => Ok(Argument::Data(token.to_string())),
        }
    }
}

impl Display for Argument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Argument::Literal(value) => f.write_str(value),
            Argument::Step(name) => write!(f, "{{{name}{OUTPUT_SUFFIX}}}"),
            Argument::Data(key) => write!(f, "{{{key}}}"),
        }
    }
}

/// Selects the transform a step compiles to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StepKind {
    Download,
    Strip,
    Inject,
    ListLibraries,
    /// Anything else; resolved against the config's function table.
    Custom(String),
}

impl StepKind {
    pub fn as_str(&self) -> &str {
        match self {
            StepKind::Download => "download",
            StepKind::Strip => "strip",
            StepKind::Inject => "inject",
            StepKind::ListLibraries => "listLibraries",
            StepKind::Custom(kind) => kind,
        }
    }

    pub fn is(&self, kind: &str) -> bool {
        self.as_str() == kind
    }
}

impl From<&str> for StepKind {
    fn from(kind: &str) -> Self {
        match kind {
            "download" => StepKind::Download,
            "strip" => StepKind::Strip,
            "inject" => StepKind::Inject,
            "listLibraries" => StepKind::ListLibraries,
            other => StepKind::Custom(other.to_string()),
        }
    }
}

impl Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step descriptor: `{"type": ..., "name"?: ..., ...args}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawStep")]
pub struct Step {
    pub kind: StepKind,
    /// Defaults to the type.
    pub name: String,
    pub args: BTreeMap<String, Argument>,
}

#[derive(Deserialize)]
struct RawStep {
    #[serde(rename = "type")]
    kind: String,
    name: Option<String>,
    #[serde(flatten)]
    args: BTreeMap<String, String>,
}

impl TryFrom<RawStep> for Step {
    type Error = ConfigError;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let args = raw
            .args
            .iter()
            .map(|(key, value)| Ok((key.clone(), Argument::parse(value)?)))
            .collect::<Result<_, ConfigError>>()?;

        Ok(Step {
            name: raw.name.unwrap_or_else(|| raw.kind.clone()),
            kind: StepKind::from(raw.kind.as_str()),
            args,
        })
    }
}

impl Step {
    pub fn arg(&self, name: &str) -> Option<&Argument> {
        self.args.get(name)
    }
}
