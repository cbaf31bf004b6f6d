use std::fmt::Display;
use std::str::FromStr;

use camino::Utf8PathBuf;

use crate::error::ConfigError;

/// A Maven-style artifact coordinate, `group:name:version[:classifier][@ext]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Artifact {
    pub group: String,
    pub name: String,
    pub version: String,
    pub classifier: Option<String>,
    pub ext: String,
}

impl Artifact {
    /// Path of the artifact in a Maven repository layout, e.g.
    /// `net/example/tool/1.0/tool-1.0-all.jar`.
    pub fn path(&self) -> Utf8PathBuf {
        let mut file = format!("{}-{}", self.name, self.version);
        if let Some(classifier) = &self.classifier {
            file.push('-');
            file.push_str(classifier);
        }
        file.push('.');
        file.push_str(&self.ext);

        let group = self.group.replace('.', "/");
        Utf8PathBuf::from(format!("{group}/{}/{}/{file}", self.name, self.version))
    }

    /// Full URL of the artifact below a repository base URL.
    pub fn url(&self, repo: &str) -> String {
        format!("{}/{}", repo.trim_end_matches('/'), self.path())
    }
}

impl FromStr for Artifact {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ConfigError::MalformedCoordinate(s.to_string());

        let (coords, ext) = match s.split_once('@') {
            Some((coords, ext)) if !ext.is_empty() => (coords, ext),
            Some(_) => return Err(malformed()),
            None => (s, "jar"),
        };

        let parts: Vec<&str> = coords.split(':').collect();
        if parts.iter().any(|part| part.is_empty()) {
            return Err(malformed());
        }

        let (group, name, version, classifier) = match parts.as_slice() {
            [g, n, v] => (*g, *n, *v, None),
            [g, n, v, c] => (*g, *n, *v, Some(c.to_string())),
            _ => return Err(malformed()),
        };

        Ok(Self {
            group: group.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            classifier,
            ext: ext.to_string(),
        })
    }
}

impl Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.name, self.version)?;
        if let Some(classifier) = &self.classifier {
            write!(f, ":{classifier}")?;
        }
        if self.ext != "jar" {
            write!(f, "@{}", self.ext)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_coordinate() {
        let art: Artifact = "net.example:tool:1.2.3".parse().unwrap();
        assert_eq!(art.path(), "net/example/tool/1.2.3/tool-1.2.3.jar");
        assert_eq!(art.to_string(), "net.example:tool:1.2.3");
    }

    #[test]
    fn test_classifier_and_extension() {
        let art: Artifact = "org.ow2:asm:9.5:sources@zip".parse().unwrap();
        assert_eq!(art.path(), "org/ow2/asm/9.5/asm-9.5-sources.zip");
        assert_eq!(
            art.url("https://maven.example.com/"),
            "https://maven.example.com/org/ow2/asm/9.5/asm-9.5-sources.zip"
        );
        assert_eq!(art.to_string(), "org.ow2:asm:9.5:sources@zip");
    }

    #[test]
    fn test_malformed() {
        for bad in ["", "a:b", "a::c", "a:b:c:d:e", "a:b:c@"] {
            assert!(bad.parse::<Artifact>().is_err(), "{bad}");
        }
    }
}
