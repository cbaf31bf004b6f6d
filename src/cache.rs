//! Content-addressed freshness records for build outputs.
//!
//! A [`CacheManifest`] belongs to exactly one output (a file or a directory)
//! and records the digest of everything that output causally depends on. It
//! lives next to the output in a sidecar file:
//!
//! * `<output>.cache` for a file output,
//! * `<output>/.cache` for a directory output.
//!
//! The sidecar is UTF-8 text, one `key=digest` line per entry, sorted by key.
//! Digests are lowercase hex, so equality is plain string equality.
//!
//! Reading the sidecar never fails: a missing or corrupt sidecar just means
//! there is no prior record, and the output will be rebuilt.

use std::collections::BTreeMap;
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::core::Hash32;
use crate::utils::{ensure_parent, walk_files};

const SIDECAR_EXT: &str = "cache";
const SIDECAR_DIR: &str = ".cache";

/// Something a manifest entry can be computed from.
#[derive(Debug, Clone, Copy)]
pub enum Source<'a> {
    /// A file's contents, or every file beneath a directory.
    Path(&'a Utf8Path),
    Bytes(&'a [u8]),
    Str(&'a str),
}

#[derive(Debug)]
pub struct CacheManifest {
    /// Base against which [`CacheManifest::add_relative`] keys are computed.
    root: Utf8PathBuf,
    sidecar: Utf8PathBuf,
    /// What was recorded by the last successful build, if anything.
    old: Option<BTreeMap<String, String>>,
    /// What has been computed during this check.
    new: BTreeMap<String, String>,
}

impl CacheManifest {
    /// Manifest for a single output file; the sidecar is `<path>.cache` and
    /// relative keys are computed against the file's parent directory.
    pub fn from_file(path: impl AsRef<Utf8Path>) -> Self {
        let path = path.as_ref();
        let root = path
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_default();

        let sidecar = match path.file_name() {
            Some(name) => path.with_file_name(format!("{name}.{SIDECAR_EXT}")),
            None => path.with_extension(SIDECAR_EXT),
        };

        Self::load(root, sidecar)
    }

    /// Manifest for an output directory; the sidecar is `<path>/.cache` and
    /// relative keys are computed against the directory itself.
    pub fn from_directory(path: impl AsRef<Utf8Path>) -> Self {
        let root = path.as_ref().to_path_buf();
        let sidecar = root.join(SIDECAR_DIR);

        Self::load(root, sidecar)
    }

    fn load(root: Utf8PathBuf, sidecar: Utf8PathBuf) -> Self {
        let old = match fs::read_to_string(&sidecar) {
            Ok(text) => {
                let parsed = parse(&text);
                if parsed.is_none() {
                    tracing::warn!("ignoring corrupt cache record {sidecar}");
                }
                parsed
            }
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("ignoring unreadable cache record {sidecar}: {err}");
                }
                None
            }
        };

        Self {
            root,
            sidecar,
            old,
            new: BTreeMap::new(),
        }
    }

    /// Location of the sidecar file.
    pub fn sidecar(&self) -> &Utf8Path {
        &self.sidecar
    }

    /// Records a dependency under `key`.
    ///
    /// For [`Source::Path`] pointing at a directory, every file beneath it is
    /// recorded as its own entry `key/relative/path`, so a change anywhere in
    /// the tree is detected. The manifest's own sidecar is never recorded.
    pub fn add(&mut self, key: &str, source: Source<'_>) -> io::Result<&mut Self> {
        debug_assert!(!key.contains('\n'), "cache keys must be single-line");

        match source {
            Source::Bytes(bytes) => {
                self.new.insert(key.to_string(), Hash32::hash(bytes).to_hex());
            }
            Source::Str(text) => {
                self.new.insert(key.to_string(), Hash32::hash_str(text).to_hex());
            }
            Source::Path(path) if path.is_dir() => {
                // another manifest's sidecar at the root of the tree is not content
                let files: Vec<_> = walk_files(path)?
                    .into_iter()
                    .filter(|rel| rel.as_str() != SIDECAR_DIR)
                    .map(|rel| (format!("{key}/{rel}"), path.join(rel)))
                    .filter(|(_, abs)| *abs != self.sidecar)
                    .collect();

                let hashed = files
                    .into_par_iter()
                    .map(|(key, abs)| Ok((key, Hash32::hash_file(&abs)?.to_hex())))
                    .collect::<io::Result<Vec<_>>>()?;

                self.new.extend(hashed);
            }
            Source::Path(path) => {
                self.new
                    .insert(key.to_string(), Hash32::hash_file(path)?.to_hex());
            }
        }

        Ok(self)
    }

    pub fn add_file(&mut self, key: &str, path: impl AsRef<Utf8Path>) -> io::Result<&mut Self> {
        self.add(key, Source::Path(path.as_ref()))
    }

    pub fn add_bytes(&mut self, key: &str, bytes: impl AsRef<[u8]>) -> io::Result<&mut Self> {
        self.add(key, Source::Bytes(bytes.as_ref()))
    }

    pub fn add_str(&mut self, key: &str, text: &str) -> io::Result<&mut Self> {
        self.add(key, Source::Str(text))
    }

    /// Records a path under a key derived from its location relative to the
    /// manifest root, so that the key is the same on every machine.
    pub fn add_relative(&mut self, path: impl AsRef<Utf8Path>) -> io::Result<&mut Self> {
        let path = path.as_ref();
        let key = path.strip_prefix(&self.root).unwrap_or(path).to_string();
        self.add(&key, Source::Path(path))
    }

    /// True iff a prior record exists and the entries computed so far are
    /// exactly the recorded ones: same keys, same digests. An added, removed
    /// or changed key makes the manifest differ.
    pub fn is_same(&self) -> bool {
        self.old.as_ref().is_some_and(|old| *old == self.new)
    }

    /// The single freshness rule used by every step: the output must exist
    /// and the manifest must be the same.
    pub fn is_up_to_date(&self, output: impl AsRef<Utf8Path>) -> bool {
        output.as_ref().exists() && self.is_same()
    }

    /// Discards the entries computed so far, keeping the loaded record. Used
    /// when an entry depends on the output itself and must be recomputed
    /// after the output has been rebuilt.
    pub fn clear(&mut self) {
        self.new.clear();
    }

    /// Forgets the prior record, on disk too. Called right before an output is
    /// rebuilt, so that a build interrupted halfway never leaves behind a
    /// record matching a half-written output.
    pub fn discard(&mut self) -> io::Result<()> {
        self.old = None;

        match fs::remove_file(&self.sidecar) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Persists the computed entries, replacing the sidecar. Call only after
    /// the output has been successfully produced.
    pub fn save(&mut self) -> io::Result<()> {
        let mut text = String::new();

        for (key, value) in &self.new {
            text.push_str(key);
            text.push('=');
            text.push_str(value);
            text.push('\n');
        }

        ensure_parent(&self.sidecar)?;
        fs::write(&self.sidecar, text)?;
        self.old = Some(self.new.clone());

        Ok(())
    }
}

/// Parses a sidecar. Any malformed line makes the whole record invalid.
fn parse(text: &str) -> Option<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();

    for line in text.lines().filter(|line| !line.is_empty()) {
        // keys may contain '=', digests never do
        let (key, value) = line.rsplit_once('=')?;

        if key.is_empty() || !Hash32::is_hex(value) {
            return None;
        }

        map.insert(key.to_string(), value.to_string());
    }

    Some(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    #[test]
    fn test_sidecar_locations() {
        let file = CacheManifest::from_file("/out/forge.pom");
        assert_eq!(file.sidecar(), "/out/forge.pom.cache");

        let dir = CacheManifest::from_directory("/out/data");
        assert_eq!(dir.sidecar(), "/out/data/.cache");
    }

    #[test]
    fn test_no_prior_record_is_never_same() {
        let (_dir, root) = tmp();
        let cache = CacheManifest::from_file(root.join("out.jar"));
        assert!(!cache.is_same());
    }

    #[test]
    fn test_equality_not_containment() {
        let (_dir, root) = tmp();
        let out = root.join("out.jar");

        let mut first = CacheManifest::from_file(&out);
        first.add_str("A", "one").unwrap().add_str("B", "two").unwrap();
        first.save().unwrap();

        let mut removed = CacheManifest::from_file(&out);
        removed.add_str("A", "one").unwrap();
        assert!(!removed.is_same());

        let mut added = CacheManifest::from_file(&out);
        added
            .add_str("A", "one")
            .unwrap()
            .add_str("B", "two")
            .unwrap()
            .add_str("C", "three")
            .unwrap();
        assert!(!added.is_same());

        let mut changed = CacheManifest::from_file(&out);
        changed.add_str("A", "one").unwrap().add_str("B", "2").unwrap();
        assert!(!changed.is_same());

        let mut same = CacheManifest::from_file(&out);
        same.add_str("B", "two").unwrap().add_str("A", "one").unwrap();
        assert!(same.is_same());
    }

    #[test]
    fn test_appended_byte_scenario() {
        let (_dir, root) = tmp();
        let input = root.join("X");
        let output = root.join("forge.pom");
        fs::write(&input, b"0123456789").unwrap();
        fs::write(&output, b"<project/>").unwrap();

        let mut cache = CacheManifest::from_file(&output);
        cache.add_file("input", &input).unwrap();
        cache.save().unwrap();

        let mut recheck = CacheManifest::from_file(&output);
        recheck.add_file("input", &input).unwrap();
        assert!(recheck.is_same());

        fs::write(&input, b"0123456789!").unwrap();
        let mut changed = CacheManifest::from_file(&output);
        changed.add_file("input", &input).unwrap();
        assert!(!changed.is_same());
        changed.save().unwrap();

        let mut third = CacheManifest::from_file(&output);
        third.add_file("input", &input).unwrap();
        assert!(third.is_same());
    }

    #[test]
    fn test_sidecar_is_sorted_key_value_lines() {
        let (_dir, root) = tmp();
        let out = root.join("out.txt");

        let mut cache = CacheManifest::from_file(&out);
        cache.add_str("zeta", "z").unwrap();
        cache.add_bytes("alpha", b"a").unwrap();
        cache.save().unwrap();

        let text = fs::read_to_string(root.join("out.txt.cache")).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("alpha="));
        assert!(lines[1].starts_with("zeta="));
        assert_eq!(lines[1], format!("zeta={}", Hash32::hash_str("z").to_hex()));
    }

    #[test]
    fn test_corrupt_sidecar_is_a_miss() {
        let (_dir, root) = tmp();
        let out = root.join("out.jar");
        fs::write(root.join("out.jar.cache"), "garbage without separator\n").unwrap();

        let mut cache = CacheManifest::from_file(&out);
        assert!(!cache.is_same());

        // a record that would match, were it not for the bad digest
        fs::write(root.join("out.jar.cache"), "A=NOTHEX\n").unwrap();
        cache = CacheManifest::from_file(&out);
        cache.add_str("A", "x").unwrap();
        assert!(!cache.is_same());
    }

    #[test]
    fn test_directory_tree_tracked_per_file() {
        let (_dir, root) = tmp();
        let data = root.join("data");
        fs::create_dir_all(data.join("nested")).unwrap();
        fs::write(data.join("a.txt"), "a").unwrap();
        fs::write(data.join("nested/b.txt"), "b").unwrap();

        let mut cache = CacheManifest::from_directory(&data);
        cache.add_file("tree", &data).unwrap();
        cache.save().unwrap();

        let text = fs::read_to_string(data.join(".cache")).unwrap();
        assert!(text.contains("tree/a.txt="));
        assert!(text.contains("tree/nested/b.txt="));
        assert!(!text.contains(".cache="));

        // the sidecar now lives inside the tree but is not part of it
        let mut again = CacheManifest::from_directory(&data);
        again.add_file("tree", &data).unwrap();
        assert!(again.is_same());

        fs::write(data.join("nested/b.txt"), "changed").unwrap();
        let mut changed = CacheManifest::from_directory(&data);
        changed.add_file("tree", &data).unwrap();
        assert!(!changed.is_same());
    }

    #[test]
    fn test_relative_keys() {
        let (_dir, root) = tmp();
        fs::create_dir_all(root.join("libs")).unwrap();
        fs::write(root.join("libs/a.jar"), "jar").unwrap();

        let mut cache = CacheManifest::from_file(root.join("out.txt"));
        cache.add_relative(root.join("libs/a.jar")).unwrap();
        cache.save().unwrap();

        let text = fs::read_to_string(root.join("out.txt.cache")).unwrap();
        assert!(text.starts_with("libs/a.jar="));
    }

    #[test]
    fn test_up_to_date_requires_output() {
        let (_dir, root) = tmp();
        let out = root.join("out.jar");

        let mut cache = CacheManifest::from_file(&out);
        cache.add_str("args", "-x").unwrap();
        cache.save().unwrap();

        let mut check = CacheManifest::from_file(&out);
        check.add_str("args", "-x").unwrap();
        assert!(check.is_same());
        assert!(!check.is_up_to_date(&out));

        fs::write(&out, "jar").unwrap();
        assert!(check.is_up_to_date(&out));
    }

    #[test]
    fn test_discard_forgets_record() {
        let (_dir, root) = tmp();
        let out = root.join("out.jar");

        let mut cache = CacheManifest::from_file(&out);
        cache.add_str("A", "a").unwrap();
        cache.save().unwrap();
        assert!(cache.is_same());

        cache.discard().unwrap();
        assert!(!cache.is_same());
        assert!(!root.join("out.jar.cache").exists());

        // nothing to remove the second time
        cache.discard().unwrap();
    }

    #[test]
    fn test_foreign_sidecar_is_not_content() {
        let (_dir, root) = tmp();
        let data = root.join("inject");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("A.java"), "class A {}").unwrap();
        fs::write(data.join(".cache"), "whatever").unwrap();

        let mut cache = CacheManifest::from_file(root.join("out.jar"));
        cache.add_file("inject", &data).unwrap();
        cache.save().unwrap();

        let text = fs::read_to_string(root.join("out.jar.cache")).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("inject/A.java="));
    }

    #[test]
    fn test_missing_input_file_is_an_error() {
        let (_dir, root) = tmp();
        let mut cache = CacheManifest::from_file(root.join("out.jar"));
        assert!(cache.add_file("input", root.join("nope")).is_err());
    }
}
