use std::fmt::Write;

/// A 32-byte BLAKE3 digest used for content-addressing and change detection.
///
/// Every [`CacheManifest`](crate::CacheManifest) entry is the lowercase hex
/// form of one of these, so two entries can be compared textually.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// Length of the hex rendering.
    pub const HEX_LEN: usize = 64;

    /// Digest of an in-memory buffer.
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Digest of a string, identical to hashing its UTF-8 bytes.
    pub fn hash_str(text: &str) -> Self {
        Self::hash(text.as_bytes())
    }

    /// Digest of a file's contents. Large files are memory-mapped and hashed
    /// on the rayon pool.
    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    pub fn to_hex(self) -> String {
        let mut acc = String::with_capacity(Self::HEX_LEN);

        for byte in self.0 {
            // writing into a String cannot fail
            let _ = write!(acc, "{byte:02x}");
        }

        acc
    }

    /// Whether `text` has the exact shape of [`Hash32::to_hex`] output.
    pub fn is_hex(text: &str) -> bool {
        text.len() == Self::HEX_LEN
            && text
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_is_lowercase_fixed_width() {
        let hex = Hash32::hash(b"hello").to_hex();
        assert_eq!(hex.len(), 64);
        assert!(Hash32::is_hex(&hex));
        assert_eq!(hex, hex.to_lowercase());
    }

    #[test]
    fn test_known_digest() {
        // BLAKE3 of the empty input
        assert_eq!(
            Hash32::hash(b"").to_hex(),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[test]
    fn test_string_and_bytes_agree() {
        assert_eq!(Hash32::hash_str("abc"), Hash32::hash(b"abc"));
    }

    #[test]
    fn test_file_digest_matches_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        assert_eq!(Hash32::hash_file(&path).unwrap(), Hash32::hash(b"0123456789"));
    }

    #[test]
    fn test_is_hex_rejects_other_shapes() {
        assert!(!Hash32::is_hex("abc"));
        assert!(!Hash32::is_hex(&"A".repeat(64)));
        assert!(!Hash32::is_hex(&"g".repeat(64)));
    }
}
