//! Local blob digest: SHA-256 over the bytes as they are streamed.
//! Not sent on the wire; lets the application compare sender and receiver copies.

use sha2::{Digest, Sha256};

/// Incremental SHA-256 over a blob stream.
#[derive(Clone, Default)]
pub struct BlobDigest {
    hasher: Sha256,
    bytes: u64,
}

impl BlobDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn finalize(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}

impl std::fmt::Debug for BlobDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobDigest")
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

/// SHA-256 of a whole blob.
pub fn digest_of(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Lowercase hex rendering of a digest.
pub fn to_hex(digest: &[u8; 32]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn incremental_matches_one_shot() {
        let mut blob = vec![0u8; 20_000];
        rand::thread_rng().fill_bytes(&mut blob);
        let mut d = BlobDigest::new();
        for chunk in blob.chunks(8192) {
            d.update(chunk);
        }
        assert_eq!(d.len(), blob.len() as u64);
        assert_eq!(d.finalize(), digest_of(&blob));
    }

    #[test]
    fn empty_blob_digest() {
        let d = BlobDigest::new();
        assert!(d.is_empty());
        assert_eq!(
            to_hex(&d.finalize()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn tampered_blob_differs() {
        assert_ne!(digest_of(b"hello chunk"), digest_of(b"tampered"));
    }
}
