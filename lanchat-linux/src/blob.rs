//! Blob file I/O: chunked reads for sending, a temporary sink for receiving, and persisting.

use std::path::{Path, PathBuf};

use lanchat_core::chunk::{plan_chunks, ChunkPlan};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A local file offered to the peer. Name and size are fixed when it is opened.
#[derive(Debug, Clone)]
pub struct BlobSource {
    path: PathBuf,
    name: String,
    size: u64,
}

impl BlobSource {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "blob".to_string());
        Ok(Self {
            path,
            name,
            size: meta.len(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open for streaming the declared size in `chunk_size` pieces.
    pub async fn reader(&self, chunk_size: usize) -> std::io::Result<ChunkReader> {
        Ok(ChunkReader {
            file: File::open(&self.path).await?,
            plan: plan_chunks(self.size, chunk_size),
        })
    }
}

pub struct ChunkReader {
    file: File,
    plan: ChunkPlan,
}

impl ChunkReader {
    /// Next chunk, `None` once the declared size is read. A file that shrank is an error.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let Some(range) = self.plan.next() else {
            return Ok(None);
        };
        let mut buf = vec![0u8; range.len];
        self.file.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }
}

/// Temporary file receiving a blob, named `<uuid>.part`.
pub struct BlobSink {
    path: PathBuf,
    file: File,
}

impl BlobSink {
    pub async fn create(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.part", uuid::Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data).await
    }

    /// Flush to disk and close. The blob stays at `path()`.
    pub async fn finalize(mut self) -> std::io::Result<PathBuf> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(self.path)
    }

    /// Close and delete the partial blob.
    pub async fn discard(self) -> std::io::Result<()> {
        let Self { path, file } = self;
        drop(file);
        match fs::remove_file(&path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Move a received blob into `dir` as `name`, adding ` (n)` before the extension if taken.
/// Only the final path component of `name` is used.
pub async fn persist(temp: &Path, dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir).await?;
    let name = safe_file_name(name);
    let mut dest = dir.join(&name);
    let mut n = 1;
    while fs::try_exists(&dest).await? {
        dest = dir.join(numbered(&name, n));
        n += 1;
    }
    if fs::rename(temp, &dest).await.is_err() {
        // Different filesystem: copy, then drop the temporary.
        fs::copy(temp, &dest).await?;
        fs::remove_file(temp).await?;
    }
    Ok(dest)
}

fn safe_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    match base {
        "" | "." | ".." => "blob".to_string(),
        other => other.to_string(),
    }
}

fn numbered(name: &str, n: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, n, ext),
        _ => format!("{} ({})", name, n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[tokio::test]
    async fn source_reads_declared_size_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        let mut blob = vec![0u8; 20_000];
        rand::thread_rng().fill_bytes(&mut blob);
        std::fs::write(&path, &blob).unwrap();

        let src = BlobSource::open(&path).await.unwrap();
        assert_eq!(src.name(), "photo.jpg");
        assert_eq!(src.size(), 20_000);
        let mut reader = src.reader(8192).await.unwrap();
        let mut out = Vec::new();
        let mut sizes = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            sizes.push(chunk.len());
            out.extend(chunk);
        }
        assert_eq!(sizes, vec![8192, 8192, 3616]);
        assert_eq!(out, blob);
    }

    #[tokio::test]
    async fn shrunk_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, vec![1u8; 100]).unwrap();
        let src = BlobSource::open(&path).await.unwrap();
        std::fs::write(&path, vec![1u8; 10]).unwrap();
        let mut reader = src.reader(64).await.unwrap();
        assert!(reader.next_chunk().await.is_err());
    }

    #[tokio::test]
    async fn directory_is_not_a_source() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BlobSource::open(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn sink_finalize_and_discard() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = BlobSink::create(dir.path()).await.unwrap();
        sink.write(b"hello ").await.unwrap();
        sink.write(b"world").await.unwrap();
        let path = sink.finalize().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        assert_eq!(path.extension().unwrap(), "part");

        let mut sink = BlobSink::create(dir.path()).await.unwrap();
        sink.write(b"partial").await.unwrap();
        let partial = sink.path().to_path_buf();
        sink.discard().await.unwrap();
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn persist_avoids_overwrite_and_strips_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = dir.path().join("inbox");
        let first = dir.path().join("1.part");
        let second = dir.path().join("2.part");
        std::fs::write(&first, b"one").unwrap();
        std::fs::write(&second, b"two").unwrap();

        let a = persist(&first, &inbox, "../notes.txt").await.unwrap();
        let b = persist(&second, &inbox, "notes.txt").await.unwrap();
        assert_eq!(a, inbox.join("notes.txt"));
        assert_eq!(b, inbox.join("notes (1).txt"));
        assert_eq!(std::fs::read(&b).unwrap(), b"two");
        assert!(!first.exists());
    }

    #[test]
    fn file_name_sanitizing() {
        assert_eq!(safe_file_name("a/b/c.txt"), "c.txt");
        assert_eq!(safe_file_name(".."), "blob");
        assert_eq!(numbered("archive", 2), "archive (2)");
        assert_eq!(numbered(".bashrc", 1), ".bashrc (1)");
    }
}
