//! Chunk planning and progress math for blob streaming.

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024; // 8 KiB

/// One chunk of a blob: byte offset and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub offset: u64,
    pub len: usize,
}

/// Ordered chunk ranges covering `total_len` bytes.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    total_len: u64,
    chunk_size: usize,
    next: u64,
}

/// Split a blob into fixed-size chunks; the last one may be shorter. `chunk_size == 0` uses the default.
pub fn plan_chunks(total_len: u64, chunk_size: usize) -> ChunkPlan {
    let chunk_size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    ChunkPlan {
        total_len,
        chunk_size,
        next: 0,
    }
}

impl ChunkPlan {
    pub fn chunk_count(&self) -> u64 {
        self.total_len.div_ceil(self.chunk_size as u64)
    }
}

impl Iterator for ChunkPlan {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<ChunkRange> {
        if self.next >= self.total_len {
            return None;
        }
        let len = (self.total_len - self.next).min(self.chunk_size as u64) as usize;
        let range = ChunkRange {
            offset: self.next,
            len,
        };
        self.next += len as u64;
        Some(range)
    }
}

/// Progress as `done / total`, clamped to [0, 1]. An empty blob reports 0 until its stream ends.
pub fn progress(done: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64).clamp(0.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_chunks() {
        let chunks: Vec<_> = plan_chunks(100, 30).collect();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], ChunkRange { offset: 0, len: 30 });
        assert_eq!(chunks[3], ChunkRange { offset: 90, len: 10 });
    }

    #[test]
    fn split_exact_multiple() {
        let plan = plan_chunks(24 * 1024, DEFAULT_CHUNK_SIZE);
        assert_eq!(plan.chunk_count(), 3);
        let chunks: Vec<_> = plan.collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len == DEFAULT_CHUNK_SIZE));
        assert_eq!(chunks[2].offset, 16 * 1024);
    }

    #[test]
    fn split_single_chunk() {
        let chunks: Vec<_> = plan_chunks(10, 100).collect();
        assert_eq!(chunks, vec![ChunkRange { offset: 0, len: 10 }]);
    }

    #[test]
    fn split_zero_length() {
        let plan = plan_chunks(0, 30);
        assert_eq!(plan.chunk_count(), 0);
        assert_eq!(plan.count(), 0);
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        let chunks: Vec<_> = plan_chunks(DEFAULT_CHUNK_SIZE as u64 * 2, 0).collect();
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn progress_is_normalized() {
        assert_eq!(progress(0, 100), 0.0);
        assert_eq!(progress(50, 100), 0.5);
        assert_eq!(progress(100, 100), 1.0);
        assert_eq!(progress(150, 100), 1.0);
        assert_eq!(progress(0, 0), 0.0);
    }
}
