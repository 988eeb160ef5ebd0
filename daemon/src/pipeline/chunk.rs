//! Chunk buffers and stream identities

use devscope_shared::DeviceId;
use std::fmt;
use std::path::PathBuf;

/// The job/device pair a stream belongs to. Chunks of one owner are delivered
/// in order by the same worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamOwner {
    pub job_id: String,
    pub device: DeviceId,
}

impl StreamOwner {
    pub fn new(job_id: impl Into<String>, device: DeviceId) -> Self {
        Self {
            job_id: job_id.into(),
            device,
        }
    }
}

impl fmt::Display for StreamOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_id, self.device)
    }
}

/// Where a worker delivers a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChunkTarget {
    /// Re-encode as `FileChunk` and send over the job's channel to `device`.
    Remote { device: DeviceId },
    /// Append to a local file.
    File { path: PathBuf },
}

impl ChunkTarget {
    pub fn label(&self) -> &'static str {
        match self {
            ChunkTarget::Remote { .. } => "remote",
            ChunkTarget::File { .. } => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub owner: StreamOwner,
    pub name: String,
    pub sink: ChunkTarget,
}

impl StreamId {
    pub fn new(owner: StreamOwner, name: impl Into<String>, sink: ChunkTarget) -> Self {
        Self {
            owner,
            name: name.into(),
            sink,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// One piece of stream data handed to [`UploadPipeline::send`](super::UploadPipeline::send).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    pub data: Vec<u8>,
    pub start_ns: u64,
    pub end_ns: u64,
    /// Final fragment of the stream; forces a dispatch and closes the target.
    pub is_last: bool,
}

impl Fragment {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn last(mut self) -> Self {
        self.is_last = true;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A fixed-capacity buffer of one stream's bytes.
///
/// Exactly one holder at a time: the stream's cache slot while open, then the
/// worker queue, then the sink.
#[derive(Debug)]
pub struct Chunk {
    pub stream: StreamId,
    data: Vec<u8>,
    capacity: usize,
    pub start_ns: u64,
    pub end_ns: u64,
    pub is_last: bool,
}

impl Chunk {
    pub fn with_capacity(stream: StreamId, capacity: usize) -> Self {
        Self {
            stream,
            data: Vec::with_capacity(capacity),
            capacity,
            start_ns: 0,
            end_ns: 0,
            is_last: false,
        }
    }

    /// A chunk holding exactly `fragment`.
    pub fn exact(stream: StreamId, fragment: Fragment) -> Self {
        Self {
            stream,
            capacity: fragment.data.len(),
            start_ns: fragment.start_ns,
            end_ns: fragment.end_ns,
            is_last: fragment.is_last,
            data: fragment.data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Append a fragment that fits. Returns false and leaves the chunk
    /// untouched otherwise.
    pub fn append(&mut self, fragment: &Fragment) -> bool {
        if fragment.len() > self.remaining() {
            return false;
        }
        if self.data.is_empty() {
            self.start_ns = fragment.start_ns;
        }
        self.end_ns = self.end_ns.max(fragment.end_ns);
        self.data.extend_from_slice(&fragment.data);
        true
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> StreamId {
        StreamId::new(
            StreamOwner::new("job", 0),
            "trace.bin",
            ChunkTarget::File {
                path: PathBuf::from("trace.bin"),
            },
        )
    }

    fn timed(data: Vec<u8>, start_ns: u64, end_ns: u64) -> Fragment {
        Fragment {
            start_ns,
            end_ns,
            ..Fragment::new(data)
        }
    }

    #[test]
    fn test_append_respects_capacity() {
        let mut chunk = Chunk::with_capacity(stream(), 8);
        assert!(chunk.append(&timed(vec![1; 5], 10, 20)));
        assert_eq!(chunk.remaining(), 3);
        assert!(!chunk.append(&Fragment::new(vec![2; 4])));
        assert_eq!(chunk.len(), 5);
        assert!(chunk.append(&timed(vec![3; 3], 21, 30)));
        assert_eq!(chunk.remaining(), 0);
        assert_eq!((chunk.start_ns, chunk.end_ns), (10, 30));
    }

    #[test]
    fn test_exact_chunk_is_full() {
        let chunk = Chunk::exact(stream(), Fragment::new(vec![0; 10]).last());
        assert_eq!(chunk.capacity(), 10);
        assert_eq!(chunk.remaining(), 0);
        assert!(chunk.is_last);
    }

    #[test]
    fn test_display() {
        assert_eq!(stream().to_string(), "job/0/trace.bin");
    }
}
