//! Production chunk sink: remote channels or local files.

use super::chunk::{Chunk, ChunkTarget, StreamOwner};
use super::storage::LocalStorage;
use super::{ChunkSink, PipelineError};
use crate::transport::TransportRegistry;
use devscope_shared::protocol::messages::{FileChunk, WireMessage};
use std::sync::Arc;

pub struct ChunkRouter {
    storage: Arc<LocalStorage>,
    transports: Arc<TransportRegistry>,
}

impl ChunkRouter {
    pub fn new(storage: Arc<LocalStorage>, transports: Arc<TransportRegistry>) -> Self {
        Self {
            storage,
            transports,
        }
    }
}

impl ChunkSink for ChunkRouter {
    fn deliver(&self, chunk: Chunk) -> Result<(), PipelineError> {
        match chunk.stream.sink.clone() {
            ChunkTarget::Remote { device } => {
                let job_id = chunk.stream.owner.job_id.clone();
                let channel = self.transports.get(&job_id, device).ok_or_else(|| {
                    PipelineError::NoTransport {
                        job_id: job_id.clone(),
                        device,
                    }
                })?;
                let message = WireMessage::FileChunk(FileChunk {
                    job_id,
                    device_id: chunk.stream.owner.device,
                    stream_name: chunk.stream.name.clone(),
                    start_ns: chunk.start_ns,
                    end_ns: chunk.end_ns,
                    is_last: chunk.is_last,
                    data: chunk.into_data(),
                });
                channel.send_request(&message)?;
                Ok(())
            }
            ChunkTarget::File { path } => {
                let written = self
                    .storage
                    .append(Some(&chunk.stream.owner), &path, chunk.data());
                if chunk.is_last {
                    self.storage.close(&path);
                }
                written
            }
        }
    }

    fn close_owner(&self, owner: &StreamOwner) {
        self.storage.close_owner(owner);
    }

    fn close_all(&self) {
        self.storage.close_all();
    }
}
