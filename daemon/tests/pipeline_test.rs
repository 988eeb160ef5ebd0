use devscope_daemon::config::{PipelineConfig, TransportConfig};
use devscope_daemon::pipeline::{
    Chunk, ChunkRouter, ChunkSink, ChunkTarget, Fragment, LocalStorage, PipelineError, StreamId,
    StreamOwner, UploadPipeline,
};
use devscope_daemon::transport::memory::{AckingDevice, MemoryConnector};
use devscope_daemon::transport::TransportRegistry;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct Collect {
    chunks: Mutex<Vec<(String, Vec<u8>, bool)>>,
}

impl ChunkSink for Collect {
    fn deliver(&self, chunk: Chunk) -> Result<(), PipelineError> {
        let name = chunk.stream.name.clone();
        let is_last = chunk.is_last;
        self.chunks.lock().push((name, chunk.into_data(), is_last));
        Ok(())
    }
}

fn pipeline(capacity: usize, workers: usize, sink: Arc<dyn ChunkSink>) -> UploadPipeline {
    let config = PipelineConfig {
        chunk_capacity: capacity,
        workers,
        ..Default::default()
    };
    UploadPipeline::new(&config, sink).unwrap()
}

fn stream(name: &str) -> StreamId {
    StreamId::new(
        StreamOwner::new("JOB1", 0),
        name,
        ChunkTarget::Remote { device: 1 },
    )
}

#[test]
fn test_overflow_dispatches_open_chunk_then_exact_chunk() {
    let sink = Arc::new(Collect::default());
    let pipeline = pipeline(10, 2, sink.clone());
    let trace = stream("trace.bin");

    pipeline.send(&trace, Fragment::new(vec![1u8; 5])).unwrap();
    assert_eq!(pipeline.cached_len(&trace), Some(5));

    pipeline.send(&trace, Fragment::new(vec![2u8; 10])).unwrap();
    assert_eq!(pipeline.cached_len(&trace), None);

    assert!(pipeline.flush());
    let chunks = sink.chunks.lock();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].1, vec![1u8; 5]);
    assert_eq!(chunks[1].1, vec![2u8; 10]);
}

#[test]
fn test_same_owner_chunks_arrive_in_order() {
    let sink = Arc::new(Collect::default());
    let pipeline = pipeline(4, 4, sink.clone());
    let names = ["a.data", "b.data", "c.data"];

    for round in 0..20u8 {
        for name in names {
            // Each 4-byte fragment fills a chunk; the next send dispatches it.
            pipeline.send(&stream(name), Fragment::new(vec![round; 4])).unwrap();
        }
    }
    assert!(pipeline.flush());

    let chunks = sink.chunks.lock();
    for name in names {
        let rounds: Vec<u8> = chunks
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, data, _)| data[0])
            .collect();
        assert_eq!(rounds, (0..20u8).collect::<Vec<_>>());
    }
}

#[test]
fn test_concurrent_senders_never_interleave_fragments() {
    const FRAGMENT: usize = 4;
    let sink = Arc::new(Collect::default());
    let pipeline = Arc::new(pipeline(64, 3, sink.clone()));

    let senders: Vec<_> = (0..6u8)
        .map(|t| {
            let pipeline = Arc::clone(&pipeline);
            std::thread::spawn(move || {
                // Threads 0..3 share one stream, the rest get their own.
                let name = if t < 3 {
                    "shared.data".to_string()
                } else {
                    format!("own-{}.data", t)
                };
                let id = stream(&name);
                for _ in 0..200 {
                    pipeline.send(&id, Fragment::new(vec![t; FRAGMENT])).unwrap();
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().unwrap();
    }
    assert!(pipeline.flush());

    let chunks = sink.chunks.lock();
    let mut per_thread = [0usize; 6];
    for (_, data, _) in chunks.iter() {
        assert!(data.len() <= 64);
        assert_eq!(data.len() % FRAGMENT, 0);
        for group in data.chunks(FRAGMENT) {
            assert!(group.iter().all(|b| *b == group[0]));
            per_thread[group[0] as usize] += 1;
        }
    }
    assert_eq!(per_thread, [200; 6]);
}

#[test]
fn test_file_streams_written_through_router() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(LocalStorage::new());
    let registry = Arc::new(TransportRegistry::new(
        Arc::new(MemoryConnector::new(Arc::new(AckingDevice))),
        TransportConfig::default(),
    ));
    let router = Arc::new(ChunkRouter::new(Arc::clone(&storage), registry));
    let pipeline = pipeline(8, 2, router);

    let path = dir.path().join("JOB1").join("device_0").join("ai_core.data");
    let id = StreamId::new(
        StreamOwner::new("JOB1", 0),
        "ai_core.data",
        ChunkTarget::File { path: path.clone() },
    );
    pipeline.send(&id, Fragment::new(b"hello ".to_vec())).unwrap();
    pipeline.send(&id, Fragment::new(b"chunked ".to_vec())).unwrap();
    pipeline.send(&id, Fragment::new(b"world".to_vec()).last()).unwrap();
    assert!(pipeline.flush_owner(&StreamOwner::new("JOB1", 0)));

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello chunked world");
    assert_eq!(storage.open_count(), 0);
}

#[test]
fn test_remote_chunk_without_transport_is_not_fatal() {
    let storage = Arc::new(LocalStorage::new());
    let registry = Arc::new(TransportRegistry::new(
        Arc::new(MemoryConnector::new(Arc::new(AckingDevice))),
        TransportConfig::default(),
    ));
    let router = Arc::new(ChunkRouter::new(storage, registry));
    let pipeline = pipeline(8, 1, router);

    let id = stream("relay.data");
    pipeline.send(&id, Fragment::new(vec![0u8; 4]).last()).unwrap();
    assert!(pipeline.flush());

    // Delivery failed, yet the pipeline still accepts work.
    pipeline.send(&id, Fragment::new(vec![1u8; 4])).unwrap();
    pipeline.shutdown();
    assert!(matches!(
        pipeline.send(&id, Fragment::new(vec![2u8; 1])),
        Err(PipelineError::Closed)
    ));
}
