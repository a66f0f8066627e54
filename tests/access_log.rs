use std::sync::Arc;
use std::time::Duration;

use http::Method;
use warden::RequestContext;
use warden::access_log::{JsonLinesSink, LogConfig, LogPipeline, LogRecord, MemorySink};

fn record(producer: usize, seq: usize) -> LogRecord {
    let ctx = RequestContext::new(format!("10.0.{producer}.1"), Method::GET, format!("/p/{producer}/{seq}"));
    LogRecord::new(&ctx, 200, Duration::from_millis(1))
}

/// Every submitted record ends up flushed, lost with a failed batch, or
/// counted as dropped at the door.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_submitted_record_is_accounted_for() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 500;

    let sink = MemorySink::new();
    let config = LogConfig { batch_size: 32, buffer_capacity: 64, ..LogConfig::default() };
    let (pipeline, drainer) = LogPipeline::new(&config, Arc::new(sink.clone()));
    let drain = tokio::spawn(drainer.run());

    let mut producers = tokio::task::JoinSet::new();
    for p in 0..PRODUCERS {
        let pipeline = pipeline.clone();
        producers.spawn(async move {
            for i in 0..PER_PRODUCER {
                pipeline.submit(record(p, i));
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
    }
    while let Some(res) = producers.join_next().await {
        res.unwrap();
    }

    pipeline.stop();
    let stats = drain.await.unwrap();

    let submitted = (PRODUCERS * PER_PRODUCER) as u64;
    assert_eq!(stats.accepted + stats.dropped, submitted);
    assert_eq!(stats.flushed + stats.lost, stats.accepted);
    assert_eq!(sink.records().len() as u64, stats.flushed);
    assert!(sink.batches().iter().all(|b| !b.is_empty() && b.len() <= 32));
}

#[tokio::test]
async fn json_lines_sink_behind_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("access.jsonl");
    let config = LogConfig { path: Some(path.clone()), ..LogConfig::default() };
    let (pipeline, drainer) = LogPipeline::new(&config, Arc::new(JsonLinesSink::new(&path)));

    for i in 0..3 {
        pipeline.submit(record(0, i));
    }
    pipeline.stop();
    let stats = drainer.run().await;
    assert_eq!(stats.flushed, 3);

    let text = std::fs::read_to_string(&path).unwrap();
    let paths: Vec<String> = text
        .lines()
        .map(|l| serde_json::from_str::<LogRecord>(l).unwrap().path().to_owned())
        .collect();
    assert_eq!(paths, ["/p/0/0", "/p/0/1", "/p/0/2"]);
}
