use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use proptest::prelude::*;
use tokio::sync::Barrier;
use tokio::time::Instant;
use warden::access_log::{LogConfig, LogPipeline, MemorySink};
use warden::limiter::{AdmissionController, Bucket, CounterStore, MemoryCounterStore, RateLimitConfig};
use warden::{Gateway, Request, Response};

const ANON: Bucket = Bucket { capacity: 10.0, rate: 10.0 / 60.0 };

proptest! {
    /// Whatever the request timing, admitted cost stays within
    /// `capacity + floor(elapsed * rate)`.
    #[test]
    fn admitted_cost_is_bounded_by_refill(
        steps in prop::collection::vec((0u64..4_000, 1u32..4), 1..150)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        rt.block_on(async {
            let store = MemoryCounterStore::new();
            let start = Instant::now();
            let mut admitted = 0.0;

            for (gap_ms, cost) in steps {
                tokio::time::advance(Duration::from_millis(gap_ms)).await;
                let take = store.take("rl:ip:198.51.100.7", ANON, f64::from(cost)).await.unwrap();
                if take.allowed {
                    admitted += f64::from(cost);
                }

                let elapsed = start.elapsed().as_secs_f64();
                let budget = ANON.capacity + (elapsed * ANON.rate + 1e-9).floor();
                prop_assert!(admitted <= budget, "admitted {admitted} > budget {budget}");
                prop_assert!(take.remaining >= 0.0 && take.remaining <= ANON.capacity);
                if take.allowed {
                    prop_assert!(take.retry_after.is_zero());
                }
            }
            Ok(())
        })?;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_takes_never_over_admit() {
    const CALLERS: usize = 64;
    let store = Arc::new(MemoryCounterStore::new());
    let barrier = Arc::new(Barrier::new(CALLERS));
    let slow = Bucket { capacity: 10.0, rate: 1e-6 };

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..CALLERS {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        tasks.spawn(async move {
            barrier.wait().await;
            store.take("rl:ip:203.0.113.1", slow, 1.0).await.unwrap().allowed
        });
    }

    let mut allowed = 0;
    while let Some(res) = tasks.join_next().await {
        allowed += usize::from(res.unwrap());
    }
    assert_eq!(allowed, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_through_the_gateway_share_one_budget() {
    const REQUESTS: usize = 40;
    let (log, drainer) = LogPipeline::new(&LogConfig::default(), Arc::new(MemorySink::new()));
    let gateway = Gateway::new(
        AdmissionController::new(Arc::new(MemoryCounterStore::new()), RateLimitConfig::default()),
        log,
    );
    let drain = tokio::spawn(drainer.run());
    let peer: SocketAddr = "192.0.2.10:41000".parse().unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..REQUESTS {
        let gateway = gateway.clone();
        tasks.spawn(async move {
            let req = Request::from(http::Request::get("/search").body(Bytes::new()).unwrap())
                .with_remote_addr(peer);
            let res = gateway
                .handle(req, |_req| async {
                    tokio::task::yield_now().await;
                    Response::text("ok")
                })
                .await
                .unwrap();
            res.status_code()
        });
    }

    let mut ok = 0;
    let mut limited = 0;
    while let Some(res) = tasks.join_next().await {
        match res.unwrap() {
            StatusCode::OK => ok += 1,
            StatusCode::TOO_MANY_REQUESTS => limited += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    // Ten tokens, and a handful of milliseconds cannot refill another whole one.
    assert_eq!(ok, 10);
    assert_eq!(limited, REQUESTS - 10);

    gateway.log().stop();
    let stats = drain.await.unwrap();
    assert_eq!(stats.flushed, REQUESTS as u64);
}
