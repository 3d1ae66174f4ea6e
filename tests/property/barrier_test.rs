// tests/property/barrier_test.rs

use proptest::prelude::*;
use riptide::core::replication::SyncBarrier;
use std::sync::Arc;
use std::time::Duration;

/// For any permutation of EOF-arrival times, no worker may observe release
/// before every shard has arrived. Each waiter records the arrival count it
/// saw at wake-up; that count must always equal N.
fn check_barrier(n: usize, delays_ms: Vec<u8>) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .build()
        .expect("runtime");

    runtime.block_on(async move {
        let barrier = Arc::new(SyncBarrier::new(n));
        let mut handles = Vec::new();
        for delay in delays_ms.iter().take(n) {
            let barrier = barrier.clone();
            let delay = Duration::from_millis(u64::from(*delay) % 20);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                barrier.arrive();
                barrier.released().await;
                barrier.arrived()
            }));
        }

        for handle in handles {
            let seen_at_wake = tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("barrier must release")
                .expect("no panic");
            assert_eq!(seen_at_wake, n, "a worker woke before all {n} arrived");
        }
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn no_early_release_under_any_arrival_order(
        n in 1usize..6,
        delays in proptest::collection::vec(any::<u8>(), 6),
    ) {
        check_barrier(n, delays);
    }
}
