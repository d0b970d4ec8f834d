// Property test for the per-key serializer's coalescing discipline.
//
// For any burst submitted while the first execution is parked, exactly the
// first item runs, followed by only the most recent item when the burst
// had more than one element. Intermediate items never execute.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::sync::{mpsc, Semaphore};

use notelens_daemon::serial::SerialQueue;

fn executed_for_burst(items: &[u32]) -> Vec<u32> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("test runtime");

    runtime.block_on(async {
        let gate = Arc::new(Semaphore::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let queue = {
            let gate = Arc::clone(&gate);
            SerialQueue::new(move |_key: u8, item: u32| {
                let gate = Arc::clone(&gate);
                let done = done_tx.clone();
                async move {
                    let permit = gate.acquire().await.expect("gate closed");
                    permit.forget();
                    done.send(item).expect("done channel closed");
                    Ok(())
                }
            })
        };

        queue.submit(0, items[0]);
        // Let the first execution start and park on the gate.
        tokio::task::yield_now().await;
        for &item in &items[1..] {
            queue.submit(0, item);
        }

        gate.add_permits(items.len());
        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.active_keys() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("queue should drain");

        let mut executed = Vec::new();
        while let Ok(item) = done_rx.try_recv() {
            executed.push(item);
        }
        executed
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn burst_executes_first_then_only_the_last(
        items in proptest::collection::vec(0u32..1000, 1..40)
    ) {
        let executed = executed_for_burst(&items);
        let expected = if items.len() == 1 {
            vec![items[0]]
        } else {
            vec![items[0], items[items.len() - 1]]
        };
        prop_assert_eq!(executed, expected);
    }
}
