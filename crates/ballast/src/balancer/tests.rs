use super::*;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{
    sync::{Arc, RwLock},
    thread,
    time::Instant,
};
use tokio::time::{sleep, timeout};

struct Harness {
    dispatcher: Dispatcher,
    // Held so the queues stay open; nothing consumes them.
    queues: Vec<mpsc::Receiver<WorkerMessage>>,
}

fn harness(
    workers: usize,
    queue_capacity: usize,
    policy: Policy,
    saturation: SaturationPolicy,
) -> Harness {
    let config = BalancerConfig::new(workers, queue_capacity, policy).with_saturation(saturation);
    let (txs, rxs) = (0..workers)
        .map(|_| mpsc::channel(queue_capacity))
        .unzip();
    Harness {
        dispatcher: Dispatcher::new(&config, txs),
        queues: rxs,
    }
}

fn loads(dispatcher: &Dispatcher) -> Vec<usize> {
    (0..dispatcher.pool.len())
        .map(|i| dispatcher.pool.pending(WorkerId(i)))
        .collect()
}

async fn dispatch_noop(dispatcher: &mut Dispatcher) -> Result<WorkerId> {
    let (request, _handle) = Request::new(|| ());
    dispatcher.dispatch(request).await
}

#[tokio::test]
async fn scenario_least_loaded_spreads_five_over_three() {
    let Harness {
        mut dispatcher,
        queues: _queues,
    } = harness(3, 16, Policy::LeastLoaded, SaturationPolicy::Block);

    for _ in 0..5 {
        let before = loads(&dispatcher);
        let min = *before.iter().min().unwrap();
        let chosen = dispatch_noop(&mut dispatcher).await.unwrap();
        assert_eq!(before[chosen.index()], min);
        dispatcher.pool.assert_invariants();
    }

    let mut sorted = loads(&dispatcher);
    sorted.sort_unstable();
    assert_eq!(sorted, vec![1, 2, 2]);

    let min = dispatcher.pool.peek_min().unwrap();
    assert_eq!(dispatcher.pool.pending(min), 1);

    let snapshot = dispatcher.snapshot();
    assert_eq!(snapshot.total_pending(), 5);
    assert_eq!(snapshot.dispatched, 5);
    assert_eq!(snapshot.completed, 0);
    assert!((snapshot.mean - 5.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn scenario_round_robin_cycles_over_three() {
    let Harness {
        mut dispatcher,
        queues: _queues,
    } = harness(3, 16, Policy::RoundRobin, SaturationPolicy::Block);

    let mut sequence = Vec::new();
    for _ in 0..7 {
        sequence.push(dispatch_noop(&mut dispatcher).await.unwrap().index());
    }
    assert_eq!(sequence, vec![0, 1, 2, 0, 1, 2, 0]);
    assert_eq!(loads(&dispatcher), vec![3, 2, 2]);
}

#[tokio::test]
async fn scenario_completion_rebalances_two_workers() {
    let Harness {
        mut dispatcher,
        queues: _queues,
    } = harness(2, 16, Policy::LeastLoaded, SaturationPolicy::Block);

    let first = dispatch_noop(&mut dispatcher).await.unwrap();
    assert_eq!(dispatcher.pool.pending(first), 1);

    dispatcher.completed(first);
    assert_eq!(loads(&dispatcher), vec![0, 0]);
    dispatcher.pool.assert_invariants();

    let second = dispatch_noop(&mut dispatcher).await.unwrap();
    assert_eq!(dispatcher.pool.pending(second), 1);
    assert_eq!(loads(&dispatcher).iter().sum::<usize>(), 1);
}

#[tokio::test]
async fn round_robin_ignores_load() {
    let Harness {
        mut dispatcher,
        queues: _queues,
    } = harness(4, 16, Policy::RoundRobin, SaturationPolicy::Block);

    for _ in 0..8 {
        dispatch_noop(&mut dispatcher).await.unwrap();
    }
    // Skew the load: worker 0 idle, worker 3 half done.
    dispatcher.completed(WorkerId(0));
    dispatcher.completed(WorkerId(0));
    dispatcher.completed(WorkerId(3));
    assert_eq!(loads(&dispatcher), vec![0, 2, 2, 1]);

    let mut sequence = Vec::new();
    for _ in 0..8 {
        sequence.push(dispatch_noop(&mut dispatcher).await.unwrap().index());
    }
    assert_eq!(sequence, vec![0, 1, 2, 3, 0, 1, 2, 3]);
}

/// Random interleavings of dispatches and completions. Checks least-loaded
/// selection, conservation and the heap invariants after every event.
#[tokio::test]
async fn random_events_conserve_pending() {
    for policy in [Policy::LeastLoaded, Policy::RoundRobin] {
        for seed in 0..16 {
            let mut rng = StdRng::seed_from_u64(seed);
            let workers = rng.random_range(1..=8);
            let Harness {
                mut dispatcher,
                queues: _queues,
            } = harness(workers, 512, policy, SaturationPolicy::Block);
            let (mut submitted, mut completed) = (0_usize, 0_usize);

            for _ in 0..300 {
                let busy: Vec<_> = loads(&dispatcher)
                    .into_iter()
                    .enumerate()
                    .filter(|&(_, load)| load > 0)
                    .map(|(i, _)| WorkerId(i))
                    .collect();

                if busy.is_empty() || rng.random_bool(0.6) {
                    let before = loads(&dispatcher);
                    let chosen = dispatch_noop(&mut dispatcher).await.unwrap();
                    if policy == Policy::LeastLoaded {
                        assert!(before.iter().all(|&load| before[chosen.index()] <= load));
                    }
                    submitted += 1;
                } else {
                    dispatcher.completed(busy[rng.random_range(0..busy.len())]);
                    completed += 1;
                }

                if policy == Policy::LeastLoaded {
                    dispatcher.pool.assert_invariants();
                }
                assert_eq!(dispatcher.pool.total_pending(), submitted - completed);
                let snapshot = dispatcher.snapshot();
                assert_eq!(
                    snapshot.total_pending() as u64,
                    snapshot.dispatched - snapshot.completed
                );
            }
        }
    }
}

#[tokio::test]
async fn reject_policy_fails_fast_when_queue_is_full() {
    let Harness {
        mut dispatcher,
        mut queues,
    } = harness(1, 1, Policy::RoundRobin, SaturationPolicy::Reject);

    let (first, _first_handle) = Request::new(|| 1);
    assert_eq!(dispatcher.dispatch(first).await, Ok(WorkerId(0)));

    let (second, second_handle) = Request::new(|| 2);
    let saturated = Error::QueueSaturated {
        worker: WorkerId(0),
    };
    assert_eq!(dispatcher.dispatch(second).await, Err(saturated.clone()));
    assert_eq!(second_handle.await, Err(saturated));
    assert_eq!(loads(&dispatcher), vec![1]);
    assert_eq!(dispatcher.snapshot().rejected, 1);

    // The worker takes the queued request, freeing the slot.
    assert!(queues[0].recv().await.is_some());
    let (third, _third_handle) = Request::new(|| 3);
    assert_eq!(dispatcher.dispatch(third).await, Ok(WorkerId(0)));
    assert_eq!(loads(&dispatcher), vec![2]);
}

#[tokio::test]
async fn rejected_least_loaded_dispatch_restores_pool() {
    let Harness {
        mut dispatcher,
        queues: _queues,
    } = harness(2, 1, Policy::LeastLoaded, SaturationPolicy::Reject);

    dispatch_noop(&mut dispatcher).await.unwrap();
    dispatch_noop(&mut dispatcher).await.unwrap();
    assert!(matches!(
        dispatch_noop(&mut dispatcher).await,
        Err(Error::QueueSaturated { .. })
    ));

    dispatcher.pool.assert_invariants();
    assert_eq!(loads(&dispatcher), vec![1, 1]);
    assert_eq!(dispatcher.pool.slots().count(), 2);
}

#[tokio::test]
async fn closed_worker_queue_resolves_channel_error() {
    let Harness {
        mut dispatcher,
        mut queues,
    } = harness(2, 4, Policy::RoundRobin, SaturationPolicy::Block);
    drop(queues.remove(0));

    let (request, handle) = Request::new(|| 1);
    assert!(matches!(
        dispatcher.dispatch(request).await,
        Err(Error::ChannelError { .. })
    ));
    assert!(matches!(handle.await, Err(Error::ChannelError { .. })));
    assert_eq!(loads(&dispatcher), vec![0, 0]);
}

#[tokio::test]
#[should_panic(expected = "least-loaded pool lost a worker")]
async fn least_loaded_dispatch_asserts_on_missing_worker() {
    let Harness {
        mut dispatcher,
        queues: _queues,
    } = harness(1, 4, Policy::LeastLoaded, SaturationPolicy::Block);

    // Detach the only worker without pushing it back.
    dispatcher.pool.pop_min();
    let _ = dispatch_noop(&mut dispatcher).await;
}

/// Polls snapshots until `done` holds.
async fn wait_for(balancer: &Balancer, done: impl Fn(&Snapshot) -> bool) -> Snapshot {
    timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = balancer.snapshot().await.expect("balancer stopped");
            if done(&snapshot) {
                return snapshot;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("balancer did not reach the expected state")
}

async fn settled(balancer: &Balancer, dispatched: u64) -> Snapshot {
    wait_for(balancer, |s| s.dispatched == dispatched && s.completed == dispatched).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_submission_gets_exactly_one_reply() {
    for policy in [Policy::LeastLoaded, Policy::RoundRobin] {
        let balancer = Balancer::with_policy(4, 16, policy).unwrap();

        let mut handles = Vec::with_capacity(500);
        for i in 0..500_u64 {
            handles.push(balancer.submit(move || i * 2).await.unwrap());
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await, Ok(i as u64 * 2));
        }

        let snapshot = settled(&balancer, 500).await;
        assert_eq!(snapshot.total_pending(), 0);
        assert_eq!(snapshot.workers.len(), 4);
        assert_eq!(snapshot.policy, policy);

        balancer.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_share_a_balancer() {
    let balancer = Balancer::with_policy(3, 8, Policy::LeastLoaded).unwrap();

    let producers: Vec<_> = (0..8_u64)
        .map(|p| {
            let balancer = balancer.clone();
            tokio::spawn(async move {
                let mut sum = 0;
                for i in 0..100_u64 {
                    let handle = balancer.submit(move || p * 1000 + i).await.unwrap();
                    sum += handle.await.unwrap();
                }
                sum
            })
        })
        .collect();

    let total: u64 = futures::future::join_all(producers)
        .await
        .into_iter()
        .map(|res| res.unwrap())
        .sum();
    let expected: u64 = (0..8_u64)
        .flat_map(|p| (0..100_u64).map(move |i| p * 1000 + i))
        .sum();
    assert_eq!(total, expected);

    let snapshot = settled(&balancer, 800).await;
    assert_eq!(snapshot.total_pending(), 0);
    balancer.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_work_is_spread_by_least_load() {
    let balancer = Balancer::with_policy(3, 8, Policy::LeastLoaded).unwrap();
    let gate = Arc::new(RwLock::new(()));
    let guard = gate.write().unwrap();

    let mut handles = Vec::new();
    for i in 0..6 {
        let gate = Arc::clone(&gate);
        handles.push(
            balancer
                .submit(move || {
                    let _open = gate.read().unwrap();
                    i
                })
                .await
                .unwrap(),
        );
    }

    let snapshot = wait_for(&balancer, |s| s.dispatched == 6).await;
    assert_eq!(snapshot.completed, 0);
    assert!(snapshot.workers.iter().all(|load| load.pending == 2));
    assert_eq!(snapshot.mean, 2.0);
    assert_eq!(snapshot.variance, 0.0);

    drop(guard);
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await, Ok(i));
    }
    assert_eq!(settled(&balancer, 6).await.total_pending(), 0);
    balancer.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_operation_reports_worker_fault() {
    let balancer = Balancer::with_policy(1, 4, Policy::RoundRobin).unwrap();

    let bad = balancer
        .submit(|| -> u32 { panic!("kaboom") })
        .await
        .unwrap();
    assert_eq!(
        bad.await,
        Err(Error::WorkerFault {
            reason: "kaboom".to_string()
        })
    );

    let good = balancer.submit(|| 5_u32).await.unwrap();
    assert_eq!(good.await, Ok(5));

    assert_eq!(settled(&balancer, 2).await.total_pending(), 0);
    balancer.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_handle_still_completes() {
    let balancer = Balancer::with_policy(2, 4, Policy::LeastLoaded).unwrap();

    let handle = balancer
        .submit(|| thread::sleep(Duration::from_millis(10)))
        .await
        .unwrap();
    drop(handle);

    assert_eq!(settled(&balancer, 1).await.total_pending(), 0);
    balancer.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submissions_after_shutdown_are_rejected() {
    let balancer = Balancer::with_policy(2, 4, Policy::LeastLoaded).unwrap();
    let other = balancer.clone();

    balancer.shutdown().await.unwrap();
    assert!(balancer.is_shutting_down());
    assert!(other.is_shutting_down());

    assert!(matches!(
        other.submit(|| 1).await,
        Err(Error::ShutdownInProgress)
    ));
    assert_eq!(other.snapshot().await, Err(Error::ShutdownInProgress));

    // Repeated shutdown is a no-op.
    other.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_drains_queued_work() {
    let balancer = Balancer::with_policy(2, 8, Policy::RoundRobin).unwrap();

    let mut handles = Vec::new();
    for i in 0..10_u64 {
        handles.push(
            balancer
                .submit(move || {
                    thread::sleep(Duration::from_millis(20));
                    i
                })
                .await
                .unwrap(),
        );
    }
    wait_for(&balancer, |s| s.dispatched == 10).await;

    balancer.shutdown().await.unwrap();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await, Ok(i as u64));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_timeout_abandons_stuck_worker() {
    let config = BalancerConfig::new(1, 4, Policy::RoundRobin)
        .with_shutdown_timeout(Duration::from_millis(50));
    let balancer = Balancer::new(config).unwrap();

    let slow = balancer
        .submit(|| {
            thread::sleep(Duration::from_millis(300));
            "slow"
        })
        .await
        .unwrap();
    let queued_a = balancer.submit(|| "a").await.unwrap();
    let queued_b = balancer.submit(|| "b").await.unwrap();
    wait_for(&balancer, |s| s.dispatched == 3).await;

    let start = Instant::now();
    balancer.shutdown().await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(300));

    // The running operation still answers; the abandoned queue does not run.
    assert_eq!(slow.await, Ok("slow"));
    assert_eq!(queued_a.await, Err(Error::ShutdownInProgress));
    assert_eq!(queued_b.await, Err(Error::ShutdownInProgress));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_rejects_buffered_submissions() {
    let config = BalancerConfig::new(1, 1, Policy::RoundRobin);
    let balancer = Balancer::new(config).unwrap();
    let gate = Arc::new(RwLock::new(()));
    let guard = gate.write().unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let gate = Arc::clone(&gate);
        handles.push(
            balancer
                .submit(move || {
                    let _open = gate.read().unwrap();
                    1_u32
                })
                .await
                .unwrap(),
        );
    }
    // One request runs, one waits in the queue and the loop blocks on the
    // third. The rest stay in the submission channel.
    sleep(Duration::from_millis(50)).await;

    let shutdown = tokio::spawn({
        let balancer = balancer.clone();
        async move { balancer.shutdown().await }
    });
    while !balancer.is_shutting_down() {
        sleep(Duration::from_millis(1)).await;
    }
    sleep(Duration::from_millis(20)).await;
    drop(guard);

    timeout(Duration::from_secs(5), shutdown)
        .await
        .expect("shutdown did not finish")
        .unwrap()
        .unwrap();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await);
    }
    let served = results.iter().take_while(|res| res.is_ok()).count();
    assert!((1..=3).contains(&served), "served {served}: {results:?}");
    assert!(results[..served].iter().all(|res| *res == Ok(1)));
    assert!(
        results[served..]
            .iter()
            .all(|res| *res == Err(Error::ShutdownInProgress))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropping_every_handle_drains_queued_work() {
    let balancer = Balancer::with_policy(1, 8, Policy::LeastLoaded).unwrap();
    let other = balancer.clone();

    let mut handles = Vec::new();
    for i in 0..6_u64 {
        handles.push(
            balancer
                .submit(move || {
                    thread::sleep(Duration::from_millis(10));
                    i
                })
                .await
                .unwrap(),
        );
    }
    drop(balancer);
    drop(other);

    for (i, handle) in handles.into_iter().enumerate() {
        let res = timeout(Duration::from_secs(5), handle)
            .await
            .expect("reply never arrived");
        assert_eq!(res, Ok(i as u64));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_queues_stall_then_recover_under_block() {
    let config = BalancerConfig::new(2, 1, Policy::LeastLoaded)
        .with_saturation(SaturationPolicy::Block)
        .with_submission_capacity(4);
    let balancer = Balancer::new(config).unwrap();

    let mut handles = Vec::new();
    for i in 0..40_u64 {
        handles.push(
            balancer
                .submit(move || {
                    thread::sleep(Duration::from_millis(1));
                    i
                })
                .await
                .unwrap(),
        );
    }
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await, Ok(i as u64));
    }

    let snapshot = settled(&balancer, 40).await;
    assert_eq!(snapshot.rejected, 0);
    assert_eq!(snapshot.total_pending(), 0);
    balancer.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    assert!(matches!(
        Balancer::with_policy(0, 4, Policy::LeastLoaded),
        Err(Error::InvalidConfig { .. })
    ));
    assert!(matches!(
        Balancer::with_policy(4, 0, Policy::RoundRobin),
        Err(Error::InvalidConfig { .. })
    ));
    assert!(matches!(
        Balancer::with_policy(16, 1 << 60, Policy::LeastLoaded),
        Err(Error::InvalidConfig { .. })
    ));
}
