use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use granary::{value, Config, ReduceFn, Runtime, Value};

fn runtime(workers: usize) -> Arc<Runtime> {
    Runtime::new(
        Config::default()
            .with_workers(workers)
            .with_stack_size(128 * 1024),
    )
    .expect("runtime starts")
}

fn sum_reducer() -> ReduceFn {
    Arc::new(|a: Value, b: Value| {
        value(a.downcast_ref::<i64>().unwrap() + b.downcast_ref::<i64>().unwrap())
    })
}

/// 10^5 spawn/sync pairs across 8 workers: every task runs exactly once,
/// every sync observes its own task's value, and the whole thing drains.
#[test]
fn hundred_thousand_spawn_sync() {
    const WAVES: usize = 500;
    const PER_WAVE: usize = 200;

    let rt = runtime(8);
    let executed = Arc::new(AtomicU64::new(0));
    rt.block_on({
        let rt = rt.clone();
        let executed = executed.clone();
        move || {
            for wave in 0..WAVES {
                let mut tasks = Vec::with_capacity(PER_WAVE);
                for i in 0..PER_WAVE {
                    let executed = executed.clone();
                    let t = rt.task_new(move || {
                        executed.fetch_add(1, Ordering::Relaxed);
                        value(i as i64)
                    });
                    rt.task_spawn(&t, false, false)
                        .expect("a wave fits the multiqueue");
                    tasks.push((i, t));
                }
                for (i, t) in tasks {
                    let v = rt.task_sync(&t).expect("task value");
                    assert_eq!(*v.downcast_ref::<i64>().unwrap(), i as i64);
                }
                if wave % 100 == 0 {
                    eprintln!("wave {wave}/{WAVES}");
                }
            }
            value(())
        }
    });
    assert_eq!(executed.load(Ordering::Relaxed), (WAVES * PER_WAVE) as u64);
    assert!(rt.tasks_dispatched() >= (WAVES * PER_WAVE) as u64);
    rt.shutdown();
}

/// Back-to-back fan-outs reuse pooled sync trees; a stale counter or slot
/// would corrupt a later round's total.
#[test]
fn repeated_grain_reductions_reuse_pools() {
    let rt = runtime(8);
    rt.block_on({
        let rt = rt.clone();
        move || {
            for round in 0..100i64 {
                let count = 1_000 + round;
                let p = rt
                    .task_new_multi(
                        |s, e| value((s..e).sum::<i64>()),
                        count,
                        Some(sum_reducer()),
                    )
                    .expect("pools recycle between rounds");
                rt.task_spawn_multi(&p).unwrap();
                let total = rt.task_sync(&p).expect("reduced total");
                assert_eq!(
                    *total.downcast_ref::<i64>().unwrap(),
                    count * (count - 1) / 2
                );
            }
            value(())
        }
    });
    rt.shutdown();
}

/// Several fan-outs in flight at once, each with its own arriver/reducer.
#[test]
fn concurrent_fan_outs() {
    let rt = runtime(4);
    rt.block_on({
        let rt = rt.clone();
        move || {
            let mut parents = Vec::new();
            for _ in 0..8 {
                let p = rt
                    .task_new_multi(|s, e| value((s..e).sum::<i64>()), 500, Some(sum_reducer()))
                    .expect("pool holds eight trees");
                rt.task_spawn_multi(&p).unwrap();
                parents.push(p);
            }
            for p in parents {
                let total = rt.task_sync(&p).expect("reduced total");
                assert_eq!(*total.downcast_ref::<i64>().unwrap(), 124_750);
            }
            value(())
        }
    });
    rt.shutdown();
}

/// Tasks spawning tasks spawning tasks, synced from the middle.
#[test]
fn nested_spawn_trees() {
    let rt = runtime(8);
    let out = rt.block_on({
        let rt = rt.clone();
        move || {
            let mut mids = Vec::new();
            for m in 0..16i64 {
                let rt2 = rt.clone();
                let mid = rt.task_new(move || {
                    let mut leaves = Vec::new();
                    for l in 0..8i64 {
                        let leaf = rt2.task_new(move || value(m * 100 + l));
                        rt2.task_spawn(&leaf, false, false).unwrap();
                        leaves.push((l, leaf));
                    }
                    let mut sum = 0;
                    for (l, leaf) in leaves {
                        let v = rt2.task_sync(&leaf).unwrap();
                        assert_eq!(*v.downcast_ref::<i64>().unwrap(), m * 100 + l);
                        sum += m * 100 + l;
                    }
                    value(sum)
                });
                rt.task_spawn(&mid, false, false).unwrap();
                mids.push(mid);
            }
            let mut total = 0;
            for mid in mids {
                total += *rt.task_sync(&mid).unwrap().downcast_ref::<i64>().unwrap();
            }
            value(total)
        }
    });
    let expected: i64 = (0..16i64)
        .map(|m| (0..8i64).map(|l| m * 100 + l).sum::<i64>())
        .sum();
    assert_eq!(*out.downcast_ref::<i64>().unwrap(), expected);
    rt.shutdown();
}
