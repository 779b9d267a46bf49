use std::collections::BTreeMap;
use std::time::Duration;

use backy_core::schedule::{Schedule, TagPolicyConfig};

use crate::job::{backoff_delay, speed_for, spread_for, Speed, WorkerPools};

fn schedule(interval: &str) -> Schedule {
    let config: BTreeMap<String, TagPolicyConfig> = [(
        "daily".to_string(),
        TagPolicyConfig {
            interval: interval.to_string(),
            keep: 3,
        },
    )]
    .into_iter()
    .collect();
    Schedule::configure(&config).unwrap()
}

#[test]
fn backoff_series_doubles_from_two_minutes() {
    assert_eq!(backoff_delay(1), Duration::from_secs(2 * 60));
    assert_eq!(backoff_delay(2), Duration::from_secs(4 * 60));
    assert_eq!(backoff_delay(3), Duration::from_secs(8 * 60));
    assert_eq!(backoff_delay(7), Duration::from_secs(128 * 60));
}

#[test]
fn backoff_converges_on_six_hours() {
    let six_hours = Duration::from_secs(6 * 60 * 60);
    assert_eq!(backoff_delay(9), six_hours);
    assert_eq!(backoff_delay(20), six_hours);
    assert_eq!(backoff_delay(u32::MAX), six_hours);
}

#[test]
fn first_run_is_fast() {
    assert_eq!(speed_for(None), Speed::Fast);
}

#[test]
fn slow_threshold_is_600_seconds() {
    assert_eq!(speed_for(Some(5.0)), Speed::Fast);
    assert_eq!(speed_for(Some(599.9)), Speed::Fast);
    assert_eq!(speed_for(Some(600.0)), Speed::Slow);
    assert_eq!(speed_for(Some(700.0)), Speed::Slow);
}

#[test]
fn spread_is_deterministic_and_bounded() {
    let sched = schedule("1d");
    let a1 = spread_for("vm01", &sched);
    let a2 = spread_for("vm01", &sched);
    let b = spread_for("vm02", &sched);
    assert_eq!(a1, a2);
    // Bounded by a tenth of the smallest interval, capped at 10 minutes.
    assert!(a1 <= Duration::from_secs(600));
    assert!(b <= Duration::from_secs(600));
}

#[test]
fn spread_respects_small_intervals() {
    let sched = schedule("100s");
    for name in ["a", "b", "c", "vm99"] {
        assert!(spread_for(name, &sched) <= Duration::from_secs(10));
    }
}

#[tokio::test]
async fn slow_pool_exhaustion_leaves_fast_slots_free() {
    // One worker per pool: a long-running job holding the slow slot must
    // not prevent a fast job from acquiring its own.
    let pools = WorkerPools::new(1);

    let slow_permit = pools
        .pool(Speed::Slow)
        .clone()
        .acquire_owned()
        .await
        .unwrap();
    assert_eq!(pools.pool(Speed::Slow).available_permits(), 0);

    let fast_permit = pools.pool(Speed::Fast).clone().try_acquire_owned();
    assert!(fast_permit.is_ok());

    drop(slow_permit);
    assert_eq!(pools.pool(Speed::Slow).available_permits(), 1);
}

#[tokio::test]
async fn pools_bound_each_class_at_worker_limit() {
    let pools = WorkerPools::new(2);
    let _a = pools.pool(Speed::Fast).clone().acquire_owned().await.unwrap();
    let _b = pools.pool(Speed::Fast).clone().acquire_owned().await.unwrap();
    assert!(pools.pool(Speed::Fast).clone().try_acquire_owned().is_err());
    // The slow pool is untouched.
    assert!(pools.pool(Speed::Slow).clone().try_acquire_owned().is_ok());
}
