use mongo_runner::server::limits::{PROCESS_LIMITS, negotiate_limit};

/// Simulated kernel accepting any soft limit up to `cap`, recording what was tried.
fn kernel(cap: u64, tried: &mut Vec<u64>) -> impl FnMut(u64) -> bool + '_ {
    move |value| {
        tried.push(value);
        value <= cap
    }
}

#[test]
fn test_reaches_desired_when_allowed() {
    let mut tried = Vec::new();
    let outcome = negotiate_limit(kernel(u64::MAX, &mut tried), 65536, 1024, 1 << 20);

    assert_eq!(outcome.achieved, 65536);
    assert_eq!(outcome.attempts, 1);
    assert!(!outcome.gave_up);
    assert_eq!(tried, vec![65536]);
}

#[test]
fn test_converges_below_kernel_cap() {
    let mut tried = Vec::new();
    let outcome = negotiate_limit(kernel(40_000, &mut tried), 65536, 1024, 65536);

    assert_eq!(outcome.achieved, 40_000);
    assert!(!outcome.gave_up);
    // bisection over a 64k gap
    assert!(outcome.attempts <= 18, "took {} attempts", outcome.attempts);
    assert!(tried.iter().all(|v| *v > 1024 && *v <= 65536));
}

#[test]
fn test_capped_at_hard_limit() {
    let mut tried = Vec::new();
    let outcome = negotiate_limit(kernel(u64::MAX, &mut tried), 65536, 1024, 4096);

    assert_eq!(outcome.achieved, 4096);
    assert!(tried.iter().all(|v| *v <= 4096));
}

#[test]
fn test_never_lowers_the_limit() {
    let mut tried = Vec::new();
    let outcome = negotiate_limit(kernel(u64::MAX, &mut tried), 1024, 8192, 65536);

    assert_eq!(outcome.achieved, 8192);
    assert_eq!(outcome.attempts, 0);
    assert!(tried.is_empty());
}

#[test]
fn test_single_step_above_soft_is_tried() {
    let mut tried = Vec::new();
    let outcome = negotiate_limit(kernel(u64::MAX, &mut tried), 1025, 1024, 1025);

    assert_eq!(outcome.achieved, 1025);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(tried, vec![1025]);
}

#[test]
fn test_every_value_below_refused_target_is_reachable() {
    let mut tried = Vec::new();
    let outcome = negotiate_limit(kernel(2, &mut tried), 3, 0, 3);

    assert_eq!(outcome.achieved, 2);
    assert!(!outcome.gave_up);
    assert_eq!(tried, vec![3, 1, 2]);
}

#[test]
fn test_refusing_kernel_keeps_soft_limit() {
    let mut tried = Vec::new();
    let outcome = negotiate_limit(kernel(0, &mut tried), 65536, 1024, 65536);

    assert_eq!(outcome.achieved, 1024);
    assert!(outcome.gave_up);
    assert!(outcome.attempts <= 18);
    assert!(tried.iter().all(|v| *v > 1024));
}

#[test]
fn test_process_limits_table() {
    let descriptions: Vec<&str> = PROCESS_LIMITS.iter().map(|l| l.description).collect();
    assert_eq!(
        descriptions,
        vec!["stack size (in bytes)", "number of file descriptors"]
    );
    assert_eq!(PROCESS_LIMITS[1].desired, 65536);
}
