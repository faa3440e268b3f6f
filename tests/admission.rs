use std::sync::Arc;
use std::time::Duration;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{
    strip_port, Clock, Decision, DecisionEngine, DenyReason, InMemoryStore, ManualClock, RateIdentity,
    RateLimitPolicy, RateRecord, RateStore,
};

struct Harness {
    engine: Arc<DecisionEngine>,
    store: InMemoryStore,
    clock: ManualClock,
}

fn harness(policy: RateLimitPolicy) -> Harness {
    let clock = ManualClock::default();
    let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
    let engine = DecisionEngine::new(Arc::new(store.clone()), policy)
        .with_clock(Arc::new(clock.clone()));
    Harness {
        engine: Arc::new(engine),
        store,
        clock,
    }
}

fn policy_from_yaml(yaml: &str) -> RateLimitPolicy {
    TurnstileConfig::from_yaml(yaml).unwrap().policy().unwrap()
}

async fn run_concurrently(engine: &Arc<DecisionEngine>, identities: Vec<RateIdentity>) -> Vec<(RateIdentity, Decision)> {
    let tasks: Vec<_> = identities
        .into_iter()
        .map(|identity| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let decision = engine.decide(&identity).await;
                (identity, decision)
            })
        })
        .collect();

    futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect()
}

fn admitted(results: &[(RateIdentity, Decision)], who: &RateIdentity) -> usize {
    results
        .iter()
        .filter(|(identity, decision)| identity == who && decision.is_allowed())
        .count()
}

#[tokio::test]
async fn burst_then_block_then_fresh_window() {
    let h = harness(policy_from_yaml(
        r#"
rate_limiting:
  max_requests_per_second_ip: 5
  block_duration_ip: 1s
"#,
    ));
    let identity = RateIdentity::resolve(None, "192.168.1.1:12345");

    for _ in 0..5 {
        assert_eq!(h.engine.decide(&identity).await, Decision::Allowed);
    }
    assert_eq!(
        h.engine.decide(&identity).await,
        Decision::Denied(DenyReason::LimitExceeded)
    );

    h.clock.advance(Duration::from_millis(1100));

    assert_eq!(h.engine.decide(&identity).await, Decision::Allowed);
    let record = h.store.get(&identity.store_key()).await.unwrap().unwrap();
    assert_eq!(record.count, 1);
}

#[tokio::test]
async fn requests_during_block_are_all_denied() {
    let h = harness(policy_from_yaml(
        r#"
rate_limiting:
  max_requests_per_second_ip: 2
  block_duration_ip: 10s
"#,
    ));
    let identity = RateIdentity::resolve(None, "10.0.0.1:1");

    for _ in 0..3 {
        h.engine.decide(&identity).await;
    }
    for _ in 0..99 {
        h.clock.advance(Duration::from_millis(100));
        assert_eq!(
            h.engine.decide(&identity).await,
            Decision::Denied(DenyReason::Blocked)
        );
    }

    h.clock.advance(Duration::from_millis(100));
    assert_eq!(h.engine.decide(&identity).await, Decision::Allowed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_tokens_under_shared_default_stay_independent() {
    let h = harness(policy_from_yaml(
        r#"
rate_limiting:
  max_requests_per_second_token: 100
"#,
    ));
    let first = RateIdentity::Token("JOAO123".to_string());
    let second = RateIdentity::Token("CARLOS456".to_string());

    let mut identities = Vec::new();
    for _ in 0..50 {
        identities.push(first.clone());
        identities.push(second.clone());
    }
    let results = run_concurrently(&h.engine, identities).await;

    assert_eq!(admitted(&results, &first), 50);
    assert_eq!(admitted(&results, &second), 50);
    for identity in [&first, &second] {
        let record = h.store.get(&identity.store_key()).await.unwrap().unwrap();
        assert_eq!(record.count, 50);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_split_matches_sequential_split() {
    let yaml = r#"
rate_limiting:
  max_requests_per_second_ip: 20
"#;
    let a = RateIdentity::resolve(None, "10.0.0.1:80");
    let b = RateIdentity::resolve(None, "[2001:db8::1]:80");

    let mut identities = Vec::new();
    identities.extend(std::iter::repeat(a.clone()).take(30));
    identities.extend(std::iter::repeat(b.clone()).take(15));

    let concurrent = harness(policy_from_yaml(yaml));
    let results = run_concurrently(&concurrent.engine, identities.clone()).await;

    for order in [identities.clone(), identities.iter().rev().cloned().collect()] {
        let sequential = harness(policy_from_yaml(yaml));
        let mut seq_results = Vec::new();
        for identity in order {
            let decision = sequential.engine.decide(&identity).await;
            seq_results.push((identity, decision));
        }
        assert_eq!(admitted(&results, &a), admitted(&seq_results, &a));
        assert_eq!(admitted(&results, &b), admitted(&seq_results, &b));
    }

    assert_eq!(admitted(&results, &a), 20);
    assert_eq!(admitted(&results, &b), 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lapsed_block_admits_exactly_one_concurrent_request() {
    let h = harness(policy_from_yaml(
        r#"
rate_limiting:
  max_requests_per_second_ip: 1
  block_duration_ip: 1s
"#,
    ));
    let identity = RateIdentity::resolve(None, "10.0.0.7:443");

    // Block deadline already passed but the record has not expired yet
    let lapsed = RateRecord {
        count: 12,
        blocked_until: Some(h.clock.now()),
    };
    h.store
        .set(&identity.store_key(), lapsed, Duration::from_secs(30))
        .await
        .unwrap();
    h.clock.advance(Duration::from_millis(5));

    let results = run_concurrently(&h.engine, vec![identity.clone(); 20]).await;
    assert_eq!(admitted(&results, &identity), 1);
}

#[tokio::test]
async fn token_overrides_apply_only_to_their_token() {
    let h = harness(policy_from_yaml(
        r#"
rate_limiting:
  max_requests_per_second_ip: 1
  max_requests_per_second_token: 3
  tokens: "JOAO123:6/1"
"#,
    ));
    let known = RateIdentity::Token("JOAO123".to_string());
    let unknown = RateIdentity::Token("unknowToken".to_string());

    let mut counts = (0usize, 0usize);
    for _ in 0..10 {
        counts.0 += h.engine.decide(&known).await.is_allowed() as usize;
        counts.1 += h.engine.decide(&unknown).await.is_allowed() as usize;
    }
    assert_eq!(counts, (6, 3));
}

#[test]
fn ipv6_origins_keep_the_full_address() {
    assert_eq!(strip_port("[2001:db8:85a3::8a2e:370:7334]:443"), "2001:db8:85a3::8a2e:370:7334");
    assert_eq!(
        RateIdentity::resolve(None, "[::1]:8080").store_key(),
        "rl:ip:::1"
    );
}
