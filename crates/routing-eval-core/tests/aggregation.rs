//! Aggregation is a pure, order-independent function of the record log.

mod common;

use std::collections::BTreeMap;

use common::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use routing_eval_core::artifacts::read_records;
use routing_eval_core::{aggregate_records, run_evaluation_at, PerPrRecord};
use tempfile::TempDir;

const ITEMS: u64 = 12;

/// `popularity` always says alice; `union` answers the true approver on odd
/// items and nothing on even ones.
fn scripts() -> Scripts {
    let popularity = (1..=ITEMS).map(|n| (n, vec!["alice".to_string()])).collect();
    let union = (1..=ITEMS)
        .filter(|n| n % 2 == 1)
        .map(|n| (n, approver(n).map(str::to_string).into_iter().collect()))
        .collect();
    BTreeMap::from([("popularity".to_string(), popularity), ("union".to_string(), union)])
}

async fn records(data_dir: &std::path::Path) -> Vec<PerPrRecord> {
    let cfg = config("agg", (1..=ITEMS).collect(), &["popularity", "union"]);
    let outcome = run_evaluation_at(&context(data_dir, ITEMS, scripts()), &cfg, now())
        .await
        .unwrap();
    read_records(&outcome.run_dir.per_pr()).unwrap()
}

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn permutations_aggregate_identically() {
    let tmp = TempDir::new().unwrap();
    let records = records(tmp.path()).await;
    let predictors = ids(&["popularity", "union"]);
    let policies = ids(&["first_response_v1", "first_approval_v1"]);
    let ks = [1, 3, 5];

    let reference = aggregate_records(&records, &predictors, &policies, &ks);
    assert_eq!(
        aggregate_records(&records, &predictors, &policies, &ks),
        reference,
        "aggregation is idempotent"
    );

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..5 {
        let mut shuffled = records.clone();
        shuffled.shuffle(&mut rng);
        assert_eq!(aggregate_records(&shuffled, &predictors, &policies, &ks), reference);
    }
}

#[tokio::test]
async fn denominators_shrink_with_each_filter() {
    let tmp = TempDir::new().unwrap();
    let records = records(tmp.path()).await;
    let aggregates = aggregate_records(
        &records,
        &ids(&["popularity", "union"]),
        &ids(&["first_response_v1", "first_approval_v1"]),
        &[1, 3, 5],
    );

    for (policy, by_predictor) in &aggregates.routing_denominators_by_policy {
        for (predictor, den) in by_predictor {
            let at = |slice: &str| den[slice];
            let ctx = format!("{policy}/{predictor}");
            assert_eq!(at("all"), ITEMS as usize, "{ctx}");
            assert!(at("all") >= at("known_truth"), "{ctx}");
            assert!(at("known_truth") >= at("observed"), "{ctx}");
            assert!(at("observed") >= at("observed_and_predictor_nonempty"), "{ctx}");
            assert!(at("predictor_nonempty") >= at("observed_and_predictor_nonempty"), "{ctx}");
        }
    }

    // Items 4, 8 and 12 have no review; coverage is complete so their truth
    // is a known negative rather than a gap.
    let counts = &aggregates.truth_coverage_counts;
    assert_eq!(counts["observed"], 9);
    assert_eq!(counts["no_post_cutoff_response"], 3);
    assert_eq!(counts["unknown_due_to_ingestion_gap"], 0);

    let den = &aggregates.routing_denominators_by_policy["first_approval_v1"]["union"];
    assert_eq!(den["predictor_nonempty"], 6);
    assert_eq!(den["observed_and_predictor_nonempty"], 6);
    assert_eq!(den["known_truth"], 12);
}

#[tokio::test]
async fn failed_items_stay_out_of_every_mean() {
    let tmp = TempDir::new().unwrap();
    let mut records = records(tmp.path()).await;
    let hit_ks = [1, 3, 5];
    let predictors = ids(&["union"]);
    let policies = ids(&["first_approval_v1"]);

    let before = aggregate_records(&records, &predictors, &policies, &hit_ks);
    // Mark every union outcome on odd items as a failure with null metrics.
    for record in records.iter_mut().filter(|r| r.pr_number % 2 == 1) {
        if let Some(outcome) = record.predictors.get_mut("union") {
            outcome.route_result = None;
            outcome.error = Some("boom".to_string());
            outcome.routing_agreement = routing_eval_core::ItemMetrics::unavailable(&hit_ks);
            for metrics in outcome.routing_agreement_by_policy.values_mut() {
                *metrics = routing_eval_core::ItemMetrics::unavailable(&hit_ks);
            }
        }
    }
    let after = aggregate_records(&records, &predictors, &policies, &hit_ks);

    assert_eq!(before.routing_agreement["union"].n, ITEMS as usize);
    assert_eq!(after.routing_agreement["union"].n, 6);
    assert!(approx(after.routing_agreement["union"].mrr, 0.0));
    assert_eq!(
        after.routing_denominators_by_policy["first_approval_v1"]["union"]["predictor_nonempty"],
        0
    );
}
