mod common;

use std::sync::Arc;

use prometheus::Registry;

use recsys_worker::feature_store::{FeatureStore, LocalFeatureStore};
use recsys_worker::observability::metrics::Metrics;
use recsys_worker::pipeline::{RunContext, StageName};
use recsys_worker::registry::TOP_K_ITEM_IDS;
use recsys_worker::streaming::InMemoryCorrectionSource;

use common::{FeatureRepo, NUM_ITEMS, NUM_USERS, expected_ranking, pipeline};

async fn published_recommendations(store: &LocalFeatureStore) -> Vec<Vec<i64>> {
    let keys: Vec<Vec<i64>> = (1..=NUM_USERS as i64).map(|u| vec![u]).collect();
    let online = store.online_features("user_items", &keys).await.unwrap();
    online
        .int64_list_column(TOP_K_ITEM_IDS)
        .unwrap()
        .iter()
        .map(|ids| ids.clone().expect("every user has recommendations"))
        .collect()
}

#[tokio::test]
async fn full_run_publishes_nearest_items_for_every_user() {
    let repo = FeatureRepo::new();
    let store = repo.store();
    let metrics = Arc::new(Metrics::new(Arc::new(Registry::new())).unwrap());
    let orchestrator = pipeline(
        &repo,
        Arc::clone(&store) as Arc<dyn FeatureStore>,
        Arc::new(InMemoryCorrectionSource::new()),
        Arc::clone(&metrics),
    );

    orchestrator.preflight().await.unwrap();
    let report = orchestrator.execute(&RunContext::new()).await.unwrap();

    assert_eq!(report.summary.items_embedded, NUM_ITEMS);
    assert_eq!(report.summary.users_embedded, NUM_USERS);
    assert_eq!(report.summary.recommendations, NUM_USERS);
    assert_eq!(metrics.runs_completed.get(), 1.0);
    assert_eq!(metrics.streaming_rows_merged.get(), 0.0);

    let published = published_recommendations(&store).await;
    for (user, items) in (1..=NUM_USERS as i64).zip(published) {
        assert_eq!(items.len(), NUM_ITEMS, "user {user} gets the whole pool");
        assert_eq!(items, expected_ranking(user), "ranking of user {user}");
    }
}

#[tokio::test]
async fn stages_resume_from_committed_artifacts() {
    let repo = FeatureRepo::new();
    let store = repo.store();
    let metrics = Arc::new(Metrics::new(Arc::new(Registry::new())).unwrap());
    let orchestrator = pipeline(
        &repo,
        Arc::clone(&store) as Arc<dyn FeatureStore>,
        Arc::new(InMemoryCorrectionSource::new()),
        metrics,
    );
    let run = RunContext::new();

    for stage in StageName::ALL {
        orchestrator.execute_stage(stage, &run).await.unwrap();
    }
    assert!(repo.artifact_root().join(run.run_id.to_string()).join("train_model").is_dir());

    let published = published_recommendations(&store).await;
    assert_eq!(published[0], expected_ranking(1));

    // A rerun of a single stage replaces its previous outputs.
    orchestrator
        .execute_stage(StageName::Train, &run)
        .await
        .unwrap();
}
