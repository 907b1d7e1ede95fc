//! End-to-end tests of the HTTP API over a real socket, backed by the
//! in-memory broker and a temporary store.

mod common;

use chrono::{DateTime, Utc};
use common::{eventually, fast_config, RunningPipeline};
use std::collections::BTreeMap;
use visitstream::storage::VisitStore;

type Visits = BTreeMap<String, Vec<DateTime<Utc>>>;

#[tokio::test]
async fn test_recorded_visits_become_queryable() {
    let pipeline = RunningPipeline::start(fast_config()).await;
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let response = client
            .post(pipeline.url("/api/visits"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.text().await.unwrap().is_empty());
    }

    let store = pipeline.store.clone();
    eventually(|| {
        let store = store.clone();
        async move {
            let visits = store.get_visits().await.unwrap();
            visits.get("127.0.0.1").map(Vec::len) == Some(3)
        }
    })
    .await;

    let all: Visits = client
        .get(pipeline.url("/api/visits"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    let times = &all["127.0.0.1"];
    assert_eq!(times.len(), 3);
    assert!(times.windows(2).all(|w| w[0] <= w[1]));

    let by_key: Visits = client
        .get(pipeline.url("/api/visits/127.0.0.1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(by_key, all);

    let report = pipeline.stop().await;
    assert!(report.is_clean(), "{:?}", report);
}

#[tokio::test]
async fn test_filters_narrow_and_reject() {
    let pipeline = RunningPipeline::start(fast_config()).await;
    let client = reqwest::Client::new();

    let future: Visits = client
        .get(pipeline.url("/api/visits?gt=2999"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(future.is_empty());

    let response = client
        .get(pipeline.url("/api/visits/127.0.0.1?day=Funday"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    let response = client
        .get(pipeline.url("/api/visits?lt=2020-13-01"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_publish_failure_is_opaque() {
    let pipeline = RunningPipeline::start(fast_config()).await;
    pipeline.broker.fail_next_deliveries(1);

    let response = reqwest::Client::new()
        .post(pipeline.url("/api/visits"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "unexpected error occurred");

    pipeline.stop().await;
}
