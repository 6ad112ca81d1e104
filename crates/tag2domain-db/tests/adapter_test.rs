//! Integration tests for the PostgreSQL storage adapter.
//!
//! Covers:
//! - Interval lifecycle: insert, prolong, end
//! - Null-valued and valued keys are matched separately
//! - Rollback discards writes; commit publishes them
//! - Taxonomy, tag and value lookups and auto-creation
//! - Unknown tag types are rejected

use chrono::{TimeZone, Utc};
use serde_json::Map;

use tag2domain_db::test_fixtures::TestDatabase;
use tag2domain_db::{Error, NewTag, NewValue, StorageAdapter, TagState};

fn ts(hour: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_interval_lifecycle() {
    let test_db = TestDatabase::new().await;
    let taxonomy_id = test_db.create_taxonomy("colors", false, false).await;
    let red = test_db.create_tag(taxonomy_id, "red").await;
    let blue = test_db.create_tag(taxonomy_id, "blue").await;

    let mut adapter = test_db.db.adapter();
    let keys = [TagState::new(red, None), TagState::new(blue, None)];
    adapter
        .insert_intersections(taxonomy_id, ts(1), &keys, "domain", 42, Some("scanner"))
        .await
        .unwrap();
    adapter.commit().await.unwrap();

    let open = adapter.get_open_tags(taxonomy_id, "domain", 42).await.unwrap();
    assert_eq!(open.len(), 2);
    assert!(open.iter().all(|i| i.measured_at == ts(1)));
    assert!(open.iter().all(|i| i.producer.as_deref() == Some("scanner")));

    adapter
        .prolong_intersections(taxonomy_id, ts(2), &keys[..1], "domain", 42, Some("scanner"))
        .await
        .unwrap();
    adapter
        .end_intersections(taxonomy_id, ts(2), &keys[1..], "domain", 42, Some("scanner"))
        .await
        .unwrap();
    adapter.commit().await.unwrap();

    let open = adapter.get_open_tags(taxonomy_id, "domain", 42).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].tag_id, red);
    assert_eq!(open[0].measured_at, ts(2));

    let all = adapter.get_all_tags(taxonomy_id, "domain", 42).await.unwrap();
    adapter.commit().await.unwrap();
    let ended = all.iter().find(|r| r.tag_id == blue).unwrap();
    assert_eq!(ended.start_ts, ts(1));
    assert_eq!(ended.end_ts, Some(ts(2)));
    assert_eq!(ended.end_date(), Some(ts(2).date_naive()));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_null_and_valued_keys_are_distinct() {
    let test_db = TestDatabase::new().await;
    let taxonomy_id = test_db.create_taxonomy("colors", false, false).await;
    let red = test_db.create_tag(taxonomy_id, "red").await;
    let dark = test_db.create_value(red, "dark").await;

    let mut adapter = test_db.db.adapter();
    let plain = TagState::new(red, None);
    let valued = TagState::new(red, Some(dark));
    adapter
        .insert_intersections(taxonomy_id, ts(1), &[plain, valued], "domain", 7, None)
        .await
        .unwrap();
    adapter
        .end_intersections(taxonomy_id, ts(2), &[plain], "domain", 7, None)
        .await
        .unwrap();
    adapter.commit().await.unwrap();

    let open = adapter.get_open_tags(taxonomy_id, "domain", 7).await.unwrap();
    adapter.commit().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].state(), valued);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_rollback_discards_writes() {
    let test_db = TestDatabase::new().await;
    let taxonomy_id = test_db.create_taxonomy("colors", true, false).await;
    let red = test_db.create_tag(taxonomy_id, "red").await;

    let mut adapter = test_db.db.adapter();
    adapter
        .insert_intersections(taxonomy_id, ts(1), &[TagState::new(red, None)], "delegation", 3, None)
        .await
        .unwrap();
    adapter
        .insert_tags(&[NewTag {
            tag_name: "green".to_string(),
            tag_description: String::new(),
            taxonomy_id,
            extras: Map::new(),
        }])
        .await
        .unwrap();
    adapter.rollback().await.unwrap();

    assert_eq!(test_db.count_rows("delegation_tags", false).await, 0);
    let found = adapter
        .fetch_tag_ids_by_name(taxonomy_id, &["green".to_string()])
        .await
        .unwrap();
    adapter.commit().await.unwrap();
    assert_eq!(found.get("green"), Some(&None));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_taxonomy_lookup_and_auto_creation() {
    let test_db = TestDatabase::new().await;
    let taxonomy_id = test_db.create_taxonomy("malware", true, true).await;
    let known = test_db.create_tag(taxonomy_id, "botnet").await;

    let mut adapter = test_db.db.adapter();
    let by_name = adapter.fetch_taxonomy_by_name("malware").await.unwrap().unwrap();
    assert_eq!(by_name.id, taxonomy_id);
    assert!(by_name.allows_auto_tags && by_name.allows_auto_values);
    assert!(adapter.fetch_taxonomy_by_id(taxonomy_id + 1000).await.unwrap().is_none());

    let names = vec!["botnet".to_string(), "phishing".to_string()];
    let ids = adapter.fetch_tag_ids_by_name(taxonomy_id, &names).await.unwrap();
    assert_eq!(ids.get("botnet"), Some(&Some(known)));
    assert_eq!(ids.get("phishing"), Some(&None));

    let mut extras = Map::new();
    extras.insert("source".to_string(), serde_json::json!("feed"));
    let created = adapter
        .insert_tags(&[NewTag {
            tag_name: "phishing".to_string(),
            tag_description: "auto".to_string(),
            taxonomy_id,
            extras,
        }])
        .await
        .unwrap();
    let phishing = created["phishing"];

    let missing = adapter
        .check_tag_ids_exist(taxonomy_id, &[known, phishing, 999_999])
        .await
        .unwrap();
    assert_eq!(missing, vec![999_999]);

    let values = adapter
        .insert_values(&[NewValue {
            tag_id: phishing,
            value: "bank".to_string(),
        }])
        .await
        .unwrap();
    let bank = values[&(phishing, "bank".to_string())];
    let looked_up = adapter
        .fetch_value_ids_by_value(&[(phishing, "bank".to_string()), (phishing, "shop".to_string())])
        .await
        .unwrap();
    assert_eq!(looked_up[&(phishing, "bank".to_string())], Some(bank));
    assert_eq!(looked_up[&(phishing, "shop".to_string())], None);

    let missing = adapter
        .check_value_ids_exist(&[(phishing, bank), (known, bank)])
        .await
        .unwrap();
    assert_eq!(missing, vec![(known, bank)]);
    adapter.commit().await.unwrap();

    let tags = test_db.db.adapter().list_taxonomy_tags(taxonomy_id).await.unwrap();
    assert_eq!(tags.len(), 2);
    let phishing_tag = tags.iter().find(|t| t.tag_id == phishing).unwrap();
    assert_eq!(phishing_tag.extras["source"], "feed");

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_taxonomy_intersections_span_entities() {
    let test_db = TestDatabase::new().await;
    let taxonomy_id = test_db.create_taxonomy("colors", false, false).await;
    let red = test_db.create_tag(taxonomy_id, "red").await;

    let mut adapter = test_db.db.adapter();
    for entity in [1, 2, 3] {
        adapter
            .insert_intersections(taxonomy_id, ts(1), &[TagState::new(red, None)], "intersection", entity, None)
            .await
            .unwrap();
    }
    adapter.commit().await.unwrap();

    let rows = adapter
        .get_taxonomy_intersections(taxonomy_id, "intersection")
        .await
        .unwrap();
    let entities: Vec<i64> = rows.iter().map(|r| r.tagged_id).collect();
    assert_eq!(entities, vec![1, 2, 3]);
    assert!(rows.iter().all(|r| r.interval.is_open()));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_unknown_tag_type_is_invalid() {
    let test_db = TestDatabase::new().await;
    let mut adapter = test_db.db.adapter();

    let err = adapter.get_open_tags(1, "prefix", 1).await.unwrap_err();
    assert!(matches!(err, Error::InvalidMeasurement(_)));

    test_db.cleanup().await;
}
