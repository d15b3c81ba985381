use std::path::PathBuf;

use hrsync_adapters::{flatten_candidate, FlattenConfig};
use serde_json::Value;

fn fixture(name: &str) -> Value {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/harvest")
        .join(name);
    let text = std::fs::read_to_string(&path).expect("read fixture");
    serde_json::from_str(&text).expect("parse fixture")
}

#[test]
fn golden_json_snapshot_test_harvest_candidate() {
    let raw = fixture("candidate_full.json");
    let record = flatten_candidate(&raw, &FlattenConfig::default()).expect("flatten");
    assert_eq!(record.raw, raw);

    let mut actual = serde_json::to_value(&record).expect("serialize");
    actual
        .as_object_mut()
        .expect("record object")
        .remove("raw");
    assert_eq!(actual, fixture("candidate_full.snapshot.json"));
}
