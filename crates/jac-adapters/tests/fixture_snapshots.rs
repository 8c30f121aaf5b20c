use jac_adapters::{load_snapshot_bundle, SnapshotFileFeed, SourceFeed};
use jac_core::PropertyType;

fn fixture(source: &str) -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join(source)
        .join("snapshot.json")
}

#[test]
fn every_fixture_bundle_matches_its_directory() {
    for source in ["encheres_publiques", "vench", "licitor"] {
        let bundle = load_snapshot_bundle(fixture(source)).unwrap();
        assert_eq!(bundle.source_id, source);
        assert!(!bundle.records.is_empty());
    }
}

#[test]
fn fixture_property_tags_are_coerced() {
    let records = SnapshotFileFeed::new("licitor", fixture("licitor"))
        .load_records()
        .unwrap();
    assert_eq!(records[0].property_type, PropertyType::Apartment);
    assert_eq!(records[1].property_type, PropertyType::Commercial);
    assert_eq!(records[1].address.as_deref(), Some("8, rue Paradis"));

    let vench = SnapshotFileFeed::new("vench", fixture("vench")).load_records().unwrap();
    assert_eq!(vench[2].property_type, PropertyType::Land);
    assert!(vench.iter().all(|r| r.source == "vench"));
}
