//! Registry file behavior: add/get/update/remove, current selection,
//! round-trip of every field.

use hexis::instance::{validate_instance_name, InstanceConfig, InstanceRegistry};

fn open_registry(dir: &tempfile::TempDir) -> InstanceRegistry {
    InstanceRegistry::open(dir.path()).expect("registry opens")
}

fn config(name: &str) -> InstanceConfig {
    let mut config = InstanceConfig::new(name, format!("hexis_{name}"));
    config.description = format!("test instance {name}");
    config
}

#[test]
fn fresh_registry_is_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = open_registry(&dir);
    assert!(registry.list_all().is_empty());
    assert!(registry.get_current().is_none());
    assert!(!registry.exists("default"));
}

#[test]
fn add_get_roundtrip_preserves_fields() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = open_registry(&dir);

    let mut original = config("alpha");
    original.host = "db.internal".to_owned();
    original.port = 5544;
    original.user = "agent".to_owned();
    original.password_env = "ALPHA_PASSWORD".to_owned();
    registry.add(original.clone()).expect("add");

    // Reopen from disk to prove persistence.
    let registry = open_registry(&dir);
    let loaded = registry.get("alpha").expect("present");
    assert_eq!(loaded.name, "alpha");
    assert_eq!(loaded.database, "hexis_alpha");
    assert_eq!(loaded.host, "db.internal");
    assert_eq!(loaded.port, 5544);
    assert_eq!(loaded.user, "agent");
    assert_eq!(loaded.password_env, "ALPHA_PASSWORD");
    assert_eq!(loaded.description, "test instance alpha");
}

#[test]
fn duplicate_add_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = open_registry(&dir);
    registry.add(config("twin")).expect("first add");
    assert!(registry.add(config("twin")).is_err());
}

#[test]
fn invalid_names_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = open_registry(&dir);
    assert!(registry.add(config("9starts-with-digit")).is_err());
    assert!(validate_instance_name("white space").is_err());
    assert!(validate_instance_name("ok-Name_2").is_ok());
}

#[test]
fn update_requires_existing_instance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = open_registry(&dir);
    assert!(registry.update(config("ghost")).is_err());

    registry.add(config("real")).expect("add");
    let mut updated = config("real");
    updated.description = "rewritten".to_owned();
    registry.update(updated).expect("update");
    assert_eq!(
        registry.get("real").expect("present").description,
        "rewritten"
    );
}

#[test]
fn remove_missing_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = open_registry(&dir);
    assert!(registry.remove("nope").is_err());
}

#[test]
fn current_selection_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = open_registry(&dir);
    registry.add(config("one")).expect("add one");
    registry.add(config("two")).expect("add two");

    assert!(registry.set_current("missing").is_err());
    registry.set_current("one").expect("select");
    assert_eq!(registry.get_current().as_deref(), Some("one"));

    // Removing the current instance clears the selection.
    registry.remove("one").expect("remove");
    assert!(registry.get_current().is_none());
    assert!(registry.exists("two"));
}

#[test]
fn dsn_for_known_and_unknown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = open_registry(&dir);
    registry.add(config("dsn")).expect("add");

    let dsn = registry.dsn_for("dsn").expect("dsn resolves");
    assert!(dsn.contains("/hexis_dsn"));
    assert!(registry.dsn_for("other").is_err());
}

#[test]
fn corrupt_registry_file_yields_empty_registry() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("instances.json"), "{broken").expect("write");
    let registry = open_registry(&dir);
    assert!(registry.list_all().is_empty());
}
