use ferrous_services::descriptors::value;
use ferrous_services::plugins::persist::{
    persisted, MemorySnapshots, PersistPlugin, SnapshotProvider, SnapshotSaver, PERSIST_PROVIDER, PERSIST_SAVER,
};
use ferrous_services::signal::{signal, SignalPlugin};
use ferrous_services::{Container, Declaration, Registry, ServiceDefinition};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn setup(snapshots: &Arc<MemorySnapshots>) -> (Container, ServiceDefinition) {
    let registry = Registry::new();
    registry.register(|_| SignalPlugin);
    registry.register(|_| PersistPlugin::new());
    let def = registry
        .declare(Declaration::new("prefs").version(2), |d| {
            d.field("theme", persisted(signal("light")));
            d.field("font_size", persisted(signal(14)));
            d.field("draft", signal(""));
            d.field("session", value("none"));
        })
        .unwrap();

    let container = Container::new(registry);
    let provider: Arc<dyn SnapshotProvider> = snapshots.clone();
    let saver: Arc<dyn SnapshotSaver> = snapshots.clone();
    container.set_property(PERSIST_PROVIDER, provider);
    container.set_property(PERSIST_SAVER, saver);
    (container, def)
}

// Lets detached listener futures run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_restores_stored_fields_on_create() {
    let snapshots = Arc::new(MemorySnapshots::new());
    snapshots.insert("prefs_2", json!({ "theme": "dark", "draft": "ignored", "unknown": 1 }));
    let (container, def) = setup(&snapshots);

    let prefs = container.resolve_by_class(&def, None).await.unwrap();

    assert_eq!(prefs.get("theme"), Some(json!("dark")));
    assert_eq!(prefs.get("font_size"), Some(json!(14)));
    // Only persisted fields are restored
    assert_eq!(prefs.get("draft"), Some(json!("")));
}

#[tokio::test(start_paused = true)]
async fn test_saves_snapshot_on_change() {
    let snapshots = Arc::new(MemorySnapshots::new());
    let (container, def) = setup(&snapshots);
    let prefs = container.resolve_by_class(&def, None).await.unwrap();

    prefs.set("font_size", 16).unwrap();
    settle().await;
    assert_eq!(snapshots.get("prefs_2"), Some(json!({ "theme": "light", "font_size": 16 })));

    // Non-persisted fields do not trigger a save
    snapshots.insert("prefs_2", json!({}));
    prefs.set("draft", "hello").unwrap();
    settle().await;
    assert_eq!(snapshots.get("prefs_2"), Some(json!({})));
}

#[tokio::test(start_paused = true)]
async fn test_scoped_instances_use_scoped_keys() {
    let snapshots = Arc::new(MemorySnapshots::new());
    snapshots.insert("prefs:guest_2", json!({ "theme": "contrast" }));
    let (container, def) = setup(&snapshots);

    let guest = container.resolve_by_class(&def, Some("guest")).await.unwrap();
    let main = container.resolve_by_class(&def, None).await.unwrap();
    assert_eq!(guest.get("theme"), Some(json!("contrast")));
    assert_eq!(main.get("theme"), Some(json!("light")));

    guest.set("font_size", 20).unwrap();
    settle().await;
    assert_eq!(snapshots.get("prefs:guest_2"), Some(json!({ "theme": "contrast", "font_size": 20 })));
    assert_eq!(snapshots.get("prefs_2"), None);
}

#[tokio::test(start_paused = true)]
async fn test_halted_container_does_not_save() {
    let snapshots = Arc::new(MemorySnapshots::new());
    let (container, def) = setup(&snapshots);
    let prefs = container.resolve_by_class(&def, None).await.unwrap();

    container.halt(true);
    prefs.set("theme", "dark").unwrap();
    settle().await;
    assert_eq!(snapshots.get("prefs_2"), None);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_stops_saving() {
    let snapshots = Arc::new(MemorySnapshots::new());
    let (container, def) = setup(&snapshots);
    let prefs = container.resolve_by_class(&def, None).await.unwrap();

    prefs.destroy();
    prefs.set("theme", "dark").unwrap();
    settle().await;
    assert_eq!(snapshots.get("prefs_2"), None);
}

#[tokio::test]
async fn test_without_collaborators_nothing_happens() {
    let registry = Registry::new();
    registry.register(|_| SignalPlugin);
    registry.register(|_| PersistPlugin::new());
    let def = registry
        .declare(Declaration::new("prefs"), |d| {
            d.field("theme", persisted(signal("light")));
        })
        .unwrap();
    let container = Container::new(registry);

    let prefs = container.resolve_by_class(&def, None).await.unwrap();
    prefs.set("theme", "dark").unwrap();
    assert_eq!(prefs.get("theme"), Some(json!("dark")));
}
