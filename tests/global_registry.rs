use ferrous_services::descriptors::value;
use ferrous_services::signal::SignalPlugin;
use ferrous_services::{Container, Declaration, Registry};
use serde_json::json;
use serial_test::serial;

#[test]
#[serial]
fn test_global_registry_is_shared() {
    let def = Registry::global()
        .declare(Declaration::new("global.settings"), |d| {
            d.field("locale", value("en"));
        })
        .unwrap();
    let again = Registry::global()
        .declare(Declaration::new("global.settings"), |d| {
            d.field("locale", value("fr"));
        })
        .unwrap();
    assert_eq!(def, again);

    let container = Container::with_global_registry();
    let settings = container.get_by_name("global.settings", None).unwrap();
    assert_eq!(settings.get("locale"), Some(json!("en")));
}

#[test]
#[serial]
fn test_global_plugins_reach_new_containers() {
    Registry::global().register(|_| SignalPlugin);
    assert!(!Registry::global().register(|_| SignalPlugin));

    let container = Container::with_global_registry();
    assert!(container.plugin::<SignalPlugin>().is_ok());
}
