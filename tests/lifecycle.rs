use ferrous_services::descriptors::value;
use ferrous_services::{
    Container, Declaration, HookFuture, Plugin, Registry, ServiceDefinition, ServiceError, ServiceInstance,
};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Log = Arc<Mutex<Vec<String>>>;

struct Recorder {
    tag: &'static str,
    log: Log,
}

impl Recorder {
    fn push(&self, event: &str, instance: &ServiceInstance) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{} {} {}", self.tag, event, instance.definition().identifier()));
    }
}

impl Plugin for Recorder {
    fn on_create(&self, _def: &ServiceDefinition, instance: &ServiceInstance) -> Option<HookFuture> {
        self.push("create", instance);
        None
    }

    fn on_destroy(&self, _def: &ServiceDefinition, instance: &ServiceInstance) {
        self.push("destroy", instance);
    }
}

// Distinct plugin types so both can be registered
struct First(Recorder);
struct Second(Recorder);

impl Plugin for First {
    fn on_create(&self, def: &ServiceDefinition, instance: &ServiceInstance) -> Option<HookFuture> {
        self.0.on_create(def, instance)
    }
    fn on_destroy(&self, def: &ServiceDefinition, instance: &ServiceInstance) {
        self.0.on_destroy(def, instance)
    }
}

impl Plugin for Second {
    fn on_create(&self, def: &ServiceDefinition, instance: &ServiceInstance) -> Option<HookFuture> {
        self.0.on_create(def, instance)
    }
    fn on_destroy(&self, def: &ServiceDefinition, instance: &ServiceInstance) {
        self.0.on_destroy(def, instance)
    }
}

fn recorder(tag: &'static str, log: &Log) -> Recorder {
    Recorder { tag, log: log.clone() }
}

#[test]
fn test_hooks_run_in_registration_order_and_reverse_on_destroy() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let registry = Registry::new();
    let l1 = log.clone();
    let l2 = log.clone();
    registry.register(move |_| First(recorder("first", &l1)));
    registry.register(move |_| Second(recorder("second", &l2)));
    let def = registry.declare(Declaration::new("svc"), |_| {}).unwrap();

    let container = Container::new(registry);
    let instance = container.get_by_class(&def, None);
    instance.destroy();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["first create svc", "second create svc", "second destroy svc", "first destroy svc"]
    );
}

#[test]
fn test_plugin_registration_is_idempotent() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let registry = Registry::new();
    let l1 = log.clone();
    let l2 = log.clone();
    assert!(registry.register(move |_| First(recorder("a", &l1))));
    assert!(!registry.register(move |_| First(recorder("b", &l2))));
    assert!(registry.has_plugin::<First>());
    assert!(!registry.has_plugin::<Second>());

    let def = registry.declare(Declaration::new("svc"), |_| {}).unwrap();
    let container = Container::new(registry);
    container.get_by_class(&def, None);

    assert_eq!(*log.lock().unwrap(), vec!["a create svc"]);
}

#[test]
fn test_plugin_lookup() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let registry = Registry::new();
    let l1 = log.clone();
    registry.register(move |_| First(recorder("first", &l1)));
    let container = Container::new(registry);

    let first = container.plugin::<First>().unwrap();
    assert_eq!(first.0.tag, "first");
    assert!(matches!(container.plugin::<Second>(), Err(ServiceError::PluginNotRegistered(_))));
}

#[test]
fn test_plugin_factory_receives_owning_container() {
    struct Probe {
        saw_container: bool,
    }
    impl Plugin for Probe {}

    let registry = Registry::new();
    registry.register(|container: &Container| Probe {
        saw_container: container.instance_count() == 0,
    });
    let container = Container::new(registry);
    assert!(container.plugin::<Probe>().unwrap().saw_container);
}

#[test]
fn test_dynamic_registration_reaches_existing_instances() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let registry = Registry::new();
    let a = registry.declare(Declaration::new("a"), |_| {}).unwrap();
    let b = registry.declare(Declaration::new("b"), |_| {}).unwrap();
    let container = Container::new(registry.clone());
    container.get_by_class(&a, None);
    container.get_by_class(&b, None);

    let l1 = log.clone();
    let l2 = log.clone();
    assert!(container.register_plugin(move |_| First(recorder("late", &l1))));
    assert!(!container.register_plugin(move |_| First(recorder("again", &l2))));
    assert_eq!(*log.lock().unwrap(), vec!["late create a", "late create b"]);

    // Registry-level plugins are untouched by per-container registration
    assert!(!registry.has_plugin::<First>());
}

struct SlowSetup {
    ready: Arc<AtomicBool>,
}

impl Plugin for SlowSetup {
    fn on_create(&self, _def: &ServiceDefinition, _instance: &ServiceInstance) -> Option<HookFuture> {
        let ready = self.ready.clone();
        Some(
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                ready.store(true, Ordering::SeqCst);
                Ok(())
            }
            .boxed(),
        )
    }
}

#[tokio::test(start_paused = true)]
async fn test_resolve_by_class_awaits_async_hooks() {
    let ready = Arc::new(AtomicBool::new(false));
    let registry = Registry::new();
    let flag = ready.clone();
    registry.register(move |_| SlowSetup { ready: flag.clone() });
    let def = registry.declare(Declaration::new("svc"), |_| {}).unwrap();
    let container = Container::new(registry);

    container.resolve_by_class(&def, None).await.unwrap();
    assert!(ready.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_get_by_class_does_not_wait_for_async_hooks() {
    let ready = Arc::new(AtomicBool::new(false));
    let registry = Registry::new();
    let flag = ready.clone();
    registry.register(move |_| SlowSetup { ready: flag.clone() });
    let def = registry.declare(Declaration::new("svc"), |_| {}).unwrap();
    let container = Container::new(registry);

    container.get_by_class(&def, None);
    assert!(!ready.load(Ordering::SeqCst));

    // The spawned hook finishes on its own
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(ready.load(Ordering::SeqCst));
}

struct FailingSetup;

impl Plugin for FailingSetup {
    fn on_create(&self, _def: &ServiceDefinition, _instance: &ServiceInstance) -> Option<HookFuture> {
        Some(async { Err(ServiceError::failed("setup failed")) }.boxed())
    }
}

#[tokio::test]
async fn test_resolve_by_class_surfaces_hook_errors() {
    let registry = Registry::new();
    registry.register(|_| FailingSetup);
    let def = registry
        .declare(Declaration::new("svc"), |d| {
            d.field("x", value(1));
        })
        .unwrap();
    let container = Container::new(registry);

    let err = container.resolve_by_class(&def, None).await.unwrap_err();
    assert_eq!(err, ServiceError::failed("setup failed"));
    // The instance is still registered
    assert_eq!(container.instance_count(), 1);
}

fn slow_setup() -> (Container, ServiceDefinition, Arc<AtomicBool>) {
    let ready = Arc::new(AtomicBool::new(false));
    let registry = Registry::new();
    let flag = ready.clone();
    registry.register(move |_| SlowSetup { ready: flag.clone() });
    let def = registry.declare(Declaration::new("svc"), |_| {}).unwrap();
    (Container::new(registry), def, ready)
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_resolves_all_wait_for_setup() {
    let (container, def, ready) = slow_setup();

    let first = {
        let container = container.clone();
        let def = def.clone();
        tokio::spawn(async move { container.resolve_by_class(&def, None).await.map(|_| ()) })
    };
    // Let the first resolve create the instance
    tokio::task::yield_now().await;
    assert_eq!(container.instance_count(), 1);
    assert!(!ready.load(Ordering::SeqCst));

    container.resolve_by_class(&def, None).await.unwrap();
    assert!(ready.load(Ordering::SeqCst));
    first.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_resolve_after_get_waits_for_spawned_setup() {
    let (container, def, ready) = slow_setup();

    let instance = container.get_by_class(&def, None);
    assert!(!ready.load(Ordering::SeqCst));

    let resolved = container.resolve_by_class(&def, None).await.unwrap();
    assert!(resolved.ptr_eq(&instance));
    assert!(ready.load(Ordering::SeqCst));
    instance.ready().await.unwrap();
}

#[tokio::test]
async fn test_later_resolves_see_the_setup_error() {
    let registry = Registry::new();
    registry.register(|_| FailingSetup);
    let def = registry.declare(Declaration::new("svc"), |_| {}).unwrap();
    let container = Container::new(registry);

    assert!(container.resolve_by_class(&def, None).await.is_err());
    let err = container.resolve_by_class(&def, None).await.unwrap_err();
    assert_eq!(err, ServiceError::failed("setup failed"));
}

#[test]
fn test_dropping_the_container_destroys_live_instances() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let registry = Registry::new();
    let l1 = log.clone();
    let l2 = log.clone();
    registry.register(move |_| First(recorder("first", &l1)));
    registry.register(move |_| Second(recorder("second", &l2)));
    let def = registry.declare(Declaration::new("svc"), |_| {}).unwrap();

    let container = Container::new(registry);
    let instance = container.get_by_class(&def, None);
    let clone = container.clone();
    drop(container);
    // Another handle keeps everything alive
    assert!(!instance.is_destroyed());

    drop(clone);
    assert!(instance.is_destroyed());
    assert!(instance.container().is_none());
    assert_eq!(
        *log.lock().unwrap(),
        vec!["first create svc", "second create svc", "second destroy svc", "first destroy svc"]
    );

    // Destroying again is a no-op
    instance.destroy();
    assert_eq!(log.lock().unwrap().len(), 4);
}
