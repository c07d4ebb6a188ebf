use ferrous_services::descriptors::method;
use ferrous_services::plugins::debounce::{debounce, DebouncePlugin};
use ferrous_services::{Container, Declaration, Registry, ServiceError, ServiceInstance};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

type Calls = Arc<Mutex<Vec<(Duration, Vec<Value>)>>>;

fn search_service(ms: u64) -> (Container, ServiceInstance, Calls, Instant) {
    let start = Instant::now();
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let registry = Registry::new();
    registry.register(|_| DebouncePlugin::new());

    let log = calls.clone();
    let def = registry
        .declare(Declaration::new("search"), move |d| {
            d.field(
                "query",
                debounce(
                    ms,
                    method(move |_this, args| {
                        let log = log.clone();
                        async move {
                            log.lock().unwrap().push((start.elapsed(), args.clone()));
                            Ok(json!({ "results": args }))
                        }
                    }),
                ),
            );
        })
        .unwrap();

    let container = Container::new(registry);
    let instance = container.get_by_class(&def, None);
    (container, instance, calls, start)
}

#[tokio::test(start_paused = true)]
async fn test_only_last_call_in_window_runs() {
    let (_container, search, calls, _start) = search_service(50);

    let a = search.call("query", vec![json!("r")]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let b = search.call("query", vec![json!("ru")]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let c = search.call("query", vec![json!("rust")]);

    let (a, b, c) = tokio::join!(a, b, c);

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], (Duration::from_millis(70), vec![json!("rust")]));

    // Every waiting caller gets the shared result
    let expected = json!({ "results": ["rust"] });
    assert_eq!(a.unwrap(), expected);
    assert_eq!(b.unwrap(), expected);
    assert_eq!(c.unwrap(), expected);
}

#[tokio::test(start_paused = true)]
async fn test_separate_windows_run_separately() {
    let (_container, search, calls, _start) = search_service(50);

    search.call("query", vec![json!(1)]).await.unwrap();
    search.call("query", vec![json!(2)]).await.unwrap();

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], (Duration::from_millis(50), vec![json!(1)]));
    assert_eq!(calls[1], (Duration::from_millis(100), vec![json!(2)]));
}

#[tokio::test(start_paused = true)]
async fn test_scoped_instances_debounce_independently() {
    let (container, search, calls, _start) = search_service(30);
    let other = container.get_by_class(search.definition(), Some("sidebar"));

    let a = search.call("query", vec![json!("main")]);
    let b = other.call("query", vec![json!("side")]);
    let (a, b) = tokio::join!(a, b);
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(calls.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_cancels_pending_trigger() {
    let (container, search, calls, _start) = search_service(50);

    let waiting = tokio::spawn(search.call("query", vec![json!("late")]));
    tokio::time::sleep(Duration::from_millis(20)).await;
    search.destroy();

    assert_eq!(container.plugin::<DebouncePlugin>().unwrap().pending_count(), 0);
    assert_eq!(
        waiting.await.unwrap().unwrap_err(),
        ServiceError::Cancelled { method: "query".to_string() }
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(calls.lock().unwrap().is_empty());
}
