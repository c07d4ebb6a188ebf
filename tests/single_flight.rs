use ferrous_services::descriptors::method;
use ferrous_services::plugins::single_flight::{single_flight, SingleFlightPlugin};
use ferrous_services::{Container, Declaration, Registry, ServiceError, ServiceInstance};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn loader(fail: bool) -> (Container, ServiceInstance, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Registry::new();
    registry.register(|_| SingleFlightPlugin::new());

    let counter = calls.clone();
    let def = registry
        .declare(Declaration::new("profile"), move |d| {
            d.field(
                "load",
                single_flight(method(move |_this, _args| {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        if fail {
                            Err(ServiceError::failed("offline"))
                        } else {
                            Ok(json!({ "load": n }))
                        }
                    }
                })),
            );
        })
        .unwrap();

    let container = Container::new(registry);
    let instance = container.get_by_class(&def, None);
    (container, instance, calls)
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_share_one_invocation() {
    let (container, profile, calls) = loader(false);

    let (a, b) = tokio::join!(profile.call("load", vec![]), profile.call("load", vec![json!("ignored")]));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap(), json!({ "load": 1 }));
    assert_eq!(b.unwrap(), json!({ "load": 1 }));
    assert_eq!(container.plugin::<SingleFlightPlugin>().unwrap().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_calls_each_run() {
    let (_container, profile, calls) = loader(false);

    assert_eq!(profile.call("load", vec![]).await.unwrap(), json!({ "load": 1 }));
    assert_eq!(profile.call("load", vec![]).await.unwrap(), json!({ "load": 2 }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_errors_fan_out_to_every_waiter() {
    let (_container, profile, calls) = loader(true);

    let first = profile.call("load", vec![]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = profile.call("load", vec![]);
    let (a, b) = tokio::join!(first, second);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap_err(), ServiceError::failed("offline"));
    assert_eq!(b.unwrap_err(), ServiceError::failed("offline"));
}

#[tokio::test(start_paused = true)]
async fn test_destroy_cancels_waiters() {
    let (_container, profile, _calls) = loader(false);

    let first = tokio::spawn(profile.call("load", vec![]));
    let second = tokio::spawn(profile.call("load", vec![]));
    tokio::time::sleep(Duration::from_millis(10)).await;
    profile.destroy();

    let cancelled = ServiceError::Cancelled { method: "load".to_string() };
    assert_eq!(first.await.unwrap().unwrap_err(), cancelled);
    assert_eq!(second.await.unwrap().unwrap_err(), cancelled);
}
