//! Proxy fan-out: several worker instances over one shared transport

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::rc::Rc;

use serde_json::json;

use taskmaster::{ClosureTask, Proxy, Taskmaster, Worker};

fn worker_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_taskmaster-worker"))
}

#[test]
fn proxy_fans_out_to_hosted_instances_and_stops_cleanly() {
    let mut master = Taskmaster::new();
    master.set_executable(worker_bin());

    let proxy = Proxy::process().with_executable(worker_bin()).into_ref();
    master.add_workers(Worker::process().with_proxy(proxy.clone()), 3);
    assert_eq!(master.proxies().len(), 1);

    let results = Rc::new(RefCell::new(Vec::new()));
    for n in 0..9 {
        let log = results.clone();
        master.add_task(
            ClosureTask::new("identify")
                .with_input(json!({ "value": n, "sleep_ms": 50 }))
                .on_result(move |data| log.borrow_mut().push(data)),
        );
    }

    master.wait();

    let results = results.borrow();
    assert_eq!(results.len(), 9);

    let values: BTreeSet<i64> = results
        .iter()
        .map(|data| data["value"].as_i64().unwrap())
        .collect();
    assert_eq!(values, (0..9).collect::<BTreeSet<i64>>());

    // with sleeping tasks all three hosted instances take part
    let instances: BTreeSet<String> = results
        .iter()
        .map(|data| data["instance"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(instances.len(), 3);

    master.stop();
    assert!(!proxy.borrow_mut().is_running());
}

#[test]
fn callbacks_tunnel_through_the_proxy() {
    let mut master = Taskmaster::new();
    master.set_executable(worker_bin());

    let proxy = Proxy::process().with_executable(worker_bin()).into_ref();
    master.add_worker(Worker::process().with_proxy(proxy.clone()));

    let results = Rc::new(RefCell::new(Vec::new()));
    let log = results.clone();
    master.add_task(
        ClosureTask::new("callback_double")
            .with_input(json!(7))
            .with_function("computeHelper", |args| {
                Ok(json!(args.as_i64().unwrap_or(0) * 2))
            })
            .on_result(move |data| log.borrow_mut().push(data)),
    );

    master.wait();
    assert_eq!(*results.borrow(), vec![json!(14)]);

    master.stop();
    assert!(!proxy.borrow_mut().is_running());
}
