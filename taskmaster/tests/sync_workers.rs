//! In-process orchestration: synchronous workers, scheduling and callbacks

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use taskmaster::{ClosureTask, TaskFactory, TaskRef, Taskmaster, Worker, WorkerStatus};
use taskmaster_runtime::TaskRegistry;

fn registry() -> Arc<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    registry.register("echo", |input, _context| Ok(input));
    registry.register("identify", |input, context| {
        Ok(json!({ "instance": context.instance_id(), "value": input }))
    });
    registry.register("callback_double", |input, context| {
        context.call_function("computeHelper", input)
    });
    Arc::new(registry)
}

#[test]
fn sync_worker_runs_tasks_in_submission_order() {
    let mut master = Taskmaster::new();
    master.add_worker(Worker::sync_with(registry()));

    let results = Rc::new(RefCell::new(Vec::new()));
    for n in 1..=3 {
        let log = results.clone();
        master.add_task(
            ClosureTask::new("echo")
                .with_input(json!(n))
                .on_result(move |data| log.borrow_mut().push(data)),
        );
    }

    master.wait();
    assert_eq!(*results.borrow(), vec![json!(1), json!(2), json!(3)]);
    assert_eq!(master.pending_task_count(), 0);
}

#[test]
fn tasks_only_reach_workers_of_their_group() {
    let mut master = Taskmaster::new();
    master.add_worker(Worker::sync_with(registry()).with_group("a"));
    master.add_worker(Worker::sync_with(registry()).with_group("b"));

    let results: Rc<RefCell<Vec<(String, JsonValue)>>> = Rc::new(RefCell::new(Vec::new()));
    for (group, value) in [("a", 1), ("a", 2), ("b", 3), ("a", 4), ("b", 5)] {
        let log = results.clone();
        master.add_task(
            ClosureTask::new("identify")
                .with_group(group)
                .with_input(json!(value))
                .on_result(move |data| {
                    let instance = data["instance"].as_str().unwrap().to_string();
                    log.borrow_mut().push((instance, data["value"].clone()));
                }),
        );
    }

    master.wait();
    let results = results.borrow();
    assert_eq!(results.len(), 5);

    // each group was served by exactly one worker, in submission order
    let by_value = |values: &[i64]| -> Vec<String> {
        values
            .iter()
            .map(|v| {
                results
                    .iter()
                    .find(|(_, value)| value == &json!(v))
                    .expect("missing result")
                    .0
                    .clone()
            })
            .collect()
    };
    let a_instances = by_value(&[1, 2, 4]);
    let b_instances = by_value(&[3, 5]);
    assert!(a_instances.windows(2).all(|w| w[0] == w[1]));
    assert!(b_instances.windows(2).all(|w| w[0] == w[1]));
    assert_ne!(a_instances[0], b_instances[0]);

    let a_order: Vec<JsonValue> = results
        .iter()
        .filter(|(instance, _)| instance == &a_instances[0])
        .map(|(_, value)| value.clone())
        .collect();
    assert_eq!(a_order, vec![json!(1), json!(2), json!(4)]);
}

#[test]
fn task_functions_are_called_back_from_the_handler() {
    let mut master = Taskmaster::new();
    master.add_worker(Worker::sync_with(registry()));

    let results = Rc::new(RefCell::new(Vec::new()));
    let log = results.clone();
    let task = master.add_task(
        ClosureTask::new("callback_double")
            .with_input(json!(7))
            .with_function("computeHelper", |args| {
                Ok(json!(args.as_i64().unwrap_or(0) * 2))
            })
            .on_result(move |data| log.borrow_mut().push(data)),
    );

    master.wait();
    assert_eq!(*results.borrow(), vec![json!(14)]);
    drop(master);
    let task = task.borrow();
    // the concrete type is known here; downcast-free check through the trait
    assert_eq!(task.input(), json!(7));
}

struct OneShotFactory {
    task: Option<TaskRef>,
}

impl TaskFactory for OneShotFactory {
    fn create_next_task(&mut self, group: Option<&str>) -> Option<TaskRef> {
        if group.is_some() {
            return None;
        }
        self.task.take()
    }
}

#[test]
fn factory_tasks_run_before_queued_tasks() {
    let mut master = Taskmaster::new();
    master.add_worker(Worker::sync_with(registry()));

    let order = Rc::new(RefCell::new(Vec::new()));

    let log = order.clone();
    let factory_task: TaskRef = Rc::new(RefCell::new(
        ClosureTask::new("echo")
            .with_input(json!("factory"))
            .on_result(move |data| log.borrow_mut().push(data)),
    ));
    master.add_task_factory(OneShotFactory {
        task: Some(factory_task),
    });

    let log = order.clone();
    master.add_task(
        ClosureTask::new("echo")
            .with_input(json!("queued"))
            .on_result(move |data| log.borrow_mut().push(data)),
    );

    master.wait();
    assert_eq!(*order.borrow(), vec![json!("factory"), json!("queued")]);
}

#[test]
fn unmatched_tasks_do_not_hang_the_loop() {
    let mut master = Taskmaster::new();
    master.add_worker(Worker::sync_with(registry()).with_group("a"));

    let fired = Rc::new(RefCell::new(false));
    let flag = fired.clone();
    master.add_task(
        ClosureTask::new("echo")
            .with_group("z")
            .on_result(move |_| *flag.borrow_mut() = true),
    );

    master.wait();
    assert!(!*fired.borrow());
    assert_eq!(master.pending_task_count(), 1);
}

#[test]
fn stop_finishes_sync_workers() {
    let mut master = Taskmaster::new();
    master.add_workers(Worker::sync_with(registry()), 2);
    master.wait();
    master.stop();
    for worker in master.workers() {
        assert_eq!(worker.status(), WorkerStatus::Finished);
    }
}
