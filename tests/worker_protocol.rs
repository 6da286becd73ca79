//! End-to-end tests driving a real `demo-worker` child process over the
//! actual stdin/stdout wire protocol.
//!
//! Scripts here are written in `appose::ExprEngine`'s own minimal grammar
//! (see `src/worker/expr_engine.rs`), not Python or Groovy — the
//! `ScriptSyntax` implementations this crate ships target those guest
//! languages, which the reference engine does not parse. `TestSyntax`
//! below is a small syntax binding compatible with `ExprEngine`'s grammar,
//! used only to drive `Service::get_var`/`put_var`/`call`/`proxy` in these
//! tests the same way a guest-language syntax would in production.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use appose::{Args, Service, SharedMemoryRegion, TaskEvent, Value};

fn demo_worker_path() -> &'static str {
    env!("CARGO_BIN_EXE_demo-worker")
}

fn spawn_service() -> Service {
    Service::new(".", vec![demo_worker_path().to_string()])
}

fn args_of(pairs: Vec<(&str, Value)>) -> Args {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Collatz stopping time of 9999 is 91, with one `UPDATE` per step and a
/// `COMPLETION` carrying `result == 91`.
#[tokio::test(flavor = "multi_thread")]
async fn collatz_progress_emits_one_update_per_step() {
    let service = spawn_service();
    let script = r#"
        n = 9999
        i = 0
        while (n != 1) {
            if (n % 2 == 0) { n = n / 2 } else { n = 3 * n + 1 }
            i = i + 1
            task.update("[" + str(i) + "] -> " + str(n), i, 0, null)
        }
        i
    "#;
    let task = service
        .task(script, Args::new(), None)
        .await
        .expect("create task");

    let launches = Arc::new(AtomicUsize::new(0));
    let updates = Arc::new(AtomicUsize::new(0));
    let completions = Arc::new(AtomicUsize::new(0));
    let (l, u, c) = (Arc::clone(&launches), Arc::clone(&updates), Arc::clone(&completions));
    task.listen(Box::new(move |event: &TaskEvent| match event.kind {
        appose::task::TaskEventKind::Launch => {
            l.fetch_add(1, Ordering::SeqCst);
        }
        appose::task::TaskEventKind::Update => {
            u.fetch_add(1, Ordering::SeqCst);
        }
        appose::task::TaskEventKind::Completion => {
            c.fetch_add(1, Ordering::SeqCst);
        }
        _ => {}
    }))
    .await
    .expect("listen");

    let outputs = tokio::time::timeout(Duration::from_secs(10), task.result())
        .await
        .expect("task did not finish in time")
        .expect("task succeeded");

    assert_eq!(launches.load(Ordering::SeqCst), 1);
    assert_eq!(updates.load(Ordering::SeqCst), 91);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(outputs.get("result"), Some(&Value::Int(91)));
}

/// A function exported by one task's script is callable by a later task
/// against the same worker process.
#[tokio::test(flavor = "multi_thread")]
async fn cross_task_export_makes_function_visible_to_later_tasks() {
    let service = spawn_service();

    let script1 = r#"
        fn sqrt_age(a) { sqrt(a) }
        task.export("sqrt_age", sqrt_age)
        sqrt_age(age)
    "#;
    let inputs1 = args_of(vec![("age", Value::Float(100.0))]);
    let task1 = service.task(script1, inputs1, None).await.expect("task1");
    let outputs1 = task1.result().await.expect("task1 succeeds");
    assert_eq!(outputs1.get("result"), Some(&Value::Float(10.0)));

    let script2 = "sqrt_age(age)";
    let inputs2 = args_of(vec![("age", Value::Float(81.0))]);
    let task2 = service.task(script2, inputs2, None).await.expect("task2");
    let outputs2 = task2.result().await.expect("task2 succeeds");
    assert_eq!(outputs2.get("result"), Some(&Value::Float(9.0)));
}

/// A `queue="main"` task runs on the worker's primary thread; an ordinary
/// task gets a distinct dedicated thread.
#[tokio::test(flavor = "multi_thread")]
async fn main_queue_task_runs_on_a_distinct_thread() {
    let service = spawn_service();

    let main_task = service
        .task("thread_name()", Args::new(), Some("main".to_string()))
        .await
        .expect("main task");
    let main_outputs = tokio::time::timeout(Duration::from_secs(5), main_task.result())
        .await
        .expect("main task timed out")
        .expect("main task succeeds");

    let other_task = service
        .task("thread_name()", Args::new(), None)
        .await
        .expect("other task");
    let other_outputs = other_task.result().await.expect("other task succeeds");

    assert_ne!(
        main_outputs.get("result"),
        other_outputs.get("result"),
        "main-queue task and a dedicated-thread task must observe different thread identities"
    );
    // The dedicated-thread task runs on a thread named after its own uuid.
    assert_eq!(
        other_outputs.get("result"),
        Some(&Value::String(format!("appose-task-{}", other_task.uuid)))
    );
}

/// An NDArray over shared memory sent to the worker round-trips its
/// dtype/shape/rsize and a content byte-sum.
#[tokio::test(flavor = "multi_thread")]
async fn shared_memory_ndarray_round_trips_through_worker() {
    let mut shm = SharedMemoryRegion::create(2 * 2 * 20 * 25).expect("create shm");
    {
        let buf = shm.buffer_mut();
        buf[0] = 123;
        buf[456] = 78;
        buf[1999] = 210;
    }
    let arr = appose::NDArray::wrap("uint16", vec![2, 20, 25], shm).expect("wrap ndarray");

    let service = spawn_service();
    let script = r#"
        task.set_output("dtype", arr.dtype)
        task.set_output("shape", arr.shape)
        task.set_output("rsize", arr.shm.rsize)
        task.set_output("sum", byte_sum(arr))
    "#;
    let inputs = args_of(vec![("arr", Value::NDArray(arr.as_ref_handle()))]);
    let task = service.task(script, inputs, None).await.expect("task");
    let outputs = task.result().await.expect("task succeeds");

    assert_eq!(outputs.get("dtype"), Some(&Value::String("uint16".to_string())));
    assert_eq!(
        outputs.get("shape"),
        Some(&Value::List(vec![Value::Int(2), Value::Int(20), Value::Int(25)]))
    );
    assert_eq!(outputs.get("rsize"), Some(&Value::Int(2000)));
    assert_eq!(outputs.get("sum"), Some(&Value::Int(123 + 78 + 210)));
}

/// Killing the worker mid-task crashes every outstanding task, carrying the
/// exit status in the error text.
#[tokio::test(flavor = "multi_thread")]
async fn killing_worker_mid_task_crashes_outstanding_tasks() {
    let service = spawn_service();
    let script = r#"
        task.update("crash-me", 0, 0, null)
        sleep(60000)
    "#;
    let task = service.task(script, Args::new(), None).await.expect("task");

    let saw_crash_me = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&saw_crash_me);
    task.listen(Box::new(move |event: &TaskEvent| {
        if event.message.as_deref() == Some("crash-me") {
            *flag.lock().unwrap() = true;
        }
    }))
    .await
    .expect("listen");
    task.start().await.expect("start");

    // Wait for the worker to actually emit the "crash-me" progress update
    // before killing it, so we exercise a genuine mid-task crash rather
    // than racing the worker's own startup.
    for _ in 0..100 {
        if *saw_crash_me.lock().unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(*saw_crash_me.lock().unwrap(), "never observed crash-me update");

    service.kill();

    let err = tokio::time::timeout(Duration::from_secs(10), task.wait_for())
        .await
        .expect("crash was not observed in time")
        .expect_err("task must not complete successfully");
    match err {
        appose::error::TaskFailed::Crashed { error, .. } => {
            assert!(error.contains("exited with code"));
        }
        other => panic!("expected Crashed, got {other:?}"),
    }
}

/// A script result that can't be encoded directly as JSON is auto-exported
/// by the worker and arrives as a live proxy; the caller can still invoke
/// it as a remote callable.
#[tokio::test(flavor = "multi_thread")]
async fn non_serializable_result_becomes_a_callable_proxy() {
    let service = spawn_service();
    let script = "fn doubler(x) { x * 2 } doubler";
    let task = service.task(script, Args::new(), None).await.expect("task");
    let outputs = task.result().await.expect("task succeeds");

    let result = outputs.get("result").expect("result present");
    let proxy = result.as_proxy().expect("result is a proxy").clone();

    service.set_syntax(Arc::new(TestSyntax));
    let doubled = proxy.call(vec![Value::Int(21)]).await.expect("remote call");
    assert_eq!(doubled, Value::Int(42));
}

/// Minimal [`appose::syntax::ScriptSyntax`] matching `ExprEngine`'s grammar
/// (plain positional calls, no `dir()`/keyword-export support), used only
/// to exercise `get_var`/`put_var`/`call`/proxy plumbing in these tests.
#[derive(Debug)]
struct TestSyntax;

impl appose::syntax::ScriptSyntax for TestSyntax {
    fn name(&self) -> &'static str {
        "exprengine-test"
    }

    fn get_var(&self, name: &str) -> String {
        name.to_string()
    }

    fn put_var(&self, name: &str, value_var: &str) -> String {
        format!("{name} = {value_var}\ntask.export(\"{name}\", {name})")
    }

    fn call(&self, function: &str, arg_vars: &[String]) -> String {
        format!("{function}({})", arg_vars.join(", "))
    }

    fn get_attribute(&self, obj: &str, attr: &str) -> String {
        format!("{obj}.{attr}")
    }

    fn invoke_method(&self, obj: &str, method: &str, arg_vars: &[String]) -> String {
        format!("{obj}.{method}({})", arg_vars.join(", "))
    }

    fn get_attributes(&self, _obj: &str) -> String {
        "null".to_string()
    }
}
