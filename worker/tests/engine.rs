mod support;

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Context, EventType, Executor, FileType, Input, Output, State, Task};
use support::{runtime, scratch, worker_conf, Recorder, ScriptRuntime};
use worker::engine::Engine;
use worker::reader::{ReadError, StaticTaskReader, TaskReader};
use worker::storage::{LocalStorage, Mux, Object, Operation, Storage, StorageError};

fn exec(cmd: &[&str]) -> Executor {
    Executor {
        image: "alpine".into(),
        command: cmd.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn task(id: &str, executors: Vec<Executor>) -> Task {
    Task {
        id: id.into(),
        executors,
        ..Default::default()
    }
}

fn local() -> Arc<dyn Storage> {
    Arc::new(Mux::new(vec![Arc::new(LocalStorage::new(vec![]))]))
}

fn engine(work: &Path, rt: Arc<ScriptRuntime>, store: Arc<dyn Storage>, rec: Arc<Recorder>) -> Engine {
    Engine::new(worker_conf(work), store, rt, rec).with_inspect_delay(Duration::from_millis(10))
}

fn states(rec: &Recorder) -> Vec<State> {
    rec.events()
        .into_iter()
        .filter_map(|e| match e.payload {
            common::Payload::State(s) => Some(s),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn hello_world_completes() {
    let work = scratch("work");
    let rec = Arc::new(Recorder::default());
    let rt = runtime();
    let t = task("hello", vec![exec(&["echo", "hello", "world"])]);

    let state = engine(&work, rt.clone(), local(), rec.clone())
        .run(&Context::background(), Arc::new(StaticTaskReader::new(t.clone())))
        .await
        .unwrap();

    assert_eq!(state, State::Complete);
    assert_eq!(states(&rec), vec![State::Initializing, State::Running, State::Complete]);
    assert_eq!(rt.runs(), vec!["hello-0"]);

    let folded = rec.fold(&t);
    assert_eq!(folded.state, State::Complete);
    let log = &folded.logs[0];
    assert_eq!(log.logs[0].stdout, "hello world\n");
    assert_eq!(log.logs[0].exit_code, 0);
    assert!(!log.start_time.is_empty() && !log.end_time.is_empty());
    assert!(log.metadata.contains_key("hostname"));
    // directorio de trabajo limpiado
    assert!(!work.join("hello").exists());
}

#[tokio::test]
async fn executor_failure_stops_the_run() {
    let work = scratch("work");
    let rec = Arc::new(Recorder::default());
    let rt = runtime();
    let t = task("bad", vec![exec(&["fail", "3"]), exec(&["echo", "never"])]);

    let state = engine(&work, rt.clone(), local(), rec.clone())
        .run(&Context::background(), Arc::new(StaticTaskReader::new(t.clone())))
        .await
        .unwrap();

    assert_eq!(state, State::ExecutorError);
    assert_eq!(rt.runs(), vec!["bad-0"]);
    let folded = rec.fold(&t);
    assert_eq!(folded.state, State::ExecutorError);
    assert_eq!(folded.logs[0].logs[0].exit_code, 3);
    assert_eq!(folded.logs[0].logs[0].stderr, "boom\n");
    assert!(rec.messages().contains(&"exec error".to_string()));
    // sin salidas no hay TASK_OUTPUTS
    assert!(rec.events().iter().all(|e| e.kind != EventType::TaskOutputs));
}

#[tokio::test]
async fn ignored_failure_keeps_going() {
    let work = scratch("work");
    let rec = Arc::new(Recorder::default());
    let rt = runtime();
    let mut first = exec(&["fail", "1"]);
    first.ignore_error = true;
    let t = task("ignored", vec![first, exec(&["echo", "second"])]);

    let state = engine(&work, rt.clone(), local(), rec.clone())
        .run(&Context::background(), Arc::new(StaticTaskReader::new(t.clone())))
        .await
        .unwrap();

    assert_eq!(state, State::Complete);
    assert_eq!(rt.runs(), vec!["ignored-0", "ignored-1"]);
    let folded = rec.fold(&t);
    assert_eq!(folded.logs[0].logs[0].exit_code, 1);
    assert_eq!(folded.logs[0].logs[1].stdout, "second\n");
    assert!(rec.messages().contains(&"executor failed, ignoring".to_string()));
}

#[tokio::test]
async fn inputs_flow_through_to_outputs() {
    let work = scratch("work");
    let src = scratch("src");
    let dest = scratch("dest");
    std::fs::write(src.join("a.txt"), "from storage").unwrap();

    let rec = Arc::new(Recorder::default());
    let mut cat = exec(&["cat"]);
    cat.stdin = "/in/inline.txt".into();
    cat.stdout = "/out/stdout.txt".into();
    let mut t = task(
        "files",
        vec![exec(&["cat", "/in/a.txt"]), cat, exec(&["write", "/out/report/sub/b.txt", "bbb"])],
    );
    t.inputs = vec![
        Input {
            url: src.join("a.txt").display().to_string(),
            path: "/in/a.txt".into(),
            ..Default::default()
        },
        Input {
            path: "/in/inline.txt".into(),
            content: "inline\n".into(),
            ..Default::default()
        },
    ];
    t.outputs = vec![
        Output {
            url: format!("file://{}", dest.join("stdout.txt").display()),
            path: "/out/stdout.txt".into(),
            kind: FileType::File,
            ..Default::default()
        },
        Output {
            url: dest.join("report").display().to_string(),
            path: "/out/report".into(),
            kind: FileType::Directory,
            ..Default::default()
        },
    ];

    let state = engine(&work, runtime(), local(), rec.clone())
        .run(&Context::background(), Arc::new(StaticTaskReader::new(t.clone())))
        .await
        .unwrap();

    assert_eq!(state, State::Complete, "{:?}", rec.messages());
    assert_eq!(std::fs::read_to_string(dest.join("stdout.txt")).unwrap(), "inline\n");
    assert_eq!(std::fs::read_to_string(dest.join("report/sub/b.txt")).unwrap(), "bbb");

    let folded = rec.fold(&t);
    let log = &folded.logs[0];
    assert_eq!(log.logs[0].stdout, "from storage");
    let paths: Vec<&str> = log.outputs.iter().map(|o| o.path.as_str()).collect();
    assert!(paths.contains(&"/out/stdout.txt"));
    assert!(paths.contains(&"/out/report/sub/b.txt"));
    assert!(log.outputs.iter().all(|o| !o.size_bytes.is_empty()));

    let kinds: Vec<EventType> = rec.events().iter().map(|e| e.kind).collect();
    let n = kinds.len();
    assert_eq!(
        &kinds[n - 3..],
        &[EventType::TaskOutputs, EventType::TaskEndTime, EventType::TaskState]
    );
}

#[tokio::test]
async fn missing_input_is_a_system_error() {
    let work = scratch("work");
    let rec = Arc::new(Recorder::default());
    let rt = runtime();
    let mut t = task("missing", vec![exec(&["echo", "x"])]);
    t.inputs = vec![Input {
        url: "/definitely/not/here.txt".into(),
        path: "/in/x".into(),
        ..Default::default()
    }];

    let state = engine(&work, rt.clone(), local(), rec.clone())
        .run(&Context::background(), Arc::new(StaticTaskReader::new(t)))
        .await
        .unwrap();

    assert_eq!(state, State::SystemError);
    assert!(rt.runs().is_empty());
    let msgs = rec.messages();
    assert!(msgs.contains(&"download failed".to_string()));
    assert!(msgs.contains(&"system error".to_string()));
    assert!(!states(&rec).contains(&State::Running));
}

#[tokio::test]
async fn escaping_path_is_a_system_error() {
    let work = scratch("work");
    let rec = Arc::new(Recorder::default());
    let mut t = task("escape", vec![exec(&["echo", "x"])]);
    t.inputs = vec![Input {
        path: "/../../etc/passwd".into(),
        content: "nope".into(),
        ..Default::default()
    }];

    let state = engine(&work, runtime(), local(), rec.clone())
        .run(&Context::background(), Arc::new(StaticTaskReader::new(t)))
        .await
        .unwrap();
    assert_eq!(state, State::SystemError);
}

#[tokio::test]
async fn canceled_context_skips_all_io() {
    let work = scratch("work");
    let rec = Arc::new(Recorder::default());
    let rt = runtime();
    let ctx = Context::background();
    ctx.cancel();

    let state = engine(&work, rt.clone(), local(), rec.clone())
        .run(&ctx, Arc::new(StaticTaskReader::new(task("early", vec![exec(&["echo", "x"])]))))
        .await
        .unwrap();

    assert_eq!(state, State::Canceled);
    assert!(rt.runs().is_empty());
    assert_eq!(states(&rec), vec![State::Initializing, State::Canceled]);
}

/// Descargas que no terminan nunca; cuenta las subidas.
#[derive(Default)]
struct Stuck {
    puts: AtomicUsize,
}

#[async_trait]
impl Storage for Stuck {
    fn supports(&self, _url: &str, _op: Operation) -> bool {
        true
    }
    async fn get(&self, _url: &str, _dest: &Path) -> Result<Object, StorageError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        unreachable!()
    }
    async fn put(&self, url: &str, _src: &Path) -> Result<Object, StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(Object { url: url.into(), size: 0 })
    }
    async fn list(&self, _url: &str) -> Result<Vec<Object>, StorageError> {
        Ok(vec![])
    }
}

/// El servidor marca la tarea CANCELED tras `after`.
struct CanceledLater {
    task: Task,
    start: Instant,
    after: Duration,
}

#[async_trait]
impl TaskReader for CanceledLater {
    async fn task(&self) -> Result<Task, ReadError> {
        Ok(self.task.clone())
    }
    async fn state(&self) -> Result<State, ReadError> {
        Ok(if self.start.elapsed() >= self.after {
            State::Canceled
        } else {
            State::Initializing
        })
    }
}

#[tokio::test]
async fn cancel_during_download_aborts_quickly() {
    let work = scratch("work");
    let rec = Arc::new(Recorder::default());
    let store = Arc::new(Stuck::default());
    let rt = runtime();
    let mut t = task("slow", vec![exec(&["echo", "x"])]);
    t.inputs = vec![Input {
        url: "s3://bucket/big".into(),
        path: "/in/big".into(),
        ..Default::default()
    }];
    t.outputs = vec![Output {
        url: "s3://bucket/out".into(),
        path: "/out/x".into(),
        ..Default::default()
    }];
    let reader = Arc::new(CanceledLater {
        task: t,
        start: Instant::now(),
        after: Duration::from_millis(100),
    });

    let started = Instant::now();
    let state = engine(&work, rt.clone(), store.clone(), rec.clone())
        .run(&Context::background(), reader)
        .await
        .unwrap();

    assert_eq!(state, State::Canceled);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(rt.runs().is_empty());
    assert_eq!(store.puts.load(Ordering::SeqCst), 0);
    assert_eq!(states(&rec).last(), Some(&State::Canceled));
}

#[tokio::test]
async fn cancel_while_running_stops_the_container() {
    let work = scratch("work");
    let rec = Arc::new(Recorder::default());
    let rt = runtime();
    let reader = Arc::new(CanceledLater {
        task: task("long", vec![exec(&["sleep", "60000"]), exec(&["echo", "never"])]),
        start: Instant::now(),
        after: Duration::from_millis(150),
    });

    let state = engine(&work, rt.clone(), local(), rec.clone())
        .run(&Context::background(), reader)
        .await
        .unwrap();

    assert_eq!(state, State::Canceled);
    assert_eq!(rt.runs(), vec!["long-0"]);
    assert_eq!(*rt.stopped.lock().unwrap(), vec!["long-0"]);
    assert!(rec.events().iter().all(|e| e.kind != EventType::ExecutorExitCode));
}
