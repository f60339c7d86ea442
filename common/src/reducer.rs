use thiserror::Error;

use crate::events::{now, syslog_string, Event, EventType, Payload};
use crate::state::{validate_transition, TransitionError};
use crate::task::{ExecutorLog, State, Task, TaskLog};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReduceError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("event for task {event} applied to task {task}")]
    IdMismatch { task: String, event: String },
    #[error("event type {0} does not match its payload")]
    PayloadMismatch(EventType),
}

/// Aplica un evento sobre la tarea. Si devuelve error la tarea queda intacta.
///
/// `max_log` acota stdout/stderr de cada executor (se conservan los últimos bytes).
pub fn apply(task: &mut Task, ev: &Event, max_log: usize) -> Result<(), ReduceError> {
    if !ev.is_consistent() {
        return Err(ReduceError::PayloadMismatch(ev.kind));
    }
    if ev.kind != EventType::TaskCreated && !task.id.is_empty() && task.id != ev.id {
        return Err(ReduceError::IdMismatch {
            task: task.id.clone(),
            event: ev.id.clone(),
        });
    }

    match &ev.payload {
        Payload::Task(created) => {
            let mut t = (**created).clone();
            t.id = ev.id.clone();
            t.state = State::Queued;
            t.logs.clear();
            if t.creation_time.is_empty() {
                t.creation_time = if ev.timestamp.is_empty() {
                    now()
                } else {
                    ev.timestamp.clone()
                };
            }
            *task = t;
        }
        Payload::State(to) => {
            validate_transition(task.state, *to)?;
            task.state = *to;
        }
        Payload::StartTime(t) if ev.kind == EventType::TaskStartTime => {
            task_log(task, ev.attempt).start_time = t.clone();
        }
        Payload::EndTime(t) if ev.kind == EventType::TaskEndTime => {
            task_log(task, ev.attempt).end_time = t.clone();
        }
        Payload::Outputs(out) => {
            task_log(task, ev.attempt).outputs = out.value.clone();
        }
        Payload::Metadata(md) => {
            let log = task_log(task, ev.attempt);
            for (k, v) in &md.value {
                log.metadata.insert(k.clone(), v.clone());
            }
        }
        Payload::SystemLog(sl) => {
            let line = syslog_string(&ev.timestamp, sl);
            task_log(task, ev.attempt).system_logs.push(line);
        }
        Payload::StartTime(t) => {
            exec_log(task, ev.attempt, ev.index).start_time = t.clone();
        }
        Payload::EndTime(t) => {
            exec_log(task, ev.attempt, ev.index).end_time = t.clone();
        }
        Payload::ExitCode(code) => {
            exec_log(task, ev.attempt, ev.index).exit_code = *code;
        }
        Payload::HostIp(ip) => {
            exec_log(task, ev.attempt, ev.index).host_ip = ip.clone();
        }
        Payload::Ports(p) => {
            exec_log(task, ev.attempt, ev.index).ports = p.value.clone();
        }
        Payload::Stdout(chunk) => {
            append_tail(&mut exec_log(task, ev.attempt, ev.index).stdout, chunk, max_log);
        }
        Payload::Stderr(chunk) => {
            append_tail(&mut exec_log(task, ev.attempt, ev.index).stderr, chunk, max_log);
        }
    }
    Ok(())
}

/// Pliega una secuencia completa de eventos de una tarea.
pub fn fold<'a, I>(events: I, max_log: usize) -> Task
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut task = Task::default();
    for ev in events {
        // eventos inválidos se descartan, como en el store
        let _ = apply(&mut task, ev, max_log);
    }
    task
}

fn task_log(task: &mut Task, attempt: u32) -> &mut TaskLog {
    let i = attempt as usize;
    if task.logs.len() <= i {
        task.logs.resize_with(i + 1, TaskLog::default);
    }
    &mut task.logs[i]
}

fn exec_log(task: &mut Task, attempt: u32, index: u32) -> &mut ExecutorLog {
    let log = task_log(task, attempt);
    let i = index as usize;
    if log.logs.len() <= i {
        log.logs.resize_with(i + 1, ExecutorLog::default);
    }
    &mut log.logs[i]
}

/// Concatena y recorta a `max` bytes guardando el final. Nunca corta un carácter UTF-8.
fn append_tail(tail: &mut String, chunk: &str, max: usize) {
    tail.push_str(chunk);
    if max == 0 || tail.len() <= max {
        return;
    }
    let mut cut = tail.len() - max;
    while !tail.is_char_boundary(cut) {
        cut += 1;
    }
    tail.drain(..cut);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{fields, Level};
    use crate::task::Executor;
    use chrono::Utc;

    fn created() -> Event {
        Event::created(Task {
            id: "t1".into(),
            executors: vec![Executor {
                image: "alpine".into(),
                command: vec!["echo".into()],
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    #[test]
    fn created_sets_queued_and_creation_time() {
        let mut t = Task::default();
        apply(&mut t, &created(), 100).unwrap();
        assert_eq!(t.id, "t1");
        assert_eq!(t.state, State::Queued);
        assert!(!t.creation_time.is_empty());
        assert!(t.logs.is_empty());
    }

    #[test]
    fn invalid_transition_leaves_task_untouched() {
        let mut t = Task::default();
        apply(&mut t, &created(), 100).unwrap();
        let before = t.clone();
        let err = apply(&mut t, &Event::state("t1", State::Complete), 100).unwrap_err();
        assert!(matches!(err, ReduceError::Transition(_)));
        assert_eq!(t, before);
    }

    #[test]
    fn repeated_state_event_is_a_noop() {
        let mut t = Task::default();
        apply(&mut t, &created(), 100).unwrap();
        apply(&mut t, &Event::state("t1", State::Running), 100).unwrap();
        apply(&mut t, &Event::state("t1", State::Running), 100).unwrap();
        assert_eq!(t.state, State::Running);
    }

    #[test]
    fn executor_events_grow_logs_by_attempt_and_index() {
        let mut t = Task::default();
        apply(&mut t, &created(), 100).unwrap();
        apply(&mut t, &Event::exit_code("t1", 1, 2, 3), 100).unwrap();
        assert_eq!(t.logs.len(), 2);
        assert_eq!(t.logs[1].logs.len(), 3);
        assert_eq!(t.logs[1].logs[2].exit_code, 3);
    }

    #[test]
    fn stdout_keeps_latest_bytes() {
        let mut t = Task::default();
        apply(&mut t, &created(), 10).unwrap();
        apply(&mut t, &Event::stdout("t1", 0, 0, "0123456".into()), 10).unwrap();
        apply(&mut t, &Event::stdout("t1", 0, 0, "789abcdef".into()), 10).unwrap();
        let out = &t.logs[0].logs[0].stdout;
        assert_eq!(out.len(), 10);
        assert_eq!(out, "6789abcdef");
    }

    #[test]
    fn metadata_merges_with_event_winning() {
        let mut t = Task::default();
        apply(&mut t, &created(), 10).unwrap();
        apply(&mut t, &Event::metadata("t1", 0, fields([("a", "1"), ("b", "1")])), 10).unwrap();
        apply(&mut t, &Event::metadata("t1", 0, fields([("b", "2")])), 10).unwrap();
        assert_eq!(t.logs[0].metadata["a"], "1");
        assert_eq!(t.logs[0].metadata["b"], "2");
    }

    #[test]
    fn system_log_is_appended_as_string() {
        let mut t = Task::default();
        apply(&mut t, &created(), 10).unwrap();
        let ev = Event::system_log("t1", 0, 0, Level::Info, "download started", fields([("url", "file:///x")]));
        apply(&mut t, &ev, 10).unwrap();
        let line = &t.logs[0].system_logs[0];
        assert!(line.starts_with("level='info' msg='download started'"));
        assert!(line.ends_with("url='file:///x'"));
    }

    #[test]
    fn replay_is_deterministic() {
        let now = Utc::now();
        let events = vec![
            created(),
            Event::state("t1", State::Initializing),
            Event::state("t1", State::Running),
            Event::start_time("t1", 0, now),
            Event::executor_start_time("t1", 0, 0, now),
            Event::stdout("t1", 0, 0, "hello world\n".into()),
            Event::exit_code("t1", 0, 0, 0),
            Event::state("t1", State::Complete),
            Event::state("t1", State::Running),
        ];
        let a = fold(&events, 1024);
        let b = fold(&events, 1024);
        assert_eq!(a, b);
        assert_eq!(a.state, State::Complete);
        assert_eq!(a.logs[0].logs[0].stdout, "hello world\n");
    }

    #[test]
    fn event_for_other_task_is_rejected() {
        let mut t = Task::default();
        apply(&mut t, &created(), 10).unwrap();
        let err = apply(&mut t, &Event::state("t2", State::Running), 10).unwrap_err();
        assert!(matches!(err, ReduceError::IdMismatch { .. }));
    }
}
