//! Daemon lifecycle over the control socket

use reaction_core::protocol::send_request;
use reaction_core::{CommandRunner, ProcessRunner, RecordingRunner, Request, Response, StatusTree, TimeManager};
use reaction_engine::{Daemon, DaemonConfig, DaemonExit, EngineError, ShutdownCause};
use reaction_rules::{parse_config, ConfigFormat};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

fn config(state: &Path, stream_cmd: &str) -> String {
    format!(
        r#"
state_directory: '{state}'
start:
  - ['start-chain']
stop:
  - ['stop-chain']
patterns:
  ip: {{ regex: '[0-9.]+' }}
streams:
  ssh:
    cmd: {stream_cmd}
    filters:
      failed:
        regex: ['failed from <ip>']
        retry: 2
        retryperiod: 1h
        actions:
          ban: {{ cmd: ['ban', '<ip>'] }}
          unban: {{ cmd: ['unban', '<ip>'], after: 1h }}
          reset: {{ cmd: ['reset', '<ip>'], after: 2h, onexit: true }}
"#,
        state = state.display()
    )
}

struct Running {
    socket: PathBuf,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<DaemonExit, EngineError>>,
}

fn spawn(dir: &Path, stream_cmd: &str, runner: Arc<dyn CommandRunner>) -> Running {
    let registry = Arc::new(parse_config(&config(dir, stream_cmd), ConfigFormat::Yaml).unwrap());
    let socket = dir.join("reaction.sock");
    let daemon = Daemon::new(
        registry,
        DaemonConfig {
            socket: socket.clone(),
        },
        runner,
        TimeManager::real(),
    );
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(daemon.run(async move {
        let _ = stopped.await;
    }));
    Running { socket, stop, task }
}

fn show_all() -> Request {
    Request::Show {
        scope: None,
        pattern: None,
        patterns: BTreeMap::new(),
    }
}

async fn show(socket: &Path) -> StatusTree {
    let request = show_all();
    match send_request(socket, &request).await.unwrap() {
        Response::Status { tree } => tree,
        Response::Error { message } => panic!("show failed: {message}"),
    }
}

/// Poll the daemon until `check` accepts its state
async fn wait_for(socket: &Path, check: impl Fn(&StatusTree) -> bool) -> StatusTree {
    for _ in 0..200 {
        if socket.exists() {
            if let Ok(Response::Status { tree }) = send_request(socket, &show_all()).await {
                if check(&tree) {
                    return tree;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("daemon never reached the expected state");
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_trigger_show_flush_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new());
    let daemon = spawn(
        dir.path(),
        r#"['sh', '-c', 'echo "failed from 1.2.3.4"; echo "failed from 1.2.3.4"; echo "failed from 5.6.7.8"; exec sleep 30']"#,
        runner.clone(),
    );

    let tree = wait_for(&daemon.socket, |tree| {
        tree.get("ssh")
            .and_then(|f| f.get("failed"))
            .is_some_and(|m| m.len() == 2)
    })
    .await;
    let failed = &tree["ssh"]["failed"];
    assert_eq!(failed["5.6.7.8"].matches, 1);
    assert!(failed["1.2.3.4"].actions.contains_key("unban"));
    assert!(failed["1.2.3.4"].actions.contains_key("reset"));

    let flushed = send_request(
        &daemon.socket,
        &Request::Flush {
            target: vec!["1.2.3.4".into()],
            scope: None,
        },
    )
    .await
    .unwrap();
    let Response::Status { tree } = flushed else {
        panic!("flush failed: {flushed:?}");
    };
    assert_eq!(tree["ssh"]["failed"].len(), 1);

    let left = show(&daemon.socket).await;
    assert!(!left["ssh"]["failed"].contains_key("1.2.3.4"));

    daemon.stop.send(()).unwrap();
    let exit = daemon.task.await.unwrap().unwrap();
    assert_eq!(exit.cause, ShutdownCause::Requested);
    assert!(exit.success());
    assert!(!daemon.socket.exists());

    let runs = runner.runs().await;
    assert_eq!(runs.first(), Some(&argv(&["start-chain"])));
    assert_eq!(runs.last(), Some(&argv(&["stop-chain"])));
    for expected in [["ban", "1.2.3.4"], ["unban", "1.2.3.4"], ["reset", "1.2.3.4"]] {
        assert!(runs.contains(&argv(&expected)), "missing {expected:?}");
    }
    // nothing was pending anymore at shutdown
    assert_eq!(runs.iter().filter(|r| r[0] == "reset").count(), 1);
}

#[tokio::test]
async fn test_onexit_actions_run_at_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new());
    let daemon = spawn(
        dir.path(),
        r#"['sh', '-c', 'echo "failed from 1.2.3.4"; echo "failed from 1.2.3.4"; exec sleep 30']"#,
        runner.clone(),
    );
    wait_for(&daemon.socket, |tree| !tree.is_empty()).await;

    daemon.stop.send(()).unwrap();
    assert!(daemon.task.await.unwrap().unwrap().success());

    let runs = runner.runs().await;
    assert!(runs.contains(&argv(&["reset", "1.2.3.4"])));
    assert!(!runs.contains(&argv(&["unban", "1.2.3.4"])));
}

#[tokio::test]
async fn test_ended_streams_stop_the_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(RecordingRunner::new());
    let daemon = spawn(dir.path(), "['true']", runner.clone());

    let exit = tokio::time::timeout(Duration::from_secs(10), daemon.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(exit.cause, ShutdownCause::StreamsEnded);
    assert!(!exit.success());
    assert_eq!(runner.runs().await.last(), Some(&argv(&["stop-chain"])));
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let first = spawn(
        dir.path(),
        r#"['sh', '-c', 'echo "failed from 1.2.3.4"; echo "failed from 9.9.9.9"; exec sleep 30']"#,
        Arc::new(RecordingRunner::new()),
    );
    wait_for(&first.socket, |tree| {
        tree.get("ssh")
            .and_then(|f| f.get("failed"))
            .is_some_and(|m| m.contains_key("1.2.3.4") && m.contains_key("9.9.9.9"))
    })
    .await;
    first.stop.send(()).unwrap();
    first.task.await.unwrap().unwrap();

    // one more failure from 1.2.3.4 is enough after the restart
    let runner = Arc::new(RecordingRunner::new());
    let second = spawn(
        dir.path(),
        r#"['sh', '-c', 'echo "failed from 1.2.3.4"; exec sleep 30']"#,
        runner.clone(),
    );
    let tree = wait_for(&second.socket, |tree| {
        tree.get("ssh")
            .and_then(|f| f.get("failed"))
            .and_then(|m| m.get("1.2.3.4"))
            .is_some_and(|s| s.actions.contains_key("unban"))
    })
    .await;
    assert_eq!(tree["ssh"]["failed"]["9.9.9.9"].matches, 1);

    second.stop.send(()).unwrap();
    second.task.await.unwrap().unwrap();
    assert!(runner.runs().await.contains(&argv(&["ban", "1.2.3.4"])));
}

#[tokio::test]
async fn test_failed_start_command_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("stopped");
    let conf = format!(
        r#"
state_directory: '{state}'
start:
  - ['false']
stop:
  - ['touch', '{marker}']
patterns:
  ip: {{ regex: '[0-9.]+' }}
streams:
  ssh:
    cmd: ['sleep', '30']
    filters:
      failed:
        regex: ['failed from <ip>']
        actions:
          ban: {{ cmd: ['true'] }}
"#,
        state = dir.path().display(),
        marker = marker.display()
    );
    let registry = Arc::new(parse_config(&conf, ConfigFormat::Yaml).unwrap());
    let socket = dir.path().join("reaction.sock");
    let daemon = Daemon::new(
        registry,
        DaemonConfig {
            socket: socket.clone(),
        },
        Arc::new(ProcessRunner::new(0)),
        TimeManager::real(),
    );
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(daemon.run(async move {
        let _ = stopped.await;
    }));

    assert!(wait_for(&socket, |_| true).await.is_empty());
    assert!(!marker.exists());

    stop.send(()).unwrap();
    assert!(task.await.unwrap().unwrap().success());
    assert!(marker.exists());
}

#[tokio::test]
async fn test_socket_failure_shuts_down_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    // the socket's parent directory cannot be created over a regular file
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();

    let runner = Arc::new(RecordingRunner::new());
    let registry = Arc::new(parse_config(&config(dir.path(), "['sleep', '30']"), ConfigFormat::Yaml).unwrap());
    let daemon = Daemon::new(
        registry,
        DaemonConfig {
            socket: blocker.join("reaction.sock"),
        },
        runner.clone(),
        TimeManager::real(),
    );

    let result = tokio::time::timeout(Duration::from_secs(10), daemon.run(std::future::pending()))
        .await
        .unwrap();
    assert!(matches!(result, Err(EngineError::Socket { .. })));
    assert_eq!(runner.runs().await, [argv(&["start-chain"]), argv(&["stop-chain"])]);

    // the state written before the failure is usable by the next start
    let daemon = spawn(dir.path(), "['sleep', '30']", Arc::new(RecordingRunner::new()));
    assert!(wait_for(&daemon.socket, |_| true).await.is_empty());
    daemon.stop.send(()).unwrap();
    assert!(daemon.task.await.unwrap().unwrap().success());
}

#[tokio::test]
async fn test_bad_request_answered_with_error() {
    use reaction_core::protocol::{read_message, write_message};
    use tokio::net::UnixStream;

    let dir = tempfile::tempdir().unwrap();
    let daemon = spawn(dir.path(), "['sleep', '30']", Arc::new(RecordingRunner::new()));
    wait_for(&daemon.socket, |_| true).await;

    let response = send_request(
        &daemon.socket,
        &Request::Show {
            scope: None,
            pattern: Some("(".into()),
            patterns: BTreeMap::new(),
        },
    )
    .await
    .unwrap();
    assert!(matches!(response, Response::Error { .. }));

    let mut stream = UnixStream::connect(&daemon.socket).await.unwrap();
    write_message(&mut stream, &serde_json::json!({"request": "reboot"})).await.unwrap();
    let response: Response = read_message(&mut stream).await.unwrap();
    assert!(matches!(response, Response::Error { .. }));

    // the daemon is unaffected
    assert!(show(&daemon.socket).await.is_empty());
    daemon.stop.send(()).unwrap();
    assert!(daemon.task.await.unwrap().unwrap().success());
}
