//! CommandRunner against scripted `ssh` and `ssh-agent` programs.

use std::time::{Duration, Instant};

use gerrit_ssh::GerritError;
use gerrit_ssh::core::retry::RetryPolicy;
use gerrit_ssh::core::states::CommandState;
use gerrit_ssh::io::agent::{AgentHandle, AgentSupervisor};
use gerrit_ssh::io::command::{CommandRunner, CommandSpec};
use gerrit_ssh::io::config::TransportConfig;
use gerrit_ssh::test_support::{FakeHost, READY_AGENT, fast_policy, target};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Rig {
    host: FakeHost,
    transport: TransportConfig,
    agent: AgentHandle,
    shutdown: CancellationToken,
}

impl Rig {
    fn new(ssh_body: &str) -> Self {
        let host = FakeHost::new().expect("host");
        let transport = host.transport(READY_AGENT, ssh_body).expect("transport");
        let shutdown = CancellationToken::new();
        let (agent, _task) = AgentSupervisor::start(transport.clone(), shutdown.clone());
        Self {
            host,
            transport,
            agent,
            shutdown,
        }
    }

    fn spec(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new(
            target(),
            self.transport.clone(),
            args.iter().map(|a| a.to_string()).collect(),
        )
    }

    fn runner(&self, args: &[&str], policy: RetryPolicy) -> CommandRunner {
        self.runner_for(self.spec(args), policy)
    }

    fn runner_for(&self, spec: CommandSpec, policy: RetryPolicy) -> CommandRunner {
        CommandRunner::new(spec, self.agent.clone(), policy, self.shutdown.clone())
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Every state the runner enters, with the time it was observed.
fn record_states(runner: &CommandRunner) -> JoinHandle<Vec<(CommandState, Instant)>> {
    let mut states = runner.subscribe();
    tokio::spawn(async move {
        let mut seen = vec![(*states.borrow_and_update(), Instant::now())];
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            seen.push((state, Instant::now()));
            if state.is_terminal() {
                break;
            }
        }
        seen
    })
}

/// How long each visit to `state` lasted.
fn dwell(history: &[(CommandState, Instant)], state: CommandState) -> Vec<Duration> {
    history
        .windows(2)
        .filter(|pair| pair[0].0 == state)
        .map(|pair| pair[1].1 - pair[0].1)
        .collect()
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[tokio::test]
async fn version_output_is_returned() {
    let rig = Rig::new("started\necho 2.14.6\nfinish 0\n");
    let runner = rig.runner(&["version"], fast_policy(5));
    let states = runner.subscribe();

    let output = runner.run().await.expect("version");
    assert_eq!(output.stdout.trim(), "2.14.6");
    assert_eq!(*states.borrow(), CommandState::Finished);
    assert_eq!(rig.host.attempts(), 1);
    assert!(rig.host.leftover_pipes().is_empty());
}

#[tokio::test]
async fn transport_gets_agent_socket_and_trace_pipe() {
    let rig = Rig::new("started\nfinish 0\n");
    rig.runner(&["version"], fast_policy(0))
        .run()
        .await
        .expect("version");

    let sock = rig.host.read("auth_sock").expect("auth_sock");
    assert_eq!(sock.trim(), rig.host.socket_path().display().to_string());
    let argv = rig.host.read("attempts").expect("attempts");
    assert!(argv.contains("-E "), "{argv}");
    assert!(argv.contains("gerrit-ssh.debug."), "{argv}");
    assert!(argv.trim_end().ends_with("ci-bot@review.example.org gerrit version"), "{argv}");
}

#[tokio::test]
async fn remote_failure_is_not_retried() {
    let rig = Rig::new(
        "started\necho 'fatal: \"abc\" no such change' >&2\nfinish 1\n",
    );
    let err = rig
        .runner(&["review", "abc", "--json"], fast_policy(5))
        .run()
        .await
        .expect_err("remote failure");

    assert_eq!(
        err,
        GerritError::RemoteCommandFailure {
            status: 1,
            diagnostics: vec!["fatal: \"abc\" no such change".to_string()],
        }
    );
    assert_eq!(rig.host.attempts(), 1);
    assert!(rig.host.leftover_pipes().is_empty());
}

#[tokio::test]
async fn trace_exit_status_overrides_transport_code() {
    let rig = Rig::new("started\ntrace 'debug1: Exit status 3'\nexit 0\n");
    let err = rig
        .runner(&["query", "--", "status:open"], fast_policy(5))
        .run()
        .await
        .expect_err("remote failure");

    let GerritError::RemoteCommandFailure {
        status,
        diagnostics,
    } = err
    else {
        panic!("expected remote failure, got {err}");
    };
    assert_eq!(status, 3);
    // stderr is empty so the trace tail is used.
    assert_eq!(
        diagnostics.last().map(String::as_str),
        Some("debug1: Exit status 3")
    );
}

#[tokio::test]
async fn pre_start_failures_retry_with_backoff_then_fail() {
    let rig = Rig::new(
        "trace 'debug1: Connecting to review.example.org'\n\
         echo 'ssh: connect to host review.example.org port 29418: Connection refused' >&2\n\
         exit 255\n",
    );
    let policy = RetryPolicy::new(4, ms(40), Duration::from_secs(5)).with_max_delay(ms(100));
    let runner = rig.runner(&["version"], policy);
    let history = record_states(&runner);

    let err = runner.run().await.expect_err("exhausted");
    let history = history.await.expect("history");

    let GerritError::TransportFailure { message } = &err else {
        panic!("expected transport failure, got {err}");
    };
    assert!(message.contains("before the command started"), "{message}");
    assert!(message.contains("Connection refused"), "{message}");
    assert_eq!(rig.host.attempts(), 5);
    assert_eq!(history.last().map(|(state, _)| *state), Some(CommandState::Error));

    // 40, 80, then capped at 100.
    let waits = dwell(&history, CommandState::Retry);
    assert_eq!(waits.len(), 4, "{history:?}");
    for (wait, floor) in waits.iter().zip([40, 80, 100, 100]) {
        assert!(*wait >= ms(floor), "{waits:?}");
    }
    assert!(waits[3] < ms(250), "{waits:?}");
    assert!(rig.host.leftover_pipes().is_empty());
}

#[tokio::test]
async fn startup_timeout_doubles_between_attempts() {
    let rig = Rig::new("exec sleep 30\n");
    let policy = RetryPolicy::new(2, ms(10), ms(60)).with_max_timeout(ms(150));
    let runner = rig.runner(&["version"], policy);
    let history = record_states(&runner);

    runner.run().await.expect_err("timed out");
    let history = history.await.expect("history");

    // 60, 120, then capped at 150.
    let attempts = dwell(&history, CommandState::Spawning);
    assert_eq!(attempts.len(), 3, "{history:?}");
    for (spent, floor) in attempts.iter().zip([60, 120, 150]) {
        assert!(*spent >= ms(floor), "{attempts:?}");
    }
    assert!(attempts[2] < ms(240), "{attempts:?}");
    assert_eq!(rig.host.attempts(), 3);
}

#[tokio::test]
async fn retry_succeeds_once_transport_recovers() {
    let rig = Rig::new(
        "if [ \"$ATTEMPT\" -le 2 ]; then exit 255; fi\nstarted\necho ok\nfinish 0\n",
    );
    let output = rig
        .runner(&["version"], fast_policy(5))
        .run()
        .await
        .expect("third attempt");
    assert_eq!(output.stdout, "ok\n");
    assert_eq!(rig.host.attempts(), 3);
    assert!(rig.host.leftover_pipes().is_empty());
}

#[tokio::test]
async fn startup_timeout_is_retried() {
    let rig = Rig::new("exec sleep 30\n");
    let policy = RetryPolicy::new(1, Duration::from_millis(10), Duration::from_millis(100));
    let err = rig
        .runner(&["version"], policy)
        .run()
        .await
        .expect_err("timed out");

    let GerritError::TransportFailure { message } = &err else {
        panic!("expected transport failure, got {err}");
    };
    assert!(message.contains("timed out"), "{message}");
    assert_eq!(rig.host.attempts(), 2);
    assert!(rig.host.leftover_pipes().is_empty());
}

#[tokio::test]
async fn authentication_failure_is_fatal() {
    let rig = Rig::new("trace 'Permission denied (publickey).'\nexit 255\n");
    let err = rig
        .runner(&["version"], fast_policy(5))
        .run()
        .await
        .expect_err("denied");
    assert_eq!(err, GerritError::AuthenticationFailure);
    assert_eq!(rig.host.attempts(), 1);
    assert!(rig.host.leftover_pipes().is_empty());
}

#[tokio::test]
async fn transport_failure_after_start_is_terminal() {
    let rig = Rig::new(
        "started\nsleep 0.1\necho 'Connection to review.example.org closed by remote host.' >&2\nexit 255\n",
    );
    let err = rig
        .runner(&["review", "1,1", "--json"], fast_policy(5))
        .run()
        .await
        .expect_err("transport died");

    let GerritError::TransportFailure { message } = &err else {
        panic!("expected transport failure, got {err}");
    };
    assert!(message.contains("closed by remote host"), "{message}");
    assert_eq!(rig.host.attempts(), 1);
}

#[tokio::test]
async fn request_body_reaches_stdin() {
    let rig = Rig::new("started\ncat > \"$HOST/body\"\necho accepted\nfinish 0\n");
    let spec = rig
        .spec(&["review", "1234,5", "--json"])
        .with_body(r#"{"message":"lgtm"}"#);
    let output = rig
        .runner_for(spec, fast_policy(0))
        .run()
        .await
        .expect("review");

    assert_eq!(output.stdout.trim(), "accepted");
    assert_eq!(rig.host.read("body").expect("body"), r#"{"message":"lgtm"}"#);
}

#[tokio::test]
async fn body_goes_to_the_attempt_that_starts() {
    let rig = Rig::new(
        "if [ \"$ATTEMPT\" -eq 1 ]; then exit 255; fi\nstarted\ncat > \"$HOST/body\"\nfinish 0\n",
    );
    let spec = rig
        .spec(&["review", "1234,5", "--json"])
        .with_body(r#"{"message":"retried"}"#);
    rig.runner_for(spec, fast_policy(2))
        .run()
        .await
        .expect("review");

    assert_eq!(rig.host.attempts(), 2);
    assert_eq!(rig.host.read("body").expect("body"), r#"{"message":"retried"}"#);
}

#[tokio::test]
async fn stdout_of_attempts_that_never_started_is_not_streamed() {
    let rig = Rig::new(
        "if [ \"$ATTEMPT\" -eq 1 ]; then echo stale; exit 255; fi\nstarted\necho fresh\nfinish 0\n",
    );
    let mut runner = rig.runner(&["version"], fast_policy(2));
    let mut stdout = runner.stdout_lines();

    let output = runner.run().await.expect("second attempt");
    assert_eq!(output.stdout, "fresh\n");
    assert_eq!(stdout.recv().await.as_deref(), Some("fresh"));
    assert_eq!(stdout.recv().await, None);
}

#[tokio::test]
async fn stdout_and_stderr_lines_are_streamed() {
    let rig = Rig::new("started\necho one\necho warn >&2\necho two\nfinish 0\n");
    let mut runner = rig.runner(&["query", "--", "x"], fast_policy(0));
    let mut stdout = runner.stdout_lines();
    let mut stderr = runner.stderr_lines();

    runner.run().await.expect("query");

    assert_eq!(stdout.recv().await.as_deref(), Some("one"));
    assert_eq!(stdout.recv().await.as_deref(), Some("two"));
    assert_eq!(stdout.recv().await, None);
    assert_eq!(stderr.recv().await.as_deref(), Some("warn"));
}

#[tokio::test]
async fn shutdown_stops_a_running_command() {
    let rig = Rig::new("started\nexec sleep 30\n");
    let runner = rig.runner(&["stream-something"], fast_policy(5));
    let mut states = runner.subscribe();
    let run = tokio::spawn(runner.run());

    states
        .wait_for(|s| *s == CommandState::Running)
        .await
        .expect("running");
    rig.shutdown.cancel();

    let err = run.await.expect("join").expect_err("stopped");
    assert_eq!(err, GerritError::Shutdown);
    assert_eq!(*states.borrow(), CommandState::Stopped);
    assert!(rig.host.leftover_pipes().is_empty());
}

#[tokio::test]
async fn agent_failure_is_reported_to_waiting_runner() {
    let host = FakeHost::new().expect("host");
    let transport = host
        .transport("exit 1\n", "started\nfinish 0\n")
        .expect("transport");
    let shutdown = CancellationToken::new();
    let (agent, _task) = AgentSupervisor::start(transport.clone(), shutdown.clone());
    let spec = CommandSpec::new(target(), transport, vec!["version".to_string()]);

    let err = CommandRunner::new(spec, agent, fast_policy(5), shutdown)
        .run()
        .await
        .expect_err("no agent");
    assert!(matches!(err, GerritError::AgentFailure { .. }), "{err}");
    assert_eq!(host.attempts(), 0);
}
