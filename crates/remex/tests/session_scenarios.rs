//! End-to-end session behavior against the scripted transport

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use remex::{correlation, CorrelationId, OutputChunk, RemexError, Session};
use remex_ssh::mock::{MockTransport, Step};
use remex_ssh::ChannelEvent;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Collected = Arc<Mutex<Vec<OutputChunk>>>;

fn session(transport: &MockTransport, name: &str, buffer: Duration) -> Result<Session> {
    Ok(Session::ssh("ci@runner-1")
        .with_name(name)
        .with_buffer(buffer)
        .with_transport(Arc::new(transport.clone()))
        .build()?)
}

fn collect(session: &mut Session) -> Collected {
    let chunks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&chunks);
    session.on_output(move |chunk| sink.lock().unwrap().push(chunk));
    chunks
}

fn joined(chunks: &Collected) -> String {
    chunks.lock().unwrap().iter().map(|c| c.text().into_owned()).collect()
}

/// A successful command reports its output and a zero status
#[tokio::test]
async fn test_echo_round_trip() -> Result<()> {
    let transport = MockTransport::new();
    transport.respond(&["hello\n"], 0);

    let mut session = session(&transport, "echo", Duration::ZERO)?;
    let chunks = collect(&mut session);

    let status = session.exec("echo hello").await?;
    session.close().await?;

    assert_eq!(status.code(), Some(0));
    assert_eq!(joined(&chunks), "hello\n");
    Ok(())
}

/// A command that exits non-zero is data, not an error
#[tokio::test]
async fn test_non_zero_exit() -> Result<()> {
    let transport = MockTransport::new();
    transport.respond(&[], 7);

    let mut session = session(&transport, "exit", Duration::from_millis(500))?;
    let chunks = collect(&mut session);

    let status = session.exec("exit 7").await?;
    session.close().await?;

    assert_eq!(status.code(), Some(7));
    assert!(chunks.lock().unwrap().is_empty());
    Ok(())
}

/// A refused command start surfaces as an error and produces no output
#[tokio::test]
async fn test_refused_start() -> Result<()> {
    let transport = MockTransport::new();
    transport.refuse_exec("channel request denied");

    let mut session = session(&transport, "refused", Duration::ZERO)?;
    let chunks = collect(&mut session);

    let result = session.exec("uptime").await;

    assert!(matches!(result, Err(RemexError::ExecStart { .. })));
    assert!(chunks.lock().unwrap().is_empty());
    Ok(())
}

/// Uploaded content is appended through a Base64 pipeline
#[tokio::test]
async fn test_upload_payload() -> Result<()> {
    let transport = MockTransport::new();
    let mut session = session(&transport, "upload", Duration::ZERO)?;

    let status = session.upload_file("/tmp/x", b"abc").await?;
    assert!(status.success());

    let commands = transport.commands();
    assert_eq!(commands.len(), 1);
    let payload = commands[0]
        .split_whitespace()
        .skip_while(|word| !word.ends_with("(echo"))
        .nth(1)
        .expect("payload follows echo");
    assert_eq!(STANDARD.decode(payload)?, b"abc");
    assert!(commands[0].ends_with(">> /tmp/x'"));
    Ok(())
}

/// The recorded upload command writes the file when run by a real shell
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_upload_command_runs_in_shell() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let target = dir.path().join("uploaded file.txt");
    let target = target.to_str().expect("utf-8 temp path");

    let transport = MockTransport::new();
    let mut session = Session::ssh("ci@runner-1")
        .with_login_shell("sh")
        .with_transport(Arc::new(transport.clone()))
        .build()?;
    session.upload_file(target, "abc").await?;
    session.upload_file(target, "def\n").await?;

    for command in transport.commands() {
        let status = std::process::Command::new("sh").arg("-c").arg(&command).status()?;
        assert!(status.success(), "`{}` failed", command);
    }

    assert_eq!(std::fs::read_to_string(target)?, "abcdef\n");
    Ok(())
}

/// Only the most recently registered handler receives output
#[tokio::test]
async fn test_handler_replacement() -> Result<()> {
    let transport = MockTransport::new();
    transport.respond(&["x"], 0);

    let mut session = session(&transport, "handlers", Duration::ZERO)?;
    let first = collect(&mut session);
    let second = collect(&mut session);

    session.exec("printf x").await?;

    assert!(first.lock().unwrap().is_empty());
    assert_eq!(joined(&second), "x");
    Ok(())
}

/// Interleaved output with pauses arrives complete and in order
#[tokio::test(start_paused = true)]
async fn test_buffered_stream_preserves_order() -> Result<()> {
    let transport = MockTransport::new();
    let mut steps = Vec::new();
    let mut expected = String::new();
    for i in 0..20 {
        let line = format!("line {}\n", i);
        expected.push_str(&line);
        steps.push(Step::data(&line));
        steps.push(Step::Pause(Duration::from_millis(130)));
    }
    steps.extend([
        Step::Event(ChannelEvent::Eof),
        Step::Event(ChannelEvent::ExitStatus(0)),
        Step::Event(ChannelEvent::Closed),
    ]);
    transport.script(steps);

    let mut session = session(&transport, "stream", Duration::from_millis(500))?;
    let chunks = collect(&mut session);
    session.exec("for i in $(seq 0 19); do echo line $i; sleep 0.13; done").await?;

    let delivered = chunks.lock().unwrap().len();
    assert!(delivered > 1 && delivered < 20, "delivered {} chunks", delivered);
    assert_eq!(joined(&chunks), expected);
    Ok(())
}

/// Sessions driven from separate tasks keep their own attribution
#[tokio::test]
async fn test_concurrent_sessions_keep_attribution() -> Result<()> {
    let mut tasks = Vec::new();
    for job in ["job-a", "job-b"] {
        let transport = MockTransport::new();
        transport.respond(&[job], 0);
        let mut session = session(&transport, job, Duration::ZERO)?;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        correlation::sync_scope(CorrelationId::new(job), || {
            session.on_output(move |chunk| {
                sink.lock().unwrap().push((correlation::current(), chunk.text().into_owned()));
            });
        });

        tasks.push(tokio::spawn(async move {
            session.exec("run").await?;
            session.close().await?;
            Ok::<_, RemexError>(seen)
        }));
    }

    for (task, job) in tasks.into_iter().zip(["job-a", "job-b"]) {
        let seen = task.await??;
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![(Some(CorrelationId::new(job)), job.to_string())]);
    }
    Ok(())
}
