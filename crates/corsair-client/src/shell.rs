//! Line-oriented operator shell.
//!
//! User-facing output uses writeln! to the given writer (this is a CLI front
//! end, not debug output). Asynchronous results reach the terminal through
//! the printer task, which follows the console log and the active session's
//! log.

use std::io::{self, Write};
use std::sync::Arc;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use corsair_proto::v1::Task;

use crate::bridge::{AdaptationError, Invocation, ParamKind, split_command_line};
use crate::client::Client;
use crate::events::{EventCondition, hook};
use crate::session::{LogLine, SessionLog};

const HELP: &str = "\
Commands:
  sessions             list known sessions
  use <session-id>     select the active session
  info                 show the active session
  functions            list registered functions
  cancel <task-id>     cancel a task on the active session
  watch <regex>        print events whose message matches
  reconnect            re-open the event stream and reload sessions
  help                 show this text
  exit                 leave the shell
Anything else runs a function on the active session, e.g. `download /etc/hosts`.";

/// One parsed shell line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Empty,
    Help,
    Sessions,
    Use(String),
    Info,
    Functions,
    Cancel(u32),
    Watch(String),
    Reconnect,
    Exit,
    Invoke { name: String, words: Vec<String> },
}

impl ShellCommand {
    pub fn parse(line: &str) -> Result<Self, AdaptationError> {
        let mut words = split_command_line(line)?.into_iter();
        let Some(head) = words.next() else {
            return Ok(Self::Empty);
        };
        let rest: Vec<String> = words.collect();
        let command = match head.as_str() {
            "help" | "?" => Self::Help,
            "sessions" => Self::Sessions,
            "use" => Self::Use(single("use", rest)?),
            "info" => Self::Info,
            "functions" => Self::Functions,
            "cancel" => {
                let raw = single("cancel", rest)?;
                let task_id = raw.parse().map_err(|_| AdaptationError::Type {
                    function: "cancel".into(),
                    param: "task_id".into(),
                    kind: ParamKind::Int,
                    value: raw.clone(),
                })?;
                Self::Cancel(task_id)
            }
            "watch" => Self::Watch(single("watch", rest)?),
            "reconnect" => Self::Reconnect,
            "exit" | "quit" => Self::Exit,
            _ => Self::Invoke {
                name: head,
                words: rest,
            },
        };
        Ok(command)
    }
}

fn single(command: &str, words: Vec<String>) -> Result<String, AdaptationError> {
    let got = words.len();
    let mut words = words.into_iter();
    match (words.next(), got) {
        (Some(word), 1) => Ok(word),
        _ => Err(AdaptationError::Arity {
            function: command.into(),
            expected: "1".into(),
            got,
        }),
    }
}

/// Whether the REPL keeps reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Shell {
    client: Arc<Client>,
}

impl Shell {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    /// Read commands from stdin until `exit` or EOF.
    pub async fn run(&self) -> anyhow::Result<()> {
        let printer = spawn_printer(&self.client, io::stdout());
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut out = io::stdout();

        write!(out, "corsair> ")?;
        out.flush()?;
        while let Some(line) = lines.next_line().await? {
            match self.execute_line(&line, &mut out).await {
                Ok(Flow::Exit) => break,
                Ok(Flow::Continue) => {}
                Err(e) => writeln!(out, "error: {e}")?,
            }
            write!(out, "corsair> ")?;
            out.flush()?;
        }
        printer.abort();
        Ok(())
    }

    /// Parse and run one line.
    pub async fn execute_line(&self, line: &str, out: &mut impl Write) -> anyhow::Result<Flow> {
        let command = ShellCommand::parse(line)?;
        self.execute(command, out).await
    }

    pub async fn execute(
        &self,
        command: ShellCommand,
        out: &mut impl Write,
    ) -> anyhow::Result<Flow> {
        let client = &self.client;
        match command {
            ShellCommand::Empty => {}
            ShellCommand::Help => writeln!(out, "{HELP}")?,
            ShellCommand::Sessions => {
                let sessions = client.sessions().all().await;
                if sessions.is_empty() {
                    writeln!(out, "No sessions.")?;
                } else {
                    writeln!(
                        out,
                        "{:<12} {:<16} {:<20} {:<8} GROUP",
                        "ID", "NAME", "USER@HOST", "STATE"
                    )?;
                    for session in sessions {
                        writeln!(out, "{}", session.summary().await)?;
                    }
                }
            }
            ShellCommand::Use(id) => {
                let session = client.sessions().get_or_fetch(&id).await?;
                client.sessions().set_active(session).await;
                writeln!(out, "Active session: {id}")?;
            }
            ShellCommand::Info => {
                let Some(session) = client.sessions().active().await else {
                    writeln!(out, "No active session.")?;
                    return Ok(Flow::Continue);
                };
                let info = session.snapshot().await;
                writeln!(out, "Session:  {}", info.session_id)?;
                writeln!(out, "Name:     {}", info.name)?;
                writeln!(out, "Alive:    {}", info.is_alive)?;
                writeln!(out, "Host:     {} ({}/{})", info.hostname, info.os, info.arch)?;
                writeln!(out, "User:     {}", info.username)?;
                writeln!(out, "Pid:      {}", info.pid)?;
                writeln!(out, "Modules:  {}", info.modules.join(", "))?;
                if !info.note.is_empty() {
                    writeln!(out, "Note:     {}", info.note)?;
                }
            }
            ShellCommand::Functions => {
                for function in client.functions().functions() {
                    writeln!(out, "{:<40} {}", function.usage(), function.summary)?;
                }
            }
            ShellCommand::Cancel(task_id) => {
                let Some(session) = client.sessions().active().await else {
                    return Err(crate::error::ClientError::NoActiveSession.into());
                };
                let task = Task {
                    task_id,
                    session_id: session.id().to_string(),
                    ..Default::default()
                };
                client.dispatcher().cancel(&task).await?;
                writeln!(out, "Cancel requested for task {task_id}")?;
            }
            ShellCommand::Watch(pattern) => {
                let condition = EventCondition::message_matches(Regex::new(&pattern)?);
                let console = client.console().clone();
                client
                    .hooks()
                    .register(
                        &condition,
                        hook(move |event| {
                            let console = console.clone();
                            async move {
                                console.info(format!("[watch] [{}] {}", event.kind, event.message));
                                anyhow::Ok(())
                            }
                        }),
                    )
                    .await;
                writeln!(out, "Watching {}", condition.label())?;
            }
            ShellCommand::Reconnect => {
                let count = client.start().await?;
                writeln!(out, "Reconnected ({count} sessions)")?;
            }
            ShellCommand::Exit => return Ok(Flow::Exit),
            ShellCommand::Invoke { name, words } => {
                let task = client
                    .bridge()
                    .invoke(&name, Invocation::Cli(words), None)
                    .await?;
                writeln!(out, "Task {} ({}) submitted", task.task_id, task.r#type)?;
            }
        }
        Ok(Flow::Continue)
    }
}

/// Print console lines and the active session's lines as they arrive.
pub fn spawn_printer<W>(client: &Client, mut out: W) -> JoinHandle<()>
where
    W: Write + Send + 'static,
{
    let mut sink = client.sessions().watch_active_sink();
    let mut console = client.console().subscribe();
    let root = client.root().clone();
    tokio::spawn(async move {
        let mut active = sink.borrow_and_update().as_ref().map(SessionLog::subscribe);
        loop {
            let line = tokio::select! {
                () = root.cancelled() => return,
                changed = sink.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    active = sink.borrow_and_update().as_ref().map(SessionLog::subscribe);
                    continue;
                }
                line = console.recv() => line,
                line = recv_active(&mut active) => line,
            };
            match line {
                Ok(line) => {
                    if writeln!(out, "{line}").and_then(|()| out.flush()).is_err() {
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Printer fell behind"),
                Err(RecvError::Closed) => debug!("Log closed"),
            }
        }
    })
}

async fn recv_active(
    active: &mut Option<broadcast::Receiver<LogLine>>,
) -> Result<LogLine, RecvError> {
    match active {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::events::Event;
    use crate::tests::harness::{Fixture, event_message};

    #[test]
    fn parses_builtins_and_invocations() {
        assert_eq!(ShellCommand::parse("  ").unwrap(), ShellCommand::Empty);
        assert_eq!(
            ShellCommand::parse("use S1").unwrap(),
            ShellCommand::Use("S1".into())
        );
        assert_eq!(
            ShellCommand::parse("cancel 12").unwrap(),
            ShellCommand::Cancel(12)
        );
        assert_eq!(
            ShellCommand::parse(r#"exec /bin/sh -c "id -a""#).unwrap(),
            ShellCommand::Invoke {
                name: "exec".into(),
                words: vec!["/bin/sh".into(), "-c".into(), "id -a".into()],
            }
        );
    }

    #[test]
    fn malformed_builtins_are_rejected() {
        assert!(matches!(
            ShellCommand::parse("use"),
            Err(AdaptationError::Arity { got: 0, .. })
        ));
        assert!(matches!(
            ShellCommand::parse("cancel soon"),
            Err(AdaptationError::Type { .. })
        ));
        assert_eq!(
            ShellCommand::parse("echo \"open").unwrap_err(),
            AdaptationError::UnterminatedQuote
        );
    }

    #[tokio::test]
    async fn use_then_invoke_submits_on_active_session() {
        let fx = Fixture::new().await;
        fx.session("S1").await;
        let shell = Shell::new(Arc::clone(&fx.client));
        let mut out = Vec::new();

        shell.execute_line("use S1", &mut out).await.unwrap();
        shell.execute_line("get /etc/hosts", &mut out).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Active session: S1"));
        assert!(text.contains("Task 1 (download) submitted"));
        assert_eq!(fx.rpc.executed()[0].session_id, "S1");
    }

    #[tokio::test]
    async fn cancel_targets_active_session() {
        let fx = Fixture::new().await;
        fx.activate("S1").await;
        let shell = Shell::new(Arc::clone(&fx.client));
        let mut out = Vec::new();
        shell.execute_line("cancel 4", &mut out).await.unwrap();
        assert_eq!(fx.rpc.calls().cancel_task, 1);
    }

    #[tokio::test]
    async fn exit_stops_the_loop() {
        let fx = Fixture::new().await;
        let shell = Shell::new(Arc::clone(&fx.client));
        let flow = shell.execute_line("exit", &mut Vec::new()).await.unwrap();
        assert_eq!(flow, Flow::Exit);
    }

    #[tokio::test]
    async fn watch_prints_matching_events_to_console() {
        let fx = Fixture::new().await;
        let shell = Shell::new(Arc::clone(&fx.client));
        shell
            .execute_line("watch ^alert", &mut Vec::new())
            .await
            .unwrap();

        fx.consumer
            .handle_event(Event::from(event_message("broadcast", "", "alert: edr")))
            .await;
        fx.hooks.wait_idle().await;
        assert!(
            fx.console
                .lines()
                .iter()
                .any(|l| l.text == "[watch] [broadcast] alert: edr")
        );
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn printer_follows_the_active_session() {
        let fx = Fixture::new().await;
        let buf = SharedBuf::default();
        let printer = spawn_printer(&fx.client, buf.clone());

        let s1 = fx.activate("S1").await;
        // Let the printer pick up the new sink before writing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        s1.log().info("task 1 (ping) finished");
        fx.console.info("hello");

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
                if text.contains("[S1] task 1 (ping) finished")
                    && text.contains("[console] hello")
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        printer.abort();
    }
}
