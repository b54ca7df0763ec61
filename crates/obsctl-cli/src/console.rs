use anyhow::{anyhow, bail, Context, Result};
use obsctl_core::{Command, ObservationController, TransportAdapter};
use serde_json::{json, Value};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::print_status;
use crate::OutputFormat;

pub const HELP: &str = "\
commands:
  assign [json]         AssignResources
  release               ReleaseAllResources
  configure [json]      Configure
  scan <secs> [json]    Scan for <secs> seconds, then EndScan
  endscan               EndScan
  abort                 Abort
  reset                 ObsReset
  restart               Restart
  status                print current status
  quit                  leave the console";

#[derive(Debug, PartialEq)]
pub enum ConsoleInput {
    Submit(Command),
    Status,
    Help,
    Quit,
    Empty,
}

/// Parses one console line. Payloads are optional JSON and default to `{}`.
pub fn parse_line(line: &str) -> Result<ConsoleInput> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ConsoleInput::Empty);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let input = match word.to_ascii_lowercase().as_str() {
        "assign" => ConsoleInput::Submit(Command::AssignResources {
            resources: payload(rest)?,
        }),
        "release" => ConsoleInput::Submit(Command::ReleaseAllResources),
        "configure" => ConsoleInput::Submit(Command::Configure {
            configuration: payload(rest)?,
        }),
        "scan" => {
            let (secs, rest) = match rest.split_once(char::is_whitespace) {
                Some((secs, rest)) => (secs, rest.trim()),
                None => (rest, ""),
            };
            if secs.is_empty() {
                bail!("scan needs a duration in seconds");
            }
            let duration_secs: f64 = secs
                .parse()
                .with_context(|| format!("invalid scan duration {secs:?}"))?;
            ConsoleInput::Submit(Command::Scan {
                scan: payload(rest)?,
                duration_secs,
            })
        }
        "endscan" | "end" => ConsoleInput::Submit(Command::EndScan),
        "abort" => ConsoleInput::Submit(Command::Abort),
        "reset" | "obsreset" => ConsoleInput::Submit(Command::ObsReset),
        "restart" => ConsoleInput::Submit(Command::Restart),
        "status" => ConsoleInput::Status,
        "help" | "?" => ConsoleInput::Help,
        "quit" | "exit" => ConsoleInput::Quit,
        other => return Err(anyhow!("unknown command {other:?}, try 'help'")),
    };
    Ok(input)
}

fn payload(raw: &str) -> Result<Value> {
    if raw.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).with_context(|| format!("payload is not valid JSON: {raw}"))
}

/// Reads commands from stdin and echoes every new activity message.
pub async fn run_console<T: TransportAdapter>(controller: &ObservationController<T>) -> Result<()> {
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut changes = controller.changes();
    let mut last_seen = controller.last_activity();

    println!("{HELP}");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = controller.last_activity();
                if latest != last_seen {
                    if let Some(message) = &latest {
                        println!("> {message}");
                    }
                    last_seen = latest;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    break;
                };
                match parse_line(&line) {
                    Ok(ConsoleInput::Submit(command)) => match controller.submit(command) {
                        Ok(ack) => println!(
                            "accepted: {} #{} {} -> {} on {} subordinate(s)",
                            ack.command, ack.operation, ack.from, ack.provisional, ack.targets
                        ),
                        Err(err) => println!("rejected: {err}"),
                    },
                    Ok(ConsoleInput::Status) => print_status(&controller.status(), OutputFormat::Human)?,
                    Ok(ConsoleInput::Help) => println!("{HELP}"),
                    Ok(ConsoleInput::Quit) => break,
                    Ok(ConsoleInput::Empty) => {}
                    Err(err) => println!("error: {err:#}"),
                }
            }
        }
    }

    Ok(())
}
