//! Stdin command console: the keyboard half of the handheld UI.

use anyhow::{anyhow, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use alora_core::NodeAddr;

use crate::config::parse_addr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Encrypted when paired, plain otherwise.
    Send { to: NodeAddr, text: String },
    Secure { to: NodeAddr, text: String },
    Pair(NodeAddr),
    Forget(NodeAddr),
    Status,
    Quit,
}

pub const HELP: &str = "/send <addr> <text> | /secure <addr> <text> | /pair <addr> | \
                        /forget <addr> | /status | /quit";

pub fn parse_command(line: &str) -> anyhow::Result<Command> {
    let line = line.trim();
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim_start();
    match verb {
        "/send" | "/secure" => {
            let (addr, text) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow!("usage: {} <addr> <text>", verb))?;
            let to = addr_arg(addr)?;
            let text = text.to_string();
            if verb == "/send" {
                Ok(Command::Send { to, text })
            } else {
                Ok(Command::Secure { to, text })
            }
        }
        "/pair" => Ok(Command::Pair(addr_arg(rest)?)),
        "/forget" => Ok(Command::Forget(addr_arg(rest)?)),
        "/status" => Ok(Command::Status),
        "/quit" => Ok(Command::Quit),
        _ => bail!("unknown command {:?}; {}", verb, HELP),
    }
}

fn addr_arg(s: &str) -> anyhow::Result<NodeAddr> {
    parse_addr(s).ok_or_else(|| anyhow!("bad address {:?}", s.trim()))
}

/// Read stdin line by line and forward parsed commands. EOF acts as /quit.
pub async fn run(tx: mpsc::Sender<Command>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(cmd) => {
                if tx.send(cmd).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => warn!("{}", e),
        }
    }
    let _ = tx.send(Command::Quit).await;
    Ok(())
}
