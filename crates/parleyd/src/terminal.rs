//! Line-oriented front end for a peer: reads commands from stdin, prints
//! incoming messages and directory changes.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use parley_core::snapshot::{DirectorySnapshot, Presence};
use parley_services::{PeerEvent, PeerNode, RouteOutcome};

#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Send { to: String, text: String },
    Register(String),
    Deregister(String),
    List,
    Help,
    Quit,
}

/// Parse one command line. `Ok(None)` for a blank line.
pub fn parse_line(line: &str) -> Result<Option<Input>, &'static str> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim_start();

    let input = match verb {
        "send" => {
            let (to, text) = rest
                .split_once(char::is_whitespace)
                .ok_or("usage: send <nickname> <message>")?;
            let text = text.trim_start();
            if text.is_empty() {
                return Err("usage: send <nickname> <message>");
            }
            Input::Send {
                to: to.to_string(),
                text: text.to_string(),
            }
        }
        "reg" if !rest.is_empty() => Input::Register(rest.to_string()),
        "reg" => return Err("usage: reg <nickname>"),
        "dereg" if !rest.is_empty() => Input::Deregister(rest.to_string()),
        "dereg" => return Err("usage: dereg <nickname>"),
        "list" => Input::List,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        _ => return Err("unknown command; try `help`"),
    };
    Ok(Some(input))
}

pub fn announce(text: &str) {
    println!(">>> [{text}]");
}

fn print_help() {
    println!("  send <nickname> <message>   send a chat message");
    println!("  dereg <nickname>            go offline");
    println!("  reg <nickname>              register or come back online");
    println!("  list                        show the directory");
    println!("  quit                        leave");
}

pub fn format_table(snapshot: &DirectorySnapshot) -> String {
    if snapshot.entries.is_empty() {
        return "  (directory is empty)".to_string();
    }
    snapshot
        .entries
        .iter()
        .map(|(nickname, entry)| {
            let presence = match entry.presence {
                Presence::Online => "online",
                Presence::Offline => "offline",
            };
            format!("  {nickname:<16} {:<22} {presence}", entry.endpoint)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Read commands until `quit`, end of input, or shutdown.
pub async fn run(node: PeerNode, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),

            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    return Ok(());
                };
                match parse_line(&line) {
                    Ok(None) => {}
                    Ok(Some(Input::Quit)) => return Ok(()),
                    Ok(Some(input)) => execute(&node, input).await,
                    Err(usage) => announce(usage),
                }
            }
        }
    }
}

async fn execute(node: &PeerNode, input: Input) {
    match input {
        Input::Send { to, text } => match node.send_message(&to, &text).await {
            Ok(RouteOutcome::Delivered) => announce(&format!("Message received by {to}.")),
            Ok(RouteOutcome::Queued) => {
                announce(&format!("{to} is offline, message saved by the server."))
            }
            Err(e) => announce(&e.to_string()),
        },
        Input::Register(nickname) => match node.register(&nickname).await {
            Ok(_) => announce("Welcome, you are registered."),
            Err(e) => announce(&e.to_string()),
        },
        Input::Deregister(nickname) => match node.deregister(&nickname).await {
            Ok(()) => announce("You are offline. Bye."),
            Err(e) => announce(&e.to_string()),
        },
        Input::List => println!("{}", format_table(&node.directory().await)),
        Input::Help => print_help(),
        Input::Quit => {}
    }
}

pub async fn print_events(mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Message { from, text } => println!("{from}: {text}"),
            PeerEvent::DirectoryChanged(snapshot) => {
                announce("Directory updated.");
                println!("{}", format_table(&snapshot));
            }
        }
    }
}
