use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use veilchat_client::{
    ClientConfig, Connection, Direction, Message, Session, SessionEvent, SessionHandle,
};
use veilchat_crypto::IdentityManager;

#[derive(Parser)]
#[command(name = "veilchat", about = "End-to-end encrypted chat over an untrusted relay")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay address (host:port), overrides config
    #[arg(short, long)]
    server: Option<String>,

    /// Username to join with, overrides config
    #[arg(short, long)]
    username: Option<String>,
}

enum Input {
    Send { to: String, text: String },
    Read(String),
    History(String),
    Unread,
    Quit,
    Help,
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match cmd {
        "/msg" => {
            let (to, text) = rest.split_once(' ')?;
            let text = text.trim();
            if to.is_empty() || text.is_empty() {
                return None;
            }
            Some(Input::Send {
                to: to.to_string(),
                text: text.to_string(),
            })
        }
        "/read" if !rest.is_empty() => Some(Input::Read(rest.to_string())),
        "/history" if !rest.is_empty() => Some(Input::History(rest.to_string())),
        "/unread" => Some(Input::Unread),
        "/quit" => Some(Input::Quit),
        _ => Some(Input::Help),
    }
}

fn print_history(handle: &SessionHandle, peer: &str) {
    let history = handle.conversations().history(peer);
    if history.is_empty() {
        println!("(no messages with {peer})");
    }
    for message in history {
        print_message(&message);
    }
}

fn print_message(message: &Message) {
    match message.direction {
        Direction::Incoming => println!("[{}] {}: {}", message.timestamp, message.sender, message.body),
        Direction::Outgoing => println!("[{}] -> {}: {}", message.timestamp, message.receiver, message.body),
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::IdentityReady => println!("* identity ready, joining relay"),
        SessionEvent::Joined { peers } if peers.is_empty() => println!("* joined, nobody else online"),
        SessionEvent::Joined { peers } => println!("* joined, online: {}", peers.join(", ")),
        SessionEvent::JoinRejected { reason } => println!("! join rejected: {reason}"),
        SessionEvent::PeerOnline { peer } => println!("* {peer} is online"),
        SessionEvent::PeerOffline { peer } => println!("* {peer} went offline"),
        SessionEvent::SecureChannelReady { peer } => println!("* secure channel with {peer} ready"),
        SessionEvent::KeyExchangeAbandoned { peer, attempts, reason } => {
            println!("! could not establish a secure channel with {peer} after {attempts} attempts: {reason}")
        }
        SessionEvent::MessageReceived { message } => {
            println!("{} (unread, /read {} to mark read)", message.sender, message.sender);
            print_message(message);
        }
        SessionEvent::MessageSent { .. } => {}
        SessionEvent::SendFailed { peer, reason } => println!("! message to {peer} not sent: {reason}"),
        SessionEvent::DecryptFailed { peer, reason } => {
            println!("! message from {peer} could not be decrypted: {reason}")
        }
        SessionEvent::TransportError { description } => println!("! relay: {description}"),
        SessionEvent::Fatal { reason } => println!("! {reason}"),
        SessionEvent::Disconnected => println!("! disconnected from relay"),
        SessionEvent::LoggedOut => println!("* logged out"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "veilchat_client=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = ClientConfig::load(args.config.as_deref()).context("failed to load config")?;

    // CLI overrides
    if let Some(server) = args.server {
        config.server = server;
    }
    if let Some(username) = args.username {
        config.username = Some(username);
    }

    let Some(username) = config.username.clone() else {
        bail!("no username given (use --username or set it in the config file)");
    };

    info!(server = %config.server, username = %username, "veilchat starting");

    let (connection, inbound) = Connection::connect(&config.server)
        .await
        .with_context(|| format!("failed to connect to {}", config.server))?;

    let identity = Arc::new(IdentityManager::new());
    let mut handle = Session::spawn(
        username,
        identity,
        Arc::new(connection),
        inbound,
        &config.exchange,
    );

    println!("commands: /msg <peer> <text>, /read <peer>, /history <peer>, /unread, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    handle.logout().await;
                    return Ok(());
                };
                match parse_input(&line) {
                    Some(Input::Send { to, text }) => handle.send_message(&to, &text).await?,
                    Some(Input::Read(peer)) => {
                        print_history(&handle, &peer);
                        handle.mark_read(&peer).await?;
                    }
                    Some(Input::History(peer)) => print_history(&handle, &peer),
                    Some(Input::Unread) => {
                        let unread = handle.conversations().unread_peers();
                        if unread.is_empty() {
                            println!("(no unread conversations)");
                        } else {
                            println!("unread: {}", unread.join(", "));
                        }
                    }
                    Some(Input::Quit) => {
                        handle.logout().await;
                        return Ok(());
                    }
                    Some(Input::Help) => {
                        println!("commands: /msg <peer> <text>, /read <peer>, /history <peer>, /unread, /quit")
                    }
                    None => {}
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_msg_with_spaces_in_text() {
        match parse_input("/msg bob hello there") {
            Some(Input::Send { to, text }) => {
                assert_eq!(to, "bob");
                assert_eq!(text, "hello there");
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn msg_without_text_is_ignored() {
        assert!(parse_input("/msg bob").is_none());
        assert!(parse_input("/msg bob   ").is_none());
    }

    #[test]
    fn parses_other_commands() {
        assert!(matches!(parse_input("/read bob"), Some(Input::Read(p)) if p == "bob"));
        assert!(matches!(parse_input("/history carol"), Some(Input::History(p)) if p == "carol"));
        assert!(matches!(parse_input("/unread"), Some(Input::Unread)));
        assert!(matches!(parse_input("/quit"), Some(Input::Quit)));
        assert!(matches!(parse_input("/read"), Some(Input::Help)));
        assert!(matches!(parse_input("hello"), Some(Input::Help)));
        assert!(parse_input("   ").is_none());
    }
}
