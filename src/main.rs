//! Headless node binary.
//!
//! Binds the UDP port, prints the bootstrap url, optionally dials a peer,
//! and drains the chat/status sinks to the terminal. Reads chat lines from
//! stdin; anything else rides on the mainline channel.

use clap::Parser;
use partyline::{Node, NodeConfig, StatusPriority};
use tracing::{debug, error, info};

#[derive(Parser)]
#[command(name = "partyline", version, about = "Serverless peer-to-peer chat and file sharing")]
struct Args {
    /// UDP port to bind
    #[arg(short, long, default_value = "3499")]
    port: u16,

    /// External IP address to advertise
    #[arg(short, long, default_value = "127.0.0.1")]
    ip: String,

    /// Base directory to share from (defaults to ~/party-line)
    #[arg(short, long)]
    share: Option<std::path::PathBuf>,

    /// Bootstrap url of a known peer: ip/port/short_id
    #[arg(short, long)]
    bootstrap: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("partyline=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut config = NodeConfig::new(format!("{}:{}", args.ip, args.port), args.port);
    if let Some(share) = args.share {
        config = config.with_shared_dir(share);
    }

    let (node, events) = match Node::start(config).await {
        Ok(started) => started,
        Err(err) => {
            error!("failed to start node: {}", err);
            return;
        }
    };
    let (mut chat_rx, mut status_rx) = (events.chat, events.status);

    println!("{}", node.bootstrap_url());

    if let Some(url) = &args.bootstrap {
        if let Err(err) = node.send_bootstrap(url).await {
            error!("bootstrap failed: {}", err);
        }
    }

    tokio::spawn(async move {
        while let Some(chat) = chat_rx.recv().await {
            let channel = if chat.channel.is_empty() {
                "mainline".to_string()
            } else {
                chat.channel.clone()
            };
            println!("[{}] {}: {}", channel, &chat.id[..12.min(chat.id.len())], chat.message);
        }
    });

    tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            match status.priority {
                StatusPriority::High => info!("{}", status.text),
                StatusPriority::Low => debug!("{}", status.text),
            }
        }
    });

    // Stdin lines go out as mainline chat.
    let chat_node = node.clone();
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let stdin = tokio::io::stdin();
        let mut lines = tokio::io::BufReader::new(stdin);
        let mut line = String::new();
        loop {
            line.clear();
            match lines.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let message = line.trim();
                    if !message.is_empty() {
                        chat_node.send_chat(message).await;
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    node.disconnect_parties().await;
    node.send_disconnect().await;
}
