// lanchat-linux: interactive LAN chat over stdin/stdout.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use lanchat_core::integrity::to_hex;
use lanchat_core::{ChatState, Direction, InviteState, PeerId, TransferState};
use lanchat_linux::{blob, config, ChatService, Completion, ServeStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const HELP: &str = "\
commands:
  /discover              look for peers on the LAN
  /peers                 list known peers
  /connect <id|ip>       invite a peer
  /accept, /reject       answer an invitation
  /send <path>           offer a file (then /yes to confirm, /cancel to drop)
  /yes, /no              confirm an outgoing offer or answer an incoming one
  /cancel                withdraw an offer not yet streaming
  /end                   end the session
  /quit                  exit
anything else is sent as chat";

fn main() -> anyhow::Result<()> {
    let mut name_override = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("lanchat-linux {}", VERSION);
                return Ok(());
            }
            "--name" => name_override = args.next(),
            other => anyhow::bail!("unknown argument {}", other),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut cfg = config::load();
    if let Some(name) = name_override {
        cfg.display_name = name;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let svc = ChatService::new(PeerId::generate(), &cfg);
        info!(id = %svc.self_id(), name = %cfg.display_name, "starting");
        if let ServeStatus::Unavailable = svc.serve() {
            warn!("not answering discovery; others cannot find this host");
        }
        let on_invite: lanchat_linux::InviteCallback = Arc::new(|peer, name| {
            println!("* invitation from {} ({}); /accept or /reject", name, peer);
        });
        svc.listen(on_invite)
            .await
            .with_context(|| format!("binding session port {}", cfg.session_port))?;
        spawn_watchers(&svc, cfg.download_dir.clone());
        println!("{}", HELP);

        tokio::select! {
            r = repl(svc.clone()) => r?,
            r = shutdown_signal() => r?,
        }
        svc.reset().await;
        Ok::<(), anyhow::Error>(())
    })
}

async fn repl(svc: ChatService) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));
        let arg = arg.trim();
        let outcome = match cmd {
            "/quit" => return Ok(()),
            "/help" => {
                println!("{}", HELP);
                Ok(())
            }
            "/discover" => match svc.discover().await {
                Ok(peers) => {
                    for p in &peers {
                        println!("  {}  {}  {}", p.id, p.display_name, p.ip_address);
                    }
                    println!("* {} peer(s) found", peers.len());
                    Ok(())
                }
                Err(e) => Err(e),
            },
            "/peers" => {
                for p in svc.peers().await {
                    println!("  {}  {}  {}", p.id, p.display_name, p.ip_address);
                }
                Ok(())
            }
            "/connect" => match arg.parse::<IpAddr>() {
                Ok(ip) => svc.connect_ip(ip).await,
                Err(_) => svc.connect(&PeerId::new(arg)).await,
            },
            "/accept" => svc.respond_to_invite(true).await,
            "/reject" => svc.respond_to_invite(false).await,
            "/send" => svc.select_file(arg).await.map(|(name, size)| {
                println!("* offer {} ({} bytes)? /yes or /cancel", name, size);
            }),
            "/yes" | "/no" => {
                let yes = cmd == "/yes";
                match svc.transfer_state() {
                    TransferState::AwaitingLocalConfirmation { .. } if yes => {
                        svc.confirm_transfer().await
                    }
                    TransferState::AwaitingLocalConfirmation { .. } => svc.cancel_transfer().await,
                    _ => svc.respond_to_transfer(yes).await,
                }
            }
            "/cancel" => svc.cancel_transfer().await,
            "/end" => {
                svc.end_session().await;
                Ok(())
            }
            _ => svc.send_text(line).await,
        };
        if let Err(e) = outcome {
            println!("! {}", e);
        }
    }
    Ok(())
}

/// Print incoming chat and state changes; move completed receptions into the download directory.
fn spawn_watchers(svc: &ChatService, download_dir: PathBuf) {
    tokio::spawn(save_completions(svc.subscribe_completions(), download_dir));

    let mut incoming = svc.subscribe_incoming();
    tokio::spawn(async move {
        loop {
            match incoming.recv().await {
                Ok(text) => println!("< {}", text),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{} chat message(s) dropped", n)
                }
                Err(_) => return,
            }
        }
    });

    let mut chat = svc.subscribe_chat_state();
    tokio::spawn(async move {
        while chat.changed().await.is_ok() {
            let state = chat.borrow_and_update().clone();
            match state {
                ChatState::Active { peer_id } => match peer_id {
                    Some(id) => println!("* chatting with {}", id),
                    None => println!("* chatting"),
                },
                ChatState::Ended(reason) => println!("* session ended: {}", reason),
                ChatState::Inactive => {}
            }
        }
    });

    let mut invite = svc.subscribe_invite_state();
    tokio::spawn(async move {
        while invite.changed().await.is_ok() {
            let state = invite.borrow_and_update().clone();
            match state {
                InviteState::Sent { address, .. } => println!("* invitation sent to {}", address),
                InviteState::Rejected => println!("* invitation rejected"),
                InviteState::Failed(msg) => println!("* invitation failed: {}", msg),
                _ => {}
            }
        }
    });

    let mut transfer = svc.subscribe_transfer_state();
    tokio::spawn(async move {
        let mut last_pct = None;
        while transfer.changed().await.is_ok() {
            let state = transfer.borrow_and_update().clone();
            match state {
                TransferState::ReceivingRequest { name, size } => {
                    println!("* peer offers {} ({} bytes); /yes or /no", name, size)
                }
                TransferState::WaitingForRemoteAcceptance { name, .. } => {
                    println!("* waiting for peer to accept {}", name)
                }
                TransferState::Sending { progress, .. } | TransferState::Receiving { progress, .. } => {
                    let pct = (progress * 100.0) as u32 / 10 * 10;
                    if last_pct != Some(pct) {
                        println!("* {}%", pct);
                        last_pct = Some(pct);
                    }
                }
                TransferState::Completed { .. } => last_pct = None,
                TransferState::Error { message } => {
                    last_pct = None;
                    println!("! transfer failed: {}", message)
                }
                _ => {}
            }
        }
    });
}

/// Report finished transfers and move received blobs into the download directory.
async fn save_completions(mut completions: broadcast::Receiver<Completion>, download_dir: PathBuf) {
    loop {
        let done = match completions.recv().await {
            Ok(done) => done,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("{} completion(s) missed; check the temporary directory", n);
                continue;
            }
            Err(_) => return,
        };
        let saved = match (done.direction, &done.location) {
            (Direction::Incoming, Some(temp)) => {
                match blob::persist(temp, &download_dir, &done.name).await {
                    Ok(path) => format!(", saved to {}", path.display()),
                    Err(e) => {
                        warn!("could not save {}: {}", done.name, e);
                        format!(", left at {}", temp.display())
                    }
                }
            }
            _ => String::new(),
        };
        println!(
            "* {} done ({} bytes, sha256 {}){}",
            done.name,
            done.size,
            to_hex(&done.sha256),
            saved
        );
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
