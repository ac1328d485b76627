//! Receive and send flows behind the CLI subcommands.

use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dropwire_data_channel::{DataChannelListener, SessionToken, connect};
use dropwire_transfer::progress::{format_eta, format_file_size, format_percentage, format_speed};
use dropwire_transfer::{
    Direction, Peer, ProgressSnapshot, TransferEvent, Transport, save_received_file,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;

/// How long the receiver waits for the sender to hang up after a file.
const HANGUP_GRACE: Duration = Duration::from_secs(5);

/// Waits for one sender and saves what it sends.
pub async fn receive(config: Config, token: Option<String>, keep_open: bool) -> anyhow::Result<()> {
    let cancel = cancel_on_ctrl_c();

    let listener = match token {
        Some(t) => {
            let token: SessionToken = t.parse()?;
            DataChannelListener::bind_with_token(config.receive.listen, token, cancel.clone())
                .await?
        }
        None => DataChannelListener::bind(config.receive.listen, cancel.clone()).await?,
    }
    .with_accept_timeout(config.receive.accept_timeout());

    let channel = listener.info();
    println!("listening on {}", channel.addr);
    println!("token: {}", channel.token);

    let (transport, inbound) = listener.accept().await?;
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let dyn_transport: Arc<dyn Transport> = transport.clone();
    // The runner owns the only peer handle, so the event stream ends when
    // the connection does.
    let peer = Peer::new(dyn_transport, config.transfer.clone(), events_tx)?;
    let mut runner = tokio::spawn(peer.run(inbound));

    let out_dir = &config.receive.out_dir;
    let mut line = ProgressLine::default();
    let mut result: anyhow::Result<()> = Ok(());

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                info!("receive cancelled");
                break;
            }
            event = events.recv() => event,
        };

        match event {
            None => break,
            Some(TransferEvent::Incoming(m)) => {
                info!(file = %m.name, size = %format_file_size(m.size), "receiving");
            }
            Some(TransferEvent::Progress { snapshot, .. }) => line.update(&snapshot),
            Some(TransferEvent::Received(file)) => {
                line.finish();
                let path = save_received_file(out_dir, &file)?;
                println!("saved {}", path.display());
                if !keep_open {
                    break;
                }
            }
            Some(TransferEvent::ReceiveFailed(e)) => {
                line.finish();
                warn!(error = %e, "receive failed");
                if !keep_open {
                    result = Err(e.into());
                    break;
                }
            }
        }
    }

    // The ACK is queued right after delivery; give the sender time to read
    // it and hang up before closing our end.
    if cancel.is_cancelled() {
        transport.close();
        runner.await?;
    } else if tokio::time::timeout(HANGUP_GRACE, &mut runner).await.is_err() {
        transport.close();
        runner.await?;
    }
    result
}

/// Connects to a receiver and sends one file.
pub async fn send(
    config: Config,
    addr: SocketAddr,
    token: &str,
    file: &Path,
    content_type: Option<&str>,
) -> anyhow::Result<()> {
    let cancel = cancel_on_ctrl_c();
    let token: SessionToken = token.parse()?;

    let (transport, inbound) = connect(addr, &token, &cancel).await?;
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let dyn_transport: Arc<dyn Transport> = transport.clone();
    let peer = Peer::new(dyn_transport, config.transfer, events_tx)?;
    let runner = tokio::spawn(Arc::clone(&peer).run(inbound));

    let progress = tokio::spawn(async move {
        let mut line = ProgressLine::default();
        while let Some(event) = events.recv().await {
            if let TransferEvent::Progress {
                direction: Direction::Send,
                snapshot,
            } = event
            {
                line.update(&snapshot);
            }
        }
        line.finish();
    });

    let result = peer.send_path(file, content_type, cancel).await;

    transport.close();
    runner.await?;
    drop(peer);
    progress.await?;

    let report = result?;
    if !report.acknowledged {
        warn!("receiver never confirmed; the file was sent but may not have arrived");
    }
    println!(
        "sent {} ({}) in {:.1}s, {} retransmission round(s)",
        report.metadata.name,
        format_file_size(report.metadata.size),
        report.elapsed.as_secs_f64(),
        report.retransmit_rounds
    );
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SIGINT received, cancelling");
            token.cancel();
        }
    });
    cancel
}

/// Single progress line redrawn in place on stderr.
#[derive(Default)]
struct ProgressLine {
    drawn: bool,
}

impl ProgressLine {
    fn update(&mut self, p: &ProgressSnapshot) {
        let mut err = std::io::stderr().lock();
        let _ = write!(
            err,
            "\r{:>6}  {} / {}  {}  eta {}   ",
            format_percentage(p.percentage),
            format_file_size(p.bytes_transferred),
            format_file_size(p.total_bytes),
            format_speed(p.speed),
            format_eta(p.eta),
        );
        let _ = err.flush();
        self.drawn = true;
    }

    fn finish(&mut self) {
        if self.drawn {
            eprintln!();
            self.drawn = false;
        }
    }
}
