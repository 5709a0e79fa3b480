// landrop: LAN file-sharing daemon (discovery, pairing, resumable transfer).

mod config;
mod discovery;
mod engine;
mod events;
mod frames;
mod jobs;
mod receiver;
mod reconnect;
mod sender;
mod session;
#[cfg(test)]
mod testutil;

use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("landrop {} — peer-to-peer LAN file sharing daemon", VERSION);
    println!();
    println!("USAGE:");
    println!("    landrop-daemon [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print this help message and exit");
    println!("    -V, --version    Print version and exit");
    println!();
    println!("DESCRIPTION:");
    println!("    Starts the landrop service: UDP broadcast discovery, trusted");
    println!("    pairing over TCP, and chunked, resumable file transfer with");
    println!("    automatic reconnection when a peer drops or changes address.");
    println!();
    println!("    Sessions    TCP 9527");
    println!("    Discovery   UDP 9528 (broadcast)");
    println!();
    println!("    Received files land in the download directory; transfer state");
    println!("    persists under <download_dir>/.lan_share/.");
    println!();
    println!("    Stop with Ctrl+C or SIGTERM.");
    println!();
    println!("CONFIGURATION:");
    println!("    Config file (optional, first found wins):");
    println!("      ~/.config/landrop/config.toml");
    println!("      /etc/landrop/config.toml");
    println!();
    println!("    Example config.toml:");
    println!("      tcp_port = 9527");
    println!("      udp_port = 9528");
    println!("      chunk_size = 65536");
    println!("      download_dir = \"/home/me/Downloads\"");
    println!();
    println!("ENVIRONMENT VARIABLES (override config file):");
    println!("    LANDROP_TCP_PORT       Session TCP port (default: 9527)");
    println!("    LANDROP_UDP_PORT       Discovery UDP port (default: 9528)");
    println!("    LANDROP_DOWNLOAD_DIR   Download directory");
    println!("    RUST_LOG               Log filter (default: info)");
}

fn main() -> anyhow::Result<()> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("landrop {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                eprintln!("landrop: unknown option '{}'\n", other);
                print_help();
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let engine = engine::Engine::start(cfg).await?;
        let mut events = engine.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                tracing::info!(?event, "event");
            }
        });
        shutdown_signal().await?;
        engine.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
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
