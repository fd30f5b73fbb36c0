mod blocklist;
mod cache;
mod config;
mod doh;
mod doh_json;
mod engine;
mod metrics;
mod prefetch;
mod proto_utils;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::load_config;
use crate::engine::Engine;
use crate::metrics::Metrics;

#[derive(Parser, Debug)]
#[command(author, version, about = "Caching DNS proxy with a DNS-over-HTTPS upstream", long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    config: PathBuf,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// Number of UDP worker tasks (0 means one per CPU core)
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load config")?;
    debug!(config = ?cfg, "configuration");
    if cfg.pprof_configuration.enabled {
        warn!("pprofConfiguration is accepted but this build has no debug http listener");
    }

    let bind_addr = cfg.listen_address.socket_addr().context("listen address")?;
    let metrics = Arc::new(Metrics::new());
    let engine = Engine::new(&cfg, metrics).context("build proxy engine")?;

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    #[cfg(unix)]
    {
        // One SO_REUSEPORT socket per worker; the kernel spreads the load.
        for worker_id in 0..udp_workers {
            let std_socket = create_reuseport_udp_socket(bind_addr)
                .with_context(|| format!("create udp socket for worker {worker_id}"))?;
            let socket = UdpSocket::from_std(std_socket).context("register udp socket")?;
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, Arc::new(socket), engine).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        let socket = Arc::new(
            UdpSocket::bind(bind_addr)
                .await
                .context("bind udp socket")?,
        );
        for worker_id in 0..udp_workers {
            let engine = engine.clone();
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, socket, engine).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
        }
    }

    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .context("bind tcp listener")?;
    let tcp_engine = engine.clone();
    tokio::spawn(async move {
        if let Err(err) = run_tcp(tcp_listener, tcp_engine).await {
            error!(error = %err, "tcp server exited");
        }
    });

    engine.start_background(&cfg);

    info!(bind = %bind_addr, udp_workers, "dns proxy started");

    await_shutdown_signal().await
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

async fn await_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received, stopping"),
            _ = terminate.recv() => info!("SIGTERM received, stopping"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("install interrupt handler")?;
        info!("interrupt received, stopping");
    }
    Ok(())
}

#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// UDP receive loop. Cache hits and local answers complete inline; queries
/// bound for the upstream are handled in their own task so one slow upstream
/// call never stalls the socket.
async fn run_udp_worker(
    _worker_id: usize,
    socket: Arc<UdpSocket>,
    engine: Engine,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        buf.reserve(4096);
        match socket.recv_buf_from(&mut buf).await {
            Ok((_len, peer)) => {
                let packet = buf.split().freeze();
                match engine.handle_packet_fast(&packet) {
                    Ok(Some(response)) => {
                        if let Err(err) = socket.send_to(&response, peer).await {
                            engine.metrics().increment_write_response_errors();
                            debug!(peer = %peer, error = %err, "udp write failed");
                        }
                    }
                    Ok(None) => {
                        let engine = engine.clone();
                        let socket = Arc::clone(&socket);
                        tokio::spawn(async move {
                            match engine.handle_packet(&packet).await {
                                Ok(response) => {
                                    if let Err(err) = socket.send_to(&response, peer).await {
                                        engine.metrics().increment_write_response_errors();
                                        debug!(peer = %peer, error = %err, "udp write failed");
                                    }
                                }
                                Err(err) => {
                                    debug!(peer = %peer, error = %err, "dropping malformed udp packet");
                                }
                            }
                        });
                    }
                    Err(err) => {
                        debug!(peer = %peer, error = %err, "udp fast path failed");
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "udp recv failed");
                buf.clear();
            }
        }
    }
}

async fn run_tcp(listener: TcpListener, engine: Engine) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_tcp_conn(stream, engine).await {
                debug!(peer = %peer, error = %err, "tcp connection ended");
            }
        });
    }
}

async fn handle_tcp_conn(mut stream: TcpStream, engine: Engine) -> anyhow::Result<()> {
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut frame = vec![0u8; frame_len];
        if stream.read_exact(&mut frame).await.is_err() {
            return Ok(());
        }

        let response = match engine.handle_packet(&frame).await {
            Ok(response) => response,
            Err(_) => return Ok(()),
        };

        if response.len() > u16::MAX as usize {
            continue;
        }
        let frame_header = (response.len() as u16).to_be_bytes();
        if stream.write_all(&frame_header).await.is_err()
            || stream.write_all(&response).await.is_err()
        {
            engine.metrics().increment_write_response_errors();
            return Ok(());
        }
    }
}
