//! skeind: skein overlay network router.
//!
//! Bridges a local Ethernet interface into a mesh of peers. Frames are
//! captured on the interface, routed over UDP to the peer that owns the
//! destination MAC, and injected there. Topology travels over TCP.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::SockRef;
use tokio::net::TcpListener;

use skein_core::config::SkeinConfig;
use skein_core::crypto::derive_psk;
use skein_core::name::{random_uid, PeerName};

mod capture;
mod connection;
mod forwarder;
mod mac_cache;
mod router;
mod status;
mod udp_sender;

use capture::{interface_mac, Injector, NullInjector, PacketSocket, READ_POLL};
use connection::Identity;
use router::Router;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = SkeinConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = SkeinConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SkeinConfig::default()
    });
    config.router.peers.extend(std::env::args().skip(1));

    let interface = config.router.interface.clone();
    let mac = (!interface.is_empty())
        .then(|| interface_mac(&interface))
        .flatten();
    let name = if !config.router.name.is_empty() {
        config
            .router
            .name
            .parse::<PeerName>()
            .with_context(|| format!("invalid peer name {:?}", config.router.name))?
    } else if let Some(mac) = mac {
        PeerName::from_mac(mac)
    } else {
        PeerName::random()
    };
    let identity = Identity {
        name,
        uid: random_uid(),
        psk: (!config.router.password.is_empty())
            .then(|| derive_psk(config.router.password.as_bytes())),
    };
    tracing::info!(
        %name,
        uid = identity.uid,
        interface,
        port = config.router.port,
        encrypted = identity.psk.is_some(),
        "skeind starting"
    );

    // Sockets
    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.router.port));
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind TCP {bind}"))?;
    let udp = UdpSocket::bind(bind).with_context(|| format!("failed to bind UDP {bind}"))?;
    udp_sender::set_pmtu_discovery(SockRef::from(&udp), libc::IP_PMTUDISC_DONT)
        .context("IP_MTU_DISCOVER on UDP socket")?;
    udp.set_read_timeout(Some(READ_POLL))
        .context("SO_RCVTIMEO on UDP socket")?;
    let udp = Arc::new(udp);

    // Capture
    let capture = if interface.is_empty() {
        tracing::warn!("no interface configured, relaying only");
        None
    } else {
        let socket = PacketSocket::open(&interface, config.router.buf_size_mb)
            .with_context(|| format!("failed to capture on {interface}"))?;
        Some(Arc::new(socket))
    };
    let injector: Arc<dyn Injector> = match &capture {
        Some(socket) => socket.clone() as Arc<dyn Injector>,
        None => Arc::new(NullInjector),
    };

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    let router = Router::new(identity, config, udp, injector, shutdown_tx.clone());
    if let Some(mac) = mac {
        router.macs.enter(mac, name);
    }

    {
        let router = router.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            router.stop();
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let accept_task = tokio::spawn(router.clone().accept_loop(listener));
    let gossip_task = tokio::spawn(router.clone().gossip_loop());
    let expiry_task = tokio::spawn(router.clone().mac_expiry_loop());
    let status_task = tokio::spawn(status::status_loop(router.clone()));

    {
        let router = router.clone();
        std::thread::Builder::new()
            .name("udp-listener".into())
            .spawn(move || router.udp_listener())
            .context("failed to spawn UDP listener")?;
    }
    if let Some(socket) = capture {
        let router = router.clone();
        std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || router.capture_loop(socket.as_ref()))
            .context("failed to spawn capture thread")?;
    }

    let peers = router.config.router.peers.clone();
    for e in router.cm.initiate_connections(peers, false).await {
        tracing::warn!(error = %e, "ignoring peer");
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        biased;
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = accept_task        => tracing::error!("accept loop exited: {:?}", r),
        r = gossip_task        => tracing::error!("gossip loop exited: {:?}", r),
        r = expiry_task        => tracing::error!("MAC expiry exited: {:?}", r),
        r = status_task        => tracing::error!("status loop exited: {:?}", r),
    }
    router.stop();

    Ok(())
}
