//! Human-readable status dump, logged on SIGUSR1 and optionally on a timer.

use std::fmt::Write as _;
use std::sync::Arc;

use skein_mesh::LocalLink;
use tokio::signal::unix::{signal, SignalKind};

use crate::connection::LocalConnection;
use crate::router::Router;

impl Router {
    pub async fn status(&self) -> String {
        let identity = self.identity();
        let mut out = String::new();
        let _ = writeln!(out, "Our name is {} ({})", identity.name, identity.uid);
        let _ = writeln!(
            out,
            "Encryption {}",
            if identity.psk.is_some() { "on" } else { "off" }
        );
        let _ = writeln!(out, "Sniffing traffic on {:?}", self.config.router.interface);
        let _ = writeln!(out, "Peers:\n{}", self.peers.status());
        let _ = writeln!(out, "Routes:\n{}", self.routes.status());

        let mut conns = self.peers.local_connections();
        conns.sort_by_key(|c| c.remote());
        let _ = writeln!(out, "Local connections ({}):", conns.len());
        for conn in &conns {
            let _ = writeln!(out, "  {}", connection_line(conn));
        }

        let _ = writeln!(out, "Connection maker:\n{}", self.cm.status().await);
        let _ = write!(out, "MACs:\n{}", self.macs.status());
        out
    }
}

fn connection_line(conn: &LocalConnection) -> String {
    let udp = conn
        .remote_udp_addr()
        .map_or_else(|| "-".to_string(), |a| a.to_string());
    let pmtu = conn
        .effective_pmtu()
        .map_or_else(|| "-".to_string(), |p| p.to_string());
    format!(
        "{} tcp={} {} {} udp={} pmtu={}{}",
        conn.remote(),
        conn.remote_tcp_addr(),
        if conn.outbound() { "outbound" } else { "inbound" },
        if conn.established() { "established" } else { "pending" },
        udp,
        pmtu,
        if conn.stack_frag() { " stack-frag" } else { "" },
    )
}

/// Log the status dump whenever SIGUSR1 arrives, and every
/// `status_interval_secs` if that is set.
pub async fn status_loop(router: Arc<Router>) {
    let mut usr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGUSR1");
            None
        }
    };
    let mut interval = router.config.router.status_interval().map(|period| {
        let mut i = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        i.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        i
    });
    let mut shutdown = router.subscribe_shutdown();
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            Some(()) = async {
                match usr1.as_mut() {
                    Some(s) => s.recv().await,
                    None => std::future::pending().await,
                }
            } => {}
            _ = async {
                match interval.as_mut() {
                    Some(i) => { i.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
        tracing::info!("status\n{}", router.status().await);
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;

    use skein_core::config::SkeinConfig;
    use skein_core::name::PeerName;
    use tokio::sync::broadcast;

    use super::*;
    use crate::capture::NullInjector;
    use crate::connection::{Handshake, Identity};

    #[tokio::test]
    async fn status_lists_identity_and_connections() {
        let ourself = PeerName::from_mac([0x02, 0, 0, 0, 0, 1]);
        let remote = PeerName::from_mac([0x02, 0, 0, 0, 0, 2]);
        let (shutdown, _) = broadcast::channel(1);
        let router = Router::new(
            Identity {
                name: ourself,
                uid: 11,
                psk: None,
            },
            SkeinConfig::default(),
            Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap()),
            Arc::new(NullInjector),
            shutdown,
        );
        let hs = Handshake {
            remote_name: remote,
            remote_uid: 22,
            conn_uid: 5,
            version: 1,
            keys: None,
        };
        let (conn, _rx) = LocalConnection::new(ourself, &hs, "10.0.0.2:6783".parse().unwrap(), true);
        router.peers.fetch_with_default(remote, 22).unwrap();
        router.peers.add_local_connection(conn, 0).unwrap();

        let status = router.status().await;
        assert!(status.contains(&format!("Our name is {ourself} (11)")));
        assert!(status.contains("Encryption off"));
        assert!(status.contains("Local connections (1):"));
        assert!(status.contains(&format!("{remote} tcp=10.0.0.2:6783 outbound pending udp=- pmtu=-")));
        router.stop();
    }
}
