//! Forwarder pipelines: batch frames for one connection into UDP packets.
//!
//! Each connection runs two pipelines: one whose packets carry DF (and so
//! discovers the path MTU) and one that lets the IP layer fragment. A
//! pipeline is a task reading a bounded channel; it packs as many frames
//! as fit into one encryptor payload and sends when the next frame would
//! overflow or the channel runs dry.
//!
//! PMTU discovery (DF pipeline only): a `MsgTooBig` from the sender
//! lowers the path MTU, to the reported value or by a fixed decrement,
//! and sends a verification frame sized to the new effective PMTU. The
//! peer acknowledges its arrival over TCP. Unacknowledged verifications
//! are retried with a doubling timeout and eventually lower the PMTU
//! again. The descent stops at `MIN_PMTU`.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use skein_core::config::PmtuConfig;
use skein_core::crypto::Encryptor;
use skein_core::ethernet::FrameError;
use skein_core::name::PeerName;
use skein_core::wire::{CHANNEL_SIZE, DEFAULT_PMTU, ETHERNET_OVERHEAD, MIN_PMTU, UDP_OVERHEAD};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::udp_sender::{SendError, UdpSender};

pub struct ForwardedFrame {
    pub src: PeerName,
    pub dst: PeerName,
    pub frame: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("frame too big (effective pmtu {effective_pmtu})")]
    FrameTooBig { effective_pmtu: usize },

    #[error("forwarder stopped")]
    Closed,

    #[error(transparent)]
    Fragment(#[from] FrameError),
}

#[derive(Debug, Clone)]
pub struct PmtuSettings {
    pub pmtu: usize,
    pub decrement: usize,
    pub verify_timeout: Duration,
    pub verify_attempts: u32,
}

impl From<&PmtuConfig> for PmtuSettings {
    fn from(config: &PmtuConfig) -> Self {
        Self {
            pmtu: config.default_pmtu.clamp(MIN_PMTU, DEFAULT_PMTU),
            decrement: config.decrement.max(1),
            verify_timeout: config.verify_timeout(),
            verify_attempts: config.verify_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PmtuCell {
    effective: usize,
    verified: bool,
}

// ── Handle ────────────────────────────────────────────────────────────────────

pub struct Forwarder {
    tx: mpsc::Sender<ForwardedFrame>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    pmtu: Arc<RwLock<PmtuCell>>,
}

impl Forwarder {
    /// Start a pipeline. Only the DF pipeline (`df == true`) adapts its
    /// PMTU; the other stays at `settings.pmtu`.
    pub fn spawn(
        ourself: PeerName,
        remote: PeerName,
        df: bool,
        settings: PmtuSettings,
        encryptor: Box<dyn Encryptor>,
        sender: Arc<dyn UdpSender>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
        let (stop_tx, stop_rx) = oneshot::channel();
        let pmtu = settings.pmtu;
        let cell = Arc::new(RwLock::new(PmtuCell {
            effective: effective_pmtu(pmtu, encryptor.as_ref()),
            verified: false,
        }));
        let span = tracing::info_span!("forwarder", peer = %remote, df);
        let pipeline = Pipeline {
            ourself,
            remote,
            rx,
            stop_rx,
            encryptor,
            sender,
            cell: cell.clone(),
            pmtu,
            discovery: df.then(|| Discovery {
                attempts_left: settings.verify_attempts,
                timeout: settings.verify_timeout,
                deadline: None,
                settings,
            }),
        };
        let task = tokio::spawn(pipeline.run().instrument(span));
        Self {
            tx,
            stop: Mutex::new(Some(stop_tx)),
            task: Mutex::new(Some(task)),
            pmtu: cell,
        }
    }

    fn cell(&self) -> PmtuCell {
        *self.pmtu.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Largest Ethernet payload a single frame may carry.
    pub fn effective_pmtu(&self) -> usize {
        self.cell().effective
    }

    pub fn is_verified(&self) -> bool {
        self.cell().verified
    }

    /// The peer received a verification frame of `len` bytes past the
    /// Ethernet header. Returns whether it confirmed the current PMTU.
    pub fn pmtu_verified(&self, len: usize) -> bool {
        let mut cell = self.pmtu.write().unwrap_or_else(PoisonError::into_inner);
        if len == cell.effective {
            cell.verified = true;
            return true;
        }
        false
    }

    /// Queue a frame from a data-plane thread, blocking while the channel
    /// is full. Must not be called from async code.
    pub fn blocking_forward(&self, frame: ForwardedFrame) -> Result<(), ForwardError> {
        self.tx.blocking_send(frame).map_err(|_| ForwardError::Closed)
    }

    pub async fn forward(&self, frame: ForwardedFrame) -> Result<(), ForwardError> {
        self.tx.send(frame).await.map_err(|_| ForwardError::Closed)
    }

    /// Stop the pipeline after it has sent everything already queued.
    pub async fn stop(&self) {
        let stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn effective_pmtu(pmtu: usize, encryptor: &dyn Encryptor) -> usize {
    pmtu.saturating_sub(
        UDP_OVERHEAD + encryptor.packet_overhead() + encryptor.frame_overhead() + ETHERNET_OVERHEAD,
    )
}

// ── Pipeline task ─────────────────────────────────────────────────────────────

struct Discovery {
    settings: PmtuSettings,
    attempts_left: u32,
    timeout: Duration,
    deadline: Option<Instant>,
}

struct Pipeline {
    ourself: PeerName,
    remote: PeerName,
    rx: mpsc::Receiver<ForwardedFrame>,
    stop_rx: oneshot::Receiver<()>,
    encryptor: Box<dyn Encryptor>,
    sender: Arc<dyn UdpSender>,
    cell: Arc<RwLock<PmtuCell>>,
    pmtu: usize,
    discovery: Option<Discovery>,
}

impl Pipeline {
    async fn run(mut self) {
        loop {
            let deadline = self.discovery.as_ref().and_then(|d| d.deadline);
            tokio::select! {
                biased;
                _ = &mut self.stop_rx => break,
                frame = self.rx.recv() => match frame {
                    Some(frame) => {
                        self.accumulate(frame);
                        while let Ok(frame) = self.rx.try_recv() {
                            self.accumulate(frame);
                        }
                        self.flush();
                    }
                    None => break,
                },
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.verify_timed_out();
                }
            }
        }
        self.drain().await;
        tracing::debug!("forwarder stopped");
    }

    /// Close the channel and send whatever is still queued.
    async fn drain(&mut self) {
        self.rx.close();
        while let Some(frame) = self.rx.recv().await {
            self.accumulate(frame);
        }
        self.flush();
    }

    fn max_payload(&self) -> usize {
        self.pmtu.saturating_sub(UDP_OVERHEAD)
    }

    fn accumulate(&mut self, frame: ForwardedFrame) {
        let needed = self.encryptor.frame_overhead() + frame.frame.len();
        if self.encryptor.packet_overhead() + needed > self.max_payload() {
            tracing::debug!(len = frame.frame.len(), "dropping frame larger than a packet");
            return;
        }
        if self.encryptor.total_len() + needed > self.max_payload() {
            self.flush();
        }
        if let Err(e) = self.encryptor.append_frame(frame.src, frame.dst, &frame.frame) {
            tracing::debug!(error = %e, "dropping frame");
        }
    }

    fn flush(&mut self) {
        if self.encryptor.is_empty() {
            return;
        }
        let packet = match self.encryptor.bytes() {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(error = %e, "failed to seal batch");
                return;
            }
        };
        match self.sender.send(&packet) {
            Ok(()) => tracing::trace!(len = packet.len(), "sent batch"),
            Err(SendError::MsgTooBig { pmtu }) => {
                if self.shrink(pmtu) {
                    self.send_verify(true);
                }
            }
            Err(SendError::Dropped(e)) => tracing::debug!(error = %e, "batch dropped"),
            Err(SendError::Io(e)) => tracing::debug!(error = %e, "send failed"),
        }
    }

    /// Lower the PMTU after a too-big send. Returns false when already at
    /// the floor or when this pipeline does not do discovery.
    fn shrink(&mut self, reported: Option<usize>) -> bool {
        let Some(discovery) = &self.discovery else {
            tracing::warn!("message too big on non-DF pipeline");
            return false;
        };
        if self.pmtu <= MIN_PMTU {
            tracing::warn!(pmtu = self.pmtu, "path MTU at floor, not shrinking");
            return false;
        }
        let next = match reported {
            Some(p) if p < self.pmtu => p,
            _ => self.pmtu.saturating_sub(discovery.settings.decrement),
        };
        self.set_pmtu(next.max(MIN_PMTU));
        true
    }

    fn set_pmtu(&mut self, pmtu: usize) {
        self.pmtu = pmtu;
        let effective = effective_pmtu(pmtu, self.encryptor.as_ref());
        *self.cell.write().unwrap_or_else(PoisonError::into_inner) = PmtuCell {
            effective,
            verified: false,
        };
        tracing::debug!(pmtu, effective, "path MTU lowered");
    }

    /// Send a verification frame for the current effective PMTU, shrinking
    /// further while the send itself is too big. `reset` restarts the
    /// retry budget.
    fn send_verify(&mut self, reset: bool) {
        loop {
            let effective = self.cell.read().unwrap_or_else(PoisonError::into_inner).effective;
            let frame = vec![0u8; effective + ETHERNET_OVERHEAD];
            if let Err(e) = self.encryptor.append_frame(self.ourself, self.remote, &frame) {
                tracing::warn!(error = %e, "failed to build verification frame");
                return;
            }
            let packet = match self.encryptor.bytes() {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to seal verification frame");
                    return;
                }
            };
            match self.sender.send(&packet) {
                Err(SendError::MsgTooBig { pmtu }) => {
                    if !self.shrink(pmtu) {
                        if let Some(d) = self.discovery.as_mut() {
                            d.deadline = None;
                        }
                        return;
                    }
                }
                result => {
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "verification frame not sent");
                    }
                    if let Some(d) = self.discovery.as_mut() {
                        if reset {
                            d.attempts_left = d.settings.verify_attempts;
                            d.timeout = d.settings.verify_timeout;
                        }
                        d.deadline = Some(Instant::now() + d.timeout);
                    }
                    return;
                }
            }
        }
    }

    fn verify_timed_out(&mut self) {
        let verified = self.cell.read().unwrap_or_else(PoisonError::into_inner).verified;
        let Some(d) = self.discovery.as_mut() else {
            return;
        };
        if verified {
            d.deadline = None;
            return;
        }
        if d.attempts_left > 0 {
            d.attempts_left -= 1;
            d.timeout *= 2;
            self.send_verify(false);
        } else if self.shrink(None) {
            self.send_verify(true);
        } else if let Some(d) = self.discovery.as_mut() {
            d.deadline = None;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
