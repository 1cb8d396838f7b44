//! Connection handshake over a fresh TCP stream.
//!
//! 1. Both sides send the 7-byte protocol header and agree on a version.
//! 2. Both sides send a JSON introduction: name, uid, a random connection
//!    id and whether they want encryption.
//! 3. With a password, a two-message Noise `NNpsk0` exchange follows,
//!    initiated by the outbound side.
//!
//! The connection uid is the XOR of both connection ids, so both ends
//! agree on it without another round trip.

use serde::{Deserialize, Serialize};
use skein_core::crypto::{NoiseInitiator, NoiseResponder, SessionKeys};
use skein_core::name::{PeerName, PeerUid};
use skein_core::wire::{ProtocolHeader, HANDSHAKE_TIMEOUT};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{AsBytes, FromZeroes};
use zeroize::Zeroizing;

use super::tcp::{read_frame, write_frame};
use super::ConnectionError;

/// Who we are, as presented to every peer.
pub struct Identity {
    pub name: PeerName,
    pub uid: PeerUid,
    pub psk: Option<Zeroizing<[u8; 32]>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Intro {
    name: PeerName,
    uid: PeerUid,
    conn_id: u64,
    encrypted: bool,
}

pub struct Handshake {
    pub remote_name: PeerName,
    pub remote_uid: PeerUid,
    pub conn_uid: u64,
    pub version: u8,
    pub keys: Option<SessionKeys>,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("remote_name", &self.remote_name)
            .field("remote_uid", &self.remote_uid)
            .field("conn_uid", &self.conn_uid)
            .field("version", &self.version)
            .field("encrypted", &self.keys.is_some())
            .finish()
    }
}

pub async fn handshake<S>(
    stream: &mut S,
    identity: &Identity,
    outbound: bool,
) -> Result<Handshake, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange(stream, identity, outbound))
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout)?
}

async fn exchange<S>(
    stream: &mut S,
    identity: &Identity,
    outbound: bool,
) -> Result<Handshake, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = ProtocolHeader::ours();
    stream.write_all(ours.as_bytes()).await?;
    let mut theirs = ProtocolHeader::new_zeroed();
    stream.read_exact(theirs.as_bytes_mut()).await?;
    let version = ours.negotiate(&theirs)?;

    let intro = Intro {
        name: identity.name,
        uid: identity.uid,
        conn_id: rand::random(),
        encrypted: identity.psk.is_some(),
    };
    write_frame(stream, &serde_json::to_vec(&intro)?).await?;
    let remote: Intro = serde_json::from_slice(&read_frame(stream).await?)?;
    if remote.encrypted != intro.encrypted {
        return Err(ConnectionError::EncryptionMismatch {
            ours: intro.encrypted,
        });
    }

    let keys = match &identity.psk {
        None => None,
        Some(psk) if outbound => {
            let (initiator, msg1) = NoiseInitiator::new(psk)?;
            write_frame(stream, &msg1).await?;
            Some(initiator.finish(&read_frame(stream).await?)?)
        }
        Some(psk) => {
            let msg1 = read_frame(stream).await?;
            let (keys, msg2) = NoiseResponder::respond(psk, &msg1)?;
            write_frame(stream, &msg2).await?;
            Some(keys)
        }
    };

    Ok(Handshake {
        remote_name: remote.name,
        remote_uid: remote.uid,
        conn_uid: intro.conn_id ^ remote.conn_id,
        version,
        keys,
    })
}
