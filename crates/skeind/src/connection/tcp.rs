//! TCP framing for the control channel.
//!
//! Every message is `[len: u32 BE][body]`. During the handshake the body
//! is raw; afterwards it is `[tag][payload]`, sealed with the control
//! cipher when the connection is encrypted.

use std::sync::Arc;

use skein_core::crypto::SessionCipher;
use skein_core::wire::{ProtocolTag, WireError, MAX_CONTROL_MESSAGE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::ConnectionError;

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> Result<(), ConnectionError> {
    if body.len() > MAX_CONTROL_MESSAGE {
        return Err(WireError::MessageTooLarge(body.len()).into());
    }
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, ConnectionError> {
    let len = r.read_u32().await? as usize;
    if len > MAX_CONTROL_MESSAGE {
        return Err(WireError::MessageTooLarge(len).into());
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}

/// Encodes and decodes tagged control messages for one connection.
#[derive(Clone, Default)]
pub struct ControlCodec {
    cipher: Option<Arc<SessionCipher>>,
}

impl ControlCodec {
    pub fn new(cipher: Option<Arc<SessionCipher>>) -> Self {
        Self { cipher }
    }

    pub async fn write<W: AsyncWrite + Unpin>(
        &self,
        w: &mut W,
        tag: ProtocolTag,
        payload: &[u8],
    ) -> Result<(), ConnectionError> {
        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(u8::from(tag));
        body.extend_from_slice(payload);
        match &self.cipher {
            Some(cipher) => write_frame(w, &cipher.seal(&body)?).await,
            None => write_frame(w, &body).await,
        }
    }

    pub async fn read<R: AsyncRead + Unpin>(
        &self,
        r: &mut R,
    ) -> Result<(ProtocolTag, Vec<u8>), ConnectionError> {
        let frame = read_frame(r).await?;
        let mut body = match &self.cipher {
            Some(cipher) => cipher.open(&frame)?,
            None => frame,
        };
        if body.is_empty() {
            return Err(WireError::Truncated { need: 1, got: 0 }.into());
        }
        let tag = ProtocolTag::try_from(body[0])?;
        body.remove(0);
        Ok((tag, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_messages_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let codec = ControlCodec::default();
        codec.write(&mut a, ProtocolTag::Heartbeat, &[]).await.unwrap();
        codec
            .write(&mut a, ProtocolTag::PmtuVerified, &1400u16.to_be_bytes())
            .await
            .unwrap();

        assert_eq!(codec.read(&mut b).await.unwrap(), (ProtocolTag::Heartbeat, vec![]));
        let (tag, payload) = codec.read(&mut b).await.unwrap();
        assert_eq!(tag, ProtocolTag::PmtuVerified);
        assert_eq!(payload, 1400u16.to_be_bytes());
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &[42, 1, 2]).await.unwrap();
        let err = ControlCodec::default().read(&mut b).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Wire(WireError::UnknownTag(42))));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Wire(WireError::MessageTooLarge(_))));
    }

    #[tokio::test]
    async fn closed_stream_is_an_io_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(ConnectionError::Io(_))));
    }
}
