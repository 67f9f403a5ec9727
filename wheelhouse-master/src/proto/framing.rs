//! Length-delimited JSON framing shared by the control-plane sockets.

use std::marker::PhantomData;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::ProtocolError;

/// Frames above this size are protocol violations, not payloads.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// A socket speaking `In`-typed requests and `Out`-typed replies.
#[derive(Debug)]
pub struct JsonFramed<S, In, Out> {
    inner: Framed<S, LengthDelimitedCodec>,
    _marker: PhantomData<(In, Out)>,
}

impl<S, In, Out> JsonFramed<S, In, Out>
where
    S: AsyncRead + AsyncWrite + Unpin,
    In: DeserializeOwned,
    Out: Serialize,
{
    pub fn new(stream: S) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME)
            .new_codec();
        Self {
            inner: Framed::new(stream, codec),
            _marker: PhantomData,
        }
    }

    /// Receives one message; `None` on clean remote close.
    pub async fn recv(&mut self) -> Result<Option<In>, ProtocolError> {
        match self.inner.next().await {
            Some(frame) => {
                let frame = frame?;
                Ok(Some(serde_json::from_slice(&frame)?))
            }
            None => Ok(None),
        }
    }

    pub async fn send(&mut self, msg: &Out) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(msg)?;
        self.inner.send(payload.into()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    #[serde(tag = "cmd")]
    enum Ping {
        Ping { n: u32 },
    }

    #[tokio::test]
    async fn round_trips_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client: JsonFramed<_, Ping, Ping> = JsonFramed::new(client);
        let mut server: JsonFramed<_, Ping, Ping> = JsonFramed::new(server);

        client.send(&Ping::Ping { n: 7 }).await.unwrap();
        assert_eq!(
            server.recv().await.unwrap(),
            Some(Ping::Ping { n: 7 })
        );

        drop(client);
        assert!(server.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_tag_is_an_error() {
        let (client, server) = tokio::io::duplex(1024);
        let mut raw: JsonFramed<_, Ping, serde_json::Value> =
            JsonFramed::new(client);
        let mut server: JsonFramed<_, Ping, Ping> = JsonFramed::new(server);

        raw.send(&serde_json::json!({"cmd": "EXPLODE"}))
            .await
            .unwrap();
        assert!(matches!(
            server.recv().await,
            Err(ProtocolError::Json(_))
        ));
    }
}
