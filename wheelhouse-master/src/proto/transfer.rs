//! Binary chunked-upload protocol for the file transfer socket.
//!
//! Frames are length-prefixed; the first payload byte is a tag. Chunk
//! payloads are raw bytes, untouched by any text encoding. The uploader
//! announces itself with the slave id it was assigned on `HELLO`, names a
//! file, then streams fixed-size chunks keyed by index; the receiver may
//! re-request missing chunks out of order before delivering its verdict.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use wheelhouse_model::SlaveId;

use super::ProtocolError;

/// Fixed chunk size; the final chunk of a file may be shorter.
pub const CHUNK_SIZE: u64 = 64 * 1024;

const TAG_HELLO: u8 = 0x01;
const TAG_SEND: u8 = 0x02;
const TAG_CHUNK: u8 = 0x03;
const TAG_DONE: u8 = 0x04;
const TAG_FETCH: u8 = 0x11;
const TAG_VERDICT: u8 = 0x12;

/// Uploader-to-master messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferIn {
    Hello { slave_id: SlaveId },
    Send { filename: String },
    Chunk { index: u32, data: Bytes },
    Done,
}

/// Master-to-uploader messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOut {
    /// Request one chunk by index; issued for chunk 0 to start the stream
    /// and again for any chunk missing when the uploader says `Done`.
    Fetch { index: u32 },
    Verdict(TransferVerdict),
}

/// Final word on one upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferVerdict {
    /// Hash verified; the file is installed.
    Ok,
    /// Hash mismatch; re-send the same file from the start.
    Retry,
    /// Out of retries or the transfer is unknown; abandon the file.
    Error,
}

/// Master-side codec: decodes [`TransferIn`], encodes [`TransferOut`].
#[derive(Debug)]
pub struct TransferCodec {
    inner: LengthDelimitedCodec,
}

impl TransferCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(CHUNK_SIZE as usize + 1024)
                .new_codec(),
        }
    }
}

impl Default for TransferCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TransferCodec {
    type Item = TransferIn;
    type Error = ProtocolError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<TransferIn>, ProtocolError> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        decode_in(frame.freeze()).map(Some)
    }
}

impl Encoder<TransferOut> for TransferCodec {
    type Error = ProtocolError;

    fn encode(
        &mut self,
        msg: TransferOut,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        self.inner.encode(encode_out(msg), dst)?;
        Ok(())
    }
}

/// Uploader-side codec, used by import tooling and tests.
#[derive(Debug, Default)]
pub struct UploaderCodec {
    inner: LengthDelimitedCodec,
}

impl Decoder for UploaderCodec {
    type Item = TransferOut;
    type Error = ProtocolError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<TransferOut>, ProtocolError> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        decode_out(frame.freeze()).map(Some)
    }
}

impl Encoder<TransferIn> for UploaderCodec {
    type Error = ProtocolError;

    fn encode(
        &mut self,
        msg: TransferIn,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        self.inner.encode(encode_in(msg), dst)?;
        Ok(())
    }
}

fn decode_in(mut frame: Bytes) -> Result<TransferIn, ProtocolError> {
    if frame.is_empty() {
        return Err(ProtocolError::Frame("empty frame".to_string()));
    }
    let tag = frame.get_u8();
    match tag {
        TAG_HELLO => {
            if frame.remaining() != 4 {
                return Err(ProtocolError::Frame(
                    "HELLO payload must be 4 bytes".to_string(),
                ));
            }
            Ok(TransferIn::Hello {
                slave_id: SlaveId(frame.get_u32()),
            })
        }
        TAG_SEND => {
            let filename =
                String::from_utf8(frame.to_vec()).map_err(|_| {
                    ProtocolError::Frame(
                        "SEND filename is not UTF-8".to_string(),
                    )
                })?;
            Ok(TransferIn::Send { filename })
        }
        TAG_CHUNK => {
            if frame.remaining() < 4 {
                return Err(ProtocolError::Frame(
                    "CHUNK frame too short".to_string(),
                ));
            }
            let index = frame.get_u32();
            Ok(TransferIn::Chunk { index, data: frame })
        }
        TAG_DONE => Ok(TransferIn::Done),
        other => Err(ProtocolError::Frame(format!(
            "unknown uploader tag 0x{other:02x}"
        ))),
    }
}

fn encode_in(msg: TransferIn) -> Bytes {
    match msg {
        TransferIn::Hello { slave_id } => {
            let mut buf = BytesMut::with_capacity(5);
            buf.put_u8(TAG_HELLO);
            buf.put_u32(slave_id.as_u32());
            buf.freeze()
        }
        TransferIn::Send { filename } => {
            let mut buf = BytesMut::with_capacity(1 + filename.len());
            buf.put_u8(TAG_SEND);
            buf.put_slice(filename.as_bytes());
            buf.freeze()
        }
        TransferIn::Chunk { index, data } => {
            let mut buf = BytesMut::with_capacity(5 + data.len());
            buf.put_u8(TAG_CHUNK);
            buf.put_u32(index);
            buf.put_slice(&data);
            buf.freeze()
        }
        TransferIn::Done => Bytes::from_static(&[TAG_DONE]),
    }
}

fn decode_out(mut frame: Bytes) -> Result<TransferOut, ProtocolError> {
    if frame.is_empty() {
        return Err(ProtocolError::Frame("empty frame".to_string()));
    }
    let tag = frame.get_u8();
    match tag {
        TAG_FETCH => {
            if frame.remaining() != 4 {
                return Err(ProtocolError::Frame(
                    "FETCH payload must be 4 bytes".to_string(),
                ));
            }
            Ok(TransferOut::Fetch {
                index: frame.get_u32(),
            })
        }
        TAG_VERDICT => {
            if frame.remaining() != 1 {
                return Err(ProtocolError::Frame(
                    "VERDICT payload must be 1 byte".to_string(),
                ));
            }
            let verdict = match frame.get_u8() {
                0 => TransferVerdict::Ok,
                1 => TransferVerdict::Retry,
                2 => TransferVerdict::Error,
                other => {
                    return Err(ProtocolError::Frame(format!(
                        "unknown verdict {other}"
                    )));
                }
            };
            Ok(TransferOut::Verdict(verdict))
        }
        other => Err(ProtocolError::Frame(format!(
            "unknown master tag 0x{other:02x}"
        ))),
    }
}

fn encode_out(msg: TransferOut) -> Bytes {
    match msg {
        TransferOut::Fetch { index } => {
            let mut buf = BytesMut::with_capacity(5);
            buf.put_u8(TAG_FETCH);
            buf.put_u32(index);
            buf.freeze()
        }
        TransferOut::Verdict(verdict) => {
            let code = match verdict {
                TransferVerdict::Ok => 0,
                TransferVerdict::Retry => 1,
                TransferVerdict::Error => 2,
            };
            Bytes::from(vec![TAG_VERDICT, code])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uploader_frames_round_trip() {
        let messages = vec![
            TransferIn::Hello {
                slave_id: SlaveId(42),
            },
            TransferIn::Send {
                filename: "foo-1.0-cp39-cp39m-linux_armv7l.whl".to_string(),
            },
            TransferIn::Chunk {
                index: 3,
                data: Bytes::from_static(b"payload bytes"),
            },
            TransferIn::Done,
        ];
        for msg in messages {
            let decoded = decode_in(encode_in(msg.clone())).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn master_frames_round_trip() {
        let messages = vec![
            TransferOut::Fetch { index: 0 },
            TransferOut::Verdict(TransferVerdict::Ok),
            TransferOut::Verdict(TransferVerdict::Retry),
            TransferOut::Verdict(TransferVerdict::Error),
        ];
        for msg in messages {
            let decoded = decode_out(encode_out(msg)).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn rejects_unknown_tags() {
        assert!(decode_in(Bytes::from_static(&[0x7f])).is_err());
        assert!(decode_out(Bytes::from_static(&[0x7f])).is_err());
        assert!(decode_in(Bytes::new()).is_err());
    }

    #[test]
    fn chunk_keeps_raw_bytes() {
        let data = Bytes::from((0u8..=255).collect::<Vec<u8>>());
        let msg = TransferIn::Chunk {
            index: 9,
            data: data.clone(),
        };
        match decode_in(encode_in(msg)).unwrap() {
            TransferIn::Chunk { index, data: back } => {
                assert_eq!(index, 9);
                assert_eq!(back, data);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
