//! Newline-framed JSON codec: "encoder appends `\n`; decoder reads until
//! `\n` and parses" (spec §4.A). Malformed lines are a protocol error the
//! caller logs and drops; they never tear the link down by themselves.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::Message;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let line = src.split_to(newline);
        src.advance(1); // drop the '\n' itself
        if line.is_empty() {
            return self.decode(src);
        }
        let msg = serde_json::from_slice::<Message>(&line)?;
        Ok(Some(msg))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut line = serde_json::to_vec(&item)?;
        line.push(b'\n');
        dst.extend_from_slice(&line);
        Ok(())
    }
}

/// Reads exactly one framed message out of a buffered reader, leaving
/// whatever bytes follow the terminating `\n` untouched in the reader's
/// internal buffer. Used to read the `NEW_CONN` header on a fresh data
/// substream before handing the same reader to a byte splice — see the
/// design note in SPEC_FULL.md §4.A about not losing buffered bytes.
pub async fn read_one_line<R>(reader: &mut R) -> Result<Message, ProtocolError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let trimmed = line.trim_end_matches('\n');
    Ok(serde_json::from_str(trimmed)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn decode_waits_for_newline() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::from(&b"{\"type\":\"PING\",\"ts\":1}"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg, Message::Ping { ts: 1 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Message::Ping { ts: 7 }, &mut buf)
            .unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));
    }
}
