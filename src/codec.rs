use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

/// Frames a byte stream into text lines, decoding each from `charset`.
///
/// Lines end at `\n`; a trailing `\r` is dropped. Decoding is lossy and strips
/// a leading BOM, so the charset must be ASCII-compatible (UTF-8, GBK, Latin-1...).
pub struct LineCodec {
    charset: &'static encoding_rs::Encoding,
    // bytes of `src` already searched for a newline
    next_index: usize,
}

impl LineCodec {
    pub fn new(charset: &'static encoding_rs::Encoding) -> Self {
        Self {
            charset,
            next_index: 0,
        }
    }

    fn decode_line(&self, raw: &[u8]) -> String {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let (text, _used, _had_errors) = self.charset.decode(raw);
        text.into_owned()
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(encoding_rs::UTF_8)
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let offset = src[self.next_index..].iter().position(|b| *b == b'\n');
        match offset {
            Some(off) => {
                let end = self.next_index + off;
                self.next_index = 0;
                let line = src.split_to(end + 1);
                Ok(Some(self.decode_line(&line[..end])))
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }

        let line = self.decode_line(buf);
        buf.advance(buf.len());
        self.next_index = 0;
        Ok(Some(line))
    }
}
