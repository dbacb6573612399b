// Stream framing: recover exactly one BER-encoded packet per call from a live
// TCP/TLS stream. Never reads past the end of the current packet, so the
// stream position always sits on a packet boundary after a valid frame.

use anyhow::Result;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Hard ceiling on one packet. A hostile length field cannot force a larger
/// allocation than this.
pub const MAX_PACKET_BYTES: usize = 64 * 1024 * 1024;

/// Initial scratch buffer size; grown on demand up to the packet cap.
pub const INITIAL_BUFFER_BYTES: usize = 32 * 1024;

/// Zero-length reads while waiting for packet content are retried this many
/// times, 500 ms apart, before the frame is given up as short.
const ZERO_READ_RETRIES: u32 = 3;
const ZERO_READ_PAUSE: Duration = Duration::from_millis(500);

/// One framed packet. When `valid` is false, `bytes` holds whatever arrived;
/// the caller forwards those bytes unmodified and must not try to rewrite them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub valid: bool,
}

impl Frame {
    fn invalid(bytes: Vec<u8>) -> Self {
        Frame {
            bytes,
            valid: false,
        }
    }

    /// Clean close: the peer went away between packets.
    pub fn is_end_of_stream(&self) -> bool {
        !self.valid && self.bytes.is_empty()
    }
}

/// Per-direction framer owning a reusable scratch buffer.
pub struct Framer {
    buf: BytesMut,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(INITIAL_BUFFER_BYTES);
        buf.resize(INITIAL_BUFFER_BYTES, 0);
        Framer { buf }
    }

    /// Read exactly one packet from the stream.
    ///
    /// Returns an invalid frame on a short header (stream closed), an
    /// oversized or indefinite length field, or a peer that stalls mid-packet
    /// past the retry budget. I/O errors propagate.
    pub async fn read_packet<S>(&mut self, stream: &mut S) -> Result<Frame>
    where
        S: AsyncRead + Unpin,
    {
        // Tag byte + first length byte.
        let mut filled = 0usize;
        while filled < 2 {
            let n = stream.read(&mut self.buf[filled..2]).await?;
            if n == 0 {
                return Ok(Frame::invalid(self.buf[..filled].to_vec()));
            }
            filled += n;
        }

        let first_length_byte = self.buf[1];
        let extra_length_bytes = if (first_length_byte & 0x80) == 0 {
            0
        } else {
            (first_length_byte & 0x7F) as usize
        };

        // 0x80 would be an indefinite length; LDAP never uses it.
        if extra_length_bytes == 0 && (first_length_byte & 0x80) != 0 {
            return Ok(Frame::invalid(self.buf[..filled].to_vec()));
        }
        // More than 8 length bytes cannot describe a packet under the cap.
        if extra_length_bytes > 8 {
            return Ok(Frame::invalid(self.buf[..filled].to_vec()));
        }

        let header_len = 2 + extra_length_bytes;
        while filled < header_len {
            let n = stream.read(&mut self.buf[filled..header_len]).await?;
            if n == 0 {
                return Ok(Frame::invalid(self.buf[..filled].to_vec()));
            }
            filled += n;
        }

        let content_length = if extra_length_bytes == 0 {
            first_length_byte as u64
        } else {
            let mut length = 0u64;
            for &b in &self.buf[2..header_len] {
                length = (length << 8) | b as u64;
            }
            length
        };

        let total = content_length + header_len as u64;
        if total > MAX_PACKET_BYTES as u64 {
            return Ok(Frame::invalid(self.buf[..filled].to_vec()));
        }
        let total = total as usize;

        if total > self.buf.len() {
            self.buf.resize(total, 0);
        }

        let mut zero_reads = 0u32;
        while filled < total {
            let n = stream.read(&mut self.buf[filled..total]).await?;
            if n == 0 {
                zero_reads += 1;
                if zero_reads > ZERO_READ_RETRIES {
                    return Ok(Frame::invalid(self.buf[..filled].to_vec()));
                }
                tokio::time::sleep(ZERO_READ_PAUSE).await;
                continue;
            }
            zero_reads = 0;
            filled += n;
        }

        Ok(Frame {
            bytes: self.buf[..total].to_vec(),
            valid: true,
        })
    }
}
