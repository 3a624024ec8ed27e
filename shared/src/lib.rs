//! # MazeWar Wire Protocol
//!
//! This crate defines the framed binary protocol spoken between the MazeWar
//! server and its clients, and is shared by the server, the headless test
//! client, and the integration tests.
//!
//! ## Frame layout
//!
//! Every frame starts with a fixed 16-byte header followed by an optional
//! payload of `size` bytes. The layout is fixed by compatibility with
//! existing clients and matches the C struct it originated from, pad bytes
//! included:
//!
//! ```text
//! offset  0   type           u8
//! offset  1   (pad)
//! offset  2   size           u16, network byte order
//! offset  4   param1         u8
//! offset  5   param2         u8
//! offset  6   param3         u8
//! offset  7   (pad)
//! offset  8   timestamp_sec  u32, network byte order
//! offset 12   timestamp_nsec u32, network byte order
//! ```
//!
//! Single-byte fields are never reordered. The params carry small signed
//! values for some frame types (a move/turn sign, a score, or -1 to drop a
//! scoreboard entry); consumers reinterpret them with `as i8`.
//!
//! ## Reading frames
//!
//! [`FrameReader`] accumulates bytes in an owned buffer and only hands out
//! complete frames, so a pending [`FrameReader::read_packet`] call can be
//! raced against other events in `tokio::select!` without losing data: a
//! cancelled read leaves any partial frame buffered for the next call.

use std::io;
use std::sync::OnceLock;
use std::time::Instant;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed packet header on the wire.
pub const HEADER_LEN: usize = 16;

/// Frame type discriminants.
///
/// The numeric values are part of the wire format and must not change.
/// Types 1..=6 travel client to server, 7..=13 server to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Unused placeholder.
    None = 0,
    /// Login request; param1 = avatar, payload = username.
    Login = 1,
    /// Step forward or backward; param1 = +1 / -1.
    Move = 2,
    /// Rotate gaze; param1 = +1 (CCW) / -1 (CW).
    Turn = 3,
    /// Fire a laser along the current gaze.
    Fire = 4,
    /// Force a full view redraw.
    Refresh = 5,
    /// Chat; payload = message bytes.
    Send = 6,
    /// Login accepted.
    Ready = 7,
    /// Requested avatar is taken.
    InUse = 8,
    /// Clear the client's view window.
    Clear = 9,
    /// Paint one view cell; param1 = byte, param2 = x, param3 = depth.
    Show = 10,
    /// The recipient was hit by a laser.
    Alert = 11,
    /// Scoreboard update; param1 = avatar, param2 = score (-1 removes).
    Score = 12,
    /// Broadcast chat line; payload = text.
    Chat = 13,
}

impl PacketType {
    /// Decodes a wire type byte. Unknown values yield `None` so the
    /// dispatcher can ignore them instead of dropping the connection.
    pub fn from_byte(byte: u8) -> Option<PacketType> {
        Some(match byte {
            0 => PacketType::None,
            1 => PacketType::Login,
            2 => PacketType::Move,
            3 => PacketType::Turn,
            4 => PacketType::Fire,
            5 => PacketType::Refresh,
            6 => PacketType::Send,
            7 => PacketType::Ready,
            8 => PacketType::InUse,
            9 => PacketType::Clear,
            10 => PacketType::Show,
            11 => PacketType::Alert,
            12 => PacketType::Score,
            13 => PacketType::Chat,
            _ => return None,
        })
    }
}

/// Fixed-size frame header, fields in host order.
///
/// `param1..param3` are raw bytes; reinterpret with `as i8` where a frame
/// type defines them as signed. The timestamps are stamped by
/// [`send_packet`], so decoded frames compare equal to what was sent except
/// for those two fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub ty: u8,
    pub size: u16,
    pub param1: u8,
    pub param2: u8,
    pub param3: u8,
    pub timestamp_sec: u32,
    pub timestamp_nsec: u32,
}

impl PacketHeader {
    /// A zeroed header of the given type. Callers fill in params and size
    /// with struct update syntax:
    ///
    /// ```
    /// use shared::{PacketHeader, PacketType};
    /// let show = PacketHeader {
    ///     param1: b'A',
    ///     param2: 1,
    ///     param3: 0,
    ///     ..PacketHeader::new(PacketType::Show)
    /// };
    /// ```
    pub fn new(ty: PacketType) -> Self {
        PacketHeader {
            ty: ty as u8,
            ..Default::default()
        }
    }

    /// Serializes the header into its 16-byte wire form, converting
    /// multi-byte fields to network byte order. Pad bytes write as zero.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.ty;
        buf[2..4].copy_from_slice(&self.size.to_be_bytes());
        buf[4] = self.param1;
        buf[5] = self.param2;
        buf[6] = self.param3;
        buf[8..12].copy_from_slice(&self.timestamp_sec.to_be_bytes());
        buf[12..16].copy_from_slice(&self.timestamp_nsec.to_be_bytes());
        buf
    }

    /// Deserializes a header from its wire form, converting multi-byte
    /// fields to host order. Pad bytes are ignored.
    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        PacketHeader {
            ty: buf[0],
            size: u16::from_be_bytes([buf[2], buf[3]]),
            param1: buf[4],
            param2: buf[5],
            param3: buf[6],
            timestamp_sec: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            timestamp_nsec: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }
}

/// One received frame: header plus payload (`None` when `size` was 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Option<Vec<u8>>,
}

impl Packet {
    /// The payload bytes, empty when the frame carried none.
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }
}

/// Error surfaced by [`FrameReader::read_packet`].
#[derive(Debug, Error)]
pub enum RecvError {
    /// The peer closed the stream between frames.
    #[error("connection closed")]
    Closed,
    /// The peer closed the stream in the middle of a frame.
    #[error("connection closed mid-frame")]
    TruncatedFrame,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Monotonic reading used to stamp outbound headers, as seconds and
/// nanoseconds since the first frame this process sent.
fn monotonic_now() -> (u32, u32) {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let elapsed = EPOCH.get_or_init(Instant::now).elapsed();
    (elapsed.as_secs() as u32, elapsed.subsec_nanos())
}

/// Sends one frame: stamps the timestamps, then writes the full header and
/// the payload, if any. Short writes are absorbed by `write_all`; any write
/// failure propagates to the caller.
///
/// The payload is written only when `header.size > 0` and a buffer was
/// supplied, and exactly `header.size` bytes of it go on the wire.
pub async fn send_packet<W>(
    writer: &mut W,
    header: &mut PacketHeader,
    payload: Option<&[u8]>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (sec, nsec) = monotonic_now();
    header.timestamp_sec = sec;
    header.timestamp_nsec = nsec;

    writer.write_all(&header.to_bytes()).await?;
    if header.size > 0 {
        if let Some(data) = payload {
            writer.write_all(&data[..header.size as usize]).await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Buffered frame reader over any async byte stream.
///
/// Bytes read from the stream accumulate in an internal buffer until a
/// complete frame (header plus payload) is available, so cancelling a
/// pending [`read_packet`](Self::read_packet) never loses protocol data.
/// Each frame's payload is a fresh allocation owned by the returned
/// [`Packet`].
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            buf: Vec::with_capacity(4 * HEADER_LEN),
        }
    }

    /// Reads the next complete frame.
    ///
    /// Performs as many reads as it takes to assemble a full frame; EOF
    /// between frames yields [`RecvError::Closed`] and EOF inside a frame
    /// yields [`RecvError::TruncatedFrame`].
    pub async fn read_packet(&mut self) -> Result<Packet, RecvError> {
        loop {
            if let Some(packet) = self.take_frame() {
                return Ok(packet);
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(if self.buf.is_empty() {
                    RecvError::Closed
                } else {
                    RecvError::TruncatedFrame
                });
            }
        }
    }

    /// Pops one complete frame off the front of the buffer, if present.
    fn take_frame(&mut self) -> Option<Packet> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&self.buf[..HEADER_LEN]);
        let header = PacketHeader::from_bytes(&raw);

        let total = HEADER_LEN + header.size as usize;
        if self.buf.len() < total {
            return None;
        }
        let payload = (header.size > 0).then(|| self.buf[HEADER_LEN..total].to_vec());
        self.buf.drain(..total);
        Some(Packet { header, payload })
    }
}
