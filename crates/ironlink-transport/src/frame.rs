//! Wire frame layout and codec.
//!
//! One frame is one unit of the protocol carried over an established secure
//! channel (the channel has already encrypted the bytes; this layer only
//! frames them):
//!
//! ```text
//! [type:1][sequence:8][correlationId:16][metadataLength:4][metadata][payloadLength:4][payload]
//! ```
//!
//! All integers are fixed-width big-endian. Metadata entries are key/value
//! string pairs serialized as `[keyLen:2][key][valLen:2][val]` in UTF-8.
//! Declared lengths are checked against the configured cap and the remaining
//! buffer before any payload allocation happens, so a corrupt or hostile
//! peer cannot force an unbounded allocation.

use ironlink_core::{Exchange, IronlinkError, Result};
use std::collections::HashMap;
use uuid::Uuid;

/// Fixed header bytes before the metadata block
const HEADER_LEN: usize = 1 + 8 + 16 + 4;

/// Type tag for a wire frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Application payload frame, delivered upward as an exchange
    Data,
    /// Adapter-internal control frame, consumed without upward delivery
    Control,
    /// Close request: the peer is draining and will release the channel
    Close,
}

impl FrameType {
    fn to_wire(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Control => 1,
            Self::Close => 2,
        }
    }

    fn from_wire(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Data),
            1 => Ok(Self::Control),
            2 => Ok(Self::Close),
            other => Err(IronlinkError::malformed(format!("unknown frame type tag {other}"))),
        }
    }
}

/// One unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type tag
    pub frame_type: FrameType,
    /// Ordered sequence number, strictly increasing and gapless per session
    pub sequence: u64,
    /// Correlation id tying the frame back to the originating exchange
    pub correlation_id: Uuid,
    /// Metadata headers; insertion order is irrelevant
    pub metadata: HashMap<String, String>,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a data frame from an outbound exchange.
    ///
    /// The sequence number comes from the owning session's send counter;
    /// assignment happens in the session writer so an abandoned send never
    /// burns a number.
    pub fn from_exchange(exchange: &Exchange, sequence: u64, correlation_id: Uuid) -> Self {
        Self {
            frame_type: FrameType::Data,
            sequence,
            correlation_id,
            metadata: exchange.headers.clone(),
            payload: exchange.body.clone(),
        }
    }

    /// Build a close frame.
    pub fn close(sequence: u64) -> Self {
        Self {
            frame_type: FrameType::Close,
            sequence,
            correlation_id: Uuid::nil(),
            metadata: HashMap::new(),
            payload: Vec::new(),
        }
    }

    /// Convert a received data frame into an inbound exchange.
    pub fn into_exchange(self) -> Exchange {
        Exchange {
            headers: self.metadata,
            body: self.payload,
            fault: None,
        }
    }

    /// Serialize the frame to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut metadata = Vec::new();
        for (key, value) in &self.metadata {
            let key = key.as_bytes();
            let value = value.as_bytes();
            if key.len() > u16::MAX as usize || value.len() > u16::MAX as usize {
                return Err(IronlinkError::malformed(
                    "metadata entry exceeds u16 length prefix",
                ));
            }
            metadata.extend_from_slice(&(key.len() as u16).to_be_bytes());
            metadata.extend_from_slice(key);
            metadata.extend_from_slice(&(value.len() as u16).to_be_bytes());
            metadata.extend_from_slice(value);
        }
        if metadata.len() > u32::MAX as usize || self.payload.len() > u32::MAX as usize {
            return Err(IronlinkError::malformed("frame section exceeds u32 length prefix"));
        }

        let mut out = Vec::with_capacity(HEADER_LEN + metadata.len() + 4 + self.payload.len());
        out.push(self.frame_type.to_wire());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(self.correlation_id.as_bytes());
        out.extend_from_slice(&(metadata.len() as u32).to_be_bytes());
        out.extend_from_slice(&metadata);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse a frame from wire bytes.
    ///
    /// `max_frame_size` caps both declared sections; a frame declaring more
    /// is rejected with `OversizeFrame` before its body is touched.
    pub fn decode(bytes: &[u8], max_frame_size: usize) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);

        let frame_type = FrameType::from_wire(cursor.take_u8()?)?;
        let sequence = cursor.take_u64()?;
        let correlation_id = Uuid::from_bytes(cursor.take_array::<16>()?);

        let metadata_len = cursor.take_u32()? as usize;
        if metadata_len > max_frame_size {
            return Err(IronlinkError::oversize(metadata_len, max_frame_size));
        }
        let metadata_bytes = cursor.take_slice(metadata_len)?;
        let metadata = decode_metadata(metadata_bytes)?;

        let payload_len = cursor.take_u32()? as usize;
        if payload_len > max_frame_size {
            return Err(IronlinkError::oversize(payload_len, max_frame_size));
        }
        let payload = cursor.take_slice(payload_len)?.to_vec();

        if !cursor.is_empty() {
            return Err(IronlinkError::malformed("trailing bytes after payload"));
        }

        Ok(Self {
            frame_type,
            sequence,
            correlation_id,
            metadata,
            payload,
        })
    }
}

fn decode_metadata(bytes: &[u8]) -> Result<HashMap<String, String>> {
    let mut cursor = Cursor::new(bytes);
    let mut metadata = HashMap::new();
    while !cursor.is_empty() {
        let key_len = cursor.take_u16()? as usize;
        let key = std::str::from_utf8(cursor.take_slice(key_len)?)
            .map_err(|_| IronlinkError::malformed("metadata key is not UTF-8"))?
            .to_string();
        let value_len = cursor.take_u16()? as usize;
        let value = std::str::from_utf8(cursor.take_slice(value_len)?)
            .map_err(|_| IronlinkError::malformed("metadata value is not UTF-8"))?
            .to_string();
        metadata.insert(key, value);
    }
    Ok(metadata)
}

/// Bounds-checked reader over a byte slice
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| IronlinkError::malformed("frame truncated"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array::<2>()?))
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array::<4>()?))
    }

    fn take_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array::<8>()?))
    }
}
