use crate::error::Error;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Length-prefixed tunnel framing: `u32` big-endian payload length, then
/// the payload. A zero-length frame is the keep-alive ping. The declared
/// length is checked against the configured cap before any payload byte is
/// buffered, so an oversize announcement fails fast as a protocol error.
pub struct FrameCodec {
    max_frame_size: usize,
    /// Whether the inner codec already consumed a length header and is
    /// waiting on payload bytes. The buffer only starts with a length
    /// header while this is false.
    mid_frame: bool,
    length_delimited: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        let length_delimited = LengthDelimitedCodec::builder()
            .length_field_type::<u32>()
            // The cap is enforced by this wrapper; the inner codec only
            // needs to never reject on its own.
            .max_frame_length(usize::MAX)
            .new_codec();
        Self {
            max_frame_size,
            mid_frame: false,
            length_delimited,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.mid_frame && src.len() >= 4 {
            let declared = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if declared > self.max_frame_size {
                return Err(Error::FrameOversize(declared));
            }
            // The inner codec consumes the header on this call; remember
            // we are inside a frame until it comes out.
            self.mid_frame = true;
        }
        match self.length_delimited.decode(src)? {
            Some(frame) => {
                self.mid_frame = false;
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(Error::FrameTooLarge(item.len()));
        }
        Ok(self.length_delimited.encode(item, dst)?)
    }
}
