use tokio_util::codec::length_delimited::Builder;
use tokio_util::codec::LengthDelimitedCodec;

const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

pub fn make_protocol_builder() -> Builder {
    *LengthDelimitedCodec::builder()
        .little_endian()
        .max_frame_length(MAX_FRAME_SIZE)
}
