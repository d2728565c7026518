//! Block-parallel LZMA2 decompression.
//!
//! A stream is a sequence of LZMA2 chunks terminated by a zero byte,
//! preceded by one property byte carrying the dictionary size and a flag for
//! an optional trailing XXH32 digest. Chunks that reset the dictionary start
//! independently decodable blocks, which is what the multi-threaded paths
//! split on.
//!
//! One-shot decoding goes through [`Decoder`] (or the [`decompress`] /
//! [`decompress_mt`] helpers), incremental decoding through
//! [`StreamDecoder`].
//!
//! # Examples
//! ```
//! let compressed: Vec<u8> = vec![
//!     0x00, 0x01, 0x00, 0x0C, 0x48, 0x65, 0x6C, 0x6C, 0x6F, 0x2C, 0x20, 0x77,
//!     0x6F, 0x72, 0x6C, 0x64, 0x21, 0x00,
//! ];
//! let mut decompressed = vec![0u8; 13];
//! let size = fast_lzma2::decompress(&mut decompressed, &compressed).unwrap();
//! assert_eq!(&decompressed[..size], b"Hello, world!");
//! ```

mod block_dec;
mod decoder;
mod error;
mod lz;
mod lzma2_dec;
mod range_dec;
mod stream_dec;

pub use block_dec::Decoder;
pub use error::{Error, Result};
pub use stream_dec::StreamDecoder;

/// Flag bit in the stream property byte: a 4-byte XXH32 canonical digest
/// follows the end-of-stream marker.
pub(crate) const PROP_HASH_FLAG: u8 = 1 << 6;
/// Mask of the dictionary-size property in the stream property byte.
pub(crate) const PROP_MASK: u8 = 0x3F;

/// Compressed input for [`StreamDecoder::decompress`]; `pos` is advanced
/// past the consumed bytes.
pub struct InBuffer<'a> {
    pub src: &'a [u8],
    pub pos: usize,
}

impl<'a> InBuffer<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }
}

/// Decompressed output for [`StreamDecoder::decompress`]; `pos` is advanced
/// past the produced bytes.
pub struct OutBuffer<'a> {
    pub dst: &'a mut [u8],
    pub pos: usize,
}

impl<'a> OutBuffer<'a> {
    pub fn new(dst: &'a mut [u8]) -> Self {
        Self { dst, pos: 0 }
    }
}

/// Decompresses a whole stream on the calling thread. Returns the number of
/// bytes written to `dst`.
pub fn decompress(dst: &mut [u8], src: &[u8]) -> Result<usize> {
    Decoder::new(1).decompress(dst, src)
}

/// Decompresses a whole stream using up to `nb_threads` threads.
pub fn decompress_mt(dst: &mut [u8], src: &[u8], nb_threads: u32) -> Result<usize> {
    Decoder::new(nb_threads).decompress(dst, src)
}

/// Walks the chunk headers of a stream (property byte included) and sums the
/// decompressed size. Returns `Ok(None)` when the input is truncated before
/// the end-of-stream marker.
pub fn find_decompressed_size(src: &[u8]) -> Result<Option<u64>> {
    match src.split_first() {
        Some((_, chunks)) => lzma2_dec::chunks_unpack_size(chunks),
        None => Ok(None),
    }
}

/// Fixed per-decoder state: the framing state plus a fully populated
/// probability model.
fn decoder_state_size() -> usize {
    core::mem::size_of::<lzma2_dec::Lzma2Dec<'static>>()
        + (1usize << decoder::LCLP_MAX) * decoder::LITERAL_CODER_SIZE * core::mem::size_of::<u16>()
}

/// Upper bound on the memory used by a one-shot [`Decoder`].
pub fn estimate_decoder_size(nb_threads: u32) -> usize {
    nb_threads.clamp(1, 256) as usize * decoder_state_size()
}

/// Upper bound on the memory used by a [`StreamDecoder`] for a stream with
/// the given dictionary size. The multi-threaded estimate assumes 50%
/// compression and block sizes of four dictionaries.
pub fn estimate_stream_size(dict_size: usize, nb_threads: u32) -> usize {
    let nb_threads = nb_threads.clamp(1, 256) as usize;
    if nb_threads > 1 {
        nb_threads * decoder_state_size()
            + (dict_size + dict_size / 2) * 4 * nb_threads
            + stream_dec::MT_INPUT_SIZE
    } else {
        decoder_state_size() + lz::dict_buf_size(dict_size)
    }
}
