use thiserror::Error;

/// Errors produced while decoding an LZMA2 stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// An internal buffer could not be allocated.
    #[error("memory allocation failed")]
    MemoryAllocation,
    /// The compressed data is malformed: a bad chunk header, an out-of-range
    /// property byte, a broken range-coder invariant or a match distance
    /// reaching outside the dictionary.
    #[error("corruption detected in compressed data")]
    CorruptionDetected,
    /// The input ended before the end-of-stream marker.
    #[error("source size is wrong or input is truncated")]
    SrcSizeWrong,
    /// The destination buffer cannot hold the decompressed data.
    #[error("destination buffer is too small")]
    DstSizeTooSmall,
    /// The trailing XXH32 digest does not match the decompressed data.
    #[error("content checksum does not match")]
    ChecksumWrong,
    /// Two consecutive streaming calls made no progress on either buffer.
    #[error("no forward progress on input or output")]
    InfiniteLoop,
}

pub type Result<T> = core::result::Result<T, Error>;
