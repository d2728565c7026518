use crate::error::{Error, Result};

/// Minimum dictionary size accepted by the LZMA2 format.
const DICT_SIZE_MIN: usize = 1 << 12;

/// Rounds a dictionary size up to the buffer size actually allocated.
pub(crate) fn dict_buf_size(dict_size: usize) -> usize {
    let dict_size = dict_size.max(DICT_SIZE_MIN);
    if dict_size >= usize::MAX - 15 {
        return usize::MAX;
    }
    (dict_size + 15) & !15
}

enum DictBuf<'a> {
    /// Cyclic buffer owned by the decoder; decoded bytes are flushed out and
    /// the write position wraps when the end is reached.
    Owned(Vec<u8>),
    /// Caller-provided output region; never wraps, never flushed.
    Ext(&'a mut [u8]),
}

/// Dictionary-backed output window.
///
/// `pos` is the write position inside the buffer. `processed` counts bytes
/// produced since the last dictionary reset and bounds admissible match
/// distances, so a reset in the middle of a linear buffer cannot reach data
/// decoded before it.
pub(crate) struct LzDecoder<'a> {
    buf: DictBuf<'a>,
    buf_size: usize,
    start: usize,
    pos: usize,
    limit: usize,
    processed: u64,
    pending_len: usize,
    pending_dist: usize,
}

impl LzDecoder<'static> {
    pub(crate) fn circular(dict_size: usize) -> Self {
        let buf_size = dict_buf_size(dict_size);
        Self::with_buf(DictBuf::Owned(vec![0; buf_size]), buf_size)
    }
}

impl<'a> LzDecoder<'a> {
    pub(crate) fn external(dst: &'a mut [u8]) -> Self {
        let buf_size = dst.len();
        Self::with_buf(DictBuf::Ext(dst), buf_size)
    }

    fn with_buf(buf: DictBuf<'a>, buf_size: usize) -> Self {
        Self {
            buf,
            buf_size,
            start: 0,
            pos: 0,
            limit: 0,
            processed: 0,
            pending_len: 0,
            pending_dist: 0,
        }
    }

    fn buf(&self) -> &[u8] {
        match &self.buf {
            DictBuf::Owned(buf) => buf,
            DictBuf::Ext(buf) => buf,
        }
    }

    fn buf_mut(&mut self) -> &mut [u8] {
        match &mut self.buf {
            DictBuf::Owned(buf) => buf,
            DictBuf::Ext(buf) => buf,
        }
    }

    /// Dictionary reset: matches may no longer reach behind this point. The
    /// write position is left alone so a linear buffer keeps appending.
    pub(crate) fn dict_reset(&mut self) {
        self.processed = 0;
    }

    pub(crate) fn set_limit(&mut self, limit: usize) {
        debug_assert!(limit <= self.buf_size);
        self.limit = limit;
    }

    #[inline]
    pub(crate) fn has_space(&self) -> bool {
        self.pos < self.limit
    }

    #[inline]
    pub(crate) fn has_pending(&self) -> bool {
        self.pending_len > 0
    }

    #[inline]
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.buf_size
    }

    #[inline]
    pub(crate) fn processed(&self) -> u64 {
        self.processed
    }

    pub(crate) fn get_byte(&self, dist: usize) -> u8 {
        let offset = if dist >= self.pos {
            self.buf_size + self.pos - dist - 1
        } else {
            self.pos - dist - 1
        };
        self.buf()[offset]
    }

    pub(crate) fn put_byte(&mut self, b: u8) {
        let pos = self.pos;
        self.buf_mut()[pos] = b;
        self.pos += 1;
        self.processed += 1;
    }

    /// Copies `len` bytes from `dist` back, clamped to the current limit;
    /// the overflow is recorded and finished by `repeat_pending`.
    pub(crate) fn repeat(&mut self, dist: usize, len: usize) -> Result<()> {
        if dist as u64 >= self.processed || dist >= self.buf_size {
            return Err(Error::CorruptionDetected);
        }

        let mut left = usize::min(self.limit - self.pos, len);
        self.pending_len = len - left;
        self.pending_dist = dist;
        self.processed += left as u64;

        let buf_size = self.buf_size;
        let mut pos = self.pos;
        let back = if pos < dist + 1 {
            // The distance reaches back across the wrap point of the cyclic
            // buffer.
            let back = buf_size + pos - dist - 1;
            let copy_size = usize::min(buf_size - back, left);
            self.buf_mut().copy_within(back..back + copy_size, pos);
            pos += copy_size;
            left -= copy_size;
            if left == 0 {
                self.pos = pos;
                return Ok(());
            }
            0
        } else {
            pos - dist - 1
        };

        let buf = self.buf_mut();
        if dist >= left {
            // No overlap between source and destination.
            let (src_part, dst_part) = buf.split_at_mut(pos);
            dst_part[..left].copy_from_slice(&src_part[back..back + left]);
            pos += left;
        } else {
            loop {
                let copy_size = left.min(pos - back);
                buf.copy_within(back..back + copy_size, pos);
                pos += copy_size;
                left -= copy_size;
                if left == 0 {
                    break;
                }
            }
        }
        self.pos = pos;
        Ok(())
    }

    pub(crate) fn repeat_pending(&mut self) -> Result<()> {
        if self.pending_len > 0 {
            let len = self.pending_len;
            self.pending_len = 0;
            self.repeat(self.pending_dist, len)?;
        }
        Ok(())
    }

    /// Stores a run of already-uncompressed bytes. The caller bounds `data`
    /// by the current limit.
    pub(crate) fn copy_uncompressed(&mut self, data: &[u8]) {
        let pos = self.pos;
        self.buf_mut()[pos..pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        self.processed += data.len() as u64;
    }

    /// Copies everything decoded since the previous flush into `out` and
    /// wraps the write position at the end of the cyclic buffer.
    pub(crate) fn flush(&mut self, out: &mut [u8]) -> usize {
        let copy_size = self.pos - self.start;
        out[..copy_size].copy_from_slice(&self.buf()[self.start..self.pos]);
        self.start = self.pos;
        if self.pos == self.buf_size {
            self.pos = 0;
            self.start = 0;
        }
        copy_size
    }
}
