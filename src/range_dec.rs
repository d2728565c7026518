use crate::error::{Error, Result};

const TOP_VALUE: u32 = 0x0100_0000;
const SHIFT_BITS: u32 = 8;
const BIT_MODEL_TOTAL_BITS: u32 = 11;
const BIT_MODEL_TOTAL: u32 = 1 << BIT_MODEL_TOTAL_BITS;
const MOVE_BITS: u32 = 5;

pub(crate) const PROB_INIT: u16 = (BIT_MODEL_TOTAL / 2) as u16;

/// Worst-case input bytes one LZMA symbol may consume. A decoder entered with
/// at least this much lookahead can never run off the end of its window.
pub(crate) const REQUIRED_INPUT_MAX: usize = 20;

/// Range decoder over a window of compressed bytes.
///
/// The window is rebuilt for every call; `range` and `code` survive between
/// calls inside the owning chunk decoder. When `complete` is set the window
/// ends exactly at the chunk payload boundary and reads past it are a data
/// error rather than a request for more input.
pub(crate) struct RangeDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
    complete: bool,
    range: u32,
    code: u32,
}

impl<'a> RangeDecoder<'a> {
    pub(crate) fn resume(
        buf: &'a [u8],
        pos: usize,
        complete: bool,
        range: u32,
        code: u32,
    ) -> Self {
        Self {
            buf,
            pos,
            complete,
            range,
            code,
        }
    }

    /// Reads the five priming bytes at the start of a chunk payload. The
    /// first byte of a range-coded stream is always zero.
    pub(crate) fn prime(&mut self) -> Result<()> {
        if self.next_byte()? != 0x00 {
            return Err(Error::CorruptionDetected);
        }
        let mut code = 0u32;
        for _ in 0..4 {
            code = (code << SHIFT_BITS) | self.next_byte()? as u32;
        }
        self.code = code;
        self.range = u32::MAX;
        Ok(())
    }

    #[inline]
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub(crate) fn save(&self) -> (u32, u32) {
        (self.range, self.code)
    }

    /// True when decoding one more symbol cannot read past the window.
    #[inline]
    pub(crate) fn has_symbol_margin(&self) -> bool {
        self.complete || self.pos + REQUIRED_INPUT_MAX <= self.buf.len()
    }

    /// Runs the single normalization the last symbol may still owe, then
    /// checks that the chunk payload was consumed exactly, with the code
    /// register drained the way an encoder flush leaves it. Returns `false`
    /// when the owed byte has not arrived in the window yet.
    pub(crate) fn try_finish_chunk(&mut self) -> Result<bool> {
        if !self.complete && self.pos == self.buf.len() && self.range < TOP_VALUE {
            return Ok(false);
        }
        self.normalize()?;
        if !(self.complete && self.pos == self.buf.len() && self.code == 0) {
            return Err(Error::CorruptionDetected);
        }
        Ok(true)
    }

    fn next_byte(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or(Error::CorruptionDetected)?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn normalize(&mut self) -> Result<()> {
        if self.range < TOP_VALUE {
            let b = self.next_byte()? as u32;
            self.code = (self.code << SHIFT_BITS) | b;
            self.range <<= SHIFT_BITS;
        }
        Ok(())
    }

    pub(crate) fn decode_bit(&mut self, prob: &mut u16) -> Result<u32> {
        self.normalize()?;
        let bound = (self.range >> BIT_MODEL_TOTAL_BITS) * (*prob as u32);

        if self.code < bound {
            self.range = bound;
            *prob += (BIT_MODEL_TOTAL as u16 - *prob) >> MOVE_BITS;
            Ok(0)
        } else {
            self.range -= bound;
            self.code -= bound;
            *prob -= *prob >> MOVE_BITS;
            Ok(1)
        }
    }

    pub(crate) fn decode_bit_tree(&mut self, probs: &mut [u16]) -> Result<u32> {
        let mut symbol = 1usize;
        loop {
            symbol = (symbol << 1) | self.decode_bit(&mut probs[symbol])? as usize;
            if symbol >= probs.len() {
                break;
            }
        }
        Ok((symbol - probs.len()) as u32)
    }

    pub(crate) fn decode_reverse_bit_tree(&mut self, probs: &mut [u16]) -> Result<u32> {
        let mut symbol = 1usize;
        let mut i = 0;
        let mut result = 0u32;
        loop {
            let bit = self.decode_bit(&mut probs[symbol])?;
            symbol = (symbol << 1) | bit as usize;
            result |= bit << i;
            i += 1;
            if symbol >= probs.len() {
                break;
            }
        }
        Ok(result)
    }

    pub(crate) fn decode_direct_bits(&mut self, count: u32) -> Result<u32> {
        let mut result = 0u32;
        for _ in 0..count {
            self.normalize()?;
            self.range >>= 1;
            let t = (self.code.wrapping_sub(self.range)) >> 31;
            self.code -= self.range & (t.wrapping_sub(1));
            result = (result << 1) | (1u32.wrapping_sub(t));
        }
        Ok(result)
    }
}
