use log::debug;

use crate::{
    decoder::{DecodeOutcome, LzmaDecoder, LCLP_MAX},
    error::{Error, Result},
    lz::LzDecoder,
    range_dec::{RangeDecoder, REQUIRED_INPUT_MAX},
};

/// Largest valid dictionary property in the stream header byte.
pub(crate) const DICT_PROP_MAX: u8 = 40;

/// Largest valid packed lc/lp/pb byte: (4 * 5 + 4) * 9 + 8.
const PROPS_MAX: u8 = 224;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FinishMode {
    /// Stop as soon as the dictionary limit is reached.
    Any,
    /// The stream must end (with its marker) once the limit is reached.
    End,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LzmaStatus {
    FinishedWithMark,
    NotFinished,
    NeedsMoreInput,
    MaybeFinishedWithoutMark,
}

#[derive(Clone, Copy)]
pub(crate) struct ChunkInfo {
    pub(crate) control: u8,
    pub(crate) header_size: usize,
    /// Whole chunk size, header bytes included.
    pub(crate) pack_size: usize,
    pub(crate) unpack_size: usize,
    pub(crate) props: Option<u8>,
}

/// Outcome of classifying the chunk starting at the head of `src`.
pub(crate) enum ChunkParse {
    /// A data chunk that continues the current block.
    Continue(ChunkInfo),
    /// A data chunk that resets the dictionary and starts a new block.
    DictReset(ChunkInfo),
    /// The 0x00 end-of-stream marker.
    Final,
    /// Not enough bytes to classify the header.
    MoreData,
    /// The control byte is not part of the format.
    Error,
}

// Control byte layout:
//   0x00        end of stream
//   0x01        uncompressed chunk, dictionary reset
//   0x02        uncompressed chunk
//   0x03..0x7F  invalid
//   0x80..0xFF  LZMA chunk; bits 6..5 select none / state / state+props /
//               state+props+dict reset, low 5 bits extend the unpacked size
pub(crate) fn parse_chunk(src: &[u8]) -> ChunkParse {
    let Some(&control) = src.first() else {
        return ChunkParse::MoreData;
    };

    if control == 0x00 {
        return ChunkParse::Final;
    }

    if control < 0x80 {
        if control > 0x02 {
            return ChunkParse::Error;
        }
        if src.len() < 3 {
            return ChunkParse::MoreData;
        }
        let unpack_size = u16::from_be_bytes([src[1], src[2]]) as usize + 1;
        let info = ChunkInfo {
            control,
            header_size: 3,
            pack_size: 3 + unpack_size,
            unpack_size,
            props: None,
        };
        return if control == 0x01 {
            ChunkParse::DictReset(info)
        } else {
            ChunkParse::Continue(info)
        };
    }

    let header_size = if control >= 0xC0 { 6 } else { 5 };
    if src.len() < header_size {
        return ChunkParse::MoreData;
    }
    let unpack_size =
        (((control & 0x1F) as usize) << 16) + u16::from_be_bytes([src[1], src[2]]) as usize + 1;
    let pack_size = u16::from_be_bytes([src[3], src[4]]) as usize + 1;
    let info = ChunkInfo {
        control,
        header_size,
        pack_size: header_size + pack_size,
        unpack_size,
        props: (header_size == 6).then(|| src[5]),
    };
    if control >= 0xE0 {
        ChunkParse::DictReset(info)
    } else {
        ChunkParse::Continue(info)
    }
}

/// Splits a packed properties byte into (lc, lp, pb).
pub(crate) fn decode_props(props: u8) -> Result<(u32, u32, u32)> {
    if props > PROPS_MAX {
        return Err(Error::CorruptionDetected);
    }
    let pb = props / (9 * 5);
    let rem = props - pb * 9 * 5;
    let lp = rem / 9;
    let lc = rem - lp * 9;
    if (lc + lp) as u32 > LCLP_MAX {
        return Err(Error::CorruptionDetected);
    }
    Ok((lc as u32, lp as u32, pb as u32))
}

/// Dictionary size encoded by the stream property byte.
pub(crate) fn dict_size_from_prop(prop: u8) -> Result<u32> {
    if prop > DICT_PROP_MAX {
        return Err(Error::CorruptionDetected);
    }
    if prop == DICT_PROP_MAX {
        return Ok(u32::MAX);
    }
    Ok((2 | (prop & 1) as u32) << (prop / 2 + 11))
}

/// Sums the unpacked size of every chunk up to the end marker. `Ok(None)`
/// means the input ran out before the marker.
pub(crate) fn chunks_unpack_size(src: &[u8]) -> Result<Option<u64>> {
    let mut pos = 0usize;
    let mut total = 0u64;
    loop {
        if pos > src.len() {
            return Ok(None);
        }
        match parse_chunk(&src[pos..]) {
            ChunkParse::Final => return Ok(Some(total)),
            ChunkParse::MoreData => return Ok(None),
            ChunkParse::Error => return Err(Error::CorruptionDetected),
            ChunkParse::Continue(info) | ChunkParse::DictReset(info) => {
                total += info.unpack_size as u64;
                pos += info.pack_size;
            }
        }
    }
}

enum Stage {
    AwaitingHeader,
    Uncompressed { remaining: usize },
    LzmaPayload { primed: bool },
    Finished,
}

/// LZMA2 chunk-stream decoder over a dictionary window.
///
/// The decoder consumes arbitrary slices of the compressed stream and writes
/// into its dictionary up to a caller-set limit. Between calls it remembers
/// the framing stage, the range-coder registers and how much of the current
/// chunk is outstanding.
pub(crate) struct Lzma2Dec<'a> {
    lz: LzDecoder<'a>,
    lzma: Option<LzmaDecoder>,
    stage: Stage,
    pack_remaining: usize,
    unpack_remaining: usize,
    rc_range: u32,
    rc_code: u32,
    need_dict_reset: bool,
    need_props: bool,
    seam: bool,
    temp: [u8; 2 * REQUIRED_INPUT_MAX],
    temp_size: usize,
}

impl Lzma2Dec<'static> {
    /// Streaming decoder with an owned cyclic dictionary. Input starvation
    /// shorter than the symbol margin is stashed between calls, so callers
    /// may feed arbitrarily small pieces.
    pub(crate) fn new_streaming(dict_size: u32) -> Self {
        let mut dec = Self::with_dict(LzDecoder::circular(dict_size as usize));
        dec.seam = true;
        dec
    }
}

impl<'a> Lzma2Dec<'a> {
    /// Decoder writing straight into a caller-provided buffer, which also
    /// serves as the dictionary.
    pub(crate) fn new_external(dst: &'a mut [u8]) -> Self {
        Self::with_dict(LzDecoder::external(dst))
    }

    fn with_dict(lz: LzDecoder<'a>) -> Self {
        Self {
            lz,
            lzma: None,
            stage: Stage::AwaitingHeader,
            pack_remaining: 0,
            unpack_remaining: 0,
            rc_range: 0,
            rc_code: 0,
            need_dict_reset: true,
            need_props: true,
            seam: false,
            temp: [0; 2 * REQUIRED_INPUT_MAX],
            temp_size: 0,
        }
    }

    #[inline]
    pub(crate) fn dic_pos(&self) -> usize {
        self.lz.pos()
    }

    /// Decodes into the dictionary until `limit`, the end of `src`, or the
    /// end of the stream. `src_len` is replaced with the bytes consumed.
    pub(crate) fn decode_to_dic(
        &mut self,
        limit: usize,
        src: &[u8],
        src_len: &mut usize,
        finish: FinishMode,
    ) -> Result<LzmaStatus> {
        let in_size = *src_len;
        let mut pos = 0usize;

        // Splice bytes stashed at the previous seam with the new input.
        if self.temp_size > 0 {
            let take = in_size.min(self.temp.len() - self.temp_size);
            let mut window = [0u8; 2 * REQUIRED_INPUT_MAX];
            window[..self.temp_size].copy_from_slice(&self.temp[..self.temp_size]);
            window[self.temp_size..self.temp_size + take].copy_from_slice(&src[..take]);
            let window_len = self.temp_size + take;

            let (status, consumed) = self.decode_window(limit, &window[..window_len], 0, finish)?;
            if consumed < self.temp_size {
                if status == LzmaStatus::NeedsMoreInput {
                    // Still starved: the whole window lies inside the current
                    // chunk, so the spliced bytes can join the stash.
                    self.temp[..window_len - consumed]
                        .copy_from_slice(&window[consumed..window_len]);
                    self.temp_size = window_len - consumed;
                    *src_len = take;
                } else {
                    // Output-limited: hand the spliced bytes back untouched.
                    self.temp.copy_within(consumed..self.temp_size, 0);
                    self.temp_size -= consumed;
                    *src_len = 0;
                }
                return Ok(status);
            }
            pos = consumed - self.temp_size;
            self.temp_size = 0;
        }

        let (status, end) = self.decode_window(limit, &src[..in_size], pos, finish)?;
        pos = end;

        if self.seam && status == LzmaStatus::NeedsMoreInput && pos < in_size {
            let tail = in_size - pos;
            debug_assert!(tail < self.temp.len());
            self.temp[..tail].copy_from_slice(&src[pos..in_size]);
            self.temp_size = tail;
            pos = in_size;
        }

        *src_len = pos;
        Ok(status)
    }

    /// One pass of the stage machine over a single input window.
    fn decode_window(
        &mut self,
        limit: usize,
        window: &[u8],
        mut pos: usize,
        finish: FinishMode,
    ) -> Result<(LzmaStatus, usize)> {
        let status = loop {
            match self.stage {
                Stage::Finished => break LzmaStatus::FinishedWithMark,

                Stage::AwaitingHeader => {
                    if self.lz.pos() == limit {
                        match finish {
                            FinishMode::Any => break LzmaStatus::NotFinished,
                            FinishMode::End => match parse_chunk(&window[pos..]) {
                                ChunkParse::Final => {
                                    pos += 1;
                                    self.stage = Stage::Finished;
                                    debug!("found end mark");
                                    break LzmaStatus::FinishedWithMark;
                                }
                                ChunkParse::MoreData => {
                                    break if pos == window.len() {
                                        LzmaStatus::MaybeFinishedWithoutMark
                                    } else {
                                        LzmaStatus::NeedsMoreInput
                                    };
                                }
                                ChunkParse::Error => return Err(Error::CorruptionDetected),
                                ChunkParse::Continue(_) | ChunkParse::DictReset(_) => {
                                    break LzmaStatus::NotFinished
                                }
                            },
                        }
                    }
                    match parse_chunk(&window[pos..]) {
                        ChunkParse::MoreData => break LzmaStatus::NeedsMoreInput,
                        ChunkParse::Error => return Err(Error::CorruptionDetected),
                        ChunkParse::Final => {
                            pos += 1;
                            self.stage = Stage::Finished;
                            debug!("found end mark");
                            break LzmaStatus::FinishedWithMark;
                        }
                        ChunkParse::Continue(info) | ChunkParse::DictReset(info) => {
                            self.start_chunk(&info)?;
                            pos += info.header_size;
                        }
                    }
                }

                Stage::Uncompressed { remaining } => {
                    let out_space = limit - self.lz.pos();
                    if out_space == 0 {
                        break LzmaStatus::NotFinished;
                    }
                    let in_avail = window.len() - pos;
                    if in_avail == 0 {
                        break LzmaStatus::NeedsMoreInput;
                    }
                    let n = remaining.min(out_space).min(in_avail);
                    self.lz.copy_uncompressed(&window[pos..pos + n]);
                    pos += n;
                    self.stage = if remaining == n {
                        Stage::AwaitingHeader
                    } else {
                        Stage::Uncompressed {
                            remaining: remaining - n,
                        }
                    };
                }

                Stage::LzmaPayload { primed } => {
                    let chunk_end = pos + self.pack_remaining;
                    let complete = chunk_end <= window.len();
                    let rc_window = &window[..chunk_end.min(window.len())];
                    let mut rc =
                        RangeDecoder::resume(rc_window, pos, complete, self.rc_range, self.rc_code);

                    if !primed {
                        if !rc.has_symbol_margin() {
                            break LzmaStatus::NeedsMoreInput;
                        }
                        rc.prime()?;
                        self.stage = Stage::LzmaPayload { primed: true };
                    }

                    let chunk_limit = limit.min(self.lz.pos() + self.unpack_remaining);
                    self.lz.set_limit(chunk_limit);
                    let produced_before = self.lz.pos();
                    let lzma = self.lzma.as_mut().ok_or(Error::CorruptionDetected)?;
                    let outcome = lzma.decode(&mut self.lz, &mut rc);

                    self.unpack_remaining -= self.lz.pos() - produced_before;
                    let stalled = match outcome? {
                        DecodeOutcome::EndMarker => return Err(Error::CorruptionDetected),
                        DecodeOutcome::NeedsMoreInput => Some(LzmaStatus::NeedsMoreInput),
                        DecodeOutcome::LimitReached => {
                            if self.unpack_remaining == 0 {
                                if self.lz.has_pending() {
                                    return Err(Error::CorruptionDetected);
                                }
                                if rc.try_finish_chunk()? {
                                    self.stage = Stage::AwaitingHeader;
                                    None
                                } else {
                                    Some(LzmaStatus::NeedsMoreInput)
                                }
                            } else {
                                Some(LzmaStatus::NotFinished)
                            }
                        }
                    };

                    self.pack_remaining -= rc.pos() - pos;
                    pos = rc.pos();
                    let (range, code) = rc.save();
                    self.rc_range = range;
                    self.rc_code = code;

                    if let Some(status) = stalled {
                        break status;
                    }
                }
            }
        };
        Ok((status, pos))
    }

    /// Applies the reset behavior requested by a chunk header and arms the
    /// payload stage.
    fn start_chunk(&mut self, info: &ChunkInfo) -> Result<()> {
        let control = info.control;

        if control >= 0xE0 || control == 0x01 {
            self.need_props = true;
            self.need_dict_reset = false;
            self.lz.dict_reset();
            self.lzma = None;
        } else if self.need_dict_reset {
            return Err(Error::CorruptionDetected);
        }

        if control >= 0x80 {
            if let Some(props) = info.props {
                let (lc, lp, pb) = decode_props(props)?;
                self.lzma = Some(LzmaDecoder::new(lc, lp, pb));
                self.need_props = false;
            } else if self.need_props {
                return Err(Error::CorruptionDetected);
            } else if control >= 0xA0 {
                if let Some(lzma) = self.lzma.as_mut() {
                    lzma.reset();
                }
            }
            self.pack_remaining = info.pack_size - info.header_size;
            self.unpack_remaining = info.unpack_size;
            self.stage = Stage::LzmaPayload { primed: false };
        } else {
            self.stage = Stage::Uncompressed {
                remaining: info.unpack_size,
            };
        }
        Ok(())
    }

    /// Buffer-to-buffer decoding through the cyclic dictionary, for the
    /// streaming single-threaded path.
    pub(crate) fn decode_to_buf(
        &mut self,
        dst: &mut [u8],
        dst_pos: &mut usize,
        src: &[u8],
        src_pos: &mut usize,
        finish: FinishMode,
    ) -> Result<LzmaStatus> {
        loop {
            let out_left = dst.len() - *dst_pos;
            let cur_limit = (self.lz.pos() + out_left).min(self.lz.capacity());

            let mut used = src.len() - *src_pos;
            let status = self.decode_to_dic(cur_limit, &src[*src_pos..], &mut used, finish)?;
            *src_pos += used;
            *dst_pos += self.lz.flush(&mut dst[*dst_pos..]);

            match status {
                LzmaStatus::NotFinished if *dst_pos < dst.len() => {
                    // The limit was the wrap point of the cyclic buffer.
                }
                _ => return Ok(status),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_final_marker() {
        assert!(matches!(parse_chunk(&[0x00]), ChunkParse::Final));
    }

    #[test]
    fn parse_empty_needs_more() {
        assert!(matches!(parse_chunk(&[]), ChunkParse::MoreData));
    }

    #[test]
    fn parse_reserved_controls() {
        assert!(matches!(parse_chunk(&[0x03]), ChunkParse::Error));
        assert!(matches!(parse_chunk(&[0x7F]), ChunkParse::Error));
    }

    #[test]
    fn parse_uncompressed_headers() {
        match parse_chunk(&[0x01, 0x00, 0x0A]) {
            ChunkParse::DictReset(info) => {
                assert_eq!(info.header_size, 3);
                assert_eq!(info.unpack_size, 11);
                assert_eq!(info.pack_size, 14);
                assert!(info.props.is_none());
            }
            _ => panic!("expected dict reset"),
        }
        assert!(matches!(
            parse_chunk(&[0x02, 0x00, 0x00]),
            ChunkParse::Continue(_)
        ));
        assert!(matches!(parse_chunk(&[0x01, 0x00]), ChunkParse::MoreData));
    }

    #[test]
    fn parse_lzma_headers() {
        // 0xE0: dict reset, carries a props byte.
        match parse_chunk(&[0xE0, 0x00, 0x04, 0x00, 0x09, 0x5D, 0xFF]) {
            ChunkParse::DictReset(info) => {
                assert_eq!(info.header_size, 6);
                assert_eq!(info.unpack_size, 5);
                assert_eq!(info.pack_size, 6 + 10);
                assert_eq!(info.props, Some(0x5D));
            }
            _ => panic!("expected dict reset"),
        }
        // 0x80: plain continuation, no props byte, high size bits used.
        match parse_chunk(&[0x81, 0x00, 0x00, 0x00, 0x00]) {
            ChunkParse::Continue(info) => {
                assert_eq!(info.header_size, 5);
                assert_eq!(info.unpack_size, (1 << 16) + 1);
                assert_eq!(info.pack_size, 5 + 1);
                assert!(info.props.is_none());
            }
            _ => panic!("expected continuation"),
        }
        assert!(matches!(
            parse_chunk(&[0xC0, 0x00, 0x00, 0x00, 0x00]),
            ChunkParse::MoreData
        ));
    }

    #[test]
    fn props_byte_bounds() {
        assert_eq!(decode_props(0x00).unwrap(), (0, 0, 0));
        // lc=3, lp=0, pb=2, the common default.
        assert_eq!(decode_props(0x5D).unwrap(), (3, 0, 2));
        assert!(decode_props(225).is_err());
        // lc=4, lp=1 exceeds the lc + lp limit.
        assert!(decode_props(13).is_err());
    }

    #[test]
    fn dict_prop_bounds() {
        assert_eq!(dict_size_from_prop(0).unwrap(), 1 << 12);
        assert_eq!(dict_size_from_prop(1).unwrap(), 3 << 11);
        assert_eq!(dict_size_from_prop(38).unwrap(), 1 << 31);
        assert_eq!(dict_size_from_prop(40).unwrap(), u32::MAX);
        assert_eq!(dict_size_from_prop(41), Err(Error::CorruptionDetected));
    }

    #[test]
    fn unpack_size_walks_chunks() {
        let stream = [0x01, 0x00, 0x02, b'a', b'b', b'c', 0x02, 0x00, 0x00, b'd', 0x00];
        assert_eq!(chunks_unpack_size(&stream), Ok(Some(4)));
        assert_eq!(chunks_unpack_size(&stream[..5]), Ok(None));
        assert_eq!(chunks_unpack_size(&[0x01, 0x00]), Ok(None));
        assert_eq!(
            chunks_unpack_size(&[0x55]),
            Err(Error::CorruptionDetected)
        );
    }
}
