use std::thread;

use log::debug;
use xxhash_rust::xxh32::xxh32;

use crate::{
    error::{Error, Result},
    lzma2_dec::{dict_size_from_prop, parse_chunk, ChunkParse, FinishMode, Lzma2Dec, LzmaStatus},
    PROP_HASH_FLAG, PROP_MASK,
};

/// One independently decodable block inside a batch: the compressed span it
/// occupies and the output span it produces, both as prefix sums.
#[derive(Clone, Copy)]
struct BlockDesc {
    pack_pos: usize,
    pack_size: usize,
    unpack_pos: usize,
    unpack_size: usize,
    finish: FinishMode,
}

impl BlockDesc {
    fn new() -> Self {
        Self {
            pack_pos: 0,
            pack_size: 0,
            unpack_pos: 0,
            unpack_size: 0,
            finish: FinishMode::Any,
        }
    }
}

/// One-shot LZMA2 decoder.
///
/// With more than one thread the stream is split at dictionary-reset
/// boundaries and the blocks are decoded concurrently, each one writing into
/// its own disjoint span of the destination buffer.
///
/// # Examples
/// ```
/// let compressed: Vec<u8> = vec![
///     0x00, 0x01, 0x00, 0x0C, 0x48, 0x65, 0x6C, 0x6C, 0x6F, 0x2C, 0x20, 0x77,
///     0x6F, 0x72, 0x6C, 0x64, 0x21, 0x00,
/// ];
/// let mut decompressed = vec![0u8; 13];
/// let mut decoder = fast_lzma2::Decoder::new(2);
/// let size = decoder.decompress(&mut decompressed, &compressed).unwrap();
/// assert_eq!(&decompressed[..size], b"Hello, world!");
/// ```
pub struct Decoder {
    nb_threads: u32,
    prop: Option<u8>,
}

impl Decoder {
    /// Creates a one-shot decoder running on up to `nb_threads` threads
    /// (clamped to 1..=256). The calling thread decodes the first block of
    /// every batch itself.
    pub fn new(nb_threads: u32) -> Self {
        Self {
            nb_threads: nb_threads.clamp(1, 256),
            prop: None,
        }
    }

    /// Supplies the stream property byte out of band, for containers that
    /// store it elsewhere. It applies to the next `decompress` call only,
    /// whose `src` must then start directly with the first chunk.
    pub fn set_prop(&mut self, prop: u8) -> Result<()> {
        dict_size_from_prop(prop & PROP_MASK)?;
        self.prop = Some(prop);
        Ok(())
    }

    /// Decompresses a whole stream and returns the number of bytes written
    /// to `dst`.
    pub fn decompress(&mut self, dst: &mut [u8], src: &[u8]) -> Result<usize> {
        let (prop, chunks) = match self.prop.take() {
            Some(prop) => (prop, src),
            None => {
                let (&prop, rest) = src.split_first().ok_or(Error::SrcSizeWrong)?;
                (prop, rest)
            }
        };
        let do_hash = prop & PROP_HASH_FLAG != 0;
        dict_size_from_prop(prop & PROP_MASK)?;
        debug!(
            "decompress: dict prop {:#04x}, hashed: {}",
            prop & PROP_MASK,
            do_hash
        );

        let (produced, consumed) = if self.nb_threads > 1 {
            decompress_blocks_mt(dst, chunks, self.nb_threads as usize)?
        } else {
            decompress_single(dst, chunks)?
        };

        if do_hash {
            let tail = chunks
                .get(consumed..consumed + 4)
                .ok_or(Error::SrcSizeWrong)?;
            let expected = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
            debug!("checking content hash");
            if xxh32(&dst[..produced], 0) != expected {
                return Err(Error::ChecksumWrong);
            }
        }
        Ok(produced)
    }
}

fn decompress_single(dst: &mut [u8], chunks: &[u8]) -> Result<(usize, usize)> {
    let capacity = dst.len();
    let mut dec = Lzma2Dec::new_external(dst);
    let mut src_len = chunks.len();
    let status = dec.decode_to_dic(capacity, chunks, &mut src_len, FinishMode::End)?;
    match status {
        LzmaStatus::FinishedWithMark => Ok((dec.dic_pos(), src_len)),
        LzmaStatus::NeedsMoreInput | LzmaStatus::MaybeFinishedWithoutMark => {
            Err(Error::SrcSizeWrong)
        }
        LzmaStatus::NotFinished => Err(Error::DstSizeTooSmall),
    }
}

/// Scans the stream into batches of up to `max_blocks` blocks, decoding each
/// batch in parallel before rebasing behind it.
fn decompress_blocks_mt(
    dst: &mut [u8],
    chunks: &[u8],
    max_blocks: usize,
) -> Result<(usize, usize)> {
    let mut src = chunks;
    let mut dst_rest = dst;
    let mut produced = 0usize;
    let mut consumed = 0usize;
    let mut blocks: Vec<BlockDesc> = Vec::with_capacity(max_blocks);

    loop {
        blocks.clear();
        let mut cur = BlockDesc::new();
        let mut pos = 0usize;
        let mut is_final = false;

        loop {
            if pos >= src.len() {
                return Err(Error::SrcSizeWrong);
            }
            let mut parsed = parse_chunk(&src[pos..]);
            if pos == 0 {
                // The chunk opening a batch always carries a dictionary
                // reset; it must not close the block it is starting.
                if let ChunkParse::DictReset(info) = parsed {
                    parsed = ChunkParse::Continue(info);
                }
            }
            match parsed {
                ChunkParse::MoreData => return Err(Error::SrcSizeWrong),
                ChunkParse::Error => return Err(Error::CorruptionDetected),
                ChunkParse::Final => {
                    cur.finish = FinishMode::End;
                    cur.pack_size += 1;
                    blocks.push(cur);
                    is_final = true;
                    break;
                }
                ChunkParse::DictReset(info) => {
                    blocks.push(cur);
                    cur = BlockDesc::new();
                    if blocks.len() == max_blocks {
                        break;
                    }
                    cur.pack_size += info.pack_size;
                    cur.unpack_size += info.unpack_size;
                    pos += info.pack_size;
                }
                ChunkParse::Continue(info) => {
                    cur.pack_size += info.pack_size;
                    cur.unpack_size += info.unpack_size;
                    pos += info.pack_size;
                }
            }
        }

        let batch_produced = run_block_batch(&mut blocks, src, dst_rest)?;
        let batch_consumed: usize = blocks.iter().map(|block| block.pack_size).sum();
        produced += batch_produced;
        consumed += batch_consumed;

        if is_final {
            return Ok((produced, consumed));
        }
        src = &src[pos..];
        let rest = std::mem::take(&mut dst_rest);
        dst_rest = &mut rest[batch_produced..];
    }
}

/// Decodes one batch: blocks 1.. on worker threads, block 0 on the calling
/// thread, each into a disjoint slice of `dst`. The first error in block
/// order wins.
fn run_block_batch(blocks: &mut [BlockDesc], src: &[u8], dst: &mut [u8]) -> Result<usize> {
    let mut pack_pos = 0usize;
    let mut unpack_pos = 0usize;
    for block in blocks.iter_mut() {
        block.pack_pos = pack_pos;
        block.unpack_pos = unpack_pos;
        pack_pos += block.pack_size;
        unpack_pos += block.unpack_size;
    }
    if dst.len() < unpack_pos {
        return Err(Error::DstSizeTooSmall);
    }

    let mut slices = Vec::with_capacity(blocks.len());
    let mut rest = &mut dst[..unpack_pos];
    for block in blocks.iter() {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(block.unpack_size);
        slices.push(head);
        rest = tail;
    }

    debug!("decoding a batch of {} blocks", blocks.len());
    let mut results: Vec<Result<usize>> = Vec::with_capacity(blocks.len());
    thread::scope(|scope| {
        let mut slices = slices.into_iter();
        let mut blocks = blocks.iter();
        let first = blocks.next().zip(slices.next());

        let mut handles = Vec::new();
        for (block, slice) in blocks.zip(slices) {
            handles.push(scope.spawn(move || {
                let span = &src[block.pack_pos..block.pack_pos + block.pack_size];
                decode_block(block, span, slice)
            }));
        }

        if let Some((block, slice)) = first {
            let span = &src[block.pack_pos..block.pack_pos + block.pack_size];
            results.push(decode_block(block, span, slice));
        }
        for handle in handles {
            results.push(handle.join().expect("block decoder thread panicked"));
        }
    });

    let mut total = 0usize;
    for result in results {
        total += result?;
    }
    debug_assert_eq!(total, unpack_pos);
    Ok(total)
}

fn decode_block(block: &BlockDesc, src: &[u8], dst: &mut [u8]) -> Result<usize> {
    let capacity = dst.len();
    let mut dec = Lzma2Dec::new_external(dst);
    let mut src_len = src.len();
    let status = dec.decode_to_dic(capacity, src, &mut src_len, block.finish)?;
    if block.finish == FinishMode::End && status != LzmaStatus::FinishedWithMark {
        return Err(Error::SrcSizeWrong);
    }
    if dec.dic_pos() != capacity {
        return Err(Error::CorruptionDetected);
    }
    Ok(capacity)
}
