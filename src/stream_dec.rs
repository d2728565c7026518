use std::{collections::VecDeque, thread};

use log::debug;
use xxhash_rust::xxh32::Xxh32;

use crate::{
    error::{Error, Result},
    lzma2_dec::{dict_size_from_prop, parse_chunk, ChunkParse, FinishMode, Lzma2Dec, LzmaStatus},
    range_dec::REQUIRED_INPUT_MAX,
    InBuffer, OutBuffer, PROP_HASH_FLAG, PROP_MASK,
};

/// Capacity of one input buffer node.
pub(crate) const MT_INPUT_SIZE: usize = 1 << 18;

/// Fixed-capacity node of the streaming input chain.
struct InBufNode {
    buf: Box<[u8]>,
    length: usize,
}

impl InBufNode {
    fn new() -> Self {
        Self {
            buf: vec![0u8; MT_INPUT_SIZE].into_boxed_slice(),
            length: 0,
        }
    }
}

/// Owned chain of input nodes, addressed by absolute node index so block
/// spans stay valid while the consumed prefix is recycled.
///
/// A node is closed once its free space drops below the decoder's input
/// margin; the margin bytes are copied into the next node so every chunk
/// header and symbol can be decoded from a single node.
struct InBufChain {
    nodes: VecDeque<InBufNode>,
    base: usize,
}

impl InBufChain {
    fn new() -> Self {
        let mut nodes = VecDeque::new();
        nodes.push_back(InBufNode::new());
        Self { nodes, base: 0 }
    }

    fn node(&self, index: usize) -> &InBufNode {
        &self.nodes[index - self.base]
    }

    fn tail_index(&self) -> usize {
        self.base + self.nodes.len() - 1
    }

    fn tail_mut(&mut self) -> &mut InBufNode {
        self.nodes.back_mut().expect("chain is never empty")
    }

    /// Appends a fresh tail seeded with the overlap region of the old tail.
    fn grow(&mut self) -> usize {
        let mut node = InBufNode::new();
        let tail = self.nodes.back().expect("chain is never empty");
        node.buf[..REQUIRED_INPUT_MAX]
            .copy_from_slice(&tail.buf[tail.length - REQUIRED_INPUT_MAX..tail.length]);
        node.length = REQUIRED_INPUT_MAX;
        self.nodes.push_back(node);
        self.tail_index()
    }

    /// Frees every node before `keep`, which becomes the new head.
    fn recycle(&mut self, keep: usize) {
        while self.base < keep {
            self.nodes.pop_front();
            self.base += 1;
        }
    }

    fn reset(&mut self) {
        self.nodes.truncate(1);
        self.tail_mut().length = 0;
        self.base = 0;
    }
}

/// Span of compressed bytes across the chain feeding one block.
#[derive(Clone, Copy, Default)]
struct InputBlock {
    first: usize,
    last: usize,
    start_pos: usize,
    end_pos: usize,
    unpack_size: usize,
}

/// A closed block waiting to be decoded and written out.
struct StreamBlock {
    span: InputBlock,
    out: Vec<u8>,
}

enum BlockEvent {
    /// A block boundary was found; `is_final` for the end-of-stream marker.
    Boundary { is_final: bool },
    /// The chain ran out of parseable bytes.
    NeedBytes,
}

enum Stage {
    Init,
    Decomp,
    Write,
    Hash,
    Finished,
}

/// Multi-threaded streaming state: the input chain, the open block being
/// parsed and the batch of closed blocks.
struct MtDec {
    chain: InBufChain,
    open: InputBlock,
    blocks: Vec<StreamBlock>,
    max_blocks: usize,
    write_block: usize,
    write_pos: usize,
    is_final: bool,
    /// Bytes past the end marker that were already buffered and cannot be
    /// handed back to the caller; the hash stage drains them first.
    tail_stash: Vec<u8>,
}

impl MtDec {
    fn new(max_blocks: usize) -> Self {
        Self {
            chain: InBufChain::new(),
            open: InputBlock::default(),
            blocks: Vec::new(),
            max_blocks,
            write_block: 0,
            write_pos: 0,
            is_final: false,
            tail_stash: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.chain.reset();
        self.open = InputBlock::default();
        self.blocks.clear();
        self.write_block = 0;
        self.write_pos = 0;
        self.is_final = false;
        self.tail_stash.clear();
    }

    /// Parses chunks of the open block out of its tail node. Stops at a
    /// block boundary or when the buffered bytes run out.
    fn parse_block(&mut self) -> Result<BlockEvent> {
        let node = self.chain.node(self.open.last);
        let mut first = self.open.unpack_size == 0;
        while self.open.end_pos < node.length {
            let mut parsed = parse_chunk(&node.buf[self.open.end_pos..node.length]);
            if first {
                if let ChunkParse::DictReset(info) = parsed {
                    parsed = ChunkParse::Continue(info);
                }
            }
            match parsed {
                ChunkParse::Error => return Err(Error::CorruptionDetected),
                ChunkParse::MoreData => return Ok(BlockEvent::NeedBytes),
                ChunkParse::Final => {
                    self.open.end_pos += 1;
                    return Ok(BlockEvent::Boundary { is_final: true });
                }
                ChunkParse::DictReset(_) => {
                    return Ok(BlockEvent::Boundary { is_final: false });
                }
                ChunkParse::Continue(info) => {
                    self.open.end_pos += info.pack_size;
                    self.open.unpack_size += info.unpack_size;
                    first = false;
                }
            }
        }
        Ok(BlockEvent::NeedBytes)
    }

    /// Moves caller input into the chain, closing blocks as their boundaries
    /// appear. Returns `true` once a full batch (or the final block) is
    /// buffered and ready to decode.
    fn load_input(&mut self, input: &mut InBuffer<'_>) -> Result<bool> {
        let mut appended = 0usize;
        loop {
            let tail_length = self.chain.node(self.open.last).length;
            if input.pos >= input.src.len() && self.open.end_pos >= tail_length {
                return Ok(false);
            }

            let mut starved = false;
            if self.open.end_pos < tail_length {
                match self.parse_block()? {
                    BlockEvent::Boundary { is_final } => {
                        let mut out = Vec::new();
                        out.try_reserve_exact(self.open.unpack_size)
                            .map_err(|_| Error::MemoryAllocation)?;
                        out.resize(self.open.unpack_size, 0);

                        if is_final {
                            // Bytes past the marker (the digest, if any) are
                            // not block input. Whatever entered the chain
                            // from the current call is handed back to the
                            // caller; older bytes go to the hash stash.
                            let node = self.chain.node(self.open.last);
                            let rewind = node.length - self.open.end_pos;
                            let give_back = rewind.min(appended).min(input.pos);
                            self.tail_stash.extend_from_slice(
                                &node.buf[self.open.end_pos..node.length - give_back],
                            );
                            input.pos -= give_back;
                            self.is_final = true;
                        }

                        let span = self.open;
                        self.blocks.push(StreamBlock { span, out });
                        if self.blocks.len() == self.max_blocks || is_final {
                            return Ok(true);
                        }
                        self.open = InputBlock {
                            first: span.last,
                            last: span.last,
                            start_pos: span.end_pos,
                            end_pos: span.end_pos,
                            unpack_size: 0,
                        };
                        continue;
                    }
                    BlockEvent::NeedBytes => starved = true,
                }
            }

            let tail_length = self.chain.node(self.open.last).length;
            if tail_length >= MT_INPUT_SIZE
                && self.open.end_pos + REQUIRED_INPUT_MAX >= tail_length
            {
                self.open.last = self.chain.grow();
                self.open.end_pos -= MT_INPUT_SIZE - REQUIRED_INPUT_MAX;
            }

            let tail = self.chain.tail_mut();
            let to_read = (input.src.len() - input.pos).min(MT_INPUT_SIZE - tail.length);
            tail.buf[tail.length..tail.length + to_read]
                .copy_from_slice(&input.src[input.pos..input.pos + to_read]);
            tail.length += to_read;
            input.pos += to_read;
            appended += to_read;

            if starved && to_read == 0 {
                return Ok(false);
            }
        }
    }

    /// Decodes the buffered batch: blocks 1.. on worker threads, block 0 on
    /// the calling thread. Afterwards the consumed chain prefix is recycled
    /// and the next open block continues from the last block's tail.
    fn decode_blocks(&mut self) -> Result<()> {
        debug!("decoding a batch of {} blocks", self.blocks.len());
        let chain = &self.chain;
        let is_final = self.is_final;
        let count = self.blocks.len();

        let mut results: Vec<Result<()>> = Vec::with_capacity(count);
        {
            let (first, rest) = self.blocks.split_first_mut().expect("batch is never empty");
            thread::scope(|scope| {
                let mut handles = Vec::with_capacity(rest.len());
                for (index, block) in rest.iter_mut().enumerate() {
                    let finish_end = is_final && index + 2 == count;
                    handles.push(scope.spawn(move || decode_chain_block(block, chain, finish_end)));
                }
                results.push(decode_chain_block(first, chain, is_final && count == 1));
                for handle in handles {
                    results.push(handle.join().expect("block decoder thread panicked"));
                }
            });
        }
        for result in results {
            result?;
        }

        let last_span = self.blocks.last().expect("batch is never empty").span;
        self.chain.recycle(last_span.last);
        self.open = InputBlock {
            first: last_span.last,
            last: last_span.last,
            start_pos: last_span.end_pos,
            end_pos: last_span.end_pos,
            unpack_size: 0,
        };
        self.write_block = 0;
        self.write_pos = 0;
        Ok(())
    }

    /// Copies decoded blocks into the caller's output in block order,
    /// feeding the running hash and freeing each buffer as it drains.
    /// Returns `true` when the whole batch has been written.
    fn write_blocks(&mut self, output: &mut OutBuffer<'_>, mut hash: Option<&mut Xxh32>) -> bool {
        while self.write_block < self.blocks.len() {
            let block = &mut self.blocks[self.write_block];
            let n = (block.out.len() - self.write_pos).min(output.dst.len() - output.pos);
            let src = &block.out[self.write_pos..self.write_pos + n];
            output.dst[output.pos..output.pos + n].copy_from_slice(src);
            if let Some(hash) = hash.as_mut() {
                hash.update(src);
            }
            self.write_pos += n;
            output.pos += n;
            if self.write_pos < block.out.len() {
                return false;
            }
            block.out = Vec::new();
            self.write_pos = 0;
            self.write_block += 1;
        }
        self.blocks.clear();
        self.write_block = 0;
        true
    }
}

/// Decodes one block by walking its node span, backtracking into the overlap
/// region at every node seam.
fn decode_chain_block(block: &mut StreamBlock, chain: &InBufChain, finish_end: bool) -> Result<()> {
    let span = block.span;
    let out_len = block.out.len();
    let mut dec = Lzma2Dec::new_external(&mut block.out);
    let mut node_index = span.first;
    let mut in_pos = span.start_pos;
    let finish = if finish_end {
        FinishMode::End
    } else {
        FinishMode::Any
    };

    loop {
        let node = chain.node(node_index);
        let end = if node_index == span.last {
            span.end_pos
        } else {
            node.length
        };
        let mut src_len = end - in_pos;
        let status = dec.decode_to_dic(out_len, &node.buf[in_pos..end], &mut src_len, finish)?;

        match status {
            LzmaStatus::FinishedWithMark => {
                if !finish_end || dec.dic_pos() != out_len {
                    return Err(Error::CorruptionDetected);
                }
                debug!("block finished with end mark");
                return Ok(());
            }
            LzmaStatus::NotFinished => {
                if finish_end || dec.dic_pos() != out_len {
                    return Err(Error::CorruptionDetected);
                }
                return Ok(());
            }
            LzmaStatus::NeedsMoreInput | LzmaStatus::MaybeFinishedWithoutMark => {
                if node_index == span.last {
                    return Err(Error::SrcSizeWrong);
                }
                in_pos += src_len;
                if in_pos + REQUIRED_INPUT_MAX >= node.length {
                    in_pos -= node.length - REQUIRED_INPUT_MAX;
                    node_index += 1;
                }
            }
        }
    }
}

/// Streaming LZMA2 decoder.
///
/// Compressed input and decompressed output move through caller-provided
/// buffers one call at a time. With more than one thread, whole blocks are
/// buffered from the input, decoded concurrently and written out in order.
///
/// # Examples
/// ```
/// use fast_lzma2::{InBuffer, OutBuffer, StreamDecoder};
///
/// let compressed: Vec<u8> = vec![
///     0x00, 0x01, 0x00, 0x0C, 0x48, 0x65, 0x6C, 0x6C, 0x6F, 0x2C, 0x20, 0x77,
///     0x6F, 0x72, 0x6C, 0x64, 0x21, 0x00,
/// ];
/// let mut decoder = StreamDecoder::new(1);
/// let mut decompressed = vec![0u8; 13];
/// let mut input = InBuffer::new(&compressed);
/// let mut output = OutBuffer::new(&mut decompressed);
/// while decoder.decompress(&mut output, &mut input).unwrap() {}
/// assert_eq!(&output.dst[..output.pos], b"Hello, world!");
/// ```
pub struct StreamDecoder {
    mt: Option<MtDec>,
    dec: Option<Lzma2Dec<'static>>,
    xxh: Xxh32,
    hash_buf: [u8; 4],
    hash_pos: usize,
    stage: Stage,
    do_hash: bool,
    loop_count: u8,
}

impl StreamDecoder {
    /// Creates a streaming decoder running on up to `nb_threads` threads
    /// (clamped to 1..=256).
    pub fn new(nb_threads: u32) -> Self {
        let nb_threads = nb_threads.clamp(1, 256);
        Self {
            mt: (nb_threads > 1).then(|| MtDec::new(nb_threads as usize)),
            dec: None,
            xxh: Xxh32::new(0),
            hash_buf: [0; 4],
            hash_pos: 0,
            stage: Stage::Init,
            do_hash: false,
            loop_count: 0,
        }
    }

    /// Begins a new stream; the property byte is read from the input.
    pub fn reset(&mut self) {
        self.stage = Stage::Init;
        self.dec = None;
        self.hash_pos = 0;
        self.loop_count = 0;
        if let Some(mt) = &mut self.mt {
            mt.reset();
        }
    }

    /// Begins a new stream with an out-of-band property byte; the input must
    /// then start directly with the first chunk.
    pub fn reset_with_prop(&mut self, prop: u8) -> Result<()> {
        self.reset();
        self.init_prop(prop)?;
        self.stage = Stage::Decomp;
        Ok(())
    }

    fn init_prop(&mut self, prop: u8) -> Result<()> {
        self.do_hash = prop & PROP_HASH_FLAG != 0;
        let dict_size = dict_size_from_prop(prop & PROP_MASK)?;
        debug!(
            "init stream: dict prop {:#04x}, hashed: {}",
            prop & PROP_MASK,
            self.do_hash
        );
        if self.mt.is_none() {
            self.dec = Some(Lzma2Dec::new_streaming(dict_size));
        }
        self.xxh = Xxh32::new(0);
        Ok(())
    }

    /// Advances the stream by one step: consumes what it can from `input`,
    /// produces what it can into `output`. Returns `Ok(true)` while the
    /// stream is unfinished and `Ok(false)` once it has fully ended.
    ///
    /// Two consecutive calls that move neither buffer fail with
    /// [`Error::InfiniteLoop`] instead of spinning on malformed input.
    pub fn decompress(
        &mut self,
        output: &mut OutBuffer<'_>,
        input: &mut InBuffer<'_>,
    ) -> Result<bool> {
        let prev_out = output.pos;
        let prev_in = input.pos;

        self.advance(output, input)?;

        let finished = matches!(self.stage, Stage::Finished);
        if !finished && output.pos == prev_out && input.pos == prev_in {
            self.loop_count += 1;
            if self.loop_count > 1 {
                return Err(Error::InfiniteLoop);
            }
        } else {
            self.loop_count = 0;
        }
        Ok(!finished)
    }

    fn advance(&mut self, output: &mut OutBuffer<'_>, input: &mut InBuffer<'_>) -> Result<()> {
        if matches!(self.stage, Stage::Init) {
            let Some(&prop) = input.src.get(input.pos) else {
                return Ok(());
            };
            input.pos += 1;
            self.init_prop(prop)?;
            self.stage = Stage::Decomp;
        }

        if matches!(self.stage, Stage::Decomp | Stage::Write) {
            if self.mt.is_some() {
                self.advance_mt(output, input)?;
            } else {
                self.advance_single(output, input)?;
            }
        }

        if matches!(self.stage, Stage::Hash) {
            self.check_hash(input)?;
        }
        Ok(())
    }

    fn advance_single(&mut self, output: &mut OutBuffer<'_>, input: &mut InBuffer<'_>) -> Result<()> {
        let dec = self.dec.as_mut().ok_or(Error::CorruptionDetected)?;
        let out_start = output.pos;
        let status = dec.decode_to_buf(
            output.dst,
            &mut output.pos,
            input.src,
            &mut input.pos,
            FinishMode::Any,
        )?;
        debug!("decoded {} bytes", output.pos - out_start);
        if self.do_hash {
            self.xxh.update(&output.dst[out_start..output.pos]);
        }
        if status == LzmaStatus::FinishedWithMark {
            self.stage = if self.do_hash {
                Stage::Hash
            } else {
                Stage::Finished
            };
        }
        Ok(())
    }

    fn advance_mt(&mut self, output: &mut OutBuffer<'_>, input: &mut InBuffer<'_>) -> Result<()> {
        if matches!(self.stage, Stage::Decomp) {
            let mt = self.mt.as_mut().ok_or(Error::CorruptionDetected)?;
            if mt.load_input(input)? {
                mt.decode_blocks()?;
                self.stage = Stage::Write;
            }
        }
        if matches!(self.stage, Stage::Write) {
            let do_hash = self.do_hash;
            let mt = self.mt.as_mut().ok_or(Error::CorruptionDetected)?;
            let hash = do_hash.then_some(&mut self.xxh);
            if mt.write_blocks(output, hash) {
                self.stage = if mt.is_final {
                    if do_hash {
                        Stage::Hash
                    } else {
                        Stage::Finished
                    }
                } else {
                    Stage::Decomp
                };
            }
        }
        Ok(())
    }

    /// Consumes the four-byte canonical digest and checks it against the
    /// running hash of everything written out.
    fn check_hash(&mut self, input: &mut InBuffer<'_>) -> Result<()> {
        if let Some(mt) = &mut self.mt {
            let take = (4 - self.hash_pos).min(mt.tail_stash.len());
            self.hash_buf[self.hash_pos..self.hash_pos + take]
                .copy_from_slice(&mt.tail_stash[..take]);
            mt.tail_stash.drain(..take);
            self.hash_pos += take;
        }
        let n = (4 - self.hash_pos).min(input.src.len() - input.pos);
        self.hash_buf[self.hash_pos..self.hash_pos + n]
            .copy_from_slice(&input.src[input.pos..input.pos + n]);
        self.hash_pos += n;
        input.pos += n;
        if self.hash_pos == 4 {
            debug!("checking content hash");
            if u32::from_be_bytes(self.hash_buf) != self.xxh.digest() {
                return Err(Error::ChecksumWrong);
            }
            self.stage = Stage::Finished;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_grows_with_overlap() {
        let mut chain = InBufChain::new();
        chain.tail_mut().length = MT_INPUT_SIZE;
        for (i, b) in chain.tail_mut().buf[MT_INPUT_SIZE - REQUIRED_INPUT_MAX..]
            .iter_mut()
            .enumerate()
        {
            *b = i as u8;
        }
        let tail = chain.grow();
        assert_eq!(tail, 1);
        let node = chain.node(1);
        assert_eq!(node.length, REQUIRED_INPUT_MAX);
        assert_eq!(node.buf[0], 0);
        assert_eq!(node.buf[REQUIRED_INPUT_MAX - 1], (REQUIRED_INPUT_MAX - 1) as u8);
    }

    #[test]
    fn chain_recycles_prefix() {
        let mut chain = InBufChain::new();
        chain.tail_mut().length = MT_INPUT_SIZE;
        chain.grow();
        chain.tail_mut().length = MT_INPUT_SIZE;
        chain.grow();
        assert_eq!(chain.tail_index(), 2);
        chain.recycle(2);
        assert_eq!(chain.nodes.len(), 1);
        assert_eq!(chain.tail_index(), 2);
        assert_eq!(chain.node(2).length, REQUIRED_INPUT_MAX);
    }
}
