//! Block-parallel compression streams
//!
//! [`ParallelBlockWriter`] splits an outgoing byte stream into fixed-size
//! blocks, compresses the blocks on a `rayon` pool and writes the results to
//! the inner writer strictly in input order. The number of blocks in flight
//! is bounded so memory use stays proportional to the thread count.
//!
//! Two block formats are provided:
//!
//! - [`GzipBlocks`]: raw deflate per block, sync-flushed so the pieces
//!   concatenate into a single deflate stream, wrapped in one gzip member whose
//!   CRC-32 is computed on the writing thread.
//! - [`Bzip2Blocks`]: each block becomes a complete bzip2 stream; concatenated
//!   streams are a valid multi-stream `.bz2` file.

use crate::error::{ArchiveError, Result};
use flate2::{Compress, Compression, Crc, FlushCompress, Status};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use tracing::{error, trace};

/// How a block stream is framed and compressed
pub trait BlockFormat: Send + Sync + 'static {
    /// Short name for logs and thread names
    fn name(&self) -> &'static str;

    /// Uncompressed bytes per block
    fn block_size(&self) -> usize;

    /// Bytes written before the first block
    fn header(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Compress one block; `last` is set for the final block only
    fn compress_block(&self, data: &[u8], last: bool) -> io::Result<Vec<u8>>;

    /// Bytes written after the last block
    fn trailer(&self, _crc: u32, _len: u64) -> Vec<u8> {
        Vec::new()
    }
}

/// Gzip member assembled from independently deflated blocks
#[derive(Debug, Clone)]
pub struct GzipBlocks {
    level: Compression,
    block_size: usize,
}

impl GzipBlocks {
    /// Default block size
    pub const BLOCK_SIZE: usize = 256 * 1024;

    /// Gzip blocks at the given level
    pub fn new(level: Compression) -> Self {
        Self {
            level,
            block_size: Self::BLOCK_SIZE,
        }
    }

    /// Override the block size
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }
}

impl Default for GzipBlocks {
    fn default() -> Self {
        Self::new(Compression::default())
    }
}

impl BlockFormat for GzipBlocks {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn header(&self) -> Vec<u8> {
        // ID1 ID2 CM=deflate FLG=0 MTIME=0 XFL=0 OS=unknown
        vec![0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff]
    }

    fn compress_block(&self, data: &[u8], last: bool) -> io::Result<Vec<u8>> {
        let mut compress = Compress::new(self.level, false);
        let flush = if last { FlushCompress::Finish } else { FlushCompress::Sync };
        let mut out = Vec::with_capacity(data.len() / 2 + 1024);

        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(4096));
            }
            let consumed = compress.total_in() as usize;
            let status = compress
                .compress_vec(&data[consumed..], &mut out, flush)
                .map_err(io::Error::other)?;
            let drained = compress.total_in() as usize == data.len() && out.len() < out.capacity();

            match status {
                Status::StreamEnd => return Ok(out),
                Status::Ok | Status::BufError if !last && drained => return Ok(out),
                Status::Ok | Status::BufError => {}
            }
        }
    }

    fn trailer(&self, crc: u32, len: u64) -> Vec<u8> {
        let mut trailer = Vec::with_capacity(8);
        trailer.extend_from_slice(&crc.to_le_bytes());
        trailer.extend_from_slice(&(len as u32).to_le_bytes());
        trailer
    }
}

/// Concatenated bzip2 streams, one per block
#[derive(Debug, Clone)]
pub struct Bzip2Blocks {
    level: bzip2::Compression,
}

impl Bzip2Blocks {
    /// bzip2's own largest block size at level 9
    pub const BLOCK_SIZE: usize = 900 * 1000;

    /// Bzip2 blocks at the given level
    pub fn new(level: bzip2::Compression) -> Self {
        Self { level }
    }
}

impl Default for Bzip2Blocks {
    fn default() -> Self {
        Self::new(bzip2::Compression::best())
    }
}

impl BlockFormat for Bzip2Blocks {
    fn name(&self) -> &'static str {
        "bzip2"
    }

    fn block_size(&self) -> usize {
        Self::BLOCK_SIZE
    }

    fn compress_block(&self, data: &[u8], _last: bool) -> io::Result<Vec<u8>> {
        let mut encoder = bzip2::write::BzEncoder::new(Vec::with_capacity(data.len() / 3 + 64), self.level);
        encoder.write_all(data)?;
        encoder.finish()
    }
}

/// Build the worker pool for a parallel codec
///
/// Worker panics are logged instead of aborting the process; the job that
/// panicked drops its result channel, which the waiting side reports as an
/// execution failure.
pub(crate) fn worker_pool(name: &'static str, threads: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(move |i| format!("{}-worker-{}", name, i))
        .panic_handler(move |_| error!("A {} compression worker panicked", name))
        .build()
        .map_err(|e| ArchiveError::execution(format!("failed to start {} workers: {}", name, e)))
}

/// Writer that compresses blocks in parallel and emits them in order
pub struct ParallelBlockWriter<W: Write, F: BlockFormat> {
    inner: Option<W>,
    format: Arc<F>,
    pool: ThreadPool,
    buffer: Vec<u8>,
    pending: VecDeque<Receiver<io::Result<Vec<u8>>>>,
    max_pending: usize,
    crc: Crc,
    total_in: u64,
    header_written: bool,
}

impl<W: Write, F: BlockFormat> ParallelBlockWriter<W, F> {
    /// Wrap `inner`, compressing on `threads` workers
    pub fn new(inner: W, format: F, threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let pool = worker_pool(format.name(), threads)?;
        let block_size = format.block_size();

        Ok(Self {
            inner: Some(inner),
            format: Arc::new(format),
            pool,
            buffer: Vec::with_capacity(block_size),
            pending: VecDeque::new(),
            max_pending: threads * 4,
            crc: Crc::new(),
            total_in: 0,
            header_written: false,
        })
    }

    fn inner(&mut self) -> io::Result<&mut W> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other("parallel compressor already finished"))
    }

    fn write_header(&mut self) -> io::Result<()> {
        if !self.header_written {
            let header = self.format.header();
            self.inner()?.write_all(&header)?;
            self.header_written = true;
        }
        Ok(())
    }

    fn make_room(&mut self) -> io::Result<()> {
        while self.pending.len() >= self.max_pending {
            self.drain_one()?;
        }
        Ok(())
    }

    /// Hands a full buffer to the pool; nothing is taken if draining fails
    fn dispatch_full(&mut self) -> io::Result<()> {
        let block_size = self.format.block_size();
        if self.buffer.len() < block_size {
            return Ok(());
        }
        self.make_room()?;
        let block = std::mem::replace(&mut self.buffer, Vec::with_capacity(block_size));
        self.spawn(block, false);
        Ok(())
    }

    fn dispatch(&mut self, block: Vec<u8>, last: bool) -> io::Result<()> {
        self.make_room()?;
        self.spawn(block, last);
        Ok(())
    }

    fn spawn(&mut self, block: Vec<u8>, last: bool) {
        let (tx, rx) = mpsc::sync_channel(1);
        let format = Arc::clone(&self.format);
        trace!(format = format.name(), bytes = block.len(), last, "Dispatching block");
        self.pool.spawn(move || {
            let _ = tx.send(format.compress_block(&block, last));
        });
        self.pending.push_back(rx);
    }

    fn drain_one(&mut self) -> io::Result<()> {
        let Some(rx) = self.pending.pop_front() else {
            return Ok(());
        };
        let compressed = rx
            .recv()
            .map_err(|_| ArchiveError::execution(format!("{} worker exited without a result", self.format.name())).into_io())??;
        self.write_header()?;
        self.inner()?.write_all(&compressed)
    }

    fn drain_all(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            self.drain_one()?;
        }
        Ok(())
    }

    /// Compress what is left, write the trailer and return the inner writer
    pub fn finish(mut self) -> io::Result<W> {
        let rest = std::mem::take(&mut self.buffer);
        self.dispatch(rest, true)?;
        self.drain_all()?;
        self.write_header()?;

        let trailer = self.format.trailer(self.crc.sum(), self.total_in);
        let mut inner = self
            .inner
            .take()
            .ok_or_else(|| io::Error::other("parallel compressor already finished"))?;
        inner.write_all(&trailer)?;
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write, F: BlockFormat> Write for ParallelBlockWriter<W, F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.dispatch_full()?;

        let room = self.format.block_size() - self.buffer.len();
        let n = room.min(buf.len());

        self.buffer.extend_from_slice(&buf[..n]);
        self.crc.update(&buf[..n]);
        self.total_in += n as u64;
        Ok(n)
    }

    /// Writes out every completed block; a partial block stays buffered
    fn flush(&mut self) -> io::Result<()> {
        self.dispatch_full()?;
        self.drain_all()?;
        self.write_header()?;
        self.inner()?.flush()
    }
}
