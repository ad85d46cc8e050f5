//! DEFLATE (zlib-wrapped) compression of individual entry payloads.
//!
//! Every entry is compressed as an independent stream with no shared
//! dictionary, so any entry can be decoded on its own. Decompression needs
//! the exact uncompressed length up front; it comes from the entry
//! descriptor.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::trace;

use crate::error::{Error, Result};

/// Default zlib compression level
pub const DEFAULT_LEVEL: u32 = 6;

/// Highest accepted compression level
pub const MAX_LEVEL: u32 = 9;

/// Largest payload of a single stored DEFLATE block in zlib's accounting
const STORED_BLOCK_LEN: usize = 16_383;

/// Upper bound on the compressed size of `len` input bytes at any level.
///
/// Covers the 5-byte header of every stored block, the zlib wrapper, and
/// the Huffman block overhead the fast levels emit on incompressible input.
pub fn compress_bound(len: usize) -> usize {
    len + (len >> 8) + 5 * len.div_ceil(STORED_BLOCK_LEN) + 64
}

/// Compress `input` into a self-delimiting zlib stream.
pub fn compress(input: &[u8], level: u32) -> Result<Vec<u8>> {
    if level > MAX_LEVEL {
        return Err(Error::Usage(format!(
            "compression level {level} outside 0..={MAX_LEVEL}"
        )));
    }

    let bound = compress_bound(input.len());
    let mut output = Vec::new();
    output
        .try_reserve_exact(bound)
        .map_err(|_| Error::Allocation {
            bytes: bound as u64,
        })?;

    let mut stream = Compress::new(Compression::new(level), true);
    loop {
        let consumed = stream.total_in() as usize;
        let produced = stream.total_out();
        let status = stream
            .compress_vec(&input[consumed..], &mut output, FlushCompress::Finish)
            .map_err(|e| Error::Compression(e.to_string()))?;

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError if output.len() == output.capacity() => {
                // Output reached capacity: grow and resume.
                let extra = (input.len() >> 3) + 64;
                output.try_reserve(extra).map_err(|_| Error::Allocation {
                    bytes: (output.capacity() + extra) as u64,
                })?;
                trace!(bound, capacity = output.capacity(), "grew compression buffer");
            }
            Status::Ok | Status::BufError => {
                if stream.total_in() as usize == consumed && stream.total_out() == produced {
                    return Err(Error::Compression("compressor made no progress".into()));
                }
            }
        }
    }

    Ok(output)
}

/// Decompress a zlib stream into `output`, whose length must equal the
/// uncompressed size. Returns the number of bytes written.
///
/// Fails unless the stream ends cleanly, consumes all of `input` and fills
/// `output` exactly.
pub fn decompress(input: &[u8], output: &mut [u8]) -> Result<usize> {
    let expected = output.len();
    let mut scratch = [0u8; 1];
    let target: &mut [u8] = if expected == 0 { &mut scratch } else { output };

    let mut stream = Decompress::new(true);
    loop {
        let consumed = stream.total_in() as usize;
        let produced = stream.total_out() as usize;
        let status = stream
            .decompress(&input[consumed..], &mut target[produced..], FlushDecompress::Finish)
            .map_err(|e| Error::Compression(e.to_string()))?;

        if status == Status::StreamEnd {
            break;
        }
        if stream.total_in() as usize == consumed && stream.total_out() as usize == produced {
            return Err(Error::Compression(
                "stream did not terminate within the declared size".into(),
            ));
        }
    }

    let written = stream.total_out() as usize;
    if written != expected {
        return Err(Error::Compression(format!(
            "decompressed {written} bytes, expected {expected}"
        )));
    }
    if stream.total_in() as usize != input.len() {
        return Err(Error::Compression(format!(
            "{} trailing bytes after end of stream",
            input.len() - stream.total_in() as usize
        )));
    }
    Ok(written)
}
