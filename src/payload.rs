//! Synthetic payload generation.
//!
//! Transfer bodies are cryptographically random so intermediaries
//! cannot shrink them by compression; a compressible payload would
//! inflate the measured throughput.

use rand::RngCore;

/// Upper bound on a single RNG fill call. Keeps each fill inside the
/// limits of generators with a maximum-fill-size restriction and avoids
/// touching one huge buffer in a single pass.
pub const MAX_FILL_CHUNK: usize = 64 * 1024;

/// Generate `byte_length` bytes of cryptographically strong random data.
///
/// The buffer is filled in sub-chunks of at most [`MAX_FILL_CHUNK`]
/// bytes; the concatenation is indistinguishable from one pass of
/// randomness.
pub fn generate(byte_length: usize) -> Vec<u8> {
    let mut buf = vec![0u8; byte_length];
    fill_random(&mut buf);
    buf
}

/// Fill `buf` with random data, at most [`MAX_FILL_CHUNK`] bytes per
/// fill call.
pub fn fill_random(buf: &mut [u8]) {
    let mut rng = rand::rng();

    for chunk in buf.chunks_mut(MAX_FILL_CHUNK) {
        rng.fill_bytes(chunk);
    }
}
