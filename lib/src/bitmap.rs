//! Bitmap payload transcoding.
//!
//! Canvas payloads arrive zlib-deflated, sometimes wrapped in block-XOR
//! encryption, in one of several pixel formats. Everything is normalized to
//! 32-bit pixels and recompressed as an LZ4 raw block for the output.

use flate2::{Decompress, FlushDecompress, Status};
use lz4::block::{compress, CompressionMode};

use crate::error::WzError;
use crate::keys::KEY_LEN;

// Channel expansion tables: 4-, 5- and 6-bit values to 8 bits.
const TABLE4: [u8; 16] = [
    0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE,
    0xFF,
];
const TABLE5: [u8; 32] = [
    0x00, 0x08, 0x10, 0x19, 0x21, 0x29, 0x31, 0x3A, 0x42, 0x4A, 0x52, 0x5A, 0x63, 0x6B, 0x73,
    0x7B, 0x84, 0x8C, 0x94, 0x9C, 0xA5, 0xAD, 0xB5, 0xBD, 0xC5, 0xCE, 0xD6, 0xDE, 0xE6, 0xEF,
    0xF7, 0xFF,
];
const TABLE6: [u8; 64] = [
    0x00, 0x04, 0x08, 0x0C, 0x10, 0x14, 0x18, 0x1C, 0x20, 0x24, 0x28, 0x2D, 0x31, 0x35, 0x39,
    0x3D, 0x41, 0x45, 0x49, 0x4D, 0x51, 0x55, 0x59, 0x5D, 0x61, 0x65, 0x69, 0x6D, 0x71, 0x75,
    0x79, 0x7D, 0x82, 0x86, 0x8A, 0x8E, 0x92, 0x96, 0x9A, 0x9E, 0xA2, 0xA6, 0xAA, 0xAE, 0xB2,
    0xB6, 0xBA, 0xBE, 0xC2, 0xC6, 0xCA, 0xCE, 0xD2, 0xD7, 0xDB, 0xDF, 0xE3, 0xE7, 0xEB, 0xEF,
    0xF3, 0xF7, 0xFB, 0xFF,
];

/// The two working buffers, reused across bitmaps within a run.
#[derive(Default)]
pub(crate) struct Scratch {
    input: Vec<u8>,
    output: Vec<u8>,
}

/// Runs one bitmap payload through the whole pipeline and returns the LZ4
/// block for the output record.
#[allow(clippy::too_many_arguments)]
pub(crate) fn transcode(
    raw: &[u8],
    width: u32,
    height: u32,
    format1: i32,
    format2: u8,
    key: &[u8; KEY_LEN],
    high_compression: bool,
    scratch: &mut Scratch,
) -> Result<Vec<u8>, WzError> {
    let size = width as usize * height as usize * 4;
    let biggest = size.max(raw.len());
    scratch.input.resize(biggest, 0);
    scratch.output.resize(biggest, 0);
    scratch.input[..raw.len()].copy_from_slice(raw);

    let mut f1 = format1;
    let mut f2 = format2;
    let attempt = match inflate(&scratch.input[..raw.len()], &mut scratch.output) {
        Ok(n) => Some(n),
        // Encrypted payloads fail the plain inflate; peel the block layer
        // and retry.
        Err(_) => match block_decrypt(raw, key, &mut scratch.input) {
            Some(n) => inflate(&scratch.input[..n], &mut scratch.output).ok(),
            None => None,
        },
    };
    let decompressed = match attempt {
        Some(n) => n,
        None => {
            log::warn!("Unable to inflate bitmap payload, substituting a blank image");
            f1 = 2;
            f2 = 0;
            scratch.output[..size].fill(0);
            size
        }
    };
    std::mem::swap(&mut scratch.input, &mut scratch.output);

    let multiplier: usize = match f1 {
        1 | 513 => 2,
        2 => 1,
        1026 | 2050 => 4,
        257 => return Err(WzError::Format("bitmap format1 257 has no decoder".into())),
        other => return Err(WzError::Format(format!("unknown bitmap format1 {other}"))),
    };
    let pixels = match f2 {
        0 => width as usize * height as usize,
        // Stored at 1/16 linear resolution per axis.
        4 => width as usize * height as usize / 256,
        other => return Err(WzError::Format(format!("unknown bitmap format2 {other}"))),
    };
    if decompressed * multiplier != pixels * 4 {
        return Err(WzError::Format(format!(
            "bitmap size mismatch: {width}x{height}, {decompressed} bytes, format {f1}/{f2}"
        )));
    }

    match f1 {
        1 => {
            expand_bgra4444(&scratch.input[..pixels * 2], &mut scratch.output);
            std::mem::swap(&mut scratch.input, &mut scratch.output);
        }
        2 => {}
        513 => {
            expand_rgb565(&scratch.input[..pixels * 2], &mut scratch.output);
            std::mem::swap(&mut scratch.input, &mut scratch.output);
        }
        1026 => {
            expand_dxt(
                &scratch.input,
                &mut scratch.output,
                width as usize,
                height as usize,
                bcdec_rs::bc2,
            );
            std::mem::swap(&mut scratch.input, &mut scratch.output);
        }
        2050 => {
            expand_dxt(
                &scratch.input,
                &mut scratch.output,
                width as usize,
                height as usize,
                bcdec_rs::bc3,
            );
            std::mem::swap(&mut scratch.input, &mut scratch.output);
        }
        _ => unreachable!("format1 validated above"),
    }
    if f2 == 4 {
        upscale16(
            &scratch.input[..pixels * 4],
            &mut scratch.output,
            width as usize,
            height as usize,
        );
        std::mem::swap(&mut scratch.input, &mut scratch.output);
    }

    let mode = high_compression.then_some(CompressionMode::HIGHCOMPRESSION(9));
    compress(&scratch.input[..size], mode, false)
        .map_err(|e| WzError::Io("Couldn't LZ4-compress bitmap".into(), e))
}

/// Accepts only a zlib stream that ends cleanly within `output`.
fn inflate(input: &[u8], output: &mut [u8]) -> Result<usize, WzError> {
    let mut z = Decompress::new(true);
    match z.decompress(input, output, FlushDecompress::Finish) {
        Ok(Status::StreamEnd) => Ok(z.total_out() as usize),
        Ok(_) => Err(WzError::Format("truncated zlib stream in bitmap".into())),
        Err(e) => Err(WzError::Format(format!("zlib error in bitmap: {e}"))),
    }
}

/// Decrypts a stream of `(u32 length, payload)` records, concatenating the
/// XOR-decrypted payloads into `out`. `None` when a record overruns the
/// buffer.
fn block_decrypt(raw: &[u8], key: &[u8; KEY_LEN], out: &mut [u8]) -> Option<usize> {
    let mut written = 0;
    let mut i = 0;
    while i + 4 <= raw.len() {
        let blen = u32::from_le_bytes(raw[i..i + 4].try_into().expect("length checked")) as usize;
        i += 4;
        if i + blen > raw.len() || written + blen > out.len() {
            return None;
        }
        for j in 0..blen {
            let k = if j < KEY_LEN { key[j] } else { 0 };
            out[written + j] = raw[i + j] ^ k;
        }
        i += blen;
        written += blen;
    }
    Some(written)
}

/// BGRA4444, two bytes per pixel, each nibble scaled to 8 bits.
fn expand_bgra4444(input: &[u8], output: &mut [u8]) {
    for (px, out) in input.chunks_exact(2).zip(output.chunks_exact_mut(4)) {
        let v = u16::from_le_bytes([px[0], px[1]]);
        out[0] = TABLE4[(v & 0xF) as usize];
        out[1] = TABLE4[((v >> 4) & 0xF) as usize];
        out[2] = TABLE4[((v >> 8) & 0xF) as usize];
        out[3] = TABLE4[((v >> 12) & 0xF) as usize];
    }
}

/// 565 pixels, blue in the low bits, forced opaque.
fn expand_rgb565(input: &[u8], output: &mut [u8]) {
    for (px, out) in input.chunks_exact(2).zip(output.chunks_exact_mut(4)) {
        let v = u16::from_le_bytes([px[0], px[1]]);
        out[0] = TABLE5[(v & 0x1F) as usize];
        out[1] = TABLE6[((v >> 5) & 0x3F) as usize];
        out[2] = TABLE5[(v >> 11) as usize];
        out[3] = 0xFF;
    }
}

/// Decodes 4x4 compressed blocks row-major into a `width * 4` pitched image.
/// The size check upstream guarantees block-aligned dimensions.
fn expand_dxt(
    input: &[u8],
    output: &mut [u8],
    width: usize,
    height: usize,
    decode_block: fn(&[u8], &mut [u8], usize),
) {
    let blocks_x = width / 4;
    let pitch = width * 4;
    for by in 0..height / 4 {
        for bx in 0..blocks_x {
            let src = &input[(by * blocks_x + bx) * 16..][..16];
            let dst = (by * 4 * width + bx * 4) * 4;
            decode_block(src, &mut output[dst..], pitch);
        }
    }
}

/// Nearest-neighbor 16x upscale: every source pixel becomes a 16x16 block.
fn upscale16(input: &[u8], output: &mut [u8], width: usize, height: usize) {
    let w = width / 16;
    let h = height / 16;
    for y in 0..h {
        for x in 0..w {
            let src = (y * w + x) * 4;
            let px: [u8; 4] = input[src..src + 4].try_into().expect("pixel width");
            for yy in y * 16..(y + 1) * 16 {
                for xx in x * 16..(x + 1) * 16 {
                    output[(yy * width + xx) * 4..][..4].copy_from_slice(&px);
                }
            }
        }
    }
}
