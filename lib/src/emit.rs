//! Output layout and section emission.
//!
//! The section offsets are computed up front so the output can be mapped at
//! its final size, with one exception: the bitmap blob's length depends on
//! per-bitmap LZ4 output, so the map ends where the blob begins and records
//! stream in through an appender while their table entries are written
//! through the map.

use std::io::Write;
use std::path::Path;

use crate::bitmap::{self, Scratch};
use crate::convert::Transcoder;
use crate::error::WzError;
use crate::io::MapWriter;
use crate::node::NODE_SIZE;

const NX_MAGIC: u32 = 0x3447_4B50;

struct Layout {
    node: u64,
    string_table: u64,
    string_blob: u64,
    audio_table: u64,
    bitmap_table: u64,
    audio_blob: u64,
    bitmap_blob: u64,
}

/// Advances to the next 16-byte boundary, a full 16 bytes when already
/// aligned.
fn pad16(offset: u64) -> u64 {
    offset + (0x10 - (offset & 0xF))
}

impl Transcoder {
    fn plan_layout(&self) -> Layout {
        let mut offset = pad16(52);
        let node = offset;
        offset = pad16(offset + self.nodes.len() as u64 * NODE_SIZE as u64);
        let string_table = offset;
        offset = pad16(offset + self.strings.len() as u64 * 8);
        let string_blob = offset;
        let blob_len: u64 = self
            .strings
            .iter()
            .map(|s| s.len() as u64 + 2 + (s.len() as u64 & 1))
            .sum();
        offset = pad16(offset + blob_len);
        let audio_table = offset;
        if self.opts.client {
            offset = pad16(offset + self.audios.len() as u64 * 8);
        }
        let bitmap_table = offset;
        if self.opts.client {
            offset = pad16(offset + self.bitmaps.len() as u64 * 8);
        }
        let audio_blob = offset;
        if self.opts.client {
            let audio_len: u64 = self.audios.iter().map(|a| a.length as u64).sum();
            offset = pad16(offset + audio_len);
        }
        let bitmap_blob = offset;
        Layout {
            node,
            string_table,
            string_blob,
            audio_table,
            bitmap_table,
            audio_blob,
            bitmap_blob,
        }
    }

    pub(crate) fn emit(&mut self, path: &Path) -> Result<(), WzError> {
        let layout = self.plan_layout();
        let mut out = MapWriter::create(path, layout.bitmap_blob)?;
        self.write_header(&mut out, &layout)?;
        self.write_nodes(&mut out, &layout)?;
        self.write_strings(&mut out, &layout)?;
        if self.opts.client {
            self.write_audio(&mut out, &layout)?;
            self.write_bitmaps(&mut out, &layout)?;
        }
        out.flush()
    }

    fn write_header(&self, out: &mut MapWriter, layout: &Layout) -> Result<(), WzError> {
        out.seek(0)?;
        out.write_u32(NX_MAGIC)?;
        out.write_u32(self.nodes.len() as u32)?;
        out.write_u64(layout.node)?;
        out.write_u32(self.strings.len() as u32)?;
        out.write_u64(layout.string_table)?;
        if self.opts.client {
            out.write_u32(self.bitmaps.len() as u32)?;
            out.write_u64(layout.bitmap_table)?;
            out.write_u32(self.audios.len() as u32)?;
            out.write_u64(layout.audio_table)?;
        } else {
            out.write_u32(0)?;
            out.write_u64(0)?;
            out.write_u32(0)?;
            out.write_u64(0)?;
        }
        Ok(())
    }

    fn write_nodes(&self, out: &mut MapWriter, layout: &Layout) -> Result<(), WzError> {
        out.seek(layout.node)?;
        for n in &self.nodes {
            out.write_u32(n.name)?;
            out.write_u32(n.children)?;
            out.write_u16(n.num)?;
            out.write_u16(n.kind as u16)?;
            out.write(&n.payload_bytes())?;
        }
        Ok(())
    }

    fn write_strings(&self, out: &mut MapWriter, layout: &Layout) -> Result<(), WzError> {
        out.seek(layout.string_table)?;
        let mut next = layout.string_blob;
        for s in self.strings.iter() {
            out.write_u64(next)?;
            next += s.len() as u64 + 2 + (s.len() as u64 & 1);
        }
        out.seek(layout.string_blob)?;
        for s in self.strings.iter() {
            out.write_u16(s.len() as u16)?;
            out.write(s.as_bytes())?;
            if s.len() & 1 == 1 {
                out.skip(1)?;
            }
        }
        Ok(())
    }

    fn write_audio(&self, out: &mut MapWriter, layout: &Layout) -> Result<(), WzError> {
        out.seek(layout.audio_table)?;
        let mut offset = layout.audio_blob;
        for a in &self.audios {
            out.write_u64(offset)?;
            offset += a.length as u64;
        }
        out.seek(layout.audio_blob)?;
        for a in &self.audios {
            out.write(self.input.slice_at(a.offset, a.length as usize)?)?;
        }
        Ok(())
    }

    fn write_bitmaps(&mut self, out: &mut MapWriter, layout: &Layout) -> Result<(), WzError> {
        out.seek(layout.bitmap_table)?;
        let mut appender = out.appender()?;
        let mut scratch = Scratch::default();
        let mut offset = layout.bitmap_blob;
        let Transcoder {
            input,
            bitmaps,
            opts,
            ..
        } = self;
        for b in bitmaps.iter() {
            out.write_u64(offset)?;
            input.seek(b.offset)?;
            let width = input.read_cint()?;
            let height = input.read_cint()?;
            if width < 0 || height < 0 {
                return Err(WzError::Format(format!(
                    "invalid image size: {width}, {height}"
                )));
            }
            let format1 = input.read_cint()?;
            let format2 = input.read_u8()?;
            let n1 = input.read_u32()?;
            if n1 != 0 {
                return Err(WzError::Format(format!(
                    "nonzero reserved field {n1:#010x} in bitmap header"
                )));
            }
            let length = input.read_u32()?;
            let n2 = input.read_u8()?;
            if n2 != 0 {
                return Err(WzError::Format(format!(
                    "nonzero reserved field {n2:#04x} in bitmap header"
                )));
            }
            let raw = input.bytes(length as usize)?;
            let block = bitmap::transcode(
                raw,
                width as u32,
                height as u32,
                format1,
                format2,
                b.key,
                opts.high_compression,
                &mut scratch,
            )?;
            appender
                .write_all(&(block.len() as u32).to_le_bytes())
                .and_then(|()| appender.write_all(&block))
                .map_err(|e| WzError::Io("Couldn't append bitmap record".into(), e))?;
            offset += 4 + block.len() as u64;
        }
        appender
            .flush()
            .map_err(|e| WzError::Io("Couldn't flush bitmap records".into(), e))?;
        Ok(())
    }
}
