//! Memory-mapped input and output streams.
//!
//! Both streams keep a cursor over a full-file mapping, the way the archive
//! formats expect: lots of short typed reads mixed with absolute seeks. The
//! writer is sized up front from the layout plan; the bitmap payload tail,
//! whose length is not known in advance, goes through a secondary append-only
//! stream on the same path.

use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

use crate::error::WzError;

pub struct MapReader {
    map: Mmap,
    pos: usize,
}

impl MapReader {
    pub fn open(path: &Path) -> Result<MapReader, WzError> {
        let file = File::open(path)
            .map_err(|e| WzError::Io(format!("Couldn't open {}", path.display()), e))?;
        // Safety: the mapping is private to this process and read-only; the
        // input file is not expected to change underneath us.
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| WzError::Io(format!("Couldn't map {}", path.display()), e))?;
        Ok(MapReader { map, pos: 0 })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn tell(&self) -> u64 {
        self.pos as u64
    }

    pub fn seek(&mut self, pos: u64) -> Result<(), WzError> {
        if pos > self.map.len() as u64 {
            return Err(WzError::Format(format!(
                "seek to {pos} past end of input ({} bytes)",
                self.map.len()
            )));
        }
        self.pos = pos as usize;
        Ok(())
    }

    pub fn skip(&mut self, n: u64) -> Result<(), WzError> {
        self.seek(self.tell() + n)
    }

    /// Consumes `n` bytes at the cursor.
    pub fn bytes(&mut self, n: usize) -> Result<&[u8], WzError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.map.len())
            .ok_or_else(|| {
                WzError::Format(format!("read of {n} bytes past end of input at {}", self.pos))
            })?;
        let slice = &self.map[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Borrows `n` bytes at an absolute offset without moving the cursor.
    pub fn slice_at(&self, offset: u64, n: usize) -> Result<&[u8], WzError> {
        let start = offset as usize;
        let end = start
            .checked_add(n)
            .filter(|&end| end <= self.map.len())
            .ok_or_else(|| {
                WzError::Format(format!("read of {n} bytes past end of input at {offset}"))
            })?;
        Ok(&self.map[start..end])
    }

    pub fn read_u8(&mut self) -> Result<u8, WzError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, WzError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, WzError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes(b.try_into().expect("length checked")))
    }

    pub fn read_u32(&mut self) -> Result<u32, WzError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes(b.try_into().expect("length checked")))
    }

    pub fn read_i32(&mut self) -> Result<i32, WzError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64, WzError> {
        let b = self.bytes(8)?;
        Ok(i64::from_le_bytes(b.try_into().expect("length checked")))
    }

    pub fn read_f32(&mut self) -> Result<f32, WzError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, WzError> {
        Ok(f64::from_bits(self.read_i64()? as u64))
    }

    /// The archive's variable-length signed 32-bit integer: one signed byte,
    /// with -128 flagging a full little-endian i32 to follow.
    pub fn read_cint(&mut self) -> Result<i32, WzError> {
        let a = self.read_i8()?;
        if a != -128 {
            Ok(a as i32)
        } else {
            self.read_i32()
        }
    }
}

pub struct MapWriter {
    path: PathBuf,
    map: MmapMut,
    pos: usize,
}

impl MapWriter {
    /// Creates (or truncates) the output at its exact final mapped size.
    pub fn create(path: &Path, exact_size: u64) -> Result<MapWriter, WzError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| WzError::Io(format!("Couldn't create {}", path.display()), e))?;
        file.set_len(exact_size)
            .map_err(|e| WzError::Io(format!("Couldn't size {}", path.display()), e))?;
        // Safety: we own the freshly truncated file; nothing else maps it.
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| WzError::Io(format!("Couldn't map {}", path.display()), e))?;
        Ok(MapWriter {
            path: path.to_owned(),
            map,
            pos: 0,
        })
    }

    pub fn tell(&self) -> u64 {
        self.pos as u64
    }

    pub fn seek(&mut self, pos: u64) -> Result<(), WzError> {
        if pos > self.map.len() as u64 {
            return Err(WzError::Format(format!(
                "seek to {pos} past end of output ({} bytes)",
                self.map.len()
            )));
        }
        self.pos = pos as usize;
        Ok(())
    }

    pub fn skip(&mut self, n: u64) -> Result<(), WzError> {
        self.seek(self.tell() + n)
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), WzError> {
        let end = self
            .pos
            .checked_add(bytes.len())
            .filter(|&end| end <= self.map.len())
            .ok_or_else(|| {
                WzError::Format(format!(
                    "write of {} bytes past end of output at {}",
                    bytes.len(),
                    self.pos
                ))
            })?;
        self.map[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    pub fn write_u16(&mut self, v: u16) -> Result<(), WzError> {
        self.write(&v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<(), WzError> {
        self.write(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<(), WzError> {
        self.write(&v.to_le_bytes())
    }

    /// A buffered append-only stream past the mapped region. Appends and
    /// mapped writes land in disjoint byte ranges, so the two handles may be
    /// used side by side.
    pub fn appender(&self) -> Result<BufWriter<File>, WzError> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| WzError::Io(format!("Couldn't reopen {}", self.path.display()), e))?;
        Ok(BufWriter::new(file))
    }

    pub fn flush(&self) -> Result<(), WzError> {
        self.map
            .flush()
            .map_err(|e| WzError::Io(format!("Couldn't flush {}", self.path.display()), e))
    }
}
