//! Archive parsing and the conversion driver.
//!
//! [`Transcoder`] owns everything a single run needs: the input mapping, the
//! node arena, the string pool and the pending bitmap/audio descriptors.
//! Parsing fills the arena, [`finish_parse`](Transcoder::finish_parse) sorts
//! child ranges and resolves references, and emission lays the result out
//! into the sibling `.nx` file.

use std::mem;
use std::path::{Path, PathBuf};

use crate::error::WzError;
use crate::io::MapReader;
use crate::keys::{self, KEY_LEN};
use crate::node::{Node, NodeKind};
use crate::strings::{decode_utf16, promote_8bit, StringPool};

const WZ_MAGIC: u32 = 0x3147_4B50;

#[derive(Debug, Clone)]
pub struct Options {
    /// Emit the bitmap and audio sections.
    pub client: bool,
    /// Compress bitmaps with LZ4-HC instead of the default mode.
    pub high_compression: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            client: true,
            high_compression: false,
        }
    }
}

/// Pending bitmap payload: where it starts in the input, and which keystream
/// its img was encrypted with.
pub(crate) struct BitmapRef {
    pub offset: u64,
    pub key: &'static [u8; KEY_LEN],
}

/// Pending audio payload, copied verbatim at emission.
pub(crate) struct AudioRef {
    pub length: u32,
    pub offset: u64,
}

struct Img {
    node: u32,
    size: i32,
}

pub struct Transcoder {
    pub(crate) input: MapReader,
    pub(crate) nodes: Vec<Node>,
    pub(crate) strings: StringPool,
    pub(crate) bitmaps: Vec<BitmapRef>,
    pub(crate) audios: Vec<AudioRef>,
    pub(crate) opts: Options,
    ranges_to_sort: Vec<(u32, u32)>,
    imgs: Vec<Img>,
    file_start: u64,
    key: Option<&'static [u8; KEY_LEN]>,
}

/// The output file is the input with its extension swapped for `.nx`.
pub fn output_path(input: &Path) -> PathBuf {
    input.with_extension("nx")
}

/// Converts one archive (`.wz`) or bare img (`.img`) into `output`.
pub fn convert_file(input: &Path, output: &Path, opts: &Options) -> Result<(), WzError> {
    let mut tx = Transcoder::new(input, opts.clone())?;
    tx.run(input, output)
        .map_err(|e| e.add_context(format!("while converting {}", input.display())))
}

impl Transcoder {
    fn run(&mut self, input: &Path, output: &Path) -> Result<(), WzError> {
        log::info!("Parsing {}", input.display());
        if input.extension().and_then(|e| e.to_str()) == Some("img") {
            self.parse_img()?;
        } else {
            self.parse_archive()?;
        }
        self.finish_parse();
        log::info!(
            "Writing {} nodes, {} strings to {}",
            self.nodes.len(),
            self.strings.len(),
            output.display()
        );
        self.emit(output)
    }

    pub(crate) fn new(input: &Path, opts: Options) -> Result<Transcoder, WzError> {
        Ok(Transcoder {
            input: MapReader::open(input)?,
            nodes: vec![Node::default()],
            strings: StringPool::new(),
            bitmaps: Vec::new(),
            audios: Vec::new(),
            opts,
            ranges_to_sort: Vec::new(),
            imgs: Vec::new(),
            file_start: 0,
            key: None,
        })
    }

    fn key(&self) -> Result<&'static [u8; KEY_LEN], WzError> {
        self.key
            .ok_or_else(|| WzError::Format("string read before any key was deduced".into()))
    }

    /// Reads the probe string at the cursor and picks the first keystream
    /// that decrypts every byte into printable ASCII. Consumes the probe;
    /// callers seek back themselves.
    fn deduce_key(&mut self) -> Result<(), WzError> {
        let len = self.input.read_i8()?;
        if len >= 0 {
            return Err(WzError::Format(
                "expected an 8-bit string for locale deduction".into(),
            ));
        }
        let slen = if len == -128 {
            self.input.read_u32()?
        } else {
            -(len as i32) as u32
        };
        let probe = self.input.bytes(slen as usize)?;
        let found = keys::candidates().into_iter().find(|key| {
            probe.iter().enumerate().all(|(i, &c)| {
                let k = if i < KEY_LEN { key[i] } else { 0 };
                let plain = c ^ k ^ 0xAAu8.wrapping_add(i as u8);
                (0x20..0x80).contains(&plain)
            })
        });
        self.key = Some(found.ok_or(WzError::Locale)?);
        Ok(())
    }

    /// Decrypts and interns a length-prefixed string. A positive length
    /// prefix means 16-bit units, negative means 8-bit, zero is the empty
    /// string; 127/-128 switch to a full u32 length.
    fn read_enc_string(&mut self) -> Result<u32, WzError> {
        let len = self.input.read_i8()?;
        if len > 0 {
            let slen = if len == 127 {
                self.input.read_u32()?
            } else {
                len as u32
            };
            let slen = slen as usize;
            let key = self.key()?;
            let raw = self.input.bytes(slen * 2)?;
            let mut units = Vec::with_capacity(slen);
            let mut mask = 0xAAAAu16;
            for (i, pair) in raw.chunks_exact(2).enumerate() {
                let c = u16::from_le_bytes([pair[0], pair[1]]);
                // The key term drops only past 65536 units; the pad's u16
                // lanes run out halfway there and read as zero.
                let k = if i < KEY_LEN {
                    u16::from_le_bytes([
                        key.get(2 * i).copied().unwrap_or(0),
                        key.get(2 * i + 1).copied().unwrap_or(0),
                    ])
                } else {
                    0
                };
                units.push(c ^ k ^ mask);
                mask = mask.wrapping_add(1);
            }
            Ok(self.strings.add(decode_utf16(&units)))
        } else if len < 0 {
            let slen = if len == -128 {
                self.input.read_u32()?
            } else {
                -(len as i32) as u32
            };
            let slen = slen as usize;
            let key = self.key()?;
            let raw = self.input.bytes(slen)?;
            let mut bytes = Vec::with_capacity(slen);
            let mut mask = 0xAAu8;
            for (i, &c) in raw.iter().enumerate() {
                let k = if i < KEY_LEN { key[i] } else { 0 };
                bytes.push(c ^ k ^ mask);
                mask = mask.wrapping_add(1);
            }
            Ok(self.strings.add(promote_8bit(bytes)))
        } else {
            Ok(0)
        }
    }

    /// A string in property data: either inline, or stored once earlier in
    /// the img and referenced by offset.
    fn read_prop_string(&mut self, img_base: u64) -> Result<u32, WzError> {
        match self.input.read_u8()? {
            0x00 | 0x73 => self.read_enc_string(),
            0x01 | 0x1B => {
                let offset = self.input.read_i32()?;
                let pos = self.input.tell();
                self.input.seek((img_base as i64 + offset as i64) as u64)?;
                let id = self.read_enc_string()?;
                self.input.seek(pos)?;
                Ok(id)
            }
            tag => Err(WzError::Format(format!(
                "unknown property string tag {tag:#04x}"
            ))),
        }
    }

    /// Reserves a contiguous child range for `parent` and queues it for the
    /// post-parse sort.
    fn alloc_children(&mut self, parent: u32, count: u32) -> Result<u32, WzError> {
        if count > u16::MAX as u32 {
            return Err(WzError::Format(format!("{count} children in one node")));
        }
        let first = self.nodes.len() as u32;
        let p = &mut self.nodes[parent as usize];
        p.children = first;
        p.num = count as u16;
        self.nodes
            .resize(self.nodes.len() + count as usize, Node::default());
        self.ranges_to_sort.push((first, count));
        Ok(first)
    }

    pub(crate) fn parse_archive(&mut self) -> Result<(), WzError> {
        let magic = self.input.read_u32()?;
        if magic != WZ_MAGIC {
            return Err(WzError::Format("not a WZ archive (bad magic)".into()));
        }
        self.input.skip(8)?;
        self.file_start = self.input.read_u32()? as u64;
        // The first directory entry's name doubles as the locale probe.
        self.input.seek(self.file_start + 2)?;
        self.input.read_cint()?;
        self.input.skip(1)?;
        self.deduce_key()?;
        self.input.seek(self.file_start + 2)?;
        self.strings.add(String::new());
        self.directory(0)?;
        let imgs = mem::take(&mut self.imgs);
        log::debug!("decoding {} imgs", imgs.len());
        for img in imgs {
            self.img(img.node, img.size)?;
        }
        Ok(())
    }

    /// A bare `.img` file is a single img subtree rooted at node 0.
    pub(crate) fn parse_img(&mut self) -> Result<(), WzError> {
        self.strings.add(String::new());
        self.img(0, 0)
    }

    fn directory(&mut self, dir_node: u32) -> Result<(), WzError> {
        let count = self.input.read_cint()?;
        if count < 0 {
            return Err(WzError::Format("directory has negative entry count".into()));
        }
        let first = self.alloc_children(dir_node, count as u32)?;
        let mut subdirs = Vec::new();
        for i in 0..count as u32 {
            let idx = first + i;
            let mut entry_type = self.input.read_u8()?;
            match entry_type {
                1 => {
                    return Err(WzError::Format(
                        "unsupported directory entry type 1".into(),
                    ))
                }
                2 => {
                    let offset = self.input.read_i32()?;
                    let pos = self.input.tell();
                    self.input
                        .seek((self.file_start as i64 + offset as i64) as u64)?;
                    entry_type = self.input.read_u8()?;
                    self.nodes[idx as usize].name = self.read_enc_string()?;
                    self.input.seek(pos)?;
                }
                3 | 4 => {
                    self.nodes[idx as usize].name = self.read_enc_string()?;
                }
                t => {
                    return Err(WzError::Format(format!(
                        "unknown directory entry type {t}"
                    )))
                }
            }
            let size = self.input.read_cint()?;
            if size < 0 {
                return Err(WzError::Format("directory entry has negative size".into()));
            }
            self.input.read_cint()?; // data offset, unused
            self.input.skip(4)?; // checksum, unused
            match entry_type {
                3 => subdirs.push(idx),
                4 => self.imgs.push(Img { node: idx, size }),
                t => {
                    return Err(WzError::Format(format!(
                        "unknown referenced directory entry type {t}"
                    )))
                }
            }
        }
        for subdir in subdirs {
            self.directory(subdir)?;
        }
        Ok(())
    }

    /// Decodes one img at the cursor; ends positioned `size` bytes past its
    /// start.
    fn img(&mut self, node: u32, size: i32) -> Result<(), WzError> {
        let start = self.input.tell();
        if self.input.read_u8()? == 1 {
            self.lua_script(node)?;
        } else {
            // The key probe is the type-name string right after the marker.
            self.deduce_key()?;
            self.input.seek(start)?;
            self.extended_property(node, start)?;
        }
        self.input.seek(start + size as u64)
    }

    /// Script imgs hold one XOR-encrypted blob, no mask, GMS keystream.
    fn lua_script(&mut self, node: u32) -> Result<(), WzError> {
        let len = self.input.read_cint()? as u32;
        if len > 0x1FFFF {
            return Err(WzError::Format("script img is too long".into()));
        }
        let key: &[u8; KEY_LEN] = &keys::GMS_KEY;
        let raw = self.input.bytes(len as usize)?;
        let mut bytes = Vec::with_capacity(len as usize);
        for (i, &c) in raw.iter().enumerate() {
            let k = if i < KEY_LEN { key[i] } else { 0 };
            bytes.push(c ^ k);
        }
        let id = self.strings.add(promote_8bit(bytes));
        self.nodes[node as usize].set_string(id);
        Ok(())
    }

    fn extended_property(&mut self, node: u32, img_base: u64) -> Result<(), WzError> {
        enum Ext {
            SubProperty,
            Canvas,
            Vector,
            Convex,
            Sound,
            Uol,
        }
        let name_id = self.read_prop_string(img_base)?;
        let ext = match self.strings.get(name_id) {
            "Property" => Ext::SubProperty,
            "Canvas" => Ext::Canvas,
            "Shape2D#Vector2D" => Ext::Vector,
            "Shape2D#Convex2D" => Ext::Convex,
            "Sound_DX8" => Ext::Sound,
            "UOL" => Ext::Uol,
            other => {
                return Err(WzError::Format(format!(
                    "unknown extended property type '{other}'"
                )))
            }
        };
        match ext {
            Ext::SubProperty => {
                self.input.skip(2)?;
                self.sub_property(node, img_base)?;
            }
            Ext::Canvas => {
                self.input.skip(1)?;
                if self.input.read_u8()? == 1 {
                    self.input.skip(2)?;
                    self.sub_property(node, img_base)?;
                }
                // The descriptor's offset must point past the nested
                // sub-property, at the bitmap payload header.
                let id = self.bitmaps.len() as u32;
                self.bitmaps.push(BitmapRef {
                    offset: self.input.tell(),
                    key: self.key()?,
                });
                let width = self.input.read_cint()?;
                let height = self.input.read_cint()?;
                self.nodes[node as usize].set_bitmap(id, width as u16, height as u16);
            }
            Ext::Vector => {
                let x = self.input.read_cint()?;
                let y = self.input.read_cint()?;
                self.nodes[node as usize].set_vector(x, y);
            }
            Ext::Convex => {
                let count = self.input.read_cint()?;
                if count < 0 {
                    return Err(WzError::Format("convex has negative point count".into()));
                }
                let first = self.alloc_children(node, count as u32)?;
                for i in 0..count as u32 {
                    let name = self.strings.add(i.to_string());
                    self.nodes[(first + i) as usize].name = name;
                    self.extended_property(first + i, img_base)?;
                }
            }
            Ext::Sound => {
                self.input.skip(1)?;
                let length = (self.input.read_cint()? as u32).wrapping_add(82);
                self.input.read_cint()?;
                let id = self.audios.len() as u32;
                self.audios.push(AudioRef {
                    length,
                    offset: self.input.tell(),
                });
                self.nodes[node as usize].set_audio(id, length);
            }
            Ext::Uol => {
                self.input.skip(1)?;
                let id = self.read_prop_string(img_base)?;
                self.nodes[node as usize].set_uol(id);
            }
        }
        Ok(())
    }

    fn sub_property(&mut self, node: u32, img_base: u64) -> Result<(), WzError> {
        let count = self.input.read_cint()?;
        if count < 0 {
            return Err(WzError::Format("property has negative child count".into()));
        }
        let first = self.alloc_children(node, count as u32)?;
        for i in 0..count as u32 {
            let idx = (first + i) as usize;
            self.nodes[idx].name = self.read_prop_string(img_base)?;
            let inner = self.input.read_u8()?;
            match inner {
                // Null entries become integers carrying their sibling index.
                0x00 => self.nodes[idx].set_integer(i as i64),
                0x02 | 0x0B => {
                    let v = self.input.read_u16()?;
                    self.nodes[idx].set_integer(v as i64);
                }
                0x03 | 0x13 => {
                    let v = self.input.read_cint()?;
                    self.nodes[idx].set_integer(v as i64);
                }
                0x04 => {
                    let d = self.input.read_u8()?;
                    let v = if d == 0x80 {
                        self.input.read_f32()? as f64
                    } else {
                        d as i8 as f64
                    };
                    self.nodes[idx].set_real(v);
                }
                0x05 => {
                    let v = self.input.read_f64()?;
                    self.nodes[idx].set_real(v);
                }
                0x08 => {
                    let s = self.read_prop_string(img_base)?;
                    self.nodes[idx].set_string(s);
                }
                0x09 => {
                    let length = self.input.read_i32()?;
                    let resume = self.input.tell() + length as u64;
                    self.extended_property(first + i, img_base)?;
                    self.input.seek(resume)?;
                }
                0x14 => {
                    let d = self.input.read_u8()?;
                    let v = if d == 0x80 {
                        self.input.read_i64()?
                    } else {
                        d as i8 as i64
                    };
                    self.nodes[idx].set_integer(v);
                }
                t => {
                    return Err(WzError::Format(format!(
                        "unknown property type {t:#04x}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Sorts every child range by raw name bytes, then runs the reference
    /// passes. After this the tree is immutable.
    pub(crate) fn finish_parse(&mut self) {
        let ranges = mem::take(&mut self.ranges_to_sort);
        for (first, count) in ranges {
            let strings = &self.strings;
            let range = &mut self.nodes[first as usize..(first + count) as usize];
            range.sort_unstable_by(|a, b| strings.get(a.name).cmp(strings.get(b.name)));
        }
        self.resolve_references();
    }
}
