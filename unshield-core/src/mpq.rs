//! Reader and writer for the map container (MPQ format 1, as written by the map
//! editor). Only what map files use is implemented, and the reader tolerates the
//! table tricks protectors rely on: negative table offsets, tables running past the
//! end of the stream, bogus block indices and garbage header fields.

use bitflags::bitflags;
use bzip2::read::BzDecoder;
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use crate::hash::{self, decrypt_bytes, decrypt_u32s, encrypt_u32s, Channel, Fingerprint};
use crate::report::ProtectionReport;
use crate::{Result, UnshieldError};

pub const HEADER_SIGNATURE: &[u8; 4] = b"MPQ\x1A";
const WRAPPER_SIGNATURE: &[u8; 4] = b"HM3W";
/// Maps saved by the editor carry a fixed-size `HM3W` block in front of the archive.
pub const WRAPPER_SIZE: usize = 512;
const HEADER_ALIGNMENT: usize = 512;
const HEADER_SIZE: u32 = 32;
const TABLE_ENTRY_SIZE: usize = 16;
const WRITE_SECTOR_SHIFT: u16 = 3;
const ZLIB_MASK: u8 = 0x02;
const BZIP2_MASK: u8 = 0x10;

pub const HASH_ENTRY_EMPTY: u32 = 0xFFFF_FFFF;
pub const HASH_ENTRY_DELETED: u32 = 0xFFFF_FFFE;

pub const LISTFILE_NAME: &str = "(listfile)";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlockFlags: u32 {
        const IMPLODE = 0x0000_0100;
        const COMPRESS = 0x0000_0200;
        const ENCRYPTED = 0x0001_0000;
        const FIX_KEY = 0x0002_0000;
        const SINGLE_UNIT = 0x0100_0000;
        const DELETE_MARKER = 0x0200_0000;
        const SECTOR_CRC = 0x0400_0000;
        const EXISTS = 0x8000_0000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Absolute offset of the `MPQ\x1A` signature in the input.
    pub offset: usize,
    pub header_size: u32,
    pub archive_size: u32,
    pub format_version: u16,
    /// Sector size is `512 << sector_shift`.
    pub sector_shift: u16,
    /// Relative to `offset`. May be negative.
    pub hash_table_pos: i32,
    pub block_table_pos: i32,
    pub hash_table_size: u32,
    pub block_table_size: u32,
}

fn read_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

fn read_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

impl Header {
    fn parse(raw: &[u8], offset: usize) -> Result<Header> {
        if offset + HEADER_SIZE as usize > raw.len() {
            return Err(UnshieldError::ContainerCorrupt(
                "archive header is truncated".to_string(),
            ));
        }
        Ok(Header {
            offset,
            header_size: read_u32(raw, offset + 4),
            archive_size: read_u32(raw, offset + 8),
            format_version: read_u16(raw, offset + 12),
            sector_shift: read_u16(raw, offset + 14),
            hash_table_pos: read_u32(raw, offset + 16) as i32,
            block_table_pos: read_u32(raw, offset + 20) as i32,
            hash_table_size: read_u32(raw, offset + 24),
            block_table_size: read_u32(raw, offset + 28),
        })
    }

    pub fn sector_size(&self) -> usize {
        // The game masks the shift, so absurd values still produce a usable size.
        512usize << (self.sector_shift & 0x0F)
    }

    fn absolute(&self, pos: i32) -> Option<usize> {
        let absolute = self.offset as i64 + pos as i64;
        usize::try_from(absolute).ok()
    }
}

/// Finds the first `MPQ\x1A` signature on a 512-byte boundary.
pub fn locate_header(raw: &[u8]) -> Option<usize> {
    (0..raw.len())
        .step_by(HEADER_ALIGNMENT)
        .find(|&at| raw.len() >= at + 4 && &raw[at..at + 4] == HEADER_SIGNATURE)
}

/// Returns the wrapper block in front of the archive when the stream has one.
pub fn wrapper_prefix(raw: &[u8]) -> Option<&[u8]> {
    if raw.len() >= WRAPPER_SIZE && raw.starts_with(WRAPPER_SIGNATURE) {
        Some(&raw[..WRAPPER_SIZE])
    } else {
        None
    }
}

/// The game only accepts format version 0 in map archives, while other tools refuse
/// anything they think is a newer format. Rewrites the field in place.
pub fn normalize_header(raw: &mut [u8], report: &mut ProtectionReport) -> bool {
    let Some(offset) = locate_header(raw) else {
        return false;
    };
    let at = offset + 12;
    if raw.len() < at + 2 {
        return false;
    }
    if read_u16(raw, at) == 0 {
        return false;
    }
    raw[at..at + 2].copy_from_slice(&0u16.to_le_bytes());
    report.protection();
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashEntry {
    pub name_a: u32,
    pub name_b: u32,
    pub locale: u16,
    pub platform: u16,
    pub block_index: u32,
}

impl HashEntry {
    const EMPTY: HashEntry = HashEntry {
        name_a: 0xFFFF_FFFF,
        name_b: 0xFFFF_FFFF,
        locale: 0xFFFF,
        platform: 0xFFFF,
        block_index: HASH_ENTRY_EMPTY,
    };

    pub fn is_empty(&self) -> bool {
        self.block_index == HASH_ENTRY_EMPTY
    }

    pub fn is_deleted(&self) -> bool {
        self.block_index == HASH_ENTRY_DELETED
    }

    pub fn fingerprint(&self) -> Fingerprint {
        hash::fingerprint_of(self.name_a, self.name_b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// Relative to the archive header.
    pub offset: u32,
    pub compressed_size: u32,
    pub size: u32,
    pub flags: BlockFlags,
}

impl BlockEntry {
    const MISSING: BlockEntry = BlockEntry {
        offset: 0,
        compressed_size: 0,
        size: 0,
        flags: BlockFlags::empty(),
    };
}

/// One stored file, identified by the hash entry that first references its block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name_a: u32,
    pub name_b: u32,
    pub block_index: u32,
    pub name: Option<String>,
    pub size: u32,
    pub compressed_size: u32,
    pub flags: BlockFlags,
}

impl Entry {
    pub fn fingerprint(&self) -> Fingerprint {
        hash::fingerprint_of(self.name_a, self.name_b)
    }

    pub fn is_unknown(&self) -> bool {
        self.name.is_none()
    }

    pub fn compressed(&self) -> bool {
        self.flags.intersects(BlockFlags::COMPRESS | BlockFlags::IMPLODE)
    }
}

pub struct Archive {
    data: Vec<u8>,
    header: Header,
    hash_table: Vec<HashEntry>,
    block_table: Vec<BlockEntry>,
    block_names: Vec<Option<String>>,
}

fn read_table(
    raw: &[u8],
    start: usize,
    count: usize,
    key_name: &str,
) -> Vec<[u32; 4]> {
    if count == 0 {
        return Vec::new();
    }
    let mut words: Vec<u32> = raw[start..start + count * TABLE_ENTRY_SIZE]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    decrypt_u32s(&mut words, hash::hash(key_name, Channel::FileKey));
    words
        .chunks_exact(4)
        .map(|w| [w[0], w[1], w[2], w[3]])
        .collect()
}

/// Entries that fit between `start` and the end of the stream.
fn entries_available(raw: &[u8], start: usize, declared: u32) -> usize {
    let room = raw.len().saturating_sub(start) / TABLE_ENTRY_SIZE;
    room.min(declared as usize)
}

impl Archive {
    /// Opens an archive, refusing any table that does not fully fit the stream.
    pub fn open(data: Vec<u8>) -> Result<Archive> {
        Archive::load(data, false)
    }

    /// Opens an archive, falling back to a raw block scan when the tables are
    /// damaged. The flag reports whether the fallback was needed.
    pub fn open_or_reconstruct(data: Vec<u8>) -> Result<(Archive, bool)> {
        match Archive::load(data.clone(), false) {
            Ok(archive) => Ok((archive, false)),
            Err(UnshieldError::TableCorrupt(reason)) => {
                log::warn!("table validation failed ({reason}), scanning blocks");
                Archive::load(data, true).map(|archive| (archive, true))
            }
            Err(err) => Err(err),
        }
    }

    fn load(data: Vec<u8>, reconstruct: bool) -> Result<Archive> {
        let offset = locate_header(&data).ok_or_else(|| {
            UnshieldError::ContainerCorrupt(
                "no archive signature on any 512-byte boundary".to_string(),
            )
        })?;
        let header = Header::parse(&data, offset)?;

        let hash_start = header.absolute(header.hash_table_pos).ok_or_else(|| {
            UnshieldError::TableCorrupt("hash table starts before the stream".to_string())
        })?;
        let hash_count = if reconstruct {
            entries_available(&data, hash_start, header.hash_table_size)
        } else {
            let count = header.hash_table_size as usize;
            if count == 0 || !count.is_power_of_two() {
                return Err(UnshieldError::TableCorrupt(format!(
                    "hash table size {count} is not a power of two"
                )));
            }
            if hash_start + count * TABLE_ENTRY_SIZE > data.len() {
                return Err(UnshieldError::TableCorrupt(
                    "hash table extends beyond end of file".to_string(),
                ));
            }
            count
        };
        if hash_count == 0 {
            return Err(UnshieldError::TableCorrupt(
                "hash table is unreadable".to_string(),
            ));
        }

        let declared_block_start = header.absolute(header.block_table_pos);
        let block_start = match declared_block_start {
            Some(start) if start < data.len() => start,
            _ if reconstruct => hash_start + hash_count * TABLE_ENTRY_SIZE,
            _ => {
                return Err(UnshieldError::TableCorrupt(
                    "block table lies outside the stream".to_string(),
                ))
            }
        };
        let block_count = if reconstruct {
            entries_available(&data, block_start, header.block_table_size)
        } else {
            let count = header.block_table_size as usize;
            if block_start + count * TABLE_ENTRY_SIZE > data.len() {
                return Err(UnshieldError::TableCorrupt(
                    "block table extends beyond end of file".to_string(),
                ));
            }
            count
        };

        let mut hash_table: Vec<HashEntry> = read_table(&data, hash_start, hash_count, "(hash table)")
            .into_iter()
            .map(|w| HashEntry {
                name_a: w[0],
                name_b: w[1],
                locale: (w[2] & 0xFFFF) as u16,
                platform: (w[2] >> 16) as u16,
                block_index: w[3],
            })
            .collect();

        let mut block_table: Vec<BlockEntry> =
            read_table(&data, block_start, block_count, "(block table)")
                .into_iter()
                .map(|w| BlockEntry {
                    offset: w[0],
                    compressed_size: w[1],
                    size: w[2],
                    flags: BlockFlags::from_bits_retain(w[3]),
                })
                .collect();

        if reconstruct {
            let mut dropped = 0usize;
            for block in block_table.iter_mut() {
                let end = offset as u64 + block.offset as u64 + block.compressed_size as u64;
                if !block.flags.contains(BlockFlags::EXISTS) || end > data.len() as u64 {
                    *block = BlockEntry::MISSING;
                    dropped += 1;
                }
            }
            for entry in hash_table.iter_mut() {
                let idx = entry.block_index as usize;
                if !entry.is_empty()
                    && !entry.is_deleted()
                    && idx < block_table.len()
                    && block_table[idx] == BlockEntry::MISSING
                {
                    entry.block_index = HASH_ENTRY_DELETED;
                }
            }
            log::debug!(
                "reconstructed tables: {hash_count} hash entries, {} blocks, {dropped} dropped",
                block_table.len()
            );
        }

        let block_names = vec![None; block_table.len()];
        Ok(Archive {
            data,
            header,
            hash_table,
            block_table,
            block_names,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn hash_table(&self) -> &[HashEntry] {
        &self.hash_table
    }

    pub fn block_table(&self) -> &[BlockEntry] {
        &self.block_table
    }

    fn is_live(&self, entry: &HashEntry) -> bool {
        !entry.is_empty()
            && !entry.is_deleted()
            && (entry.block_index as usize) < self.block_table.len()
    }

    /// Marks hash entries that point past the block table as deleted, so nothing
    /// downstream indexes out of bounds. Deleted rather than emptied so probe chains
    /// running through them still reach later entries.
    pub fn repair(&mut self) -> usize {
        let block_count = self.block_table.len();
        let mut repaired = 0;
        for entry in self.hash_table.iter_mut() {
            if !entry.is_empty() && !entry.is_deleted() && entry.block_index as usize >= block_count
            {
                entry.block_index = HASH_ENTRY_DELETED;
                repaired += 1;
            }
        }
        repaired
    }

    /// Index of the hash entry for `name`, probing from its home slot like the game.
    pub fn find(&self, name: &str) -> Option<usize> {
        let size = self.hash_table.len();
        if size == 0 {
            return None;
        }
        let home = hash::hash(name, Channel::TableOffset) as usize % size;
        let name_a = hash::hash(name, Channel::NameA);
        let name_b = hash::hash(name, Channel::NameB);

        for step in 0..size {
            let index = (home + step) % size;
            let entry = &self.hash_table[index];
            if entry.is_empty() {
                break;
            }
            if self.is_live(entry) && entry.name_a == name_a && entry.name_b == name_b {
                return Some(index);
            }
        }
        None
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn block_of(&self, name: &str) -> Option<u32> {
        self.find(name).map(|index| self.hash_table[index].block_index)
    }

    pub fn is_block_named(&self, block: u32) -> bool {
        self.block_names
            .get(block as usize)
            .map_or(false, Option::is_some)
    }

    /// Attaches `name` to the block it hashes to. Returns `true` only when that
    /// block was previously unnamed.
    pub fn resolve(&mut self, name: &str) -> bool {
        let Some(index) = self.find(name) else {
            return false;
        };
        let block = self.hash_table[index].block_index as usize;
        if self.block_names[block].is_some() {
            return false;
        }
        self.block_names[block] = Some(name.to_string());
        true
    }

    /// One entry per existing block, ordered by the hash entry that reaches it first.
    pub fn entries(&self) -> Vec<Entry> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for hash_entry in &self.hash_table {
            if !self.is_live(hash_entry) || !seen.insert(hash_entry.block_index) {
                continue;
            }
            let block = &self.block_table[hash_entry.block_index as usize];
            if !block.flags.contains(BlockFlags::EXISTS) {
                continue;
            }
            entries.push(Entry {
                name_a: hash_entry.name_a,
                name_b: hash_entry.name_b,
                block_index: hash_entry.block_index,
                name: self.block_names[hash_entry.block_index as usize].clone(),
                size: block.size,
                compressed_size: block.compressed_size,
                flags: block.flags,
            });
        }
        entries
    }

    pub fn count_unknown(&self) -> usize {
        self.entries().iter().filter(|e| e.is_unknown()).count()
    }

    pub fn unknown_fingerprints(&self) -> HashSet<Fingerprint> {
        let unnamed: HashSet<u32> = self
            .entries()
            .iter()
            .filter(|e| e.is_unknown())
            .map(|e| e.block_index)
            .collect();
        // Every hash entry of an unnamed block counts, duplicates included.
        self.hash_table
            .iter()
            .filter(|e| self.is_live(e) && unnamed.contains(&e.block_index))
            .map(HashEntry::fingerprint)
            .collect()
    }

    pub fn known_names(&self) -> Vec<String> {
        self.entries().into_iter().filter_map(|e| e.name).collect()
    }

    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let index = self
            .find(name)
            .ok_or_else(|| UnshieldError::Config(format!("{name} is not in the archive")))?;
        let block = self.hash_table[index].block_index;
        self.read_block(block as usize, Some(name))
    }

    pub fn extract(&self, entry: &Entry) -> Result<Vec<u8>> {
        self.read_block(entry.block_index as usize, entry.name.as_deref())
    }

    fn read_block(&self, index: usize, name: Option<&str>) -> Result<Vec<u8>> {
        let block = self.block_table.get(index).ok_or_else(|| {
            UnshieldError::TableCorrupt(format!("block index {index} out of range"))
        })?;
        if !block.flags.contains(BlockFlags::EXISTS) {
            return Err(UnshieldError::Unsupported(format!(
                "block {index} does not hold a file"
            )));
        }
        if block.flags.contains(BlockFlags::IMPLODE) {
            return Err(UnshieldError::Unsupported(
                "imploded payloads are not supported".to_string(),
            ));
        }

        let start = self.header.offset + block.offset as usize;
        let end = start + block.compressed_size as usize;
        if end > self.data.len() {
            return Err(UnshieldError::TableCorrupt(format!(
                "block {index} extends beyond end of file"
            )));
        }
        let raw = &self.data[start..end];

        let key = if block.flags.contains(BlockFlags::ENCRYPTED) {
            let name = name.ok_or_else(|| {
                UnshieldError::Unsupported(format!(
                    "block {index} is encrypted and its name is unknown"
                ))
            })?;
            Some(hash::file_key(
                name,
                block.offset,
                block.size,
                block.flags.contains(BlockFlags::FIX_KEY),
            ))
        } else {
            None
        };

        if block.size == 0 {
            return Ok(Vec::new());
        }

        if block.flags.contains(BlockFlags::SINGLE_UNIT) {
            let mut payload = raw.to_vec();
            if let Some(key) = key {
                decrypt_bytes(&mut payload, key);
            }
            if block.flags.contains(BlockFlags::COMPRESS) && payload.len() < block.size as usize {
                return decompress(&payload, block.size as usize);
            }
            return Ok(payload);
        }

        self.read_sectors(raw, block, key)
    }

    fn read_sectors(&self, raw: &[u8], block: &BlockEntry, key: Option<u32>) -> Result<Vec<u8>> {
        let sector_size = self.header.sector_size();
        let size = block.size as usize;
        let sector_count = size.div_ceil(sector_size);

        if !block.flags.contains(BlockFlags::COMPRESS) {
            let mut payload = raw.to_vec();
            if let Some(key) = key {
                for (i, sector) in payload.chunks_mut(sector_size).enumerate() {
                    decrypt_bytes(sector, key.wrapping_add(i as u32));
                }
            }
            payload.truncate(size);
            return Ok(payload);
        }

        let table_len = (sector_count + 1) * 4;
        if raw.len() < table_len {
            return Err(UnshieldError::TableCorrupt(
                "sector offset table is truncated".to_string(),
            ));
        }
        let mut table = raw[..table_len].to_vec();
        if let Some(key) = key {
            decrypt_bytes(&mut table, key.wrapping_sub(1));
        }
        let offsets: Vec<usize> = table
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as usize)
            .collect();

        let mut payload = Vec::with_capacity(size);
        for i in 0..sector_count {
            let (from, to) = (offsets[i], offsets[i + 1]);
            if from > to || to > raw.len() {
                return Err(UnshieldError::TableCorrupt(format!(
                    "sector {i} has an invalid range {from}..{to}"
                )));
            }
            let mut sector = raw[from..to].to_vec();
            if let Some(key) = key {
                decrypt_bytes(&mut sector, key.wrapping_add(i as u32));
            }
            let expected = sector_size.min(size - i * sector_size);
            if sector.len() < expected {
                payload.extend(decompress(&sector, expected)?);
            } else {
                payload.extend_from_slice(&sector[..expected]);
            }
        }
        Ok(payload)
    }
}

fn decompress(sector: &[u8], expected: usize) -> Result<Vec<u8>> {
    let (&mask, body) = sector
        .split_first()
        .ok_or_else(|| UnshieldError::TableCorrupt("empty compressed sector".to_string()))?;
    if mask == 0 || mask & !(ZLIB_MASK | BZIP2_MASK) != 0 {
        return Err(UnshieldError::Unsupported(format!(
            "compression mask {mask:#04x}"
        )));
    }

    // bzip2 is the outer layer when both are set.
    let mut data = body.to_vec();
    if mask & BZIP2_MASK != 0 {
        let mut out = Vec::with_capacity(expected);
        BzDecoder::new(data.as_slice()).read_to_end(&mut out)?;
        data = out;
    }
    if mask & ZLIB_MASK != 0 {
        let mut out = Vec::with_capacity(expected);
        ZlibDecoder::new(data.as_slice()).read_to_end(&mut out)?;
        data = out;
    }
    if data.len() != expected {
        return Err(UnshieldError::TableCorrupt(format!(
            "sector decoded to {} bytes, expected {expected}",
            data.len()
        )));
    }
    Ok(data)
}

fn compress_sector(sector: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(vec![ZLIB_MASK], Compression::default());
    encoder.write_all(sector)?;
    Ok(encoder.finish()?)
}

/// Assembles a fresh format-1 archive.
#[derive(Default)]
pub struct ArchiveBuilder {
    files: Vec<(String, Vec<u8>)>,
    include_listfile: bool,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            include_listfile: true,
        }
    }

    pub fn include_listfile(mut self, include: bool) -> Self {
        self.include_listfile = include;
        self
    }

    /// Adds a file; a later file with the same (case-insensitive) name replaces it.
    pub fn add_file(&mut self, name: &str, data: Vec<u8>) {
        let name = name.replace('/', "\\");
        self.files
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.files.push((name, data));
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        let mut files: Vec<(String, Vec<u8>)> = self
            .files
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case(LISTFILE_NAME))
            .cloned()
            .collect();
        if self.include_listfile {
            let listing = files
                .iter()
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>()
                .join("\r\n");
            files.push((LISTFILE_NAME.to_string(), listing.into_bytes()));
        }

        let sector_size = 512usize << WRITE_SECTOR_SHIFT;
        let mut out = vec![0u8; HEADER_SIZE as usize];
        let mut blocks = Vec::with_capacity(files.len());

        for (_, data) in &files {
            let offset = out.len() as u32;
            if data.is_empty() {
                blocks.push(BlockEntry {
                    offset,
                    compressed_size: 0,
                    size: 0,
                    flags: BlockFlags::EXISTS,
                });
                continue;
            }

            let sectors: Vec<Vec<u8>> = data
                .chunks(sector_size)
                .map(|chunk| {
                    let packed = compress_sector(chunk)?;
                    Ok(if packed.len() < chunk.len() {
                        packed
                    } else {
                        chunk.to_vec()
                    })
                })
                .collect::<Result<_>>()?;

            let mut table = Vec::with_capacity(sectors.len() + 1);
            let mut cursor = ((sectors.len() + 1) * 4) as u32;
            table.push(cursor);
            for sector in &sectors {
                cursor += sector.len() as u32;
                table.push(cursor);
            }
            for entry in table {
                out.extend_from_slice(&entry.to_le_bytes());
            }
            for sector in sectors {
                out.extend(sector);
            }

            blocks.push(BlockEntry {
                offset,
                compressed_size: out.len() as u32 - offset,
                size: data.len() as u32,
                flags: BlockFlags::EXISTS | BlockFlags::COMPRESS,
            });
        }

        let hash_size = (files.len() * 2).next_power_of_two().max(16);
        let mut hash_table = vec![HashEntry::EMPTY; hash_size];
        for (block_index, (name, _)) in files.iter().enumerate() {
            let home = hash::hash(name, Channel::TableOffset) as usize % hash_size;
            let slot = (0..hash_size)
                .map(|step| (home + step) % hash_size)
                .find(|&i| hash_table[i].is_empty())
                .ok_or_else(|| UnshieldError::Config("hash table is full".to_string()))?;
            hash_table[slot] = HashEntry {
                name_a: hash::hash(name, Channel::NameA),
                name_b: hash::hash(name, Channel::NameB),
                locale: 0,
                platform: 0,
                block_index: block_index as u32,
            };
        }

        let hash_pos = out.len() as u32;
        let mut words: Vec<u32> = hash_table
            .iter()
            .flat_map(|e| {
                [
                    e.name_a,
                    e.name_b,
                    (e.locale as u32) | ((e.platform as u32) << 16),
                    e.block_index,
                ]
            })
            .collect();
        encrypt_u32s(&mut words, hash::hash("(hash table)", Channel::FileKey));
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }

        let block_pos = out.len() as u32;
        let mut words: Vec<u32> = blocks
            .iter()
            .flat_map(|b| [b.offset, b.compressed_size, b.size, b.flags.bits()])
            .collect();
        encrypt_u32s(&mut words, hash::hash("(block table)", Channel::FileKey));
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }

        let archive_size = out.len() as u32;
        let mut header = Vec::with_capacity(HEADER_SIZE as usize);
        header.extend_from_slice(HEADER_SIGNATURE);
        header.extend_from_slice(&HEADER_SIZE.to_le_bytes());
        header.extend_from_slice(&archive_size.to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(&WRITE_SECTOR_SHIFT.to_le_bytes());
        header.extend_from_slice(&hash_pos.to_le_bytes());
        header.extend_from_slice(&block_pos.to_le_bytes());
        header.extend_from_slice(&(hash_size as u32).to_le_bytes());
        header.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
        out[..HEADER_SIZE as usize].copy_from_slice(&header);

        Ok(out)
    }
}

/// Archive name for a file below `base_dir`, using the format's `\` separator.
pub fn archive_name(base_dir: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(base_dir).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\\"))
    }
}

/// Writes an archive holding exactly `files` to `output`. The archive is written
/// next to the destination first and renamed over it once complete.
pub fn rebuild(
    output: &Path,
    base_dir: &Path,
    files: &[std::path::PathBuf],
    prefix: Option<&[u8]>,
) -> Result<usize> {
    let mut builder = ArchiveBuilder::new();
    for file in files {
        let Some(name) = archive_name(base_dir, file) else {
            log::warn!("skipping {} outside of {}", file.display(), base_dir.display());
            continue;
        };
        builder.add_file(&name, fs::read(file)?);
    }
    let archive = builder.build()?;

    let mut staged = output.as_os_str().to_owned();
    staged.push(".partial");
    let staged = std::path::PathBuf::from(staged);
    let written = write_staged(&staged, prefix, &archive).and_then(|()| fs::rename(&staged, output));
    if let Err(err) = written {
        if let Err(cleanup) = fs::remove_file(&staged) {
            log::debug!("could not remove {}: {cleanup}", staged.display());
        }
        return Err(err.into());
    }
    Ok(builder.files.len())
}

fn write_staged(staged: &Path, prefix: Option<&[u8]>, archive: &[u8]) -> std::io::Result<()> {
    let mut out = fs::File::create(staged)?;
    if let Some(prefix) = prefix {
        out.write_all(prefix)?;
    }
    out.write_all(archive)?;
    out.flush()
}
