//! Dynamic VHD image writer.
//!
//! A read-side tap: every byte that flows out of the image read path can
//! be mirrored into a sparse (dynamic) VHD file, turning a one-pass
//! examination into a persistent capture. The produced file follows the
//! Microsoft VHD layout: a leading copy of the 512-byte footer, the
//! 1024-byte sparse header, the Block Allocation Table, then per-block
//! `(sector bitmap, data)` regions, with the canonical footer always
//! occupying the last 512 bytes.
//!
//! All multi-byte VHD fields are big-endian.

use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ImageError;

/// Logical block size of the produced dynamic VHD (2 MiB).
pub const VHD_BLOCK_SIZE: u64 = 0x20_0000;
/// VHD sector size; the format hard-codes 512.
pub const VHD_SECTOR_SIZE: u64 = 512;
/// A dynamic VHD BAT entry is a 32-bit sector number, which caps the
/// output at roughly 2 TB.
pub const VHD_MAX_IMAGE_SIZE: u64 = 2 * 1024 * 1024 * 1024 * 1024;

const FOOTER_COOKIE: &[u8; 8] = b"conectix";
const SPARSE_COOKIE: &[u8; 8] = b"cxsparse";
const BAT_OFFSET: u64 = 0x600;
const BAT_UNALLOCATED: u32 = 0xffff_ffff;
/// Seconds between the Unix epoch and the VHD epoch (2000-01-01 UTC).
const VHD_EPOCH_OFFSET: u64 = 946_684_800;

/// Capture state of one logical block.
enum BlockState {
    Unallocated,
    /// Present in the file; the bitmap marks which sectors hold data.
    Allocated { bitmap: Vec<u8> },
    /// Every sector of the block has been written; the bitmap is freed.
    Finished,
}

/// Writer state for one dynamic VHD output file.
pub struct VhdWriter {
    file: File,
    image_size: u64,
    sectors_per_block: u64,
    /// Per-block sector bitmap length in bytes, padded to a sector.
    bitmap_len: u64,
    bat: Vec<u32>,
    blocks: Vec<BlockState>,
    /// Host byte offset where the next allocated block will land (also
    /// the current position of the trailing footer).
    next_data_offset: u64,
    footer: [u8; 512],
    /// First write failure; once set, every later call reports it.
    error: Option<String>,
}

impl VhdWriter {
    /// Create the output file and lay down footer copy, sparse header,
    /// empty BAT, and trailing footer.
    pub fn create(output_path: &str, image_size: u64) -> Result<VhdWriter, ImageError> {
        if image_size == 0 || image_size > VHD_MAX_IMAGE_SIZE {
            return Err(ImageError::Arg(format!(
                "image size {} out of range for a dynamic VHD",
                image_size
            )));
        }

        let total_blocks = image_size.div_ceil(VHD_BLOCK_SIZE);
        let sectors_per_block = VHD_BLOCK_SIZE / VHD_SECTOR_SIZE;
        let bitmap_len = (sectors_per_block / 8).div_ceil(VHD_SECTOR_SIZE) * VHD_SECTOR_SIZE;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(output_path)
            .map_err(|e| ImageError::Open {
                path: output_path.to_string(),
                source: e,
            })?;

        let footer = build_footer(image_size);
        let header = build_sparse_header(total_blocks as u32);
        let bat_len = (total_blocks * 4).div_ceil(VHD_SECTOR_SIZE) * VHD_SECTOR_SIZE;
        let next_data_offset = BAT_OFFSET + bat_len;

        let mut preamble = Vec::with_capacity(next_data_offset as usize + 512);
        preamble.extend_from_slice(&footer);
        preamble.extend_from_slice(&header);
        preamble.resize((BAT_OFFSET + bat_len) as usize, 0);
        for entry in preamble[BAT_OFFSET as usize..].chunks_exact_mut(4) {
            entry.copy_from_slice(&BAT_UNALLOCATED.to_be_bytes());
        }
        preamble.extend_from_slice(&footer);
        file.write_all(&preamble)
            .map_err(|e| ImageError::Write(e.to_string()))?;

        debug!(
            "Created dynamic VHD '{}': {} block(s) of {} bytes",
            output_path, total_blocks, VHD_BLOCK_SIZE
        );

        let mut blocks = Vec::with_capacity(total_blocks as usize);
        blocks.resize_with(total_blocks as usize, || BlockState::Unallocated);

        Ok(VhdWriter {
            file,
            image_size,
            sectors_per_block,
            bitmap_len,
            bat: vec![BAT_UNALLOCATED; total_blocks as usize],
            blocks,
            next_data_offset,
            footer,
            error: None,
        })
    }

    #[inline]
    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Whether every sector of block `index` has been captured.
    pub fn is_block_finished(&self, index: usize) -> bool {
        matches!(self.blocks[index], BlockState::Finished)
    }

    /// The first write failure, if any. Sticky.
    pub fn sticky_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Number of sectors of block `index` that the image actually covers.
    /// Only the trailing block can be partial.
    fn covered_sectors(&self, index: usize) -> u64 {
        let block_start = index as u64 * VHD_BLOCK_SIZE;
        let remaining = self.image_size - block_start;
        remaining.min(VHD_BLOCK_SIZE).div_ceil(VHD_SECTOR_SIZE)
    }

    /// Mirror `data` (read from logical `offset`) into the VHD.
    ///
    /// `offset` must be sector-aligned, `data.len()` a multiple of 512,
    /// and the span must lie within one logical block. Never changes what
    /// the reader observed; failures are recorded and re-reported by
    /// [`VhdWriter::sticky_error`].
    pub fn add(&mut self, offset: u64, data: &[u8]) -> Result<(), ImageError> {
        if let Some(e) = &self.error {
            return Err(ImageError::Write(e.clone()));
        }
        let result = self.add_inner(offset, data);
        if let Err(e) = &result {
            warn!("VHD writer poisoned: {}", e);
            self.error = Some(e.to_string());
        }
        result
    }

    fn add_inner(&mut self, offset: u64, data: &[u8]) -> Result<(), ImageError> {
        if offset % VHD_SECTOR_SIZE != 0 || data.len() as u64 % VHD_SECTOR_SIZE != 0 {
            return Err(ImageError::Arg(
                "VHD add requires sector-aligned offset and length".into(),
            ));
        }
        let block = (offset / VHD_BLOCK_SIZE) as usize;
        let first_sector = (offset % VHD_BLOCK_SIZE) / VHD_SECTOR_SIZE;
        let sector_count = data.len() as u64 / VHD_SECTOR_SIZE;
        if first_sector + sector_count > self.sectors_per_block || block >= self.blocks.len() {
            return Err(ImageError::Arg(
                "VHD add must lie within one logical block".into(),
            ));
        }

        match &mut self.blocks[block] {
            BlockState::Finished => return Ok(()),
            BlockState::Allocated { .. } => {
                self.fill_allocated(block, first_sector, sector_count, data)?
            }
            BlockState::Unallocated => {
                self.append_block(block, first_sector, sector_count, data)?
            }
        }

        self.retire_if_complete(block);
        Ok(())
    }

    /// Write into an already-allocated block, touching only sectors whose
    /// bitmap bit is still clear, then rewrite the bitmap.
    fn fill_allocated(
        &mut self,
        block: usize,
        first_sector: u64,
        sector_count: u64,
        data: &[u8],
    ) -> Result<(), ImageError> {
        let block_start = self.bat[block] as u64 * VHD_SECTOR_SIZE;
        let data_start = block_start + self.bitmap_len;

        let mut bitmap = match std::mem::replace(&mut self.blocks[block], BlockState::Unallocated) {
            BlockState::Allocated { bitmap } => bitmap,
            _ => unreachable!(),
        };

        for i in 0..sector_count {
            let sector = first_sector + i;
            if bitmap_get(&bitmap, sector) {
                continue;
            }
            let src = (i * VHD_SECTOR_SIZE) as usize;
            let host = data_start + sector * VHD_SECTOR_SIZE;
            if let Err(e) = write_at(
                &mut self.file,
                host,
                &data[src..src + VHD_SECTOR_SIZE as usize],
            ) {
                self.blocks[block] = BlockState::Allocated { bitmap };
                return Err(e);
            }
            bitmap_set(&mut bitmap, sector);
        }

        let result = write_at(&mut self.file, block_start, &bitmap);
        self.blocks[block] = BlockState::Allocated { bitmap };
        result
    }

    /// Append a brand-new block region: bitmap, zero-padded data area,
    /// BAT patch, and the relocated trailing footer.
    fn append_block(
        &mut self,
        block: usize,
        first_sector: u64,
        sector_count: u64,
        data: &[u8],
    ) -> Result<(), ImageError> {
        let block_start = self.next_data_offset;
        let sector_number: u32 = (block_start / VHD_SECTOR_SIZE) as u32;

        let mut bitmap = vec![0u8; self.bitmap_len as usize];
        for i in 0..sector_count {
            bitmap_set(&mut bitmap, first_sector + i);
        }

        let mut block_data = vec![0u8; VHD_BLOCK_SIZE as usize];
        let dst = (first_sector * VHD_SECTOR_SIZE) as usize;
        block_data[dst..dst + data.len()].copy_from_slice(data);

        write_at(&mut self.file, block_start, &bitmap)?;
        write_at(&mut self.file, block_start + self.bitmap_len, &block_data)?;

        self.bat[block] = sector_number;
        write_at(
            &mut self.file,
            BAT_OFFSET + block as u64 * 4,
            &sector_number.to_be_bytes(),
        )?;

        self.next_data_offset += self.bitmap_len + VHD_BLOCK_SIZE;
        let footer = self.footer;
        write_at(&mut self.file, self.next_data_offset, &footer)?;

        self.blocks[block] = BlockState::Allocated { bitmap };
        Ok(())
    }

    /// Mark the block finished and free its bitmap once every covered
    /// sector is present.
    fn retire_if_complete(&mut self, block: usize) {
        let covered = self.covered_sectors(block);
        if let BlockState::Allocated { bitmap } = &self.blocks[block] {
            let complete = (0..covered).all(|s| bitmap_get(bitmap, s));
            if complete {
                debug!("VHD block {} finished", block);
                self.blocks[block] = BlockState::Finished;
            }
        }
    }

    /// Flush the sink file.
    pub fn flush(&mut self) -> Result<(), ImageError> {
        self.file
            .flush()
            .map_err(|e| ImageError::Write(e.to_string()))
    }
}

fn write_at(file: &mut File, offset: u64, data: &[u8]) -> Result<(), ImageError> {
    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.write_all(data))
        .map_err(|e| ImageError::Write(format!("at offset 0x{:x}: {}", offset, e)))
}

#[inline]
fn bitmap_get(bitmap: &[u8], sector: u64) -> bool {
    let bit = 7 - (sector % 8) as u8;
    bitmap[(sector / 8) as usize] & (1 << bit) != 0
}

#[inline]
fn bitmap_set(bitmap: &mut [u8], sector: u64) {
    let bit = 7 - (sector % 8) as u8;
    bitmap[(sector / 8) as usize] |= 1 << bit;
}

/// Build the 512-byte VHD footer for a dynamic disk of `image_size`
/// bytes.
fn build_footer(image_size: u64) -> [u8; 512] {
    let mut footer = [0u8; 512];
    footer[0..8].copy_from_slice(FOOTER_COOKIE);
    footer[8..12].copy_from_slice(&2u32.to_be_bytes()); // features: reserved bit
    footer[12..16].copy_from_slice(&0x0001_0000u32.to_be_bytes()); // format 1.0
    footer[16..24].copy_from_slice(&0x200u64.to_be_bytes()); // sparse header offset

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let timestamp = now.saturating_sub(VHD_EPOCH_OFFSET) as u32;
    footer[24..28].copy_from_slice(&timestamp.to_be_bytes());

    footer[28..32].copy_from_slice(b"win ");
    footer[32..36].copy_from_slice(&0x0006_0001u32.to_be_bytes());
    footer[36..40].copy_from_slice(b"Wi2k");
    footer[40..48].copy_from_slice(&image_size.to_be_bytes()); // original size
    footer[48..56].copy_from_slice(&image_size.to_be_bytes()); // current size

    let (cylinders, heads, sectors_per_track) = chs_geometry(image_size);
    footer[56..58].copy_from_slice(&(cylinders as u16).to_be_bytes());
    footer[58] = heads as u8;
    footer[59] = sectors_per_track as u8;

    footer[60..64].copy_from_slice(&3u32.to_be_bytes()); // dynamic disk
    footer[68..84].copy_from_slice(&unique_id());

    let checksum = ones_complement_checksum(&footer, 64);
    footer[64..68].copy_from_slice(&checksum.to_be_bytes());
    footer
}

/// Build the 1024-byte sparse (dynamic disk) header.
fn build_sparse_header(total_blocks: u32) -> [u8; 1024] {
    let mut header = [0u8; 1024];
    header[0..8].copy_from_slice(SPARSE_COOKIE);
    header[8..16].copy_from_slice(&u64::MAX.to_be_bytes()); // data offset: unused
    header[16..24].copy_from_slice(&BAT_OFFSET.to_be_bytes());
    header[24..28].copy_from_slice(&0x0001_0000u32.to_be_bytes()); // header version
    header[28..32].copy_from_slice(&total_blocks.to_be_bytes());
    header[32..36].copy_from_slice(&(VHD_BLOCK_SIZE as u32).to_be_bytes());

    let checksum = ones_complement_checksum(&header, 36);
    header[36..40].copy_from_slice(&checksum.to_be_bytes());
    header
}

/// One's complement of the byte sum, with the four checksum bytes at
/// `checksum_offset` treated as zero.
fn ones_complement_checksum(raw: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u32 = 0;
    for (i, b) in raw.iter().enumerate() {
        if (checksum_offset..checksum_offset + 4).contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}

/// CHS geometry from total size, per the algorithm in the appendix of
/// the Microsoft VHD format document.
fn chs_geometry(size_bytes: u64) -> (u32, u32, u32) {
    let total_sectors = (size_bytes / VHD_SECTOR_SIZE).min(65535 * 16 * 255) as u32;
    if total_sectors == 0 {
        return (0, 0, 0);
    }

    if total_sectors >= 65535 * 16 * 63 {
        let spt = 255u32;
        let heads = 16u32;
        return (total_sectors / (heads * spt), heads, spt);
    }

    let mut spt = 17u32;
    let mut cyl_times_heads = total_sectors / spt;
    let mut heads = cyl_times_heads.div_ceil(1024);
    if heads < 4 {
        heads = 4;
    }
    if cyl_times_heads >= heads * 1024 || heads > 16 {
        spt = 31;
        heads = 16;
        cyl_times_heads = total_sectors / spt;
    }
    if cyl_times_heads >= heads * 1024 {
        spt = 63;
        heads = 16;
        cyl_times_heads = total_sectors / spt;
    }

    (cyl_times_heads / heads, heads, spt)
}

/// 16 pseudo-random bytes for the footer's unique-id field. Not
/// cryptographic; only has to avoid colliding between captures.
fn unique_id() -> [u8; 16] {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut id = [0u8; 16];
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    id[0..8].copy_from_slice(&hasher.finish().to_be_bytes());
    0x45584855u32.hash(&mut hasher);
    id[8..16].copy_from_slice(&hasher.finish().to_be_bytes());
    id
}
