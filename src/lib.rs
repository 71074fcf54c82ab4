//! Virtual disk image access for digital forensics.
//!
//! An [`Image`] presents one linear, read-only byte address space over a
//! split raw acquisition or a QCOW2 image (backing chains and compressed
//! clusters included), without mounting anything. Two optional layers
//! stack on top of it:
//!
//! * the [`vhd`] writer tap, which transparently materialises every byte
//!   read into a dynamic VHD capture file, and
//! * the [`bitlocker`] filter, which decrypts BitLocker volumes sector
//!   by sector once a password, recovery password, or clear key unwraps
//!   the key chain.
//!
//! `Image` and the BitLocker filter both implement [`Read`] and
//! [`Seek`], so file-system parsers sit on either without caring what is
//! underneath.

pub mod bitlocker;
pub mod error;
pub mod qcow2;
pub mod raw;
pub mod vhd;

use log::{debug, info};
use serde::Serialize;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use error::ImageError;
use qcow2::Qcow2;
use raw::RawSplit;
use vhd::{VhdWriter, VHD_BLOCK_SIZE, VHD_SECTOR_SIZE};

/// Concrete image kind with its open state.
pub enum ImageFormat {
    RawSplit {
        image: RawSplit,
        description: String,
    },
    Qcow2 {
        image: Qcow2,
        description: String,
    },
}

/// State shared between an image handle, its clones, and whoever is
/// watching a capture: the VHD sink plus the progress/cancel signals.
struct WriterShared {
    writer: Mutex<VhdWriter>,
    progress: AtomicU8,
    cancel: AtomicBool,
}

/// Evidence summary, serializable for tool output.
#[derive(Serialize)]
pub struct ImageInfo {
    pub format: String,
    pub description: String,
    pub size: u64,
    pub sector_size: u16,
    pub paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qcow2_chain: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_size: Option<u64>,
}

/// A mounted disk image: one linear byte address space over one or more
/// container files.
pub struct Image {
    /// Paths as given at open time (auto-discovery may expand them).
    paths: Vec<String>,
    format_name: &'static str,
    sector_size_override: Option<u16>,
    format: ImageFormat,
    writer: Option<Arc<WriterShared>>,
    position: u64,
}

impl Image {
    /// Open an image.
    ///
    /// `format` is `"raw"`, `"qcow2"`, or `"auto"`; auto-detection probes
    /// the QCOW2 magic on the first path and falls back to raw. The
    /// optional `sector_size` overrides the default of 512.
    pub fn open(
        paths: &[String],
        format: &str,
        sector_size: Option<u16>,
    ) -> Result<Image, ImageError> {
        if paths.is_empty() {
            return Err(ImageError::Arg("no source path given".into()));
        }

        let resolved = match format {
            "auto" => {
                if qcow2::is_qcow2(&paths[0]) {
                    "qcow2"
                } else {
                    "raw"
                }
            }
            other => other,
        };

        let format = match resolved {
            "raw" => {
                let image = RawSplit::new(paths, sector_size)?;
                info!(
                    "Opened raw image ({} segment(s), {} bytes)",
                    image.segment_paths().len(),
                    image.size()
                );
                ImageFormat::RawSplit {
                    image,
                    description: "Raw Data (single or split)".to_string(),
                }
            }
            "qcow2" => {
                let image = Qcow2::new(paths, sector_size)?;
                ImageFormat::Qcow2 {
                    image,
                    description: "QEMU Copy-On-Write image (v2/v3)".to_string(),
                }
            }
            other => {
                return Err(ImageError::Arg(format!(
                    "invalid format '{}', supported formats are 'raw', 'qcow2' and 'auto'",
                    other
                )))
            }
        };

        Ok(Image {
            paths: paths.to_vec(),
            format_name: match &format {
                ImageFormat::RawSplit { .. } => "raw",
                ImageFormat::Qcow2 { .. } => "qcow2",
            },
            sector_size_override: sector_size,
            format,
            writer: None,
            position: 0,
        })
    }

    /// Total logical size in bytes.
    pub fn size(&self) -> u64 {
        match &self.format {
            ImageFormat::RawSplit { image, .. } => image.size(),
            ImageFormat::Qcow2 { image, .. } => image.size(),
        }
    }

    pub fn sector_size(&self) -> u16 {
        match &self.format {
            ImageFormat::RawSplit { image, .. } => image.sector_size(),
            ImageFormat::Qcow2 { image, .. } => image.sector_size(),
        }
    }

    pub fn format_name(&self) -> &'static str {
        self.format_name
    }

    /// Read up to `buf.len()` bytes at `offset`. Within `[0, size)` a
    /// read is only short when it runs into the end of the image; a read
    /// starting at or past the end fails with
    /// [`ImageError::ReadOffset`]. When a writer tap is enabled, the
    /// delivered bytes are mirrored into the capture.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, ImageError> {
        let n = match &mut self.format {
            ImageFormat::RawSplit { image, .. } => image.read_at(offset, buf)?,
            ImageFormat::Qcow2 { image, .. } => image.read_at(offset, buf)?,
        };
        if let Some(shared) = self.writer.clone() {
            self.tap(&shared, offset, &buf[..n]);
        }
        Ok(n)
    }

    /// Mirror the complete sectors of a delivered read into the capture.
    /// Tap failures never disturb the read; they stay sticky inside the
    /// writer and surface at [`Image::finish_image`].
    fn tap(&self, shared: &WriterShared, offset: u64, data: &[u8]) {
        let start = offset.div_ceil(VHD_SECTOR_SIZE) * VHD_SECTOR_SIZE;
        let end = (offset + data.len() as u64) / VHD_SECTOR_SIZE * VHD_SECTOR_SIZE;
        if start >= end {
            return;
        }

        let mut writer = shared.writer.lock().unwrap();
        let mut at = start;
        while at < end {
            // One add per VHD block.
            let block_end = (at / VHD_BLOCK_SIZE + 1) * VHD_BLOCK_SIZE;
            let chunk_end = end.min(block_end);
            let slice = &data[(at - offset) as usize..(chunk_end - offset) as usize];
            if writer.add(at, slice).is_err() {
                break;
            }
            at = chunk_end;
        }
    }

    /// Attach a dynamic-VHD capture sink at `output_path`. Every
    /// subsequent read is mirrored; [`Image::finish_image`] sweeps
    /// whatever the reads did not cover.
    pub fn enable_writer(&mut self, output_path: &str) -> Result<(), ImageError> {
        if self.writer.is_some() {
            return Err(ImageError::Arg("image writer already enabled".into()));
        }
        let writer = VhdWriter::create(output_path, self.size())?;
        self.writer = Some(Arc::new(WriterShared {
            writer: Mutex::new(writer),
            progress: AtomicU8::new(0),
            cancel: AtomicBool::new(false),
        }));
        info!("Image writer enabled, capturing to '{}'", output_path);
        Ok(())
    }

    /// Complete the capture: issue synthetic reads through the normal
    /// read path for every block that foreground reads did not already
    /// finish. Runs until done, the cancel flag is raised, or a write
    /// error surfaces. Progress is published for [`Image::progress`].
    pub fn finish_image(&mut self) -> Result<(), ImageError> {
        let shared = self
            .writer
            .clone()
            .ok_or_else(|| ImageError::Arg("image writer is not enabled".into()))?;

        // Chunked like a cache refill so the tap sees aligned spans.
        const SWEEP_CHUNK: usize = 64 * 1024;
        let size = self.size();
        let total_blocks = shared.writer.lock().unwrap().block_count();
        let mut buf = vec![0u8; SWEEP_CHUNK];

        for block in 0..total_blocks {
            if !shared.writer.lock().unwrap().is_block_finished(block) {
                let block_start = block as u64 * VHD_BLOCK_SIZE;
                let block_end = (block_start + VHD_BLOCK_SIZE).min(size);
                let mut at = block_start;
                while at < block_end {
                    if shared.cancel.load(Ordering::Relaxed) {
                        debug!("Capture cancelled at offset 0x{:x}", at);
                        return Err(ImageError::Write("image capture cancelled".into()));
                    }
                    let want = SWEEP_CHUNK.min((block_end - at) as usize);
                    let got = self.read_at(at, &mut buf[..want])?;
                    if got == 0 {
                        break;
                    }
                    at += got as u64;
                }
            }
            let percent = ((block + 1) * 100 / total_blocks) as u8;
            shared.progress.store(percent, Ordering::Relaxed);
        }

        let writer = shared.writer.lock().unwrap();
        if let Some(e) = writer.sticky_error() {
            return Err(ImageError::Write(e.to_string()));
        }
        info!("Image capture complete");
        Ok(())
    }

    /// Capture progress, 0–100.
    pub fn progress(&self) -> u8 {
        self.writer
            .as_ref()
            .map(|s| s.progress.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Ask a running [`Image::finish_image`] to stop at the next
    /// synthetic read.
    pub fn cancel_finish(&self) {
        if let Some(shared) = &self.writer {
            shared.cancel.store(true, Ordering::Relaxed);
        }
    }

    /// Open a second handle over the same sources, sharing the writer
    /// tap and its progress/cancel signals. Useful to run the capture
    /// sweep on its own thread while foreground reads continue.
    pub fn try_clone(&self) -> Result<Image, ImageError> {
        let mut clone = Image::open(&self.paths, self.format_name, self.sector_size_override)?;
        clone.writer = self.writer.clone();
        Ok(clone)
    }

    /// Evidence summary.
    pub fn info(&self) -> ImageInfo {
        let (description, qcow2_chain, cluster_size, paths) = match &self.format {
            ImageFormat::RawSplit { image, description } => {
                (description.clone(), None, None, image.segment_paths())
            }
            ImageFormat::Qcow2 { image, description } => (
                description.clone(),
                Some(image.chain_paths()),
                Some(image.cluster_bytes()),
                image.chain_paths(),
            ),
        };
        ImageInfo {
            format: self.format_name.to_string(),
            description,
            size: self.size(),
            sector_size: self.sector_size(),
            paths,
            qcow2_chain,
            cluster_size,
        }
    }

    /// Outputs a human-readable summary to the current `log` subscriber.
    pub fn print_info(&self) {
        info!("Evidence : {}", self.paths.join(", "));
        info!("Format : {}", self.format_name);
        info!("Size : {} bytes", self.size());
        info!("Sector size : {}", self.sector_size());
        if let ImageFormat::Qcow2 { image, .. } = &self.format {
            image.print_info();
        }
    }
}

impl Read for Image {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.size() {
            return Ok(0);
        }
        let n = self.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for Image {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_offset = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::Current(o) => self.position as i64 + o,
            SeekFrom::End(o) => self.size() as i64 + o,
        };
        if new_offset < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Seek before start of image",
            ));
        }
        self.position = new_offset as u64;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> String {
        let path = dir.path().join(name);
        File::create(&path).unwrap().write_all(data).unwrap();
        path.display().to_string()
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_auto_detects_raw() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "disk.raw", &[0u8; 1024]);
        let img = Image::open(&[path], "auto", None).unwrap();
        assert_eq!(img.format_name(), "raw");
        assert_eq!(img.size(), 1024);
    }

    #[test]
    fn test_invalid_format_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "disk.raw", &[0u8; 512]);
        assert!(matches!(
            Image::open(&[path], "ewf", None),
            Err(ImageError::Arg(_))
        ));
    }

    #[test]
    fn test_concatenated_reads_match_spanning_read() {
        let dir = TempDir::new().unwrap();
        let data = pattern(8192, 3);
        let a = write_file(&dir, "img.001", &data[..4096]);
        let b = write_file(&dir, "img.002", &data[4096..]);
        let mut img = Image::open(&[a, b], "raw", None).unwrap();

        let mut spanning = vec![0u8; 8192];
        img.read_at(0, &mut spanning).unwrap();
        assert_eq!(spanning, data);

        let mut first = vec![0u8; 3000];
        let mut second = vec![0u8; 5192];
        img.read_at(0, &mut first).unwrap();
        img.read_at(3000, &mut second).unwrap();
        let mut joined = first;
        joined.extend_from_slice(&second);
        assert_eq!(joined, data);
    }

    /// Reassemble a dynamic VHD produced by the writer tap.
    fn parse_vhd(path: &str, image_size: u64) -> Vec<u8> {
        let mut raw = Vec::new();
        File::open(path).unwrap().read_to_end(&mut raw).unwrap();
        assert_eq!(&raw[0..8], b"conectix");
        assert_eq!(&raw[raw.len() - 512..raw.len() - 504], b"conectix");
        assert_eq!(
            u64::from_be_bytes(raw[48..56].try_into().unwrap()),
            image_size
        );

        let total_blocks = image_size.div_ceil(VHD_BLOCK_SIZE) as usize;
        let mut out = vec![0u8; image_size as usize];
        for block in 0..total_blocks {
            let at = 0x600 + block * 4;
            let entry = u32::from_be_bytes(raw[at..at + 4].try_into().unwrap());
            if entry == 0xffff_ffff {
                continue;
            }
            let block_start = entry as usize * 512;
            let bitmap = &raw[block_start..block_start + 512];
            let data_start = block_start + 512;
            for sector in 0..(VHD_BLOCK_SIZE / 512) as usize {
                let logical = block * VHD_BLOCK_SIZE as usize + sector * 512;
                if logical >= image_size as usize {
                    break;
                }
                if bitmap[sector / 8] & (1 << (7 - (sector % 8) as u8)) != 0 {
                    let n = 512.min(image_size as usize - logical);
                    out[logical..logical + n]
                        .copy_from_slice(&raw[data_start + sector * 512..data_start + sector * 512 + n]);
                }
            }
        }
        out
    }

    #[test]
    fn test_vhd_capture_round_trip() {
        let dir = TempDir::new().unwrap();
        let data = pattern(8192, 7);
        let src = write_file(&dir, "evidence.raw", &data);
        let out = dir.path().join("capture.vhd").display().to_string();

        let mut img = Image::open(&[src], "raw", None).unwrap();
        img.enable_writer(&out).unwrap();

        // A foreground read feeds the tap...
        let mut buf = vec![0u8; 2048];
        img.read_at(1024, &mut buf).unwrap();
        assert_eq!(&buf, &data[1024..3072]);

        // ...and the sweep captures the rest.
        img.finish_image().unwrap();
        assert_eq!(img.progress(), 100);

        assert_eq!(parse_vhd(&out, 8192), data);
    }

    #[test]
    fn test_vhd_capture_of_qcow2_reads_decompressed_bytes() {
        // The tap must observe post-decompression bytes: capture a QCOW2
        // with sparse regions and compare against its logical content.
        let dir = TempDir::new().unwrap();
        let qcow_path = crate::qcow2::test_support::build_sample(&dir);
        let out = dir.path().join("capture.vhd").display().to_string();

        let mut img = Image::open(&[qcow_path], "auto", None).unwrap();
        assert_eq!(img.format_name(), "qcow2");
        let size = img.size();

        let mut logical = vec![0u8; size as usize];
        img.read_at(0, &mut logical).unwrap();

        img.enable_writer(&out).unwrap();
        img.finish_image().unwrap();

        assert_eq!(parse_vhd(&out, size), logical);
    }

    #[test]
    fn test_cancel_finish() {
        let dir = TempDir::new().unwrap();
        let src = write_file(&dir, "evidence.raw", &pattern(4096, 1));
        let out = dir.path().join("capture.vhd").display().to_string();

        let mut img = Image::open(&[src], "raw", None).unwrap();
        img.enable_writer(&out).unwrap();
        img.cancel_finish();
        assert!(matches!(
            img.finish_image(),
            Err(ImageError::Write(_))
        ));
    }

    #[test]
    fn test_read_off_end() {
        let dir = TempDir::new().unwrap();
        let src = write_file(&dir, "evidence.raw", &[0u8; 2048]);
        let mut img = Image::open(&[src], "raw", None).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            img.read_at(2048, &mut buf),
            Err(ImageError::ReadOffset { .. })
        ));
    }
}
