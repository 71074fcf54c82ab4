//! Split raw image reader.
//!
//! A raw acquisition is often spread over numbered segment files
//! (`disk.dd.001`, `disk.dd.002`, …) that concatenate into one logical
//! disk. This module maps a logical byte offset onto the right segment and
//! keeps at most [`SEGMENT_CACHE_CAPACITY`] host descriptors open at a
//! time, recycling the least recently used one.
//!
//! Raw device nodes are supported as sources: their size is probed with a
//! seek-to-end when `stat` does not report one, and unaligned reads are
//! rewritten to whole-sector host reads.

use log::{debug, warn};
use lru::LruCache;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use crate::error::ImageError;

/// Default number of segment descriptors kept open simultaneously.
pub const SEGMENT_CACHE_CAPACITY: usize = 15;

/// An open segment handle plus the host cursor position after the last
/// read, so sequential access can skip the redundant seek.
struct CachedSegment {
    file: File,
    pos: u64,
}

/// Fixed-capacity pool of open segment descriptors.
struct SegmentCache {
    handles: LruCache<usize, CachedSegment>,
}

impl SegmentCache {
    fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        SegmentCache {
            handles: LruCache::new(cap),
        }
    }

    /// Return an open handle for segment `index`, opening `path` (and
    /// evicting the least recently used descriptor) on a miss.
    fn fetch(&mut self, index: usize, path: &Path) -> Result<&mut CachedSegment, ImageError> {
        if !self.handles.contains(&index) {
            let file = File::open(path).map_err(|e| ImageError::Open {
                path: path.display().to_string(),
                source: e,
            })?;
            if let Some((evicted, _)) = self.handles.push(index, CachedSegment { file, pos: 0 }) {
                if evicted != index {
                    debug!("Segment cache full, closed segment {}", evicted);
                }
            }
        }
        Ok(self.handles.get_mut(&index).unwrap())
    }

    /// Close every cached descriptor.
    fn invalidate_all(&mut self) {
        self.handles.clear();
    }
}

/// One host file of a split raw image.
struct Segment {
    path: PathBuf,
    /// Cumulative logical end offset of this segment.
    max_off: u64,
    /// Whether the source is a character or block device node, which
    /// forces sector-aligned host reads.
    is_device: bool,
}

/// A split raw image: an ordered list of segments presented as a single
/// linear byte address space.
pub struct RawSplit {
    segments: Vec<Segment>,
    cache: SegmentCache,
    size: u64,
    sector_size: u16,
    position: u64,
}

impl RawSplit {
    /// Open a split raw image.
    ///
    /// With a single non-device path, sibling segments are auto-discovered
    /// by globbing the trailing numeric suffix; with an explicit list the
    /// paths are used verbatim in the given order.
    ///
    /// # Errors
    ///
    /// [`ImageError::Open`] if the first path cannot be probed,
    /// [`ImageError::Arg`] if a later segment's size cannot be determined.
    pub fn new(paths: &[String], sector_size: Option<u16>) -> Result<RawSplit, ImageError> {
        if paths.is_empty() {
            return Err(ImageError::Arg("no source path given".into()));
        }
        let sector_size = sector_size.unwrap_or(512);

        let resolved: Vec<PathBuf> = if paths.len() == 1 && !path_is_device(Path::new(&paths[0])) {
            find_segments(Path::new(&paths[0]))?
        } else {
            paths.iter().map(PathBuf::from).collect()
        };

        let mut segments = Vec::with_capacity(resolved.len());
        let mut total: u64 = 0;
        for (i, path) in resolved.iter().enumerate() {
            let is_device = path_is_device(path);
            let size = match probe_size(path, is_device) {
                Ok(s) => s,
                Err(e) if i == 0 || resolved.len() > 1 => {
                    // The first segment's size must be known, and all of
                    // them must be when the image is split.
                    return Err(e);
                }
                Err(_) => 0,
            };
            total += size;
            segments.push(Segment {
                path: path.clone(),
                max_off: total,
                is_device,
            });
        }

        debug!(
            "Opened split raw image: {} segment(s), {} bytes",
            segments.len(),
            total
        );

        Ok(RawSplit {
            segments,
            cache: SegmentCache::new(SEGMENT_CACHE_CAPACITY),
            size: total,
            sector_size,
            position: 0,
        })
    }

    /// Total logical size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn sector_size(&self) -> u16 {
        self.sector_size
    }

    /// Paths of every segment, in logical order.
    pub fn segment_paths(&self) -> Vec<String> {
        self.segments
            .iter()
            .map(|s| s.path.display().to_string())
            .collect()
    }

    /// Close every cached host descriptor. Subsequent reads reopen on
    /// demand.
    pub fn invalidate_handles(&mut self) {
        self.cache.invalidate_all();
    }

    /// Read up to `buf.len()` bytes at logical `offset`.
    ///
    /// Returns the number of bytes delivered; this is only less than the
    /// request when the read runs into the end of the image (or a short
    /// final segment). A read *starting* at or past the end fails with
    /// [`ImageError::ReadOffset`].
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, ImageError> {
        if offset >= self.size {
            return Err(ImageError::ReadOffset {
                offset,
                size: self.size,
            });
        }
        if buf.is_empty() {
            return Ok(0);
        }

        // First segment holding `offset`: the unique i with
        // max_off[i-1] <= offset < max_off[i].
        let mut seg = self.segments.partition_point(|s| s.max_off <= offset);
        let mut total_read = 0usize;
        let mut cur = offset;

        while total_read < buf.len() && seg < self.segments.len() {
            let seg_start = if seg == 0 {
                0
            } else {
                self.segments[seg - 1].max_off
            };
            let rel = cur - seg_start;
            let avail = self.segments[seg].max_off - cur;
            if avail == 0 {
                seg += 1;
                continue;
            }
            let want = (buf.len() - total_read).min(avail as usize);
            let got = self.read_segment(seg, rel, &mut buf[total_read..total_read + want])?;
            total_read += got;
            cur += got as u64;
            if got < want {
                // Short segment on disk; stop and return what we have.
                warn!(
                    "Segment '{}' ended {} bytes early",
                    self.segments[seg].path.display(),
                    want - got
                );
                break;
            }
            seg += 1;
        }
        Ok(total_read)
    }

    /// Read from one segment at segment-relative offset `rel`.
    fn read_segment(&mut self, seg: usize, rel: u64, buf: &mut [u8]) -> Result<usize, ImageError> {
        let sector = self.sector_size as u64;
        let aligned = rel % sector == 0 && buf.len() as u64 % sector == 0;

        if self.segments[seg].is_device && !aligned {
            // Raw devices only accept whole-sector transfers: round the
            // host read down to a sector boundary, cover the request, and
            // slice out the caller's window.
            let seg_start = if seg == 0 {
                0
            } else {
                self.segments[seg - 1].max_off
            };
            let seg_len = self.segments[seg].max_off - seg_start;
            let start = rel - rel % sector;
            let mut end = (rel + buf.len() as u64).div_ceil(sector) * sector;
            if end > seg_len {
                end = seg_len;
            }
            let mut tmp = vec![0u8; (end - start) as usize];
            let got = self.read_segment_direct(seg, start, &mut tmp)?;
            let skip = (rel - start) as usize;
            if got <= skip {
                return Ok(0);
            }
            let usable = (got - skip).min(buf.len());
            buf[..usable].copy_from_slice(&tmp[skip..skip + usable]);
            Ok(usable)
        } else {
            self.read_segment_direct(seg, rel, buf)
        }
    }

    /// Seek + read on the cached descriptor, skipping the seek when the
    /// cursor is already in place.
    fn read_segment_direct(
        &mut self,
        seg: usize,
        rel: u64,
        buf: &mut [u8],
    ) -> Result<usize, ImageError> {
        let path = self.segments[seg].path.clone();
        let handle = self.cache.fetch(seg, &path)?;
        if handle.pos != rel {
            handle
                .file
                .seek(SeekFrom::Start(rel))
                .map_err(|e| ImageError::Seek {
                    offset: rel,
                    source: e,
                })?;
            handle.pos = rel;
        }

        let mut total = 0usize;
        while total < buf.len() {
            match handle.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    handle.pos += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ImageError::read_io(rel + total as u64, e)),
            }
        }
        Ok(total)
    }
}

impl Read for RawSplit {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.size {
            return Ok(0);
        }
        let n = self.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for RawSplit {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_offset = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::Current(o) => self.position as i64 + o,
            SeekFrom::End(o) => self.size as i64 + o,
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

/// Whether `path` names a character or block device node.
#[cfg(unix)]
fn path_is_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    match std::fs::metadata(path) {
        Ok(md) => md.file_type().is_char_device() || md.file_type().is_block_device(),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn path_is_device(path: &Path) -> bool {
    // Windows device objects are addressed as \\.\PhysicalDriveN.
    path.to_string_lossy().starts_with(r"\\.\")
}

/// Host size of one segment. Device nodes may not support `stat`; fall
/// back to a seek-to-end probe on the opened descriptor.
fn probe_size(path: &Path, is_device: bool) -> Result<u64, ImageError> {
    if !is_device {
        let md = std::fs::metadata(path).map_err(|e| ImageError::Open {
            path: path.display().to_string(),
            source: e,
        })?;
        return Ok(md.len());
    }
    let mut file = File::open(path).map_err(|e| ImageError::Open {
        path: path.display().to_string(),
        source: e,
    })?;
    file.seek(SeekFrom::End(0)).map_err(|e| ImageError::Seek {
        offset: 0,
        source: e,
    })
}

/// Look for every segment belonging to the same split image as `path`.
///
/// The trailing run of decimal digits in the file name is replaced with a
/// digit wild-card of the same width (`disk.dd.001` ⇒
/// `disk.dd.[0-9][0-9][0-9]`) and the sorted matches are returned. A name
/// without a numeric suffix is a single-segment image.
fn find_segments(path: &Path) -> Result<Vec<PathBuf>, ImageError> {
    let filename = match path.file_name().and_then(|f| f.to_str()) {
        Some(f) => f,
        None => return Ok(vec![path.to_path_buf()]),
    };

    let digits = filename
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .count();
    if digits == 0 {
        return Ok(vec![path.to_path_buf()]);
    }

    let base = &filename[..filename.len() - digits];
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut pattern = parent.join(base).display().to_string();
    for _ in 0..digits {
        pattern.push_str("[0-9]");
    }

    let mut found: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| ImageError::Arg(format!("glob error: {}", e)))?
        .filter_map(Result::ok)
        .collect();
    found.sort();

    if found.is_empty() {
        // The named file may simply not exist; let open() report that.
        return Ok(vec![path.to_path_buf()]);
    }
    debug!("Discovered {} segment(s) for '{}'", found.len(), filename);
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_segment(dir: &TempDir, name: &str, fill: u8, len: usize) -> String {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![fill; len]).unwrap();
        path.display().to_string()
    }

    #[test]
    fn test_two_segment_boundary_read() {
        let dir = TempDir::new().unwrap();
        let a = write_segment(&dir, "disk.dd.001", 0xAA, 4096);
        let b = write_segment(&dir, "disk.dd.002", 0xBB, 2048);

        let mut img = RawSplit::new(&[a, b], None).unwrap();
        assert_eq!(img.size(), 6144);

        let mut buf = [0u8; 8];
        let n = img.read_at(4092, &mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(buf, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 0xBB, 0xBB]);
    }

    #[test]
    fn test_sibling_discovery() {
        let dir = TempDir::new().unwrap();
        let a = write_segment(&dir, "disk.dd.001", 0x11, 1024);
        write_segment(&dir, "disk.dd.002", 0x22, 1024);
        write_segment(&dir, "disk.dd.003", 0x33, 512);

        let mut img = RawSplit::new(&[a], None).unwrap();
        assert_eq!(img.size(), 2560);
        assert_eq!(img.segment_paths().len(), 3);

        let mut buf = [0u8; 4];
        img.read_at(2048, &mut buf).unwrap();
        assert_eq!(buf, [0x33; 4]);
    }

    #[test]
    fn test_read_past_end_rejected() {
        let dir = TempDir::new().unwrap();
        let a = write_segment(&dir, "flat.raw", 0x00, 1024);
        let mut img = RawSplit::new(&[a], None).unwrap();

        let mut buf = [0u8; 16];
        match img.read_at(1024, &mut buf) {
            Err(ImageError::ReadOffset { offset, size }) => {
                assert_eq!(offset, 1024);
                assert_eq!(size, 1024);
            }
            other => panic!("expected ReadOffset, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_short_tail_read() {
        let dir = TempDir::new().unwrap();
        let a = write_segment(&dir, "flat.raw", 0x7F, 1000);
        let mut img = RawSplit::new(&[a], None).unwrap();

        let mut buf = [0u8; 64];
        let n = img.read_at(990, &mut buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf[..10], &[0x7F; 10]);
    }

    #[test]
    fn test_read_seek_traits() {
        let dir = TempDir::new().unwrap();
        let a = write_segment(&dir, "disk.dd.001", 0x01, 512);
        write_segment(&dir, "disk.dd.002", 0x02, 512);

        let mut img = RawSplit::new(&[a], None).unwrap();
        img.seek(SeekFrom::Start(510)).unwrap();
        let mut buf = [0u8; 4];
        img.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x01, 0x02, 0x02]);
    }

    #[test]
    fn test_cache_eviction_keeps_reads_correct() {
        let dir = TempDir::new().unwrap();
        let mut paths = Vec::new();
        for i in 0..20 {
            paths.push(write_segment(&dir, &format!("seg{:02}", i), i as u8, 256));
        }
        let mut img = RawSplit::new(&paths, None).unwrap();
        assert_eq!(img.size(), 20 * 256);

        // Touch every segment twice so the 15-slot cache has to recycle.
        for round in 0..2u64 {
            for i in 0..20u64 {
                let mut buf = [0u8; 1];
                img.read_at(i * 256 + round, &mut buf).unwrap();
                assert_eq!(buf[0], i as u8);
            }
        }
    }
}
