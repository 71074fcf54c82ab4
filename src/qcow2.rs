//! QCOW2 (QEMU copy-on-write, version 2 and 3) image reader.
//!
//! Supports backing-file chains and zlib-compressed clusters. Encrypted
//! images are rejected. All multi-byte header fields are big-endian, per
//! the published format.
//!
//! A cluster that is sparse at every level of the backing chain reads as
//! zeroes; this is normal QCOW2 behaviour, not an error.

use flate2::read::ZlibDecoder;
use log::{debug, info, warn};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::ImageError;

const QCOW2_MAGIC: u32 = 0x514649fb;

/// Fields of the fixed QCOW2 header this reader uses. The refcount and
/// snapshot machinery is write-side state and is not loaded.
#[derive(Clone)]
struct Qcow2Header {
    version: u32,
    backing_file_offset: u64,
    backing_file_size: u32,
    cluster_bits: u32,
    size: u64,
    crypt_method: u32,
    l1_size: u32,
    l1_table_offset: u64,
}

impl Qcow2Header {
    /// Parse the 72 leading header bytes (common to v2 and v3).
    fn parse(raw: &[u8; 72]) -> Result<Self, ImageError> {
        let magic = u32::from_be_bytes(raw[0..4].try_into().unwrap());
        if magic != QCOW2_MAGIC {
            return Err(ImageError::Magic("not a QCOW2 image"));
        }
        let version = u32::from_be_bytes(raw[4..8].try_into().unwrap());
        if version != 2 && version != 3 {
            return Err(ImageError::Magic("unsupported QCOW2 version"));
        }

        let header = Qcow2Header {
            version,
            backing_file_offset: u64::from_be_bytes(raw[8..16].try_into().unwrap()),
            backing_file_size: u32::from_be_bytes(raw[16..20].try_into().unwrap()),
            cluster_bits: u32::from_be_bytes(raw[20..24].try_into().unwrap()),
            size: u64::from_be_bytes(raw[24..32].try_into().unwrap()),
            crypt_method: u32::from_be_bytes(raw[32..36].try_into().unwrap()),
            l1_size: u32::from_be_bytes(raw[36..40].try_into().unwrap()),
            l1_table_offset: u64::from_be_bytes(raw[40..48].try_into().unwrap()),
        };

        if header.crypt_method != 0 {
            return Err(ImageError::Unsupported(
                "encrypted QCOW2 images are not supported".into(),
            ));
        }
        if !(9..=21).contains(&header.cluster_bits) {
            return Err(ImageError::Unsupported(format!(
                "QCOW2 cluster_bits {} out of range [9, 21]",
                header.cluster_bits
            )));
        }
        Ok(header)
    }

    #[inline]
    fn cluster_bytes(&self) -> u64 {
        1u64 << self.cluster_bits
    }
}

/// One image of a QCOW2 backing chain. The head of the chain owns its
/// parent transitively, so dropping the head releases every layer.
pub struct Qcow2 {
    path: PathBuf,
    file: File,
    header: Qcow2Header,
    /// Eagerly loaded L1 table, byte-swapped into host order.
    l1: Vec<u64>,
    backing_file: Option<String>,
    parent: Option<Box<Qcow2>>,
    /// Scratch buffers for compressed clusters, allocated on first hit.
    compressed_buf: Option<Vec<u8>>,
    decompressed_buf: Option<Vec<u8>>,
    sector_size: u16,
    position: u64,
}

impl Qcow2 {
    /// Open a QCOW2 image, or a backing chain given as several paths.
    ///
    /// Each image naming a backing file is linked to the set member whose
    /// basename matches; a backing file absent from the set is opened
    /// relative to the referring image's directory. Exactly one head must
    /// remain, the chain must not loop, and every member must share the
    /// same cluster size.
    pub fn new(paths: &[String], sector_size: Option<u16>) -> Result<Qcow2, ImageError> {
        if paths.is_empty() {
            return Err(ImageError::Arg("no source path given".into()));
        }
        let sector_size = sector_size.unwrap_or(512);

        let mut layers: Vec<Qcow2> = Vec::new();
        for path in paths {
            layers.push(Self::open_single(Path::new(path), sector_size)?);
        }

        // Pull in backing files that were not passed explicitly.
        // Bounded: a genuine chain cannot be longer than this.
        const MAX_CHAIN: usize = 64;
        loop {
            if layers.len() > MAX_CHAIN {
                return Err(ImageError::Arg("QCOW2 backing chain too long".into()));
            }
            let missing = layers.iter().find_map(|img| {
                img.backing_file.as_ref().and_then(|name| {
                    let base = basename(name);
                    if layers.iter().any(|o| basename_of(&o.path) == base) {
                        None
                    } else {
                        Some((img.path.clone(), name.clone()))
                    }
                })
            });
            match missing {
                Some((referrer, name)) => {
                    let dir = referrer.parent().unwrap_or_else(|| Path::new("."));
                    let candidate = dir.join(basename(&name));
                    debug!(
                        "Backing file '{}' not in argument set, opening '{}'",
                        name,
                        candidate.display()
                    );
                    layers.push(Self::open_single(&candidate, sector_size)?);
                }
                None => break,
            }
        }

        Self::link_chain(layers)
    }

    /// Open and parse a single QCOW2 file, leaving it unlinked.
    fn open_single(path: &Path, sector_size: u16) -> Result<Qcow2, ImageError> {
        let mut file = File::open(path).map_err(|e| ImageError::Open {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut raw = [0u8; 72];
        file.read_exact(&mut raw)
            .map_err(|e| ImageError::read_io(0, e))?;
        let header = Qcow2Header::parse(&raw)?;

        let backing_file = if header.backing_file_offset != 0 && header.backing_file_size != 0 {
            if header.backing_file_size > 1023 {
                return Err(ImageError::Arg("QCOW2 backing file name too long".into()));
            }
            let mut name = vec![0u8; header.backing_file_size as usize];
            file.seek(SeekFrom::Start(header.backing_file_offset))
                .map_err(|e| ImageError::Seek {
                    offset: header.backing_file_offset,
                    source: e,
                })?;
            file.read_exact(&mut name)
                .map_err(|e| ImageError::read_io(header.backing_file_offset, e))?;
            Some(String::from_utf8_lossy(&name).into_owned())
        } else {
            None
        };

        // The L1 table is small even for large disks; load it eagerly.
        if header.l1_size > 4 * 1024 * 1024 {
            return Err(ImageError::Arg("QCOW2 L1 table implausibly large".into()));
        }
        let mut l1 = Vec::with_capacity(header.l1_size as usize);
        if header.l1_size > 0 {
            let mut raw_l1 = vec![0u8; header.l1_size as usize * 8];
            file.seek(SeekFrom::Start(header.l1_table_offset))
                .map_err(|e| ImageError::Seek {
                    offset: header.l1_table_offset,
                    source: e,
                })?;
            file.read_exact(&mut raw_l1)
                .map_err(|e| ImageError::read_io(header.l1_table_offset, e))?;
            for chunk in raw_l1.chunks_exact(8) {
                l1.push(u64::from_be_bytes(chunk.try_into().unwrap()));
            }
        }

        debug!(
            "Parsed QCOW2 '{}': v{}, {} bytes, cluster_bits {}, backing: {}",
            path.display(),
            header.version,
            header.size,
            header.cluster_bits,
            backing_file.as_deref().unwrap_or("none")
        );

        Ok(Qcow2 {
            path: path.to_path_buf(),
            file,
            header,
            l1,
            backing_file,
            parent: None,
            compressed_buf: None,
            decompressed_buf: None,
            sector_size,
            position: 0,
        })
    }

    /// Link opened layers into a single ownership chain and return the
    /// head. Rejects loops, orphans, and mixed cluster sizes.
    fn link_chain(layers: Vec<Qcow2>) -> Result<Qcow2, ImageError> {
        let n = layers.len();
        let cluster_bits = layers[0].header.cluster_bits;
        if layers
            .iter()
            .any(|l| l.header.cluster_bits != cluster_bits)
        {
            return Err(ImageError::Arg(
                "QCOW2 chain members have different cluster sizes".into(),
            ));
        }

        // parent_of[i]: index of the layer backing layer i.
        let mut parent_of: Vec<Option<usize>> = vec![None; n];
        let mut referenced = vec![false; n];
        for i in 0..n {
            if let Some(name) = &layers[i].backing_file {
                let base = basename(name);
                let j = layers
                    .iter()
                    .position(|o| basename_of(&o.path) == base)
                    .ok_or_else(|| {
                        ImageError::Arg(format!("QCOW2 backing file '{}' not found", name))
                    })?;
                if j == i {
                    return Err(ImageError::Arg("QCOW2 image backs itself".into()));
                }
                parent_of[i] = Some(j);
                referenced[j] = true;
            }
        }

        let heads: Vec<usize> = (0..n).filter(|&i| !referenced[i]).collect();
        if heads.len() != 1 {
            return Err(ImageError::Arg(format!(
                "QCOW2 chain must have exactly one head image, found {}",
                heads.len()
            )));
        }

        // Walk head → tail, detecting loops and orphans.
        let mut order = Vec::with_capacity(n);
        let mut seen = vec![false; n];
        let mut cur = Some(heads[0]);
        while let Some(i) = cur {
            if seen[i] {
                return Err(ImageError::Arg("QCOW2 backing chain loops".into()));
            }
            seen[i] = true;
            order.push(i);
            cur = parent_of[i];
        }
        if order.len() != n {
            return Err(ImageError::Arg(
                "QCOW2 images present that belong to no chain".into(),
            ));
        }

        // Assemble ownership from the tail up.
        let mut slots: Vec<Option<Qcow2>> = layers.into_iter().map(Some).collect();
        let mut chain: Option<Box<Qcow2>> = None;
        for &i in order.iter().rev() {
            let mut img = slots[i].take().unwrap();
            img.parent = chain;
            chain = Some(Box::new(img));
        }
        let head = *chain.unwrap();
        info!(
            "Opened QCOW2 chain of {} image(s), head '{}', {} bytes",
            n,
            head.path.display(),
            head.header.size
        );
        Ok(head)
    }

    /// Virtual disk size in bytes (of the head image).
    #[inline]
    pub fn size(&self) -> u64 {
        self.header.size
    }

    #[inline]
    pub fn sector_size(&self) -> u16 {
        self.sector_size
    }

    #[inline]
    pub fn cluster_bytes(&self) -> u64 {
        self.header.cluster_bytes()
    }

    /// Number of images in the backing chain, head included.
    pub fn chain_length(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.chain_length())
    }

    /// Paths of the chain, head first.
    pub fn chain_paths(&self) -> Vec<String> {
        let mut paths = vec![self.path.display().to_string()];
        if let Some(parent) = &self.parent {
            paths.extend(parent.chain_paths());
        }
        paths
    }

    /// Outputs a human-readable summary to the current `log` subscriber.
    pub fn print_info(&self) {
        info!("QCOW2 Image Information:");
        info!("  Version: {}", self.header.version);
        info!("  Virtual Size: {} bytes", self.header.size);
        info!(
            "  Cluster Size: {} bytes (cluster_bits {})",
            self.cluster_bytes(),
            self.header.cluster_bits
        );
        info!("  L1 Entries: {}", self.l1.len());
        for (depth, path) in self.chain_paths().iter().enumerate() {
            info!("  Chain[{}]: {}", depth, path);
        }
    }

    /// Read up to `buf.len()` bytes at virtual `offset`, resolving each
    /// cluster through the backing chain.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, ImageError> {
        if offset >= self.header.size {
            return Err(ImageError::ReadOffset {
                offset,
                size: self.header.size,
            });
        }
        let want = (buf.len() as u64).min(self.header.size - offset) as usize;
        let cluster = self.cluster_bytes();

        // Split so each sub-read lies within one cluster.
        let mut done = 0usize;
        while done < want {
            let cur = offset + done as u64;
            let in_cluster = (cur % cluster) as usize;
            let n = (want - done).min(cluster as usize - in_cluster);
            self.read_in_cluster(cur, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(done)
    }

    /// Read a window that lies entirely within one cluster, walking the
    /// backing chain until some level resolves it.
    fn read_in_cluster(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), ImageError> {
        let cluster = self.header.cluster_bytes();
        let entries_per_cluster = cluster / 8;
        let cluster_index = offset / cluster;
        let l1_index = (cluster_index / entries_per_cluster) as usize;
        let l2_index = cluster_index % entries_per_cluster;
        let in_cluster = offset % cluster;

        let l2_entry = if l1_index < self.l1.len() {
            let l1_entry = self.l1[l1_index];
            let l2_offset = l1_entry & 0x00ff_ffff_ffff_ffff;
            if l1_entry >> 63 == 0 || l2_offset == 0 {
                0
            } else {
                let entry_offset = l2_offset + l2_index * 8;
                let mut raw = [0u8; 8];
                self.file
                    .seek(SeekFrom::Start(entry_offset))
                    .map_err(|e| ImageError::Seek {
                        offset: entry_offset,
                        source: e,
                    })?;
                self.file
                    .read_exact(&mut raw)
                    .map_err(|e| ImageError::read_io(entry_offset, e))?;
                u64::from_be_bytes(raw)
            }
        } else {
            0
        };

        let compressed = (l2_entry >> 62) & 1 == 1;
        let host_offset = if compressed {
            l2_entry & ((1u64 << (70 - self.header.cluster_bits)) - 1)
        } else {
            l2_entry & 0x00ff_ffff_ffff_ffff
        };

        if host_offset == 0 {
            // Sparse at this level: descend, or zero-fill at the end of
            // the chain.
            return match &mut self.parent {
                Some(parent) => parent.read_in_cluster(offset, buf),
                None => {
                    buf.fill(0);
                    Ok(())
                }
            };
        }

        if compressed {
            self.read_compressed_cluster(host_offset, in_cluster as usize, buf)
        } else {
            let data_offset = host_offset + in_cluster;
            self.file
                .seek(SeekFrom::Start(data_offset))
                .map_err(|e| ImageError::Seek {
                    offset: data_offset,
                    source: e,
                })?;
            self.file
                .read_exact(buf)
                .map_err(|e| ImageError::read_io(data_offset, e))?;
            Ok(())
        }
    }

    /// Inflate the compressed cluster at `host_offset` and copy out the
    /// caller's window.
    fn read_compressed_cluster(
        &mut self,
        host_offset: u64,
        in_cluster: usize,
        buf: &mut [u8],
    ) -> Result<(), ImageError> {
        let cluster = self.header.cluster_bytes() as usize;

        // Compressed payloads never exceed one cluster; bounding the read
        // here keeps a corrupt entry from forcing oversized allocations.
        let comp = self
            .compressed_buf
            .get_or_insert_with(|| vec![0u8; cluster]);
        self.file
            .seek(SeekFrom::Start(host_offset))
            .map_err(|e| ImageError::Seek {
                offset: host_offset,
                source: e,
            })?;
        let mut avail = 0usize;
        while avail < cluster {
            match self.file.read(&mut comp[avail..]) {
                Ok(0) => break,
                Ok(n) => avail += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ImageError::read_io(host_offset, e)),
            }
        }

        let out = self
            .decompressed_buf
            .get_or_insert_with(|| vec![0u8; cluster]);
        let mut decoder = ZlibDecoder::new(&comp[..avail]);
        let mut produced = 0usize;
        while produced < cluster {
            match decoder.read(&mut out[produced..]) {
                Ok(0) => break,
                Ok(n) => produced += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ImageError::Read {
                        offset: host_offset,
                        detail: format!("zlib inflate failed: {}", e),
                    })
                }
            }
        }

        if produced < in_cluster + buf.len() {
            warn!(
                "Compressed cluster at 0x{:x} inflated to {} bytes, {} required",
                host_offset,
                produced,
                in_cluster + buf.len()
            );
            return Err(ImageError::short_read(
                host_offset,
                in_cluster + buf.len(),
                produced,
            ));
        }
        buf.copy_from_slice(&out[in_cluster..in_cluster + buf.len()]);
        Ok(())
    }
}

impl Read for Qcow2 {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.header.size {
            return Ok(0);
        }
        let n = self.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for Qcow2 {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_offset = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::Current(o) => self.position as i64 + o,
            SeekFrom::End(o) => self.header.size as i64 + o,
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

fn basename(name: &str) -> &str {
    Path::new(name)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(name)
}

fn basename_of(path: &Path) -> &str {
    path.file_name().and_then(|f| f.to_str()).unwrap_or("")
}

/// Probe the first bytes of a file for the QCOW2 magic.
pub fn is_qcow2(path: &str) -> bool {
    let mut magic = [0u8; 4];
    match File::open(path) {
        Ok(mut f) => {
            f.read_exact(&mut magic).is_ok() && u32::from_be_bytes(magic) == QCOW2_MAGIC
        }
        Err(_) => false,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_compressed_cluster_and_sparse_tail() {
        let dir = TempDir::new().unwrap();
        let pattern: Vec<u8> = (0..CLUSTER).map(|i| (i % 256) as u8).collect();
        let path = write_qcow2(
            &dir,
            "comp.qcow2",
            2 * CLUSTER,
            &[(0, TestCluster::Compressed(pattern))],
            None,
        );

        let mut img = Qcow2::new(&[path], None).unwrap();
        assert_eq!(img.size(), 2 * CLUSTER);

        let mut buf = [0u8; 16];
        img.read_at(0, &mut buf).unwrap();
        let expected: Vec<u8> = (0u8..16).collect();
        assert_eq!(&buf[..], &expected[..]);

        // Second cluster was never allocated: sparse ⇒ zeroes.
        img.read_at(CLUSTER, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_backing_chain_resolution() {
        let dir = TempDir::new().unwrap();
        let base = write_qcow2(
            &dir,
            "base.qcow2",
            CLUSTER,
            &[(0, TestCluster::Raw(b"HELLO WORLD\0".to_vec()))],
            None,
        );
        let overlay = write_qcow2(&dir, "overlay.qcow2", CLUSTER, &[], Some("base.qcow2"));

        let mut img = Qcow2::new(&[overlay, base], None).unwrap();
        assert_eq!(img.chain_length(), 2);

        let mut buf = [0u8; 12];
        img.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..], b"HELLO WORLD\0");
    }

    #[test]
    fn test_overlay_masks_backing_at_cluster_granularity() {
        let dir = TempDir::new().unwrap();
        write_qcow2(
            &dir,
            "base.qcow2",
            2 * CLUSTER,
            &[
                (0, TestCluster::Raw(vec![0x42; 32])),
                (1, TestCluster::Raw(vec![0x43; 32])),
            ],
            None,
        );
        let overlay = write_qcow2(
            &dir,
            "overlay.qcow2",
            2 * CLUSTER,
            &[(0, TestCluster::Raw(vec![0x99; 32]))],
            Some("base.qcow2"),
        );

        // Backing file resolved relative to the overlay's directory.
        let mut img = Qcow2::new(&[overlay], None).unwrap();
        assert_eq!(img.chain_length(), 2);

        let mut buf = [0u8; 8];
        img.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0x99; 8]); // overlay wins
        img.read_at(CLUSTER, &mut buf).unwrap();
        assert_eq!(buf, [0x43; 8]); // sparse in overlay ⇒ backing
    }

    #[test]
    fn test_backing_loop_rejected() {
        let dir = TempDir::new().unwrap();
        let a = write_qcow2(&dir, "a.qcow2", CLUSTER, &[], Some("b.qcow2"));
        let b = write_qcow2(&dir, "b.qcow2", CLUSTER, &[], Some("a.qcow2"));

        match Qcow2::new(&[a, b], None) {
            Err(ImageError::Arg(_)) => {}
            other => panic!("expected Arg error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_encrypted_image_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("enc.qcow2");
        let mut header = vec![0u8; 104];
        header[0..4].copy_from_slice(&QCOW2_MAGIC.to_be_bytes());
        header[4..8].copy_from_slice(&2u32.to_be_bytes());
        header[20..24].copy_from_slice(&16u32.to_be_bytes());
        header[24..32].copy_from_slice(&65536u64.to_be_bytes());
        header[32..36].copy_from_slice(&1u32.to_be_bytes()); // AES crypt method
        File::create(&path).unwrap().write_all(&header).unwrap();

        match Qcow2::new(&[path.display().to_string()], None) {
            Err(ImageError::Unsupported(_)) => {}
            other => panic!("expected Unsupported, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_read_spanning_clusters() {
        let dir = TempDir::new().unwrap();
        let path = write_qcow2(
            &dir,
            "span.qcow2",
            2 * CLUSTER,
            &[
                (0, TestCluster::Raw(vec![0x01; CLUSTER as usize])),
                (1, TestCluster::Raw(vec![0x02; CLUSTER as usize])),
            ],
            None,
        );
        let mut img = Qcow2::new(&[path], None).unwrap();

        let mut buf = vec![0u8; 32];
        let n = img.read_at(CLUSTER - 16, &mut buf).unwrap();
        assert_eq!(n, 32);
        assert_eq!(&buf[..16], &[0x01; 16]);
        assert_eq!(&buf[16..], &[0x02; 16]);
    }
}
