// src/image/partclone.rs

//! Native partclone v2 image reader
//!
//! Reconstructs a raw partition image from a partclone v2 stream:
//! descriptor, block bitmap, then the used blocks in disk order with a
//! checksum interleaved every `blocks_per_checksum` data blocks. Unused
//! blocks come out as zeroes. The stream is usually gzip-compressed and
//! split into fixed-size parts; [`extract_split_gz`] stitches the parts
//! back together and decompresses on the fly.

use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::progress::ProgressTracker;

const IMAGE_MAGIC: &[u8; 15] = b"partclone-image";
const ENDIAN_MAGIC_LE: u16 = 0xC0DE;

/// How the block bitmap is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapMode {
    /// One bit per block, LSB first
    Bit,
    /// One byte per block
    Byte,
}

/// Parsed image descriptor (head + file system info + options)
#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    pub partclone_version: String,
    pub fs_type: String,
    pub device_size: u64,
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub block_size: u32,
    pub checksum_size: u16,
    pub blocks_per_checksum: u32,
    pub bitmap_mode: BitmapMode,
}

impl ImageDescriptor {
    pub fn raw_size(&self) -> u64 {
        self.total_blocks * self.block_size as u64
    }
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        Error::Format(format!("truncated partclone stream: {}", e))
    })
}

fn read_u16<R: Read>(reader: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_exact(reader, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// Parse the v2 descriptor at the head of a stream
pub fn read_descriptor<R: Read>(reader: &mut R) -> Result<ImageDescriptor> {
    // image_head_v2
    let mut magic = [0u8; 16];
    read_exact(reader, &mut magic)?;
    if &magic[..15] != IMAGE_MAGIC {
        return Err(Error::Format("not a partclone image".to_string()));
    }
    let mut ptc_version = [0u8; 14];
    read_exact(reader, &mut ptc_version)?;
    let mut image_version = [0u8; 4];
    read_exact(reader, &mut image_version)?;
    if &image_version != b"0002" {
        return Err(Error::Format(format!(
            "unsupported image version {:?}",
            cstr(&image_version)
        )));
    }
    let endianess = read_u16(reader)?;
    if endianess != ENDIAN_MAGIC_LE {
        return Err(Error::Format(format!(
            "unsupported endianness {:#06x}",
            endianess
        )));
    }

    // file_system_info_v2
    let mut fs_type = [0u8; 16];
    read_exact(reader, &mut fs_type)?;
    let device_size = read_u64(reader)?;
    let total_blocks = read_u64(reader)?;
    let _superblock_used = read_u64(reader)?;
    let used_blocks = read_u64(reader)?;
    let block_size = read_u32(reader)?;

    // image_options_v2
    let _feature_size = read_u32(reader)?;
    let _image_version = read_u16(reader)?;
    let _cpu_bits = read_u16(reader)?;
    let _checksum_mode = read_u16(reader)?;
    let checksum_size = read_u16(reader)?;
    let blocks_per_checksum = read_u32(reader)?;
    let mut flags = [0u8; 2];
    read_exact(reader, &mut flags)?; // reseed_checksum, bitmap_mode
    let bitmap_mode = match flags[1] {
        1 => BitmapMode::Bit,
        2 => BitmapMode::Byte,
        other => {
            return Err(Error::Format(format!(
                "unsupported bitmap mode {}",
                other
            )))
        }
    };

    // Descriptor CRC; partclone itself is the authority on it.
    let _desc_crc = read_u32(reader)?;

    if block_size == 0 || total_blocks == 0 {
        return Err(Error::Format("degenerate partclone geometry".to_string()));
    }

    Ok(ImageDescriptor {
        partclone_version: cstr(&ptc_version),
        fs_type: cstr(&fs_type),
        device_size,
        total_blocks,
        used_blocks,
        block_size,
        checksum_size,
        blocks_per_checksum,
        bitmap_mode,
    })
}

/// Block usage bitmap
pub struct Bitmap {
    mode: BitmapMode,
    data: Vec<u8>,
}

impl Bitmap {
    pub fn read<R: Read>(reader: &mut R, desc: &ImageDescriptor) -> Result<Self> {
        let len = match desc.bitmap_mode {
            BitmapMode::Bit => desc.total_blocks.div_ceil(8),
            BitmapMode::Byte => desc.total_blocks,
        } as usize;
        let mut data = vec![0u8; len];
        read_exact(reader, &mut data)?;

        // Bitmap trailer checksum, not validated here either.
        if desc.checksum_size > 0 {
            let mut skip = vec![0u8; desc.checksum_size as usize];
            read_exact(reader, &mut skip)?;
        }
        Ok(Self {
            mode: desc.bitmap_mode,
            data,
        })
    }

    #[inline]
    pub fn is_used(&self, block: u64) -> bool {
        match self.mode {
            BitmapMode::Bit => {
                (self.data[(block / 8) as usize] >> (block % 8)) & 1 != 0
            }
            BitmapMode::Byte => self.data[block as usize] != 0,
        }
    }

    pub fn count_used(&self) -> u64 {
        match self.mode {
            BitmapMode::Bit => self.data.iter().map(|b| b.count_ones() as u64).sum(),
            BitmapMode::Byte => self.data.iter().filter(|&&b| b != 0).count() as u64,
        }
    }
}

/// Counters from a completed restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreStats {
    pub total_blocks: u64,
    pub data_blocks: u64,
    pub bytes_written: u64,
}

/// Restore a raw image from an already-decompressed partclone stream
pub fn restore_raw<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    progress: &dyn ProgressTracker,
) -> Result<RestoreStats> {
    let desc = read_descriptor(reader)?;
    let bitmap = Bitmap::read(reader, &desc)?;
    if bitmap.count_used() != desc.used_blocks {
        return Err(Error::Format(format!(
            "bitmap marks {} used blocks, descriptor says {}",
            bitmap.count_used(),
            desc.used_blocks
        )));
    }

    progress.set_length(desc.total_blocks);
    let block_size = desc.block_size as usize;
    let zero_block = vec![0u8; block_size];
    let mut block = vec![0u8; block_size];
    let mut checksum = vec![0u8; desc.checksum_size as usize];

    let mut data_blocks = 0u64;
    for index in 0..desc.total_blocks {
        if bitmap.is_used(index) {
            read_exact(reader, &mut block)?;
            writer.write_all(&block)?;
            data_blocks += 1;
            // partclone interleaves a checksum after every
            // blocks_per_checksum data blocks; skip it.
            if desc.checksum_size > 0
                && desc.blocks_per_checksum > 0
                && data_blocks % desc.blocks_per_checksum as u64 == 0
            {
                read_exact(reader, &mut checksum)?;
            }
        } else {
            writer.write_all(&zero_block)?;
        }
        if index % 4096 == 0 {
            progress.set_position(index);
        }
    }
    progress.finish_with_message("restore complete");

    Ok(RestoreStats {
        total_blocks: desc.total_blocks,
        data_blocks,
        bytes_written: desc.raw_size(),
    })
}

/// Reader over a sorted sequence of part files, presented as one stream
pub struct SplitReader {
    parts: Vec<PathBuf>,
    index: usize,
    current: Option<File>,
}

impl SplitReader {
    pub fn open(parts: &[PathBuf]) -> Result<Self> {
        if parts.is_empty() {
            return Err(Error::Format("no chunk files given".to_string()));
        }
        let mut parts = parts.to_vec();
        parts.sort();
        let first = File::open(&parts[0])?;
        Ok(Self {
            parts,
            index: 0,
            current: Some(first),
        })
    }
}

impl Read for SplitReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let Some(file) = self.current.as_mut() else {
                return Ok(0);
            };
            let n = file.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.index += 1;
            self.current = if self.index < self.parts.len() {
                Some(File::open(&self.parts[self.index])?)
            } else {
                None
            };
        }
    }
}

/// Decompress and restore a split gzipped partclone chunk set to a raw
/// image file
pub fn extract_split_gz(
    chunks: &[PathBuf],
    output: &Path,
    progress: &dyn ProgressTracker,
) -> Result<RestoreStats> {
    let split = SplitReader::open(chunks)?;
    let mut decoder = MultiGzDecoder::new(split);
    let mut writer = BufWriter::new(File::create(output)?);
    let stats = restore_raw(&mut decoder, &mut writer, progress)?;
    writer.flush()?;
    Ok(stats)
}
