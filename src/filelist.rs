// src/filelist.rs

//! Codec for the machine's encrypted-asset manifest (`fl.dat`)
//!
//! One record per line:
//!
//! ```text
//! /jjpe/gen1/<game>/game/edata/path,filler,crc_encrypted,crc_decrypted
//! ```
//!
//! Checksums and filler are decimal. Asset paths may themselves contain
//! commas, so the three numeric fields are split from the *right*; the
//! remainder is the path. The machine's own reader consumes this file, so
//! serialization must reproduce the input byte for byte, including the
//! line ending flavor and whether a final newline was present.

use std::collections::HashSet;

use crate::error::{Error, Result};

/// One manifest record; checksums are over the encrypted bytes on disk
/// and the defillered decrypted content respectively
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// Absolute path inside the mounted image; record identity
    pub path: String,
    /// Random prefix bytes inserted before the plaintext prior to
    /// encryption
    pub filler_size: u32,
    pub crc_encrypted: u32,
    pub crc_decrypted: u32,
}

impl Asset {
    /// Whether this record points into the encrypted-data tree
    pub fn is_encrypted_data(&self) -> bool {
        self.path.contains(crate::config::ENCRYPTED_DATA_PREFIX)
    }
}

/// Line ending flavor of the source file, preserved on output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

/// Parsed manifest, ordered as on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileList {
    pub assets: Vec<Asset>,
    line_ending: LineEnding,
    trailing_newline: bool,
}

impl FileList {
    /// Parse decrypted manifest text
    pub fn parse(text: &str) -> Result<Self> {
        let line_ending = if text.contains("\r\n") {
            LineEnding::CrLf
        } else {
            LineEnding::Lf
        };
        let trailing_newline = text.ends_with('\n');

        let mut assets = Vec::new();
        let mut seen = HashSet::new();

        for (lineno, raw_line) in text.split('\n').enumerate() {
            let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
            if line.is_empty() {
                continue;
            }
            let asset = parse_record(line)
                .map_err(|e| Error::Format(format!("line {}: {}", lineno + 1, e)))?;
            if !seen.insert(asset.path.clone()) {
                return Err(Error::Format(format!(
                    "line {}: duplicate asset path {}",
                    lineno + 1,
                    asset.path
                )));
            }
            assets.push(asset);
        }

        Ok(Self {
            assets,
            line_ending,
            trailing_newline,
        })
    }

    /// Serialize back to manifest text; `serialize(parse(x)) == x`
    pub fn serialize(&self) -> String {
        let ending = self.line_ending.as_str();
        let mut out = String::new();
        for (i, asset) in self.assets.iter().enumerate() {
            if i > 0 {
                out.push_str(ending);
            }
            out.push_str(&format!(
                "{},{},{},{}",
                asset.path, asset.filler_size, asset.crc_encrypted, asset.crc_decrypted
            ));
        }
        if self.trailing_newline && !self.assets.is_empty() {
            out.push_str(ending);
        }
        out
    }

    /// Look up a record by its path
    pub fn find(&self, path: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.path == path)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

fn parse_record(line: &str) -> std::result::Result<Asset, String> {
    // Rightmost three commas delimit the numeric fields; anything before
    // them, commas included, is the path.
    let (rest, crc_decrypted) = split_last_field(line)?;
    let (rest, crc_encrypted) = split_last_field(rest)?;
    let (path, filler_size) = split_last_field(rest)?;

    if path.is_empty() {
        return Err("empty asset path".to_string());
    }

    Ok(Asset {
        path: path.to_string(),
        filler_size: filler_size
            .try_into()
            .map_err(|_| format!("filler size {} out of range", filler_size))?,
        crc_encrypted: crc_encrypted as u32,
        crc_decrypted: crc_decrypted as u32,
    })
}

fn split_last_field(s: &str) -> std::result::Result<(&str, u64), String> {
    let (rest, field) = s
        .rsplit_once(',')
        .ok_or_else(|| format!("expected 4 comma-separated fields in {:?}", s))?;
    let value: u64 = field
        .parse()
        .map_err(|_| format!("non-numeric field {:?}", field))?;
    if value > u32::MAX as u64 {
        return Err(format!("field {} exceeds 32 bits", value));
    }
    Ok((rest, value))
}
