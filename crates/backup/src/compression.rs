/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Streaming gzip helpers
//!
//! The embedded-engine driver and the restore paths compress and expand
//! through these instead of buffering whole files in memory. All archives
//! in this system use gzip; the algorithm is recorded in every metadata
//! sidecar so restore never has to guess.

use crate::error::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;

/// Compress `src` into `dst`, streaming. Returns bytes written.
pub fn gzip_file(src: &Path, dst: &Path, level: u32) -> Result<u64> {
    let input = File::open(src)?;
    let output = File::create(dst)?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::new(level));
    io::copy(&mut BufReader::new(input), &mut encoder)?;
    encoder.finish()?.into_inner().map_err(|e| e.into_error())?;
    Ok(std::fs::metadata(dst)?.len())
}

/// Compress an in-memory document into `dst`.
pub fn gzip_bytes(data: &[u8], dst: &Path, level: u32) -> Result<u64> {
    let output = File::create(dst)?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::new(level));
    io::Write::write_all(&mut encoder, data)?;
    encoder.finish()?.into_inner().map_err(|e| e.into_error())?;
    Ok(std::fs::metadata(dst)?.len())
}

/// Expand `src` into `dst`, streaming. Returns bytes written.
pub fn gunzip_file(src: &Path, dst: &Path) -> Result<u64> {
    let input = File::open(src)?;
    let output = File::create(dst)?;
    let mut decoder = GzDecoder::new(BufReader::new(input));
    let mut writer = BufWriter::new(output);
    let written = io::copy(&mut decoder, &mut writer)?;
    io::Write::flush(&mut writer)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn gzip_round_trip() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let gz = dir.path().join("src.gz");
        let back = dir.path().join("back");

        let payload = vec![7u8; 256 * 1024];
        std::fs::write(&src, &payload).unwrap();

        let compressed = gzip_file(&src, &gz, 9).unwrap();
        assert!(compressed > 0);
        assert!(compressed < payload.len() as u64);

        gunzip_file(&gz, &back).unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), payload);
    }

    #[test]
    fn gzip_bytes_round_trip() {
        let dir = TempDir::new().unwrap();
        let gz = dir.path().join("doc.gz");
        let back = dir.path().join("doc");

        gzip_bytes(b"schema dump", &gz, 6).unwrap();
        gunzip_file(&gz, &back).unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), b"schema dump");
    }
}
