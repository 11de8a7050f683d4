//! File-level source using a zsync-style block-differential transport.
//!
//! A `.zsync` control file describes the remote file as a table of per-block
//! checksums (a rolling rsum plus a truncated MD4). Blocks whose checksums
//! match blocks of the current cache file are copied locally; only the rest
//! is fetched, as coalesced HTTP range requests. The assembled file must
//! match the control file's whole-file SHA-1 before it is accepted, and an
//! optional detached signature is verified with `gpgv` on top of that.
//!
//! Contract with the file-level updater: everything is written to the
//! destination path it supplies; the live cache file is never touched here.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::process::Command;

use md4::{Digest as _, Md4};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RANGE;
use sha1::Sha1;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::maps::MapKind;
use crate::sources::http::{Fetched, build_client, fetch_url, join_url};
use crate::sources::{FileSource, retry_delay, retry_max, with_retries};

const DEFAULT_ZSYNC_SUFFIX: &str = ".zsync";
const DEFAULT_GPG_SUFFIX: &str = ".asc";
const DEFAULT_GPG_PUBKEYFILE: &str = "/var/lib/nsscache/nsscache.pub";
const DEFAULT_GPGV: &str = "/usr/bin/gpgv";

pub struct ZsyncSource {
    client: Client,
    options: Options,
    retry_max: u32,
    retry_delay: u64,
}

impl ZsyncSource {
    pub fn new(options: &Options) -> Result<Self> {
        if options.get_bool("gpg") {
            // Fail at startup, not mid-update, if verification can't run.
            let pubkey = options
                .get_str("gpg_pubkeyfile")
                .unwrap_or_else(|| DEFAULT_GPG_PUBKEYFILE.to_string());
            if !Path::new(&pubkey).exists() {
                return Err(Error::Configuration(format!(
                    "gpg verification enabled but {pubkey} does not exist"
                )));
            }
        }
        Ok(Self {
            client: build_client(options)?,
            retry_max: retry_max(options),
            retry_delay: retry_delay(options),
            options: options.clone(),
        })
    }

    fn url_for(&self, kind: MapKind, location: Option<&str>) -> Result<String> {
        if kind == MapKind::Automount {
            let base = self.options.require_str("automount_base_url")?;
            let location = location.unwrap_or("auto.master");
            return join_url(&base, location);
        }
        let key = match kind {
            MapKind::Passwd => "passwd_url",
            MapKind::Group => "group_url",
            MapKind::Shadow => "shadow_url",
            MapKind::Netgroup => "netgroup_url",
            MapKind::Sshkey => "sshkey_url",
            MapKind::Automount => unreachable!(),
        };
        self.options.require_str(key)
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        match fetch_url(&self.client, url, None, self.retry_max, self.retry_delay)? {
            Fetched::Document { body, .. } => Ok(body),
            Fetched::NotModified => Err(Error::SourceUnavailable(format!(
                "{url}: unexpected 304 without a conditional request"
            ))),
        }
    }

    fn fetch_range(&self, url: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        with_retries(self.retry_max, self.retry_delay, || {
            tracing::debug!(url, start, end, "fetching range");
            let response = self
                .client
                .get(url)
                .header(RANGE, format!("bytes={start}-{end}"))
                .send()
                .map_err(|err| Error::SourceUnavailable(format!("{url}: {err}")))?;
            let status = response.status();
            let mut body = Vec::new();
            let mut response = response;
            response
                .read_to_end(&mut body)
                .map_err(|err| Error::SourceUnavailable(format!("{url}: {err}")))?;

            match status {
                StatusCode::PARTIAL_CONTENT => Ok(body),
                // A server that ignores ranges sends the whole file; slice
                // out what was asked for.
                StatusCode::OK => {
                    let start = usize::try_from(start).unwrap_or(usize::MAX);
                    let end = usize::try_from(end).unwrap_or(usize::MAX);
                    if body.len() > end {
                        Ok(body[start..=end].to_vec())
                    } else if body.len() > start {
                        Ok(body[start..].to_vec())
                    } else {
                        Err(Error::InvalidMap(format!(
                            "{url}: short response for range {start}-{end}"
                        )))
                    }
                }
                other => Err(Error::SourceUnavailable(format!(
                    "{url}: HTTP {} for range request",
                    other.as_u16()
                ))),
            }
        })
    }

    /// One differential transfer: control file, plan, assembly, SHA-1 gate.
    fn transfer(&self, url: &str, dst: &Path, current: Option<&Path>) -> Result<()> {
        let suffix = self
            .options
            .get_str("zsync_suffix")
            .unwrap_or_else(|| DEFAULT_ZSYNC_SUFFIX.to_string());
        let control_url = format!("{url}{suffix}");
        let control = ControlFile::parse(&self.fetch_bytes(&control_url)?)?;
        tracing::debug!(url, blocks = control.blocks.len(), length = control.length,
            "zsync control file loaded");

        let local = match current {
            Some(path) => index_local_blocks(path, &control).unwrap_or_default(),
            None => Vec::new(),
        };
        let plan = plan_blocks(&control, &local);
        let reused = plan.iter().filter(|b| matches!(b, BlockSource::Local(_))).count();
        tracing::info!(
            reused,
            fetched = plan.len() - reused,
            "block reuse plan computed"
        );

        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dst)
            .map_err(|err| Error::from_io(err, "opening zsync destination"))?;
        out.set_len(control.length)?;

        // Local copies first, then the remote ranges in coalesced runs.
        if let Some(current) = current {
            if reused > 0 {
                let mut source = File::open(current)?;
                for (index, block) in plan.iter().enumerate() {
                    let BlockSource::Local(offset) = block else {
                        continue;
                    };
                    let mut data = vec![0u8; control.block_len(index)];
                    source.seek(SeekFrom::Start(*offset))?;
                    read_padded(&mut source, &mut data)?;
                    out.seek(SeekFrom::Start(control.block_offset(index)))?;
                    out.write_all(&data)?;
                }
            }
        }
        for (start_block, end_block) in remote_runs(&plan) {
            let start = control.block_offset(start_block);
            let end = control
                .block_offset(end_block)
                .saturating_add(control.block_len(end_block) as u64)
                .saturating_sub(1);
            let data = self.fetch_range(url, start, end)?;
            if data.len() != usize::try_from(end - start + 1).unwrap_or(usize::MAX) {
                return Err(Error::InvalidMap(format!(
                    "{url}: range {start}-{end} returned {} bytes",
                    data.len()
                )));
            }
            out.seek(SeekFrom::Start(start))?;
            out.write_all(&data)?;
        }
        out.sync_all()?;
        drop(out);

        let actual = sha1_file(dst)?;
        if actual != control.sha1 {
            return Err(Error::InvalidMap(format!(
                "{url}: SHA-1 mismatch after transfer ({actual} != {})",
                control.sha1
            )));
        }
        Ok(())
    }

    fn gpg_verify(&self, url: &str, dst: &Path) -> Result<()> {
        let suffix = self
            .options
            .get_str("gpg_suffix")
            .unwrap_or_else(|| DEFAULT_GPG_SUFFIX.to_string());
        let signature = self.fetch_bytes(&format!("{url}{suffix}"))?;
        let mut sig_file = tempfile::NamedTempFile::new()?;
        sig_file.write_all(&signature)?;
        sig_file.flush()?;

        let gpgv = self
            .options
            .get_str("gpgv")
            .unwrap_or_else(|| DEFAULT_GPGV.to_string());
        let pubkey = self
            .options
            .get_str("gpg_pubkeyfile")
            .unwrap_or_else(|| DEFAULT_GPG_PUBKEYFILE.to_string());
        let output = Command::new(&gpgv)
            .arg("--keyring")
            .arg(&pubkey)
            .arg(sig_file.path())
            .arg(dst)
            .output()
            .map_err(|err| Error::from_io(err, "spawning gpgv"))?;
        if !output.status.success() {
            return Err(Error::InvalidMap(format!(
                "signature verification failed for {url}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::info!(url, "signature verified");
        Ok(())
    }
}

impl FileSource for ZsyncSource {
    fn name(&self) -> &'static str {
        "zsync"
    }

    fn get_file(
        &mut self,
        kind: MapKind,
        dst: &Path,
        current: Option<&Path>,
        location: Option<&str>,
    ) -> Result<()> {
        let url = self.url_for(kind, location)?;
        let current = current.filter(|path| path.exists());

        match self.transfer(&url, dst, current) {
            Ok(()) => {}
            Err(Error::InvalidMap(why)) if current.is_some() => {
                // Stale or divergent local data can make the differential
                // pass come out wrong; retry as a full transfer.
                tracing::warn!(%why, "partial zsync failed, trying full transfer");
                self.transfer(&url, dst, None)?;
            }
            Err(err) => return Err(err),
        }

        if self.options.get_bool("gpg") {
            self.gpg_verify(&url, dst)?;
        }
        Ok(())
    }
}

/// Parsed `.zsync` control file: header fields plus the block checksum
/// table (`rsum_len` trailing rsum bytes and `checksum_len` MD4 prefix
/// bytes per block).
struct ControlFile {
    blocksize: u64,
    length: u64,
    rsum_len: usize,
    checksum_len: usize,
    sha1: String,
    blocks: Vec<BlockSum>,
}

#[derive(PartialEq, Eq, Hash, Clone)]
struct BlockSum {
    rsum: Vec<u8>,
    checksum: Vec<u8>,
}

enum BlockSource {
    /// Byte offset into the current cache file.
    Local(u64),
    Remote,
}

impl ControlFile {
    fn parse(raw: &[u8]) -> Result<Self> {
        let header_end = raw
            .windows(2)
            .position(|w| w == b"\n\n")
            .ok_or_else(|| Error::InvalidMap("control file has no header break".to_string()))?;
        let header = String::from_utf8_lossy(&raw[..header_end]);
        let table = &raw[header_end + 2..];

        let mut blocksize = 0u64;
        let mut length = 0u64;
        let mut sha1 = String::new();
        let mut hash_lengths = (1usize, 4usize, 16usize);
        for line in header.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key {
                "Blocksize" => {
                    blocksize = value
                        .parse()
                        .map_err(|_| Error::InvalidMap("bad Blocksize".to_string()))?;
                }
                "Length" => {
                    length = value
                        .parse()
                        .map_err(|_| Error::InvalidMap("bad Length".to_string()))?;
                }
                "SHA-1" => sha1 = value.to_lowercase(),
                "Hash-Lengths" => {
                    let parts: Vec<usize> = value
                        .split(',')
                        .map(|part| part.trim().parse())
                        .collect::<std::result::Result<_, _>>()
                        .map_err(|_| Error::InvalidMap("bad Hash-Lengths".to_string()))?;
                    let [seq, rsum, checksum] = parts[..] else {
                        return Err(Error::InvalidMap("bad Hash-Lengths".to_string()));
                    };
                    hash_lengths = (seq, rsum, checksum);
                }
                _ => {}
            }
        }
        if blocksize == 0 || sha1.len() != 40 {
            return Err(Error::InvalidMap(
                "control file is missing Blocksize or SHA-1".to_string(),
            ));
        }
        let (_seq, rsum_len, checksum_len) = hash_lengths;
        if rsum_len == 0 || rsum_len > 4 || checksum_len == 0 || checksum_len > 16 {
            return Err(Error::InvalidMap("bad Hash-Lengths".to_string()));
        }

        let block_count = usize::try_from(length.div_ceil(blocksize))
            .map_err(|_| Error::InvalidMap("file too large".to_string()))?;
        let record = rsum_len + checksum_len;
        if table.len() < block_count * record {
            return Err(Error::InvalidMap(format!(
                "control file block table truncated: {} < {}",
                table.len(),
                block_count * record
            )));
        }

        let mut blocks = Vec::with_capacity(block_count);
        for index in 0..block_count {
            let at = index * record;
            blocks.push(BlockSum {
                rsum: table[at..at + rsum_len].to_vec(),
                checksum: table[at + rsum_len..at + record].to_vec(),
            });
        }

        Ok(Self {
            blocksize,
            length,
            rsum_len,
            checksum_len,
            sha1,
            blocks,
        })
    }

    fn block_offset(&self, index: usize) -> u64 {
        index as u64 * self.blocksize
    }

    /// Unpadded length of block `index` (the final block may be short).
    fn block_len(&self, index: usize) -> usize {
        let start = self.block_offset(index);
        let end = (start + self.blocksize).min(self.length);
        usize::try_from(end - start).unwrap_or(0)
    }

    /// Checksums of one padded block, truncated the way the table stores
    /// them.
    fn summarize(&self, block: &[u8]) -> BlockSum {
        debug_assert_eq!(block.len() as u64, self.blocksize);
        let rsum = rolling_checksum(block).to_be_bytes();
        BlockSum {
            rsum: rsum[4 - self.rsum_len..].to_vec(),
            checksum: Md4::digest(block)[..self.checksum_len].to_vec(),
        }
    }
}

/// The zsync rolling checksum: a running byte sum and a running sum of the
/// sums, each kept to 16 bits, packed `a << 16 | b`.
fn rolling_checksum(block: &[u8]) -> u32 {
    let mut a = 0u16;
    let mut b = 0u16;
    for &byte in block {
        a = a.wrapping_add(u16::from(byte));
        b = b.wrapping_add(a);
    }
    (u32::from(a) << 16) | u32::from(b)
}

/// Checksum every aligned block of the current cache file, padding the tail
/// with zeros like the control-file generator does.
fn index_local_blocks(path: &Path, control: &ControlFile) -> Result<Vec<(BlockSum, u64)>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let blocksize = usize::try_from(control.blocksize)
        .map_err(|_| Error::InvalidMap("blocksize too large".to_string()))?;

    let mut sums = Vec::new();
    let mut offset = 0u64;
    while offset < len {
        let mut block = vec![0u8; blocksize];
        file.seek(SeekFrom::Start(offset))?;
        read_padded(&mut file, &mut block)?;
        sums.push((control.summarize(&block), offset));
        offset += control.blocksize;
    }
    Ok(sums)
}

/// Decide, per target block, whether a matching local block exists.
fn plan_blocks(control: &ControlFile, local: &[(BlockSum, u64)]) -> Vec<BlockSource> {
    let by_sum: std::collections::HashMap<&BlockSum, u64> = local
        .iter()
        .map(|(sum, offset)| (sum, *offset))
        .collect();
    control
        .blocks
        .iter()
        .map(|wanted| match by_sum.get(wanted) {
            Some(&offset) => BlockSource::Local(offset),
            None => BlockSource::Remote,
        })
        .collect()
}

/// Runs of consecutive remote blocks as (first, last) index pairs, so
/// adjacent misses become one range request.
fn remote_runs(plan: &[BlockSource]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    for (index, block) in plan.iter().enumerate() {
        match (block, &mut current) {
            (BlockSource::Remote, Some((_, end))) if *end + 1 == index => *end = index,
            (BlockSource::Remote, _) => {
                if let Some(run) = current.take() {
                    runs.push(run);
                }
                current = Some((index, index));
            }
            (BlockSource::Local(_), _) => {}
        }
    }
    if let Some(run) = current {
        runs.push(run);
    }
    runs
}

/// Fill `buf` from the reader, zero-padding past end of file.
fn read_padded(reader: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            for byte in &mut buf[filled..] {
                *byte = 0;
            }
            break;
        }
        filled += n;
    }
    Ok(())
}

fn sha1_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::Digest as _;
    use std::fs;
    use tempfile::TempDir;

    /// Build a control file over `content` the way zsyncmake would.
    fn make_control(content: &[u8], blocksize: u64) -> Vec<u8> {
        let sha1 = hex::encode(Sha1::digest(content));
        let mut raw = format!(
            "zsync: 0.6.2\nBlocksize: {blocksize}\nLength: {}\nHash-Lengths: 1,4,16\nURL: data\nSHA-1: {sha1}\n\n",
            content.len()
        )
        .into_bytes();
        let blocksize = usize::try_from(blocksize).unwrap();
        for chunk in content.chunks(blocksize) {
            let mut block = chunk.to_vec();
            block.resize(blocksize, 0);
            raw.extend_from_slice(&rolling_checksum(&block).to_be_bytes());
            raw.extend_from_slice(&Md4::digest(&block)[..16]);
        }
        raw
    }

    #[test]
    fn parses_control_header_and_table() {
        let content = b"root:x:0:0::/root:/bin/bash\nalice:x:1000:1000::/h:/bin/sh\n";
        let control = ControlFile::parse(&make_control(content, 16)).unwrap();
        assert_eq!(control.blocksize, 16);
        assert_eq!(control.length, content.len() as u64);
        assert_eq!(control.blocks.len(), content.len().div_ceil(16));
        assert_eq!(control.rsum_len, 4);
        assert_eq!(control.checksum_len, 16);
    }

    #[test]
    fn truncated_table_is_rejected() {
        let content = b"0123456789abcdef0123456789abcdef";
        let mut raw = make_control(content, 16);
        raw.truncate(raw.len() - 4);
        assert!(matches!(
            ControlFile::parse(&raw),
            Err(Error::InvalidMap(_))
        ));
    }

    #[test]
    fn identical_local_file_needs_no_remote_blocks() {
        let dir = TempDir::new().unwrap();
        let content = b"0123456789abcdef0123456789abcdefXYZ";
        let local_path = dir.path().join("current");
        fs::write(&local_path, content).unwrap();

        let control = ControlFile::parse(&make_control(content, 16)).unwrap();
        let local = index_local_blocks(&local_path, &control).unwrap();
        let plan = plan_blocks(&control, &local);
        assert!(plan.iter().all(|b| matches!(b, BlockSource::Local(_))));
    }

    #[test]
    fn changed_blocks_are_fetched_remotely() {
        let dir = TempDir::new().unwrap();
        let old = b"0123456789abcdefOLDBLOCK_OLDBLCK0123456789abcdef";
        let new = b"0123456789abcdefNEWBLOCK_NEWBLCK0123456789abcdef";
        let local_path = dir.path().join("current");
        fs::write(&local_path, old).unwrap();

        let control = ControlFile::parse(&make_control(new, 16)).unwrap();
        let local = index_local_blocks(&local_path, &control).unwrap();
        let plan = plan_blocks(&control, &local);
        assert!(matches!(plan[0], BlockSource::Local(_)));
        assert!(matches!(plan[1], BlockSource::Remote));
        assert!(matches!(plan[2], BlockSource::Local(_)));
        assert_eq!(remote_runs(&plan), vec![(1, 1)]);
    }

    #[test]
    fn remote_runs_coalesce_neighbors() {
        let plan = vec![
            BlockSource::Remote,
            BlockSource::Remote,
            BlockSource::Local(0),
            BlockSource::Remote,
        ];
        assert_eq!(remote_runs(&plan), vec![(0, 1), (3, 3)]);
    }

    #[test]
    fn rolling_checksum_is_order_sensitive() {
        assert_ne!(rolling_checksum(b"ab"), rolling_checksum(b"ba"));
        assert_eq!(rolling_checksum(b""), 0);
    }

    #[test]
    fn gpg_enabled_requires_pubkey_file() {
        let mut options = Options::new();
        options.set_str("name", "zsync");
        options.set_str("gpg", "yes");
        options.set_str("gpg_pubkeyfile", "/nonexistent/nsscache.pub");
        assert!(matches!(
            ZsyncSource::new(&options),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn url_for_joins_automount_locations() {
        let mut options = Options::new();
        options.set_str("name", "zsync");
        options.set_str("automount_base_url", "https://maps.example.com/exports/");
        let source = ZsyncSource::new(&options).unwrap();
        assert_eq!(
            source.url_for(MapKind::Automount, Some("auto.home")).unwrap(),
            "https://maps.example.com/exports/auto.home"
        );
        assert_eq!(
            source.url_for(MapKind::Automount, None).unwrap(),
            "https://maps.example.com/exports/auto.master"
        );
    }
}
