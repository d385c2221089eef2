// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Partition layout: turning an ordered table description into absolute
//! byte regions, and the per-partition assembly operations.

use std::io::{self, Write};
use std::mem::size_of;
use std::path::Path;

use serde::Deserialize;
use zerocopy::{AsBytes, U32};

use crate::error::{ImageError, Result};
use crate::format::{EndMarker, TableEntry, TableHeader, PART_NAME_MAXLEN};
use crate::pak::Container;

/// One entry of the partition table description: a name and a declared size
/// in bytes. Order within the table is layout order.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "(String, u32)")]
pub struct PartitionSpec {
    pub name: String,
    pub size: u32,
}

impl From<(String, u32)> for PartitionSpec {
    fn from((name, size): (String, u32)) -> Self {
        Self { name, size }
    }
}

/// Parses a partition table description: a literal ordered sequence of
/// `(name, size)` pairs, written as a JSON array of two-element arrays,
/// e.g. `[["bootA", 262144], ["data", 131072]]`.
pub fn parse_table(text: &str) -> Result<Vec<PartitionSpec>> {
    serde_json::from_str(text).map_err(|e| ImageError::InvalidTable(e.to_string()))
}

/// One region of the flash image, wrapping the archive container that holds
/// its payload.
#[derive(Debug)]
pub struct Partition<C> {
    name: String,
    start: u32,
    size: u32,
    last: bool,
    pak: C,
}

impl<C: Container + Default> Partition<C> {
    /// Creates a partition covering `size` bytes at absolute offset
    /// `start`. The last partition of a table gives up the final 8 bytes of
    /// its declared size to the image end marker.
    pub fn new(name: &str, start: u32, size: u32, last: bool) -> Result<Self> {
        if name.len() > PART_NAME_MAXLEN {
            return Err(ImageError::NameTooLong(name.to_string()));
        }
        let reserved = if last { EndMarker::LEN as u32 } else { 0 };
        if size < reserved {
            return Err(ImageError::InvalidTable(format!(
                "last partition '{}' is too small to reserve the end marker",
                name,
            )));
        }
        Ok(Self {
            name: name.to_string(),
            start,
            size: size - reserved,
            last,
            pak: C::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    /// Usable size in bytes, end-marker reservation already applied.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_last(&self) -> bool {
        self.last
    }

    /// Current length of the loaded payload (0 until `load` is called).
    pub fn payload_len(&self) -> usize {
        self.pak.len()
    }

    /// Loads the payload file into the owned container and checks that it
    /// fits. A payload that arrives sealed with its own end marker has the
    /// marker stripped; emitting the marker of the composed image belongs
    /// to the assembler alone.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.pak.load(path)?;

        // The fit check sees the payload as loaded, marker included.
        if self.pak.len() > self.size as usize {
            return Err(ImageError::Oversize {
                partition: self.name.clone(),
                file: path.to_path_buf(),
                required: self.pak.len(),
                available: self.size as usize,
            });
        }

        if self.pak.has_end_marker() {
            self.pak.clear_end_marker();
        }
        Ok(())
    }

    /// Pads the payload out to the partition's full usable size.
    pub fn expand(&mut self) {
        // load() enforced len <= size, and unreferenced partitions are
        // empty, so this cannot underflow.
        let pad = self.size as usize - self.pak.len();
        self.pak.append_padding(pad);
    }

    /// Rebuilds the container image and writes its raw bytes to `w`.
    pub fn write_into(&mut self, w: &mut impl Write) -> io::Result<()> {
        self.pak.rebuild();
        w.write_all(self.pak.image())
    }

    /// The 24-byte binary partition table entry for this partition,
    /// independent of payload state.
    pub fn table_entry(&self) -> TableEntry {
        let mut name = [0; PART_NAME_MAXLEN];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        TableEntry {
            name,
            start: U32::new(self.start),
            size: U32::new(self.size),
        }
    }
}

/// Lays out a partition table: folds the declared sizes into absolute start
/// offsets, producing one immutable partition list per run.
///
/// Offsets accumulate the *declared* sizes, so they reflect nominal layout
/// even though the last entry's usable size excludes the end-marker
/// reservation.
pub fn layout<C: Container + Default>(table: &[PartitionSpec]) -> Result<Vec<Partition<C>>> {
    if table.is_empty() {
        return Err(ImageError::InvalidTable(
            "partition table is empty".to_string(),
        ));
    }

    let mut partitions = Vec::with_capacity(table.len());
    let mut offset: u64 = 0;
    for (i, spec) in table.iter().enumerate() {
        let last = i + 1 == table.len();
        let start = u32::try_from(offset).map_err(|_| {
            ImageError::InvalidTable(format!(
                "partition '{}' starts beyond the 32-bit offset space",
                spec.name,
            ))
        })?;
        partitions.push(Partition::new(&spec.name, start, spec.size, last)?);
        offset += u64::from(spec.size);
    }

    // The end marker records the total image size in a u32, so the whole
    // layout has to fit one.
    if offset > u64::from(u32::MAX) {
        return Err(ImageError::InvalidTable(
            "total image size exceeds the 32-bit offset space".to_string(),
        ));
    }

    Ok(partitions)
}

/// Serializes a laid-out table into its binary descriptor: header plus one
/// 24-byte entry per partition. Pure over the layout; payload state never
/// enters the output.
pub fn compile_table<C: Container + Default>(partitions: &[Partition<C>]) -> Result<Vec<u8>> {
    let count = u16::try_from(partitions.len()).map_err(|_| {
        ImageError::InvalidTable("more than 65535 partitions".to_string())
    })?;

    let mut out =
        Vec::with_capacity(size_of::<TableHeader>() + partitions.len() * size_of::<TableEntry>());
    out.extend_from_slice(TableHeader::new(count).as_bytes());
    for part in partitions {
        out.extend_from_slice(part.table_entry().as_bytes());
    }
    Ok(out)
}
