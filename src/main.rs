// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `flashbuild` is a utility around pak based flash images. It assembles a
//! deterministic, offset-exact flash image from a declarative partition
//! table plus per-partition payload files, and compiles the same table into
//! its binary on-flash descriptor.
//!
//! Payloads are opaque archive blobs here: the tool places, sizes, pads,
//! and seals them without knowing anything about their internal structure.

mod error;
mod format;
mod pak;
mod partition;

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use zerocopy::AsBytes;

use crate::error::ImageError;
use crate::format::EndMarker;
use crate::pak::PakImage;
use crate::partition::{compile_table, layout, parse_table, Partition, PartitionSpec};

///////////////////////////////////////////////////////////////////////
// Top-level command line interface definition and dispatch.

/// flashbuild builds pak-based flash images and binary partition tables.
#[derive(Parser)]
#[clap(term_width = 80)]
struct Flashbuild {
    #[clap(flatten)]
    global: GlobalFlags,
    #[clap(subcommand)]
    command: Option<Cmd>,
}

#[derive(Parser)]
struct GlobalFlags {
    /// Print the layout of each partition as it is written.
    #[clap(long, short, global = true)]
    verbose: bool,
}

#[derive(Parser)]
enum Cmd {
    /// Build a flash image from individual pak partitions.
    BuildImage(ImageArgs),
    /// Translate a text partition table into binary.
    CompilePtable(PtableArgs),
    /// Concatenate pak images back-to-back into one partition's capacity.
    ConcatImage(ImageArgs),
}

/// Arguments shared by the two image-producing commands.
#[derive(Parser)]
struct ImageArgs {
    /// Partition table description: a literal ordered sequence of
    /// (name, size) pairs.
    parttable: PathBuf,

    /// Output image file name.
    outfile: PathBuf,

    /// Partition images in part_name=file_name format. May be repeated; if
    /// a name is given more than once, the last file wins.
    #[clap(long, short, value_name = "NAME=FILE", parse(try_from_str = parse_pspec))]
    partition: Vec<PartitionArg>,
}

#[derive(Parser)]
struct PtableArgs {
    /// Partition table description: a literal ordered sequence of
    /// (name, size) pairs.
    parttable: PathBuf,

    /// Output file name.
    outfile: PathBuf,
}

///////////////////////////////////////////////////////////////////////
// Main function / dispatch routine.

fn main() -> Result<()> {
    let args = Flashbuild::parse();
    let command = match args.command {
        Some(command) => command,
        None => {
            Flashbuild::command().print_help()?;
            std::process::exit(1);
        }
    };
    match &command {
        Cmd::BuildImage(subargs) => cmd_build_image(&args.global, subargs),
        Cmd::CompilePtable(subargs) => cmd_compile_ptable(&args.global, subargs),
        Cmd::ConcatImage(subargs) => cmd_concat_image(&args.global, subargs),
    }
}

///////////////////////////////////////////////////////////////////////
// build-image

fn cmd_build_image(global: &GlobalFlags, args: &ImageArgs) -> Result<()> {
    let table = load_table(&args.parttable)?;
    let mut partitions = layout::<PakImage>(&table)?;

    // Resolve and load every referenced payload first, so unknown-name and
    // oversize conditions surface before the output file exists.
    load_payloads(&mut partitions, &args.partition)?;

    let verbose = global.verbose;
    let total = write_or_discard(&args.outfile, |out| {
        write_image(out, &mut partitions, verbose)
    })?;

    println!("image is {} bytes ({} partitions)", total, table.len());
    Ok(())
}

/// Resolves each name=file mapping against the layout and loads the
/// payloads. Duplicate names are last-wins: a later file replaces the
/// earlier payload.
fn load_payloads(
    partitions: &mut [Partition<PakImage>],
    specs: &[PartitionArg],
) -> Result<()> {
    let index: BTreeMap<String, usize> = partitions
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name().to_string(), i))
        .collect();

    for spec in specs {
        let &slot = index
            .get(&spec.name)
            .ok_or_else(|| ImageError::UnknownPartition(spec.name.clone()))?;
        partitions[slot].load(&spec.file).with_context(|| {
            format!("unable to load partition image {}", spec.file.display())
        })?;
    }
    Ok(())
}

/// Pads and writes every partition in table order, then seals the image.
/// Returns the total number of bytes written, which is fixed by the table:
/// the sum of all declared partition sizes.
fn write_image(
    out: &mut (impl Write + Seek),
    partitions: &mut [Partition<PakImage>],
    verbose: bool,
) -> Result<u64> {
    for part in partitions.iter_mut() {
        if verbose {
            println!(
                "{:16} @ {:#010x}  {:8} bytes, {} loaded",
                part.name(),
                part.start(),
                part.size(),
                part.payload_len(),
            );
        }
        part.expand();
        part.write_into(out).with_context(|| {
            format!("error writing partition '{}' to output", part.name())
        })?;
    }
    seal_image(out)
}

///////////////////////////////////////////////////////////////////////
// concat-image

fn cmd_concat_image(_global: &GlobalFlags, args: &ImageArgs) -> Result<()> {
    let table = load_table(&args.parttable)?;
    let partitions = layout::<PakImage>(&table)?;

    // The output file's base name, extension stripped, names the partition
    // whose capacity the fragments fill.
    let target = args
        .outfile
        .file_stem()
        .and_then(OsStr::to_str)
        .unwrap_or_default();
    let capacity = partitions
        .iter()
        .find(|p| p.name() == target)
        .map(|p| p.size())
        .ok_or_else(|| ImageError::UnknownPartition(target.to_string()))?;

    let mut regions = chain_regions(capacity, &args.partition)?;
    let total = write_or_discard(&args.outfile, |out| write_concat(out, &mut regions))?;

    println!("image is {} bytes ({} fragments)", total, args.partition.len());
    Ok(())
}

/// Builds the private partition chain for concat mode: the first region
/// spans the target partition's whole capacity, and each later region gets
/// whatever capacity remains after the previous region's actual bytes.
fn chain_regions(capacity: u32, specs: &[PartitionArg]) -> Result<Vec<Partition<PakImage>>> {
    let mut regions = Vec::with_capacity(specs.len());
    let mut offset = 0;
    let mut available = capacity;
    for spec in specs {
        let mut region = Partition::new(&spec.name, offset, available, false)?;
        region.load(&spec.file).with_context(|| {
            format!("unable to load partition image {}", spec.file.display())
        })?;
        let len = region.payload_len() as u32;
        offset += len;
        available -= len;
        regions.push(region);
    }
    Ok(regions)
}

/// Writes the chained fragments back-to-back, unpadded, then seals the
/// image. Returns the total number of bytes written.
fn write_concat(
    out: &mut (impl Write + Seek),
    regions: &mut [Partition<PakImage>],
) -> Result<u64> {
    for region in regions.iter_mut() {
        println!("write {}", region.name());
        region.write_into(out).with_context(|| {
            format!("error writing fragment '{}' to output", region.name())
        })?;
    }
    seal_image(out)
}

///////////////////////////////////////////////////////////////////////
// compile-ptable

fn cmd_compile_ptable(_global: &GlobalFlags, args: &PtableArgs) -> Result<()> {
    let table = load_table(&args.parttable)?;
    let partitions = layout::<PakImage>(&table)?;

    let compiled = compile_table(&partitions)?;
    std::fs::write(&args.outfile, &compiled).with_context(|| {
        format!("can't write output file {}", args.outfile.display())
    })?;

    println!(
        "partition table is {} bytes ({} entries)",
        compiled.len(),
        partitions.len(),
    );
    Ok(())
}

///////////////////////////////////////////////////////////////////////
// Shared output plumbing.

/// Appends the 8-byte end marker. Its size field counts the marker itself,
/// so it always equals the final image length; that length is returned.
fn seal_image(out: &mut (impl Write + Seek)) -> Result<u64> {
    let total = out.stream_position()? + EndMarker::LEN as u64;
    let marker = EndMarker::sealing(
        u32::try_from(total).context("image size exceeds the end marker's 32-bit size field")?,
    );
    out.write_all(marker.as_bytes())
        .context("error writing end marker to output")?;
    Ok(total)
}

/// Creates the output file and runs `write` against it. A failed write
/// removes the output again rather than leaving a truncated image behind
/// looking valid.
fn write_or_discard(
    outfile: &Path,
    write: impl FnOnce(&mut File) -> Result<u64>,
) -> Result<u64> {
    let mut out = File::create(outfile)
        .with_context(|| format!("can't create output file {}", outfile.display()))?;
    match write(&mut out) {
        Ok(total) => Ok(total),
        Err(e) => {
            drop(out);
            let _ = std::fs::remove_file(outfile);
            Err(e)
        }
    }
}

///////////////////////////////////////////////////////////////////////
// Clap helper functions and the name=path partition specification.

/// A `--partition` mapping from table entry name to payload file.
#[derive(Debug, Clone)]
struct PartitionArg {
    name: String,
    file: PathBuf,
}

/// Parses a `part_name=file_name` specification.
fn parse_pspec(s: &str) -> Result<PartitionArg, ImageError> {
    let mut parts = s.splitn(3, '=');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(file), None) => Ok(PartitionArg {
            name: name.to_string(),
            file: PathBuf::from(file),
        }),
        _ => Err(ImageError::MalformedSpec(s.to_string())),
    }
}

/// Reads and parses a partition table description file.
fn load_table(path: &Path) -> Result<Vec<PartitionSpec>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read partition table {}", path.display()))?;
    parse_table(&text)
        .with_context(|| format!("unable to parse partition table {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn temp_file(name: &str, data: &[u8]) -> PathBuf {
        let path = std::env::temp_dir()
            .join(format!("flashbuild-main-{}-{}", std::process::id(), name));
        std::fs::write(&path, data).unwrap();
        path
    }

    fn spec(name: &str, size: u32) -> PartitionSpec {
        PartitionSpec {
            name: name.to_string(),
            size,
        }
    }

    fn parg(name: &str, file: &Path) -> PartitionArg {
        PartitionArg {
            name: name.to_string(),
            file: file.to_path_buf(),
        }
    }

    #[test]
    fn parse_pspec_splits_on_single_separator() {
        let arg = parse_pspec("bootA=out/bootA.pak").unwrap();
        assert_eq!(arg.name, "bootA");
        assert_eq!(arg.file, PathBuf::from("out/bootA.pak"));

        assert!(matches!(
            parse_pspec("bootA"),
            Err(ImageError::MalformedSpec(_)),
        ));
        assert!(matches!(
            parse_pspec("bootA=x=y"),
            Err(ImageError::MalformedSpec(_)),
        ));
    }

    #[test]
    fn unknown_partition_is_rejected_during_load() {
        let mut partitions =
            layout::<PakImage>(&[spec("A", 64), spec("B", 64)]).unwrap();
        let err = load_payloads(
            &mut partitions,
            &[parg("bogus", Path::new("never-read.pak"))],
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImageError>(),
            Some(ImageError::UnknownPartition(n)) if n == "bogus",
        ));
    }

    #[test]
    fn duplicate_partition_mappings_are_last_wins() {
        let first = temp_file("dup-first", &[0x11; 10]);
        let second = temp_file("dup-second", &[0x22; 20]);

        let mut partitions =
            layout::<PakImage>(&[spec("A", 64), spec("B", 64)]).unwrap();
        load_payloads(
            &mut partitions,
            &[parg("A", &first), parg("A", &second)],
        )
        .unwrap();
        assert_eq!(partitions[0].payload_len(), 20);

        let _ = std::fs::remove_file(first);
        let _ = std::fs::remove_file(second);
    }

    #[test]
    fn build_image_matches_worked_example() {
        let a = temp_file("example-a", &[0xa5; 50]);
        let b = temp_file("example-b", &[0x5a; 50]);

        let mut partitions =
            layout::<PakImage>(&[spec("A", 64), spec("B", 64)]).unwrap();
        load_payloads(&mut partitions, &[parg("A", &a), parg("B", &b)]).unwrap();

        let mut out = Cursor::new(Vec::new());
        let total = write_image(&mut out, &mut partitions, false).unwrap();
        let image = out.into_inner();

        // Output length is the sum of the declared sizes; the last
        // partition's padding absorbed the marker reservation.
        assert_eq!(total, 128);
        assert_eq!(image.len(), 128);
        assert!(image[0..50].iter().all(|&b| b == 0xa5));
        assert!(image[50..64].iter().all(|&b| b == 0));
        assert!(image[64..114].iter().all(|&b| b == 0x5a));
        assert!(image[114..120].iter().all(|&b| b == 0));
        let marker = EndMarker::sealing(128);
        assert_eq!(&image[120..], marker.as_bytes());

        let _ = std::fs::remove_file(a);
        let _ = std::fs::remove_file(b);
    }

    #[test]
    fn build_image_rejects_oversize_last_partition_payload() {
        let b = temp_file("example-oversize", &[0x5a; 70]);

        let mut partitions =
            layout::<PakImage>(&[spec("A", 64), spec("B", 64)]).unwrap();
        let err = load_payloads(&mut partitions, &[parg("B", &b)]).unwrap_err();
        assert!(matches!(
            err.root_cause().downcast_ref::<ImageError>(),
            Some(ImageError::Oversize {
                required: 70,
                available: 56,
                ..
            }),
        ));

        let _ = std::fs::remove_file(b);
    }

    #[test]
    fn concat_regions_chain_by_actual_length() {
        let f0 = temp_file("concat-0", &[0x11; 10]);
        let f1 = temp_file("concat-1", &[0x22; 20]);

        let mut regions =
            chain_regions(64, &[parg("frag0", &f0), parg("frag1", &f1)]).unwrap();
        assert_eq!(regions[0].start(), 0);
        assert_eq!(regions[0].size(), 64);
        assert_eq!(regions[1].start(), 10);
        assert_eq!(regions[1].size(), 54);

        let mut out = Cursor::new(Vec::new());
        let total = write_concat(&mut out, &mut regions).unwrap();
        let image = out.into_inner();

        // Fragments pack back-to-back, unpadded, marker sized against the
        // whole concatenated output.
        assert_eq!(total, 38);
        assert_eq!(image.len(), 38);
        assert!(image[0..10].iter().all(|&b| b == 0x11));
        assert!(image[10..30].iter().all(|&b| b == 0x22));
        let marker = EndMarker::sealing(38);
        assert_eq!(&image[30..], marker.as_bytes());

        let _ = std::fs::remove_file(f0);
        let _ = std::fs::remove_file(f1);
    }

    #[test]
    fn concat_rejects_fragment_exceeding_remaining_capacity() {
        let f0 = temp_file("concat-fit", &[0x11; 10]);
        let f1 = temp_file("concat-spill", &[0x22; 10]);

        let err =
            chain_regions(16, &[parg("frag0", &f0), parg("frag1", &f1)]).unwrap_err();
        assert!(matches!(
            err.root_cause().downcast_ref::<ImageError>(),
            Some(ImageError::Oversize {
                required: 10,
                available: 6,
                ..
            }),
        ));

        let _ = std::fs::remove_file(f0);
        let _ = std::fs::remove_file(f1);
    }
}
