// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash image and partition table wire formats: magic constants and the
//! fixed binary layouts shared by the subcommands.

use byteorder::BigEndian;
use zerocopy::{AsBytes, FromBytes, Unaligned, U16, U32};

/// Maximum encoded length of a partition name, fixed by the 16-byte name
/// field of a binary partition table entry.
pub const PART_NAME_MAXLEN: usize = 16;

/// Format version stamped into compiled partition table headers.
pub const PT_FORMAT_VERSION: u16 = 1;

/// Magic opening a compiled binary partition table.
pub const TABLE_MAGIC: [u8; 4] = *b"PTBL";

/// Magic marking the end of a pak-based flash image.
pub const PAK_END_MAGIC: u32 = 0x5041_4b45;

/// Trailer sealing a composed flash image: magic plus the total image
/// length, marker included.
#[derive(Clone, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct EndMarker {
    pub magic: U32<BigEndian>,
    pub total_size: U32<BigEndian>,
}

impl EndMarker {
    /// Serialized size of the marker. The last partition of every table
    /// reserves exactly this many bytes.
    pub const LEN: usize = 8;

    /// Produces the marker for an image whose final length, marker
    /// included, is `total_size`.
    pub fn sealing(total_size: u32) -> Self {
        Self {
            magic: U32::new(PAK_END_MAGIC),
            total_size: U32::new(total_size),
        }
    }

    /// Checks whether `image` ends in a marker sealing exactly `image`,
    /// i.e. the magic is in place and the length field equals the image's
    /// own length. Both must hold; a payload that merely happens to end in
    /// the magic bytes is not treated as sealed.
    pub fn seals(image: &[u8]) -> bool {
        if image.len() < Self::LEN {
            return false;
        }
        let trailer = &image[image.len() - Self::LEN..];
        // This can't fail: the type is Unaligned and the slice length is
        // exact.
        let marker = zerocopy::LayoutVerified::<_, EndMarker>::new(trailer)
            .unwrap()
            .into_ref();
        marker.magic.get() == PAK_END_MAGIC
            && marker.total_size.get() as usize == image.len()
    }
}

/// Header of a compiled binary partition table.
#[derive(Clone, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct TableHeader {
    pub magic: [u8; 4],
    pub version: U16<BigEndian>,
    pub count: U16<BigEndian>,
}

impl TableHeader {
    pub fn new(count: u16) -> Self {
        Self {
            magic: TABLE_MAGIC,
            version: U16::new(PT_FORMAT_VERSION),
            count: U16::new(count),
        }
    }
}

/// One compiled partition table entry: name zero-padded to 16 bytes,
/// absolute start offset, and usable size (with the end-marker reservation
/// already applied to the last entry).
#[derive(Clone, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct TableEntry {
    pub name: [u8; PART_NAME_MAXLEN],
    pub start: U32<BigEndian>,
    pub size: U32<BigEndian>,
}
