// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error taxonomy for flash image assembly.

use std::path::PathBuf;
use thiserror::Error;

use crate::format::PART_NAME_MAXLEN;

#[derive(Debug, Error)]
pub enum ImageError {
    /// A partition name does not fit the 16-byte field of the binary
    /// partition table.
    #[error("partition name '{0}' exceeds maximum length of {} bytes", PART_NAME_MAXLEN)]
    NameTooLong(String),

    /// A payload is larger than the partition it was assigned to.
    #[error(
        "partition '{partition}': partition image '{}' exceeds \
         available space ({required} > {available})",
        .file.display()
    )]
    Oversize {
        partition: String,
        file: PathBuf,
        required: usize,
        available: usize,
    },

    /// A `--partition` mapping (or a concat output name) referenced a name
    /// that is not in the partition table.
    #[error("unknown partition name: {0}")]
    UnknownPartition(String),

    /// A `--partition` argument was not of the form `part_name=file_name`.
    #[error("partition specification must be part_name=file_name, got '{0}'")]
    MalformedSpec(String),

    /// The partition table description itself is unusable: unparsable text,
    /// a last entry too small to reserve the end marker, or a layout that
    /// does not fit the 32-bit offset space.
    #[error("invalid partition table: {0}")]
    InvalidTable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ImageError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversize_message_names_all_quantities() {
        let e = ImageError::Oversize {
            partition: "boot".to_string(),
            file: PathBuf::from("boot.pak"),
            required: 70,
            available: 56,
        };
        let msg = e.to_string();
        assert!(msg.contains("'boot'"));
        assert!(msg.contains("boot.pak"));
        assert!(msg.contains("70 > 56"));
    }

    #[test]
    fn name_too_long_message_names_the_partition() {
        let e = ImageError::NameTooLong("seventeen-bytes-x".to_string());
        assert!(e.to_string().contains("seventeen-bytes-x"));
        assert!(e.to_string().contains("16 bytes"));
    }
}
