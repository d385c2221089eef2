// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Narrow interface to the pak archive container.
//!
//! The assembler never looks inside a payload; it only places, sizes, and
//! seals payloads. Everything it needs from one is behind the [`Container`]
//! trait, which keeps the layout core agnostic to the archive format.

use std::io;
use std::path::Path;

use zerocopy::AsBytes;

use crate::format::EndMarker;

/// Byte used for partition padding. Padding is always this value, so a
/// given table and payload set produce identical images on every run.
pub const PAD_BYTE: u8 = 0;

/// The operations the assembler needs from an archive payload.
pub trait Container {
    /// Replaces the container's contents with the raw bytes of `path`.
    fn load(&mut self, path: &Path) -> io::Result<()>;

    /// Finalizes the in-memory byte image before serialization, re-emitting
    /// the container's own end marker only while it is still flagged as
    /// present.
    fn rebuild(&mut self);

    /// Appends `n` padding bytes to the image.
    fn append_padding(&mut self, n: usize);

    /// Current length of the byte image.
    fn len(&self) -> usize;

    /// The raw byte image.
    fn image(&self) -> &[u8];

    /// Whether the image currently carries its own end marker.
    fn has_end_marker(&self) -> bool;

    /// Strips the trailing end marker from the image and stops `rebuild`
    /// from re-emitting one.
    fn clear_end_marker(&mut self);
}

/// In-memory image of one pak payload.
///
/// A payload that was itself a previously sealed flash image arrives with a
/// trailing end marker; `load` detects it so the assembler can strip it and
/// take over marker emission for the composed image.
#[derive(Debug, Clone, Default)]
pub struct PakImage {
    image: Vec<u8>,
    end_marker: bool,
}

impl Container for PakImage {
    fn load(&mut self, path: &Path) -> io::Result<()> {
        self.image = std::fs::read(path)?;
        self.end_marker = EndMarker::seals(&self.image);
        Ok(())
    }

    fn rebuild(&mut self) {
        if self.end_marker && !EndMarker::seals(&self.image) {
            let total = u32::try_from(self.image.len() + EndMarker::LEN).unwrap();
            self.image
                .extend_from_slice(EndMarker::sealing(total).as_bytes());
        }
    }

    fn append_padding(&mut self, n: usize) {
        self.image.resize(self.image.len() + n, PAD_BYTE);
    }

    fn len(&self) -> usize {
        self.image.len()
    }

    fn image(&self) -> &[u8] {
        &self.image
    }

    fn has_end_marker(&self) -> bool {
        self.end_marker
    }

    fn clear_end_marker(&mut self) {
        if self.end_marker {
            self.image.truncate(self.image.len() - EndMarker::LEN);
            self.end_marker = false;
        }
    }
}
