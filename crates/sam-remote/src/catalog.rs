// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Volume catalog types and the catalog store interfaces.
//!
//! The catalog itself belongs to the storage daemon. The protocol core only
//! reads snapshots on the server ([`Catalog`]) and applies forwarded changes
//! on the client ([`CatalogMirror`]). [`MemoryCatalog`] implements both and is
//! what the binary and the tests use.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Size of the VSN field on the wire (31 characters plus NUL).
pub const VSN_LEN: usize = 32;

/// Size of the media-type field on the wire.
pub const MEDIA_LEN: usize = 4;

/// Catalog errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Invalid VSN: {0:?}")]
    InvalidVsn(String),

    #[error("Invalid media type: {0:?}")]
    InvalidMediaType(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
}

/// Volume serial number: the label of one cartridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Vsn(String);

impl Vsn {
    /// Create a VSN. Must be non-empty, at most 31 bytes, without NUL.
    pub fn new(vsn: impl Into<String>) -> Result<Self, CatalogError> {
        let vsn = vsn.into();
        if vsn.is_empty() || vsn.len() >= VSN_LEN || vsn.contains('\0') {
            return Err(CatalogError::InvalidVsn(vsn));
        }
        Ok(Self(vsn))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Vsn {
    type Error = CatalogError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Vsn> for String {
    fn from(vsn: Vsn) -> Self {
        vsn.0
    }
}

impl fmt::Display for Vsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Two-to-four character media code (`lt`, `li`, `mo`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MediaType(String);

impl MediaType {
    pub fn new(media: impl Into<String>) -> Result<Self, CatalogError> {
        let media = media.into();
        if media.is_empty()
            || media.len() > MEDIA_LEN
            || !media.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(CatalogError::InvalidMediaType(media));
        }
        Ok(Self(media))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MediaType {
    type Error = CatalogError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MediaType> for String {
    fn from(media: MediaType) -> Self {
        media.0
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! volume_status {
    ($($(#[$doc:meta])* $field:ident = $bit:expr,)*) => {
        /// Catalog entry status.
        ///
        /// Named flags in memory; packed into one 32-bit word on the wire.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct VolumeStatus {
            $($(#[$doc])* pub $field: bool,)*
        }

        impl VolumeStatus {
            /// Pack into the wire status word.
            pub fn to_bits(&self) -> u32 {
                let mut bits = 0;
                $(if self.$field {
                    bits |= $bit;
                })*
                bits
            }

            /// Unpack from the wire status word. Unknown bits are ignored.
            pub fn from_bits(bits: u32) -> Self {
                Self {
                    $($field: bits & $bit != 0,)*
                }
            }
        }
    };
}

volume_status! {
    /// Slot must be audited before use.
    needs_audit = 0x8000_0000,
    /// Slot holds a catalogued volume.
    in_use = 0x4000_0000,
    /// Volume carries a SAM label.
    labeled = 0x2000_0000,
    /// Media errors were reported.
    bad_media = 0x1000_0000,
    /// Slot is physically occupied.
    occupied = 0x0800_0000,
    /// Cleaning cartridge.
    cleaning = 0x0400_0000,
    /// Barcode was read.
    bar_code = 0x0200_0000,
    /// Write-protect tab set.
    write_protect = 0x0100_0000,
    /// Read-only by operator request.
    read_only = 0x0080_0000,
    /// Scheduled for recycling.
    recycle = 0x0040_0000,
    /// Not available for mounting.
    unavailable = 0x0020_0000,
    /// Sitting in an export slot.
    export_slot = 0x0010_0000,
    /// Foreign (non-SAM) volume.
    non_sam = 0x0008_0000,
    /// Priority volume.
    priority = 0x0004_0000,
    /// Duplicate VSN detected.
    dup_vsn = 0x0002_0000,
    /// Archive media full.
    arch_full = 0x0001_0000,
}

impl VolumeStatus {
    /// Whether a client may ever see this volume.
    ///
    /// Volumes pending audit, cleaning cartridges and foreign volumes are
    /// never forwarded.
    pub fn is_usable(&self) -> bool {
        !(self.needs_audit || self.cleaning || self.non_sam)
    }
}

/// Snapshot of one catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Equipment ordinal of the library owning the catalog.
    pub eq: u16,
    /// Storage slot.
    #[serde(default)]
    pub slot: u32,
    /// Partition (optical media sides).
    #[serde(default)]
    pub partition: u16,
    pub media: MediaType,
    pub vsn: Vsn,
    #[serde(default)]
    pub status: VolumeStatus,
    #[serde(default)]
    pub block_size: u32,
    /// Capacity in kilobytes.
    #[serde(default)]
    pub capacity: u64,
    /// Space remaining in kilobytes.
    #[serde(default)]
    pub space: u64,
}

impl CatalogEntry {
    pub fn new(eq: u16, media: MediaType, vsn: Vsn) -> Self {
        Self {
            eq,
            slot: 0,
            partition: 0,
            media,
            vsn,
            status: VolumeStatus::default(),
            block_size: 0,
            capacity: 0,
            space: 0,
        }
    }

    fn key(&self) -> (MediaType, Vsn) {
        (self.media.clone(), self.vsn.clone())
    }
}

/// Why an entry changed, as far as a remote mirror cares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateFlags {
    /// Volume was exported from the library.
    pub export: bool,
    /// Volume was relabeled; the mirror drops the old VSN.
    pub relabel: bool,
}

impl UpdateFlags {
    const EXPORT: u32 = 0x1;
    const RELABEL: u32 = 0x2;

    pub fn to_bits(&self) -> u32 {
        let mut bits = 0;
        if self.export {
            bits |= Self::EXPORT;
        }
        if self.relabel {
            bits |= Self::RELABEL;
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            export: bits & Self::EXPORT != 0,
            relabel: bits & Self::RELABEL != 0,
        }
    }
}

/// One catalog mutation to forward to remote clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogChange {
    pub entry: CatalogEntry,
    pub flags: UpdateFlags,
}

impl CatalogChange {
    /// Build a change record. Exported volumes are forwarded as unavailable.
    pub fn new(mut entry: CatalogEntry, flags: UpdateFlags) -> Self {
        if flags.export {
            entry.status.unavailable = true;
        }
        Self { entry, flags }
    }

    /// A plain status/slot/label update.
    pub fn updated(entry: CatalogEntry) -> Self {
        Self::new(entry, UpdateFlags::default())
    }
}

/// Read side of the catalog store, as used by the server.
pub trait Catalog: Send + Sync {
    /// Bring the in-memory view up to date with the backing store.
    fn sync(&self) -> Result<(), CatalogError>;

    /// Look up one entry.
    fn entry_by_media(&self, media: &MediaType, vsn: &Vsn) -> Option<CatalogEntry>;

    /// Snapshot every entry, in catalog order.
    fn entries(&self) -> Vec<CatalogEntry>;
}

/// Write side used by a client to mirror the server's shared volumes.
pub trait CatalogMirror: Send + Sync {
    /// Apply a change forwarded by the server.
    fn apply_remote(&self, change: &CatalogChange);

    /// Mark the mirrored volumes usable or not (session up/down).
    fn set_available(&self, available: bool);
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    volumes: Vec<CatalogEntry>,
}

#[derive(Debug)]
struct MemoryInner {
    entries: BTreeMap<(MediaType, Vsn), CatalogEntry>,
    available: bool,
}

/// In-memory catalog keyed by (media, VSN).
#[derive(Debug)]
pub struct MemoryCatalog {
    inner: RwLock<MemoryInner>,
}

impl MemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner {
                entries: BTreeMap::new(),
                available: true,
            }),
        }
    }

    /// Create a catalog holding the given entries.
    pub fn from_entries(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let catalog = Self::new();
        {
            let mut inner = catalog.inner.write();
            for entry in entries {
                inner.entries.insert(entry.key(), entry);
            }
        }
        catalog
    }

    /// Load a catalog from a TOML file with `[[volumes]]` tables.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        let file: CatalogFile = toml::from_str(&content)?;
        Ok(Self::from_entries(file.volumes))
    }

    /// Insert or replace an entry and return the change to forward.
    pub fn upsert(&self, entry: CatalogEntry) -> CatalogChange {
        self.inner.write().entries.insert(entry.key(), entry.clone());
        CatalogChange::updated(entry)
    }

    /// Remove an entry (export) and return the change to forward.
    pub fn export(&self, media: &MediaType, vsn: &Vsn) -> Option<CatalogChange> {
        let entry = self
            .inner
            .write()
            .entries
            .remove(&(media.clone(), vsn.clone()))?;
        Some(CatalogChange::new(
            entry,
            UpdateFlags {
                export: true,
                relabel: false,
            },
        ))
    }

    /// Replace the whole content, returning the changes between the two.
    ///
    /// New or modified entries become plain updates; vanished entries become
    /// exports.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = CatalogEntry>) -> Vec<CatalogChange> {
        let mut fresh: BTreeMap<_, _> = entries.into_iter().map(|e| (e.key(), e)).collect();
        let mut inner = self.inner.write();
        let mut changes = Vec::new();

        for (key, entry) in &fresh {
            if inner.entries.get(key) != Some(entry) {
                changes.push(CatalogChange::updated(entry.clone()));
            }
        }
        for (key, entry) in &inner.entries {
            if !fresh.contains_key(key) {
                changes.push(CatalogChange::new(
                    entry.clone(),
                    UpdateFlags {
                        export: true,
                        relabel: false,
                    },
                ));
            }
        }

        std::mem::swap(&mut inner.entries, &mut fresh);
        changes
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the mirrored volumes are currently usable.
    pub fn is_available(&self) -> bool {
        self.inner.read().available
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog for MemoryCatalog {
    fn sync(&self) -> Result<(), CatalogError> {
        Ok(())
    }

    fn entry_by_media(&self, media: &MediaType, vsn: &Vsn) -> Option<CatalogEntry> {
        self.inner
            .read()
            .entries
            .get(&(media.clone(), vsn.clone()))
            .cloned()
    }

    fn entries(&self) -> Vec<CatalogEntry> {
        self.inner.read().entries.values().cloned().collect()
    }
}

impl CatalogMirror for MemoryCatalog {
    fn apply_remote(&self, change: &CatalogChange) {
        let mut inner = self.inner.write();
        let key = change.entry.key();
        if change.flags.relabel {
            inner.entries.remove(&key);
        } else {
            inner.entries.insert(key, change.entry.clone());
        }
    }

    fn set_available(&self, available: bool) {
        self.inner.write().available = available;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(vsn: &str) -> CatalogEntry {
        CatalogEntry::new(10, MediaType::new("lt").unwrap(), Vsn::new(vsn).unwrap())
    }

    #[test]
    fn test_vsn_validation() {
        assert!(Vsn::new("SCR001").is_ok());
        assert!(Vsn::new("").is_err());
        assert!(Vsn::new("A".repeat(31)).is_ok());
        assert!(Vsn::new("A".repeat(32)).is_err());
        assert!(Vsn::new("AB\0C").is_err());
    }

    #[test]
    fn test_media_type_validation() {
        assert!(MediaType::new("lt").is_ok());
        assert!(MediaType::new("").is_err());
        assert!(MediaType::new("toolong").is_err());
        assert!(MediaType::new("l t").is_err());
    }

    #[test]
    fn test_status_bits_roundtrip() {
        let status = VolumeStatus {
            in_use: true,
            labeled: true,
            occupied: true,
            bar_code: true,
            ..Default::default()
        };
        assert_eq!(VolumeStatus::from_bits(status.to_bits()), status);
        assert_eq!(VolumeStatus::from_bits(0), VolumeStatus::default());
    }

    #[test]
    fn test_usable_status() {
        assert!(VolumeStatus::default().is_usable());
        for status in [
            VolumeStatus {
                needs_audit: true,
                ..Default::default()
            },
            VolumeStatus {
                cleaning: true,
                ..Default::default()
            },
            VolumeStatus {
                non_sam: true,
                ..Default::default()
            },
        ] {
            assert!(!status.is_usable());
        }
        let read_only = VolumeStatus {
            read_only: true,
            ..Default::default()
        };
        assert!(read_only.is_usable());
    }

    #[test]
    fn test_export_marks_unavailable() {
        let change = CatalogChange::new(
            entry("SCR001"),
            UpdateFlags {
                export: true,
                relabel: false,
            },
        );
        assert!(change.entry.status.unavailable);
        assert!(!CatalogChange::updated(entry("SCR001")).entry.status.unavailable);
    }

    #[test]
    fn test_mirror_relabel_removes_entry() {
        let mirror = MemoryCatalog::from_entries([entry("SCR001"), entry("SCR002")]);
        let relabel = CatalogChange::new(
            entry("SCR001"),
            UpdateFlags {
                export: false,
                relabel: true,
            },
        );
        mirror.apply_remote(&relabel);
        assert_eq!(mirror.len(), 1);

        let mut updated = entry("SCR003");
        updated.slot = 42;
        mirror.apply_remote(&CatalogChange::updated(updated.clone()));
        assert_eq!(
            mirror.entry_by_media(&updated.media, &updated.vsn),
            Some(updated)
        );
    }

    #[test]
    fn test_replace_all_diff() {
        let catalog = MemoryCatalog::from_entries([entry("A1"), entry("A2")]);
        let mut moved = entry("A2");
        moved.slot = 9;

        let changes = catalog.replace_all([moved.clone(), entry("A3")]);

        assert_eq!(changes.len(), 3);
        assert!(changes.contains(&CatalogChange::updated(moved)));
        assert!(changes.contains(&CatalogChange::updated(entry("A3"))));
        assert!(changes
            .iter()
            .any(|c| c.entry.vsn.as_str() == "A1" && c.flags.export));
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_catalog_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        std::fs::write(
            &path,
            r#"
[[volumes]]
eq = 10
slot = 1
media = "lt"
vsn = "SCR001"
status = { in_use = true, labeled = true }

[[volumes]]
eq = 10
slot = 2
media = "lt"
vsn = "PROD001"
"#,
        )
        .unwrap();

        let catalog = MemoryCatalog::from_file(&path).unwrap();
        assert_eq!(catalog.len(), 2);
        let scr = catalog
            .entry_by_media(&MediaType::new("lt").unwrap(), &Vsn::new("SCR001").unwrap())
            .unwrap();
        assert!(scr.status.labeled);
        assert_eq!(scr.slot, 1);
    }

    #[test]
    fn test_catalog_file_rejects_bad_vsn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        std::fs::write(
            &path,
            "[[volumes]]\neq = 1\nmedia = \"lt\"\nvsn = \"\"\n",
        )
        .unwrap();
        assert!(MemoryCatalog::from_file(&path).is_err());
    }
}
