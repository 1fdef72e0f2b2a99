use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use super::ImageKind;
use crate::FlashError;

/// Value of an erased flash byte
pub const ERASED_BYTE: u8 = 0xFF;

/// The flash primitives the update engine stages an image through.
///
/// Every image kind has its own region. A region must be erased before it is programmed, and a
/// staged image only becomes active once it is finalized.
pub trait FlashStaging {
    /// Size of the region in bytes
    fn capacity(&self, kind: ImageKind) -> u32;

    fn erase_region(&mut self, kind: ImageKind) -> Result<(), FlashError>;

    fn program(&mut self, kind: ImageKind, offset: u32, bytes: &[u8]) -> Result<(), FlashError>;

    /// Marks the staged image as valid and active
    fn finalize(&mut self, kind: ImageKind) -> Result<(), FlashError>;

    /// Discards the staged image
    fn invalidate(&mut self, kind: ImageKind) -> Result<(), FlashError>;
}

impl<F: FlashStaging + ?Sized> FlashStaging for &mut F {
    fn capacity(&self, kind: ImageKind) -> u32 {
        (**self).capacity(kind)
    }

    fn erase_region(&mut self, kind: ImageKind) -> Result<(), FlashError> {
        (**self).erase_region(kind)
    }

    fn program(&mut self, kind: ImageKind, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
        (**self).program(kind, offset, bytes)
    }

    fn finalize(&mut self, kind: ImageKind) -> Result<(), FlashError> {
        (**self).finalize(kind)
    }

    fn invalidate(&mut self, kind: ImageKind) -> Result<(), FlashError> {
        (**self).invalidate(kind)
    }
}

fn check_bounds(kind: ImageKind, capacity: u32, offset: u32, len: usize) -> Result<(), FlashError> {
    if offset as u64 + len as u64 > capacity as u64 {
        return Err(FlashError::OutOfBounds {
            region: kind,
            offset,
            len,
        });
    }

    Ok(())
}

/// A call made against a `MemoryStaging`
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FlashCall {
    Erase(ImageKind),
    Program {
        kind: ImageKind,
        offset: u32,
        len: usize,
    },
    Finalize(ImageKind),
    Invalidate(ImageKind),
}

#[derive(Debug, Clone, Default)]
struct MemoryRegion {
    data: Vec<u8>,
    /// Highest offset programmed so far
    written: usize,
    erased: bool,
    valid: bool,
}

/// RAM-backed staging that records every call made against it.
#[derive(Debug, Clone)]
pub struct MemoryStaging {
    capacity: u32,
    regions: HashMap<ImageKind, MemoryRegion>,
    calls: Vec<FlashCall>,
    /// Number of `program` calls that succeed before every further one fails
    fail_after: Option<usize>,
}

impl MemoryStaging {
    /// Creates staging where every region holds `capacity` bytes
    pub fn new(capacity: u32) -> MemoryStaging {
        MemoryStaging {
            capacity,
            regions: HashMap::new(),
            calls: Vec::new(),
            fail_after: None,
        }
    }

    /// Makes `program` fail once `count` calls have succeeded
    pub fn fail_programs_after(mut self, count: usize) -> MemoryStaging {
        self.fail_after = Some(count);
        self
    }

    pub fn calls(&self) -> &[FlashCall] {
        &self.calls
    }

    /// The bytes programmed into the region, up to the highest written offset
    pub fn image(&self, kind: ImageKind) -> &[u8] {
        self.regions
            .get(&kind)
            .map(|region| &region.data[..region.written])
            .unwrap_or(&[])
    }

    pub fn is_valid(&self, kind: ImageKind) -> bool {
        self.regions.get(&kind).map_or(false, |region| region.valid)
    }

    pub fn program_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, FlashCall::Program { .. }))
            .count()
    }

    pub fn finalize_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, FlashCall::Finalize(_)))
            .count()
    }
}

impl FlashStaging for MemoryStaging {
    fn capacity(&self, _kind: ImageKind) -> u32 {
        self.capacity
    }

    fn erase_region(&mut self, kind: ImageKind) -> Result<(), FlashError> {
        self.calls.push(FlashCall::Erase(kind));
        self.regions.insert(
            kind,
            MemoryRegion {
                data: vec![ERASED_BYTE; self.capacity as usize],
                written: 0,
                erased: true,
                valid: false,
            },
        );

        Ok(())
    }

    fn program(&mut self, kind: ImageKind, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
        self.calls.push(FlashCall::Program {
            kind,
            offset,
            len: bytes.len(),
        });

        check_bounds(kind, self.capacity, offset, bytes.len())?;

        if let Some(remaining) = self.fail_after.as_mut() {
            if *remaining == 0 {
                return Err(FlashError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "program failed",
                )));
            }

            *remaining -= 1;
        }

        let region = match self.regions.get_mut(&kind) {
            Some(region) if region.erased => region,
            _ => return Err(FlashError::NotErased(kind)),
        };

        let start = offset as usize;
        let end = start + bytes.len();

        region.data[start..end].copy_from_slice(bytes);
        region.written = region.written.max(end);

        Ok(())
    }

    fn finalize(&mut self, kind: ImageKind) -> Result<(), FlashError> {
        self.calls.push(FlashCall::Finalize(kind));

        match self.regions.get_mut(&kind) {
            Some(region) if region.erased => {
                region.valid = true;
                Ok(())
            }
            _ => Err(FlashError::NotErased(kind)),
        }
    }

    fn invalidate(&mut self, kind: ImageKind) -> Result<(), FlashError> {
        self.calls.push(FlashCall::Invalidate(kind));
        self.regions.remove(&kind);

        Ok(())
    }
}

/// Staging backed by one file per image kind in a directory.
///
/// Each region file is erased to `ERASED_BYTE` and a finalized image is marked by a sibling
/// `.valid` file.
#[derive(Debug)]
pub struct FileStaging {
    dir: PathBuf,
    capacity: u32,
    erased: HashSet<ImageKind>,
}

impl FileStaging {
    pub fn new<P: AsRef<Path>>(dir: P, capacity: u32) -> Result<FileStaging, FlashError> {
        fs::create_dir_all(dir.as_ref())?;

        Ok(FileStaging {
            dir: dir.as_ref().to_path_buf(),
            capacity,
            erased: HashSet::new(),
        })
    }

    /// Path of the file holding the region for `kind`
    pub fn region_path(&self, kind: ImageKind) -> PathBuf {
        self.dir.join(format!("{}.bin", region_name(kind)))
    }

    /// Path of the marker that flags the region for `kind` as valid
    pub fn marker_path(&self, kind: ImageKind) -> PathBuf {
        self.dir.join(format!("{}.valid", region_name(kind)))
    }

    pub fn is_valid(&self, kind: ImageKind) -> bool {
        self.marker_path(kind).exists()
    }

    fn remove_marker(&self, kind: ImageKind) -> Result<(), FlashError> {
        match fs::remove_file(self.marker_path(kind)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn region_name(kind: ImageKind) -> &'static str {
    match kind {
        ImageKind::Application => "application",
        ImageKind::Bootloader => "bootloader",
        ImageKind::CustomData => "custom-data",
    }
}

impl FlashStaging for FileStaging {
    fn capacity(&self, _kind: ImageKind) -> u32 {
        self.capacity
    }

    fn erase_region(&mut self, kind: ImageKind) -> Result<(), FlashError> {
        self.remove_marker(kind)?;

        let path = self.region_path(kind);
        let mut file = File::create(&path)?;
        file.write_all(&vec![ERASED_BYTE; self.capacity as usize])?;
        file.sync_all()?;

        debug!("Erased {} ({} bytes)", path.display(), self.capacity);

        self.erased.insert(kind);

        Ok(())
    }

    fn program(&mut self, kind: ImageKind, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
        check_bounds(kind, self.capacity, offset, bytes.len())?;

        if !self.erased.contains(&kind) {
            return Err(FlashError::NotErased(kind));
        }

        let mut file = OpenOptions::new().write(true).open(self.region_path(kind))?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(bytes)?;

        Ok(())
    }

    fn finalize(&mut self, kind: ImageKind) -> Result<(), FlashError> {
        if !self.erased.contains(&kind) {
            return Err(FlashError::NotErased(kind));
        }

        File::open(self.region_path(kind))?.sync_all()?;
        File::create(self.marker_path(kind))?;

        info!("Marked {} as valid", self.region_path(kind).display());

        Ok(())
    }

    fn invalidate(&mut self, kind: ImageKind) -> Result<(), FlashError> {
        self.remove_marker(kind)?;
        self.erased.remove(&kind);

        match fs::remove_file(self.region_path(kind)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
