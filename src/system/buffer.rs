use std::path::PathBuf;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, SourceError};

use super::layout::RECORD_ALIGN;
use super::parser::Listing;

/// Answer of a single listing query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// The buffer now holds a listing of this many bytes.
    Complete(usize),
    /// The buffer was too small; `required` is the size the source asked for.
    TooSmall { required: usize },
}

/// Something that can fill a buffer with a process listing in the layout
/// described by [`super::layout`].
pub trait ListingSource: Send {
    fn query(&mut self, buf: &mut [u8]) -> Result<QueryOutcome, SourceError>;

    /// Full path of a process image, when the caller is allowed to see it.
    fn executable_path(&self, _pid: u32) -> Option<PathBuf> {
        None
    }
}

/// Backing storage whose usable window starts on a record-aligned address.
struct Region {
    bytes: Vec<u8>,
    capacity: usize,
}

impl Region {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity + RECORD_ALIGN],
            capacity,
        }
    }

    fn pad(&self) -> usize {
        self.bytes.as_ptr().align_offset(RECORD_ALIGN).min(RECORD_ALIGN)
    }

    fn window(&self) -> &[u8] {
        let pad = self.pad();
        &self.bytes[pad..pad + self.capacity]
    }

    fn window_mut(&mut self) -> &mut [u8] {
        let pad = self.pad();
        &mut self.bytes[pad..pad + self.capacity]
    }
}

/// Reusable receive buffer for the kernel process listing.
///
/// Grows on a "too small" answer to the reported size plus a safety margin,
/// and gives up after a bounded number of retries. A grown region replaces the
/// current one only after a query into it succeeded.
pub struct SnapshotBuffer {
    region: Region,
    margin: usize,
    max_retries: u32,
}

impl SnapshotBuffer {
    pub fn new(initial_capacity: usize, margin: usize, max_retries: u32) -> Self {
        Self {
            region: Region::with_capacity(initial_capacity),
            margin,
            max_retries,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.initial_buffer_bytes,
            config.buffer_margin_bytes,
            config.max_buffer_retries,
        )
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity
    }

    pub fn acquire(&mut self, source: &mut dyn ListingSource) -> EngineResult<Listing<'_>> {
        let _span = tracing::debug_span!("buffer.acquire", capacity = self.capacity()).entered();

        let mut grown: Option<Region> = None;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let region = grown.as_mut().unwrap_or(&mut self.region);
            let capacity = region.capacity;
            match source.query(region.window_mut())? {
                QueryOutcome::Complete(len) => {
                    if let Some(region) = grown.take() {
                        tracing::debug!(
                            from = self.region.capacity,
                            to = region.capacity,
                            attempts,
                            "snapshot buffer grown"
                        );
                        self.region = region;
                    }
                    let len = len.min(self.region.capacity);
                    return Ok(Listing::new(&self.region.window()[..len]));
                }
                QueryOutcome::TooSmall { required } => {
                    if attempts > self.max_retries {
                        return Err(EngineError::SnapshotUnavailable { attempts, required });
                    }
                    let next = required.max(capacity).saturating_add(self.margin);
                    grown = Some(Region::with_capacity(next));
                }
            }
        }
    }
}
