//! Zero-copy walk over the kernel process listing.
//!
//! [`Records`] follows the `NEXT_ENTRY_OFFSET` chain directly over the raw
//! bytes. Every field read is bounds-checked against the listing; a chain that
//! would leave the buffer ends the walk early and marks it truncated.

use super::identity::ProcessIdentity;
use super::layout::{
    CREATE_TIME, HANDLE_COUNT, IMAGE_NAME_BUFFER, IMAGE_NAME_LENGTH, INHERITED_FROM_PROCESS_ID,
    KERNEL_TIME, NEXT_ENTRY_OFFSET, NUMBER_OF_THREADS, OTHER_TRANSFER_COUNT, PAGEFILE_USAGE,
    READ_TRANSFER_COUNT, RECORD_HEADER_LEN, SESSION_ID, UNIQUE_PROCESS_ID, USER_TIME,
    VIRTUAL_SIZE, WORKING_SET_SIZE, WRITE_TRANSFER_COUNT, read_u16, read_u32, read_u64,
};

/// A validated view of one acquired listing.
#[derive(Clone, Copy, Debug)]
pub struct Listing<'a> {
    bytes: &'a [u8],
}

impl<'a> Listing<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn records(&self) -> Records<'a> {
        Records {
            bytes: self.bytes,
            cursor: if self.bytes.is_empty() { None } else { Some(0) },
            truncated: false,
        }
    }
}

/// UTF-16 image name borrowed from the listing.
#[derive(Clone, Copy, Debug)]
pub struct ImageName<'a> {
    units: &'a [u8],
}

impl<'a> ImageName<'a> {
    const EMPTY: ImageName<'static> = ImageName { units: &[] };

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Number of UTF-16 code units (the byte length halved).
    pub fn unit_len(&self) -> usize {
        self.units.len() / 2
    }

    pub fn chars(&self) -> impl Iterator<Item = char> + 'a {
        let units = self
            .units
            .chunks_exact(2)
            .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]));
        char::decode_utf16(units).map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
    }

    pub fn to_string_lossy(&self) -> String {
        let mut out = String::with_capacity(self.unit_len());
        out.extend(self.chars());
        out
    }
}

/// Counters for one process, borrowed from the listing for a single pass.
#[derive(Clone, Copy, Debug)]
pub struct RawProcessRecord<'a> {
    pub pid: u32,
    pub parent_pid: u32,
    pub thread_count: u32,
    pub handle_count: u32,
    pub session_id: u32,
    pub create_time: u64,
    pub kernel_time: u64,
    pub user_time: u64,
    pub working_set: u64,
    pub private_bytes: u64,
    pub virtual_size: u64,
    pub read_transfer: u64,
    pub write_transfer: u64,
    pub other_transfer: u64,
    pub name: ImageName<'a>,
}

impl RawProcessRecord<'_> {
    pub fn identity(&self) -> ProcessIdentity {
        ProcessIdentity::new(self.pid, self.create_time)
    }

    /// Cumulative kernel + user time, 100 ns units.
    pub fn cpu_time(&self) -> u64 {
        self.kernel_time.saturating_add(self.user_time)
    }

    pub fn transfer_bytes(&self) -> u64 {
        self.read_transfer
            .saturating_add(self.write_transfer)
            .saturating_add(self.other_transfer)
    }
}

/// Lazy iterator over the records of a [`Listing`].
pub struct Records<'a> {
    bytes: &'a [u8],
    cursor: Option<usize>,
    truncated: bool,
}

impl<'a> Records<'a> {
    /// True when the walk stopped on a malformed offset instead of the
    /// terminating zero.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    fn stop_malformed(&mut self) {
        self.cursor = None;
        self.truncated = true;
    }

    fn image_name(&self, header: &[u8]) -> ImageName<'a> {
        let byte_len = usize::from(read_u16(header, IMAGE_NAME_LENGTH)) & !1;
        let address = read_u64(header, IMAGE_NAME_BUFFER);
        if byte_len == 0 || address == 0 {
            return ImageName::EMPTY;
        }

        let base = self.bytes.as_ptr() as u64;
        let units = address
            .checked_sub(base)
            .and_then(|offset| usize::try_from(offset).ok())
            .and_then(|offset| self.bytes.get(offset..offset.checked_add(byte_len)?));
        match units {
            Some(units) => ImageName { units },
            None => ImageName::EMPTY,
        }
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = RawProcessRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.cursor?;
        let Some(header) = start
            .checked_add(RECORD_HEADER_LEN)
            .and_then(|end| self.bytes.get(start..end))
        else {
            self.stop_malformed();
            return None;
        };

        let next = read_u32(header, NEXT_ENTRY_OFFSET) as usize;
        self.cursor = match start.checked_add(next) {
            _ if next == 0 => None,
            Some(at) if next >= RECORD_HEADER_LEN && at < self.bytes.len() => Some(at),
            _ => {
                self.truncated = true;
                None
            }
        };

        Some(RawProcessRecord {
            pid: read_u64(header, UNIQUE_PROCESS_ID) as u32,
            parent_pid: read_u64(header, INHERITED_FROM_PROCESS_ID) as u32,
            thread_count: read_u32(header, NUMBER_OF_THREADS),
            handle_count: read_u32(header, HANDLE_COUNT),
            session_id: read_u32(header, SESSION_ID),
            create_time: read_u64(header, CREATE_TIME),
            kernel_time: read_u64(header, KERNEL_TIME),
            user_time: read_u64(header, USER_TIME),
            working_set: read_u64(header, WORKING_SET_SIZE),
            private_bytes: read_u64(header, PAGEFILE_USAGE),
            virtual_size: read_u64(header, VIRTUAL_SIZE),
            read_transfer: read_u64(header, READ_TRANSFER_COUNT),
            write_transfer: read_u64(header, WRITE_TRANSFER_COUNT),
            other_transfer: read_u64(header, OTHER_TRANSFER_COUNT),
            name: self.image_name(header),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::buffer::QueryOutcome;
    use crate::system::layout::{ListingEntry, ListingWriter, write_u32};

    fn encode(buf: &mut [u8], entries: &[ListingEntry<'_>]) -> usize {
        let mut writer = ListingWriter::new(buf);
        for entry in entries {
            writer.push(entry);
        }
        match writer.finish() {
            QueryOutcome::Complete(len) => len,
            QueryOutcome::TooSmall { .. } => panic!("test buffer too small"),
        }
    }

    fn entry(pid: u32, parent_pid: u32, name: &str) -> ListingEntry<'_> {
        ListingEntry {
            pid,
            parent_pid,
            name,
            ..Default::default()
        }
    }

    #[test]
    fn walks_the_chain_and_decodes_fields() {
        let mut buf = vec![0u8; 8192];
        let len = encode(
            &mut buf,
            &[
                ListingEntry {
                    pid: 4,
                    parent_pid: 0,
                    thread_count: 3,
                    handle_count: 12,
                    kernel_time: 70,
                    user_time: 30,
                    read_transfer: 1,
                    write_transfer: 2,
                    other_transfer: 4,
                    name: "System",
                    ..Default::default()
                },
                entry(100, 4, "smss.exe"),
            ],
        );

        let listing = Listing::new(&buf[..len]);
        let mut records = listing.records();
        let first = records.next().expect("first record");
        assert_eq!(first.pid, 4);
        assert_eq!(first.thread_count, 3);
        assert_eq!(first.handle_count, 12);
        assert_eq!(first.cpu_time(), 100);
        assert_eq!(first.transfer_bytes(), 7);
        assert_eq!(first.name.to_string_lossy(), "System");

        let second = records.next().expect("second record");
        assert_eq!(second.parent_pid, 4);
        assert_eq!(second.name.to_string_lossy(), "smss.exe");
        assert!(records.next().is_none());
        assert!(!records.truncated());
    }

    #[test]
    fn name_length_is_bytes_not_characters() {
        let mut buf = vec![0u8; 4096];
        let len = encode(&mut buf, &[entry(7, 0, "notepad.exe")]);
        let listing = Listing::new(&buf[..len]);
        let record = listing.records().next().expect("record");
        assert_eq!(read_u16(&buf, IMAGE_NAME_LENGTH), 22);
        assert_eq!(record.name.unit_len(), 11);
        assert_eq!(record.name.chars().count(), 11);
    }

    #[test]
    fn name_is_not_read_past_its_length() {
        let mut buf = vec![0u8; 4096];
        let len = encode(&mut buf, &[entry(7, 0, "abcdef")]);
        // Shrink the reported length: the trailing units must not leak in.
        buf[IMAGE_NAME_LENGTH..IMAGE_NAME_LENGTH + 2].copy_from_slice(&6u16.to_ne_bytes());
        let listing = Listing::new(&buf[..len]);
        let record = listing.records().next().expect("record");
        assert_eq!(record.name.to_string_lossy(), "abc");
    }

    #[test]
    fn offset_past_the_end_truncates() {
        let mut buf = vec![0u8; 8192];
        let len = encode(
            &mut buf,
            &[entry(1, 0, "a"), entry(2, 1, "b"), entry(3, 1, "c")],
        );
        write_u32(&mut buf, NEXT_ENTRY_OFFSET, 0x7FFF_0000);

        let listing = Listing::new(&buf[..len]);
        let mut records = listing.records();
        let pids: Vec<u32> = records.by_ref().map(|r| r.pid).collect();
        assert_eq!(pids, vec![1]);
        assert!(records.truncated());
    }

    #[test]
    fn offset_inside_the_header_truncates() {
        let mut buf = vec![0u8; 8192];
        let len = encode(&mut buf, &[entry(1, 0, "a"), entry(2, 1, "b")]);
        write_u32(&mut buf, NEXT_ENTRY_OFFSET, 8);

        let listing = Listing::new(&buf[..len]);
        let mut records = listing.records();
        assert_eq!(records.by_ref().count(), 1);
        assert!(records.truncated());
    }

    #[test]
    fn name_pointer_outside_listing_yields_empty_name() {
        let mut buf = vec![0u8; 4096];
        let len = encode(&mut buf, &[entry(9, 0, "ghost")]);
        buf[IMAGE_NAME_BUFFER..IMAGE_NAME_BUFFER + 8].copy_from_slice(&1u64.to_ne_bytes());
        let listing = Listing::new(&buf[..len]);
        let record = listing.records().next().expect("record");
        assert!(record.name.is_empty());
        assert_eq!(record.pid, 9);
    }

    #[test]
    fn short_listing_yields_nothing() {
        let buf = vec![0u8; RECORD_HEADER_LEN - 1];
        let listing = Listing::new(&buf);
        let mut records = listing.records();
        assert!(records.next().is_none());
        assert!(records.truncated());
        assert!(Listing::new(&[]).records().next().is_none());
    }
}
