//! Fixed record layout of the kernel process listing.
//!
//! The listing is the 64-bit `SYSTEM_PROCESS_INFORMATION` chain: a 256-byte
//! header per process, linked by `NEXT_ENTRY_OFFSET` (zero on the last
//! record). The image name is a `(byte length, pointer)` pair whose pointer
//! refers to UTF-16 code units stored elsewhere in the same buffer.
//!
//! Windows fills this layout directly. Other backends produce it with
//! [`ListingWriter`] so a single parser serves every platform.

use super::buffer::QueryOutcome;

pub const RECORD_HEADER_LEN: usize = 0x100;
pub const RECORD_ALIGN: usize = 8;

pub const NEXT_ENTRY_OFFSET: usize = 0x00;
pub const NUMBER_OF_THREADS: usize = 0x04;
pub const WORKING_SET_PRIVATE: usize = 0x08;
pub const CREATE_TIME: usize = 0x20;
pub const USER_TIME: usize = 0x28;
pub const KERNEL_TIME: usize = 0x30;
pub const IMAGE_NAME_LENGTH: usize = 0x38;
pub const IMAGE_NAME_MAX_LENGTH: usize = 0x3A;
pub const IMAGE_NAME_BUFFER: usize = 0x40;
pub const BASE_PRIORITY: usize = 0x48;
pub const UNIQUE_PROCESS_ID: usize = 0x50;
pub const INHERITED_FROM_PROCESS_ID: usize = 0x58;
pub const HANDLE_COUNT: usize = 0x60;
pub const SESSION_ID: usize = 0x64;
pub const VIRTUAL_SIZE: usize = 0x78;
pub const WORKING_SET_SIZE: usize = 0x90;
pub const PAGEFILE_USAGE: usize = 0xB8;
pub const READ_TRANSFER_COUNT: usize = 0xE8;
pub const WRITE_TRANSFER_COUNT: usize = 0xF0;
pub const OTHER_TRANSFER_COUNT: usize = 0xF8;

/// Longest image name representable by the 16-bit byte length.
const MAX_NAME_UNITS: usize = (u16::MAX as usize) / 2;

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&bytes[offset..offset + 2]);
    u16::from_ne_bytes(raw)
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_ne_bytes(raw)
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_ne_bytes(raw)
}

fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
}

pub(crate) fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}

const fn align_up(len: usize) -> usize {
    (len + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

/// One process as a backend describes it before encoding.
///
/// Times are in 100 ns units; memory and transfer counters are in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListingEntry<'a> {
    pub pid: u32,
    pub parent_pid: u32,
    pub thread_count: u32,
    pub handle_count: u32,
    pub session_id: u32,
    pub base_priority: i32,
    pub create_time: u64,
    pub kernel_time: u64,
    pub user_time: u64,
    pub working_set: u64,
    pub private_bytes: u64,
    pub virtual_size: u64,
    pub read_transfer: u64,
    pub write_transfer: u64,
    pub other_transfer: u64,
    pub name: &'a str,
}

/// Encodes [`ListingEntry`] values into a caller-provided buffer.
///
/// Keeps counting the required size after the buffer is exhausted so that
/// [`finish`](Self::finish) can report it, mirroring the kernel's
/// length-mismatch answer.
pub struct ListingWriter<'b> {
    buf: &'b mut [u8],
    required: usize,
    last_record: Option<usize>,
    overflowed: bool,
}

impl<'b> ListingWriter<'b> {
    pub fn new(buf: &'b mut [u8]) -> Self {
        Self {
            buf,
            required: 0,
            last_record: None,
            overflowed: false,
        }
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn push(&mut self, entry: &ListingEntry<'_>) {
        let name_units = entry.name.encode_utf16().count().min(MAX_NAME_UNITS);
        let record_len = align_up(RECORD_HEADER_LEN + name_units * 2);
        let start = self.required;
        self.required += record_len;
        if self.overflowed || self.required > self.buf.len() {
            self.overflowed = true;
            return;
        }

        let base = self.buf.as_ptr() as u64;
        let record = &mut self.buf[start..start + record_len];
        record.fill(0);

        write_u32(record, NUMBER_OF_THREADS, entry.thread_count);
        write_u64(record, WORKING_SET_PRIVATE, entry.private_bytes);
        write_u64(record, CREATE_TIME, entry.create_time);
        write_u64(record, USER_TIME, entry.user_time);
        write_u64(record, KERNEL_TIME, entry.kernel_time);
        write_u32(record, BASE_PRIORITY, entry.base_priority as u32);
        write_u64(record, UNIQUE_PROCESS_ID, u64::from(entry.pid));
        write_u64(record, INHERITED_FROM_PROCESS_ID, u64::from(entry.parent_pid));
        write_u32(record, HANDLE_COUNT, entry.handle_count);
        write_u32(record, SESSION_ID, entry.session_id);
        write_u64(record, VIRTUAL_SIZE, entry.virtual_size);
        write_u64(record, WORKING_SET_SIZE, entry.working_set);
        write_u64(record, PAGEFILE_USAGE, entry.private_bytes);
        write_u64(record, READ_TRANSFER_COUNT, entry.read_transfer);
        write_u64(record, WRITE_TRANSFER_COUNT, entry.write_transfer);
        write_u64(record, OTHER_TRANSFER_COUNT, entry.other_transfer);

        if name_units > 0 {
            let name_bytes = (name_units * 2) as u16;
            write_u16(record, IMAGE_NAME_LENGTH, name_bytes);
            write_u16(record, IMAGE_NAME_MAX_LENGTH, name_bytes);
            write_u64(
                record,
                IMAGE_NAME_BUFFER,
                base + (start + RECORD_HEADER_LEN) as u64,
            );
            for (i, unit) in entry.name.encode_utf16().take(name_units).enumerate() {
                write_u16(record, RECORD_HEADER_LEN + i * 2, unit);
            }
        }

        if let Some(prev) = self.last_record {
            write_u32(
                &mut self.buf[prev..],
                NEXT_ENTRY_OFFSET,
                (start - prev) as u32,
            );
        }
        self.last_record = Some(start);
    }

    pub fn finish(self) -> QueryOutcome {
        if self.overflowed {
            QueryOutcome::TooSmall {
                required: self.required,
            }
        } else {
            QueryOutcome::Complete(self.required)
        }
    }
}
