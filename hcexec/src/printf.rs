//! Soft-printf ring buffer.
//!
//! Layout contract with device kernels: the first u32 is the current write
//! offset (initially the header size), the second u32 the total buffer size.
//! Kernels append records atomically; the dispatcher drains once, single
//! threaded, after all workers joined. Records are framed as a u32 length
//! followed by that many payload bytes.

use hcapi::limits::{PRINTF_BUFFER_HEADER_SIZE, PRINTF_BUFFER_SIZE};

pub(crate) fn init(buffer: *mut u32) {
    unsafe {
        *buffer = PRINTF_BUFFER_HEADER_SIZE;
        *buffer.add(1) = PRINTF_BUFFER_SIZE;
    }
}

/// Rewind the write offset if a previous dispatch left data behind.
pub(crate) fn reset_if_dirty(buffer: *mut u32) {
    unsafe {
        if *buffer > PRINTF_BUFFER_HEADER_SIZE {
            init(buffer);
        }
    }
}

pub(crate) fn has_output(buffer: *const u32) -> bool {
    unsafe { *buffer > PRINTF_BUFFER_HEADER_SIZE }
}

/// Forward all appended records to the host log.
pub(crate) fn drain(buffer: *const u32) {
    let end = unsafe { (*buffer).min(PRINTF_BUFFER_SIZE) };
    let base = buffer as *const u8;
    let mut offset = PRINTF_BUFFER_HEADER_SIZE;
    while offset + 4 <= end {
        let record_len = unsafe { *(base.add(offset as usize) as *const u32) };
        offset += 4;
        if record_len == 0 || offset + record_len > end {
            log::warn!("truncated printf record at offset {offset}");
            break;
        }
        let payload =
            unsafe { core::slice::from_raw_parts(base.add(offset as usize), record_len as usize) };
        log::info!("[kernel] {}", String::from_utf8_lossy(payload));
        offset += record_len;
    }
}
