use core::cell::UnsafeCell;

/// Plain host memory passed to kernels as a buffer argument.
///
/// This is deliberately minimal: the full buffer/image object model lives in
/// the backend drivers. Kernels receive the base pointer and may write
/// through it at any offset, hence the `UnsafeCell` storage.
pub struct HostBuffer {
    data: Box<[UnsafeCell<u8>]>,
}

// Kernels running on worker threads write through the raw pointer; the
// dispatcher serialises kernel execution process-wide.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    /// Zero-initialised buffer of `size` bytes.
    pub fn new(size: usize) -> HostBuffer {
        let data = (0..size).map(|_| UnsafeCell::new(0)).collect();
        HostBuffer { data }
    }

    pub fn from_slice(bytes: &[u8]) -> HostBuffer {
        let data = bytes.iter().map(|b| UnsafeCell::new(*b)).collect();
        HostBuffer { data }
    }

    pub fn from_u32_slice(values: &[u32]) -> HostBuffer {
        let buf = HostBuffer::new(values.len() * 4);
        for (i, v) in values.iter().enumerate() {
            let bytes = v.to_ne_bytes();
            for (j, b) in bytes.iter().enumerate() {
                unsafe { *buf.data[i * 4 + j].get() = *b };
            }
        }
        buf
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }

    /// Read the buffer contents.
    ///
    /// Only sound while no kernel is concurrently writing; dispatches are
    /// synchronous, so after `execute` returns this is always the case.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.as_ptr(), self.data.len()) }
    }

    pub fn to_u32_vec(&self) -> Vec<u32> {
        self.as_slice()
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes(c.try_into().expect("4-byte chunk")))
            .collect()
    }
}
