//! Batched vectored file I/O.
//!
//! Tablespace data moves between the network stream and archive files
//! through a [`VectoredBuffer`]: a fixed set of aligned, equally sized
//! slots submitted as one scatter/gather operation. On Linux the
//! [`Ring`] engine drives a kernel submission/completion queue; elsewhere
//! (and when the ring cannot be set up) the engine falls back to plain
//! positioned read/write calls. Either way the number of in-flight
//! operations and the memory footprint are bounded by the buffer geometry.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::File;

use crate::error::{ArchiveError, Result};

pub const DEFAULT_QUEUE_DEPTH: u32 = 8;
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Slot alignment; suits direct I/O should the file be opened for it.
const BUFFER_ALIGNMENT: usize = 4096;

/// One aligned allocation of fixed size.
struct AlignedBuf {
    ptr: *mut u8,
    layout: Layout,
}

// The raw pointer owns a private allocation; moving it between threads
// is fine.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    fn new(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, BUFFER_ALIGNMENT)
            .map_err(|e| ArchiveError::invalid("buffer_size", e.to_string()))?;
        // SAFETY: layout has non-zero size, checked by the caller.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(ArchiveError::Io {
                reason: "buffer allocation failed".into(),
                os_code: None,
            });
        }
        Ok(AlignedBuf { ptr, layout })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr covers layout.size() initialized (zeroed) bytes.
        unsafe { std::slice::from_raw_parts(self.ptr, self.layout.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and we hold &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this layout.
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

/// A set of `num_buffers` aligned slots of `buffer_size` bytes each,
/// submitted together as one vectored operation.
///
/// `effective_size` tracks how many bytes of the set are currently
/// meaningful: after a short read or a partial fill the owner adjusts it
/// and the next submission covers exactly that many bytes.
pub struct VectoredBuffer {
    buffer_size: usize,
    num_buffers: usize,
    buffers: Vec<AlignedBuf>,
    effective_size: usize,
    /// Current position as (slot index, offset within slot).
    pos_index: usize,
    pos_offset: usize,
}

impl VectoredBuffer {
    pub fn new(buffer_size: usize, num_buffers: usize) -> Result<Self> {
        if buffer_size == 0 || num_buffers == 0 {
            return Err(ArchiveError::invalid(
                "vectored buffer",
                "buffer size and count must be positive",
            ));
        }
        let buffers = (0..num_buffers)
            .map(|_| AlignedBuf::new(buffer_size))
            .collect::<Result<Vec<_>>>()?;
        Ok(VectoredBuffer {
            buffer_size,
            num_buffers,
            buffers,
            effective_size: 0,
            pos_index: 0,
            pos_offset: 0,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    /// Total capacity of the buffer set in bytes.
    pub fn total_size(&self) -> usize {
        self.buffer_size * self.num_buffers
    }

    pub fn effective_size(&self) -> usize {
        self.effective_size
    }

    /// Declare how many bytes of the set are valid. Capped by the total
    /// capacity; everything beyond it is rejected.
    pub fn set_effective_size(&mut self, size: usize) -> Result<()> {
        if size > self.total_size() {
            return Err(ArchiveError::invalid(
                "effective_size",
                format!("{size} exceeds buffer capacity {}", self.total_size()),
            ));
        }
        self.effective_size = size;
        Ok(())
    }

    /// Absolute offset of the current position within the buffer set.
    pub fn offset(&self) -> usize {
        self.pos_index * self.buffer_size + self.pos_offset
    }

    /// Move the current position to an absolute offset. The end of the
    /// buffer set is a valid position (nothing left to fill).
    pub fn set_offset(&mut self, offset: usize) -> Result<()> {
        if offset > self.total_size() {
            return Err(ArchiveError::invalid(
                "offset",
                format!("{offset} out of bounds for buffer of {}", self.total_size()),
            ));
        }
        self.pos_index = offset / self.buffer_size;
        self.pos_offset = offset % self.buffer_size;
        Ok(())
    }

    /// Zero all slot contents and rewind; the allocation is kept.
    pub fn clear(&mut self) {
        for buf in &mut self.buffers {
            buf.as_mut_slice().fill(0);
        }
        self.effective_size = 0;
        self.pos_index = 0;
        self.pos_offset = 0;
    }

    pub fn slot(&self, index: usize) -> &[u8] {
        self.buffers[index].as_slice()
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        self.buffers[index].as_mut_slice()
    }

    /// Copy bytes into the set starting at the current position, advancing
    /// it and growing `effective_size` to the high-water mark. Returns how
    /// many bytes fit.
    pub fn fill(&mut self, mut data: &[u8]) -> usize {
        let mut copied = 0;
        while !data.is_empty() && self.offset() < self.total_size() {
            let index = self.pos_index;
            let offset = self.pos_offset;
            let room = self.buffer_size - offset;
            let n = room.min(data.len());
            self.buffers[index].as_mut_slice()[offset..offset + n].copy_from_slice(&data[..n]);
            data = &data[n..];
            copied += n;
            let pos = self.offset() + n;
            self.pos_index = pos / self.buffer_size;
            self.pos_offset = pos % self.buffer_size;
        }
        if self.offset() > self.effective_size {
            self.effective_size = self.offset();
        }
        copied
    }

    /// Copy the valid bytes out, in slot order.
    pub fn valid_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.effective_size);
        let mut remaining = self.effective_size;
        for buf in &self.buffers {
            if remaining == 0 {
                break;
            }
            let n = remaining.min(self.buffer_size);
            out.extend_from_slice(&buf.as_slice()[..n]);
            remaining -= n;
        }
        out
    }

    /// Per-slot `(ptr, len)` pairs covering the first `limit` bytes.
    fn sg_list(&mut self, limit: usize) -> Vec<(*mut u8, usize)> {
        let mut list = Vec::with_capacity(self.num_buffers);
        let mut remaining = limit;
        for buf in &mut self.buffers {
            if remaining == 0 {
                break;
            }
            let n = remaining.min(self.buffer_size);
            list.push((buf.ptr, n));
            remaining -= n;
        }
        list
    }
}

/// A completed ring operation: kernel result and the submitter's tag.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub result: i32,
    pub user_data: u64,
}

/// Batched submission/completion engine over `io_uring`.
#[cfg(target_os = "linux")]
pub struct Ring {
    ring: Option<io_uring::IoUring>,
    queue_depth: u32,
    block_size: usize,
    /// iovec arrays of submitted batches; kept alive until their
    /// completions have been reaped.
    pending_iovecs: Vec<Vec<libc::iovec>>,
}

#[cfg(target_os = "linux")]
impl Ring {
    pub fn new(queue_depth: u32, block_size: usize) -> Self {
        Ring {
            ring: None,
            queue_depth,
            block_size,
            pending_iovecs: Vec::new(),
        }
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Prepare the submission/completion queues. Fails with the kernel's
    /// verdict where io_uring is unavailable.
    pub fn setup(&mut self) -> Result<()> {
        if self.ring.is_none() {
            self.ring = Some(io_uring::IoUring::new(self.queue_depth)?);
        }
        Ok(())
    }

    pub fn available(&self) -> bool {
        self.ring.is_some()
    }

    /// Tear the ring down and release its queues.
    pub fn exit(&mut self) {
        self.ring = None;
        self.pending_iovecs.clear();
    }

    fn ring_mut(&mut self) -> Result<&mut io_uring::IoUring> {
        self.ring.as_mut().ok_or(ArchiveError::Io {
            reason: "ring unavailable: setup() not called".into(),
            os_code: None,
        })
    }

    fn check_geometry(&self, buffer: &VectoredBuffer) -> Result<()> {
        if buffer.num_buffers() as u32 > self.queue_depth {
            return Err(ArchiveError::invalid(
                "vectored buffer",
                format!(
                    "vector length {} exceeds queue depth {}",
                    buffer.num_buffers(),
                    self.queue_depth
                ),
            ));
        }
        if buffer.buffer_size() != self.block_size {
            return Err(ArchiveError::invalid(
                "vectored buffer",
                format!(
                    "slot size {} does not match ring block size {}",
                    buffer.buffer_size(),
                    self.block_size
                ),
            ));
        }
        Ok(())
    }

    fn submit(&mut self, entry: io_uring::squeue::Entry, iovecs: Vec<libc::iovec>) -> Result<()> {
        {
            let ring = self.ring_mut()?;
            // SAFETY: the iovec array referenced by the entry lives in this
            // function until it is stowed below, and in pending_iovecs from
            // then until the completion is reaped.
            let pushed = unsafe { ring.submission().push(&entry) };
            if pushed.is_err() {
                return Err(ArchiveError::Io {
                    reason: "submission queue full".into(),
                    os_code: None,
                });
            }
            ring.submit()?;
        }
        self.pending_iovecs.push(iovecs);
        Ok(())
    }

    /// Emplace a vectored read of the whole buffer set at byte `pos`.
    pub fn read(&mut self, file: &File, buffer: &mut VectoredBuffer, pos: u64) -> Result<()> {
        use std::os::fd::AsRawFd;
        self.check_geometry(buffer)?;
        let iovecs: Vec<libc::iovec> = buffer
            .sg_list(buffer.total_size())
            .into_iter()
            .map(|(ptr, len)| libc::iovec {
                iov_base: ptr as *mut libc::c_void,
                iov_len: len,
            })
            .collect();
        let entry = io_uring::opcode::Readv::new(
            io_uring::types::Fd(file.as_raw_fd()),
            iovecs.as_ptr(),
            iovecs.len() as u32,
        )
        .offset(pos)
        .build();
        self.submit(entry, iovecs)
    }

    /// Emplace a vectored write of the buffer's valid bytes at byte `pos`.
    pub fn write(&mut self, file: &File, buffer: &mut VectoredBuffer, pos: u64) -> Result<()> {
        use std::os::fd::AsRawFd;
        self.check_geometry(buffer)?;
        let limit = buffer.effective_size();
        let iovecs: Vec<libc::iovec> = buffer
            .sg_list(limit)
            .into_iter()
            .map(|(ptr, len)| libc::iovec {
                iov_base: ptr as *mut libc::c_void,
                iov_len: len,
            })
            .collect();
        let entry = io_uring::opcode::Writev::new(
            io_uring::types::Fd(file.as_raw_fd()),
            iovecs.as_ptr(),
            iovecs.len() as u32,
        )
        .offset(pos)
        .build();
        self.submit(entry, iovecs)
    }

    /// Block until the most recently submitted operation completes, update
    /// the buffer's `effective_size` to the transferred byte count and
    /// return it. Partial transfers are reported verbatim; re-submission
    /// is the caller's business.
    pub fn handle_current_io(&mut self, buffer: &mut VectoredBuffer) -> Result<usize> {
        let completion = self.wait()?;
        self.pending_iovecs.clear();
        if completion.result < 0 {
            return Err(ArchiveError::Io {
                reason: "ring operation failed".into(),
                os_code: Some(-completion.result),
            });
        }
        let transferred = completion.result as usize;
        buffer.set_effective_size(transferred)?;
        Ok(transferred)
    }

    /// Block until a completion-queue entry is available and reap it.
    /// Reaping marks the entry as seen.
    pub fn wait(&mut self) -> Result<Completion> {
        let ring = self.ring_mut()?;
        ring.submit_and_wait(1)?;
        let entry = ring.completion().next().ok_or(ArchiveError::Io {
            reason: "completion queue empty after wait".into(),
            os_code: None,
        })?;
        Ok(Completion {
            result: entry.result(),
            user_data: entry.user_data(),
        })
    }
}

/// File engine used by the streaming sinks: the ring where the platform
/// provides one, plain positioned I/O otherwise.
pub enum IoEngine {
    #[cfg(target_os = "linux")]
    Uring(Ring),
    StdFs,
}

impl IoEngine {
    /// Pick the best engine for this platform. A kernel without io_uring
    /// support quietly gets the fallback.
    pub fn create(queue_depth: u32, block_size: usize) -> IoEngine {
        #[cfg(target_os = "linux")]
        {
            let mut ring = Ring::new(queue_depth, block_size);
            if ring.setup().is_ok() {
                return IoEngine::Uring(ring);
            }
        }
        let _ = (queue_depth, block_size);
        IoEngine::StdFs
    }

    /// Write the buffer's valid bytes at `pos`, returning the transferred
    /// count and leaving `effective_size` set to it.
    pub fn write_at(&mut self, file: &File, buffer: &mut VectoredBuffer, pos: u64) -> Result<usize> {
        match self {
            #[cfg(target_os = "linux")]
            IoEngine::Uring(ring) => {
                ring.write(file, buffer, pos)?;
                ring.handle_current_io(buffer)
            }
            IoEngine::StdFs => {
                use std::os::unix::fs::FileExt;
                let bytes = buffer.valid_bytes();
                file.write_all_at(&bytes, pos)?;
                Ok(bytes.len())
            }
        }
    }

    /// Read up to the buffer's capacity at `pos`; `effective_size` ends up
    /// at the transferred count.
    pub fn read_at(&mut self, file: &File, buffer: &mut VectoredBuffer, pos: u64) -> Result<usize> {
        match self {
            #[cfg(target_os = "linux")]
            IoEngine::Uring(ring) => {
                ring.read(file, buffer, pos)?;
                ring.handle_current_io(buffer)
            }
            IoEngine::StdFs => {
                use std::os::unix::fs::FileExt;
                let mut total = 0;
                for index in 0..buffer.num_buffers() {
                    let n = file.read_at(buffer.slot_mut(index), pos + total as u64)?;
                    total += n;
                    if n < buffer.buffer_size() {
                        break;
                    }
                }
                buffer.set_effective_size(total)?;
                Ok(total)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn buffer_geometry_and_bounds() {
        let mut buf = VectoredBuffer::new(8, 4).unwrap();
        assert_eq!(buf.total_size(), 32);
        assert_eq!(buf.effective_size(), 0);

        buf.set_effective_size(32).unwrap();
        assert!(buf.set_effective_size(33).is_err());
        assert_eq!(buf.effective_size(), 32);

        buf.set_offset(17).unwrap();
        assert_eq!(buf.offset(), 17);
        buf.set_offset(32).unwrap();
        assert!(buf.set_offset(33).is_err());

        assert!(VectoredBuffer::new(0, 4).is_err());
        assert!(VectoredBuffer::new(8, 0).is_err());
    }

    #[test]
    fn fill_crosses_slot_boundaries() {
        let mut buf = VectoredBuffer::new(4, 3).unwrap();
        assert_eq!(buf.fill(b"abcdef"), 6);
        assert_eq!(buf.effective_size(), 6);
        assert_eq!(buf.slot(0), b"abcd");
        assert_eq!(&buf.slot(1)[..2], b"ef");

        // only six more bytes fit
        assert_eq!(buf.fill(b"0123456789"), 6);
        assert_eq!(buf.effective_size(), 12);
        assert_eq!(buf.valid_bytes(), b"abcdef012345");
    }

    #[test]
    fn clear_keeps_allocation() {
        let mut buf = VectoredBuffer::new(4, 2).unwrap();
        buf.fill(b"xxxxyy");
        buf.clear();
        assert_eq!(buf.effective_size(), 0);
        assert_eq!(buf.offset(), 0);
        assert_eq!(buf.total_size(), 8);
        assert!(buf.slot(0).iter().all(|&b| b == 0));
    }

    #[test]
    fn stdfs_engine_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let mut file = File::create(&path).unwrap();
        file.write_all(&[0u8; 64]).unwrap();
        drop(file);

        let file = File::options().read(true).write(true).open(&path).unwrap();
        let mut engine = IoEngine::StdFs;

        let mut buf = VectoredBuffer::new(8, 2).unwrap();
        buf.fill(b"hello vectored");
        let written = engine.write_at(&file, &mut buf, 16).unwrap();
        assert_eq!(written, 14);

        let mut read_buf = VectoredBuffer::new(8, 2).unwrap();
        let read = engine.read_at(&file, &mut read_buf, 16).unwrap();
        assert_eq!(read, 16);
        assert_eq!(&read_buf.valid_bytes()[..14], b"hello vectored");
        assert_eq!(read_buf.effective_size(), read);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn ring_round_trip() {
        let mut ring = Ring::new(DEFAULT_QUEUE_DEPTH, 8);
        if ring.setup().is_err() {
            // io_uring not available in this environment
            return;
        }
        assert!(ring.available());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, [0u8; 64]).unwrap();
        let file = File::options().read(true).write(true).open(&path).unwrap();

        let mut buf = VectoredBuffer::new(8, 2).unwrap();
        buf.fill(b"ring data!");
        let written = ring.write(&file, &mut buf, 0).and_then(|_| {
            ring.handle_current_io(&mut buf)
        });
        let written = match written {
            Ok(n) => n,
            // sandboxed kernels may refuse the submission
            Err(_) => return,
        };
        assert_eq!(written, 10);
        assert_eq!(buf.effective_size(), 10);

        let mut read_buf = VectoredBuffer::new(8, 2).unwrap();
        ring.read(&file, &mut read_buf, 0).unwrap();
        let read = ring.handle_current_io(&mut read_buf).unwrap();
        assert_eq!(read, 16);
        assert_eq!(&read_buf.valid_bytes()[..10], b"ring data!");

        ring.exit();
        assert!(!ring.available());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn ring_rejects_mismatched_geometry() {
        let mut ring = Ring::new(2, 8);
        if ring.setup().is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, [0u8; 64]).unwrap();
        let file = File::open(&path).unwrap();

        // more slots than queue depth
        let mut buf = VectoredBuffer::new(8, 4).unwrap();
        assert!(ring.read(&file, &mut buf, 0).is_err());
        // slot size differs from block size
        let mut buf = VectoredBuffer::new(16, 2).unwrap();
        assert!(ring.read(&file, &mut buf, 0).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn ring_operations_require_setup() {
        let mut ring = Ring::new(4, 8);
        let mut buf = VectoredBuffer::new(8, 2).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, [0u8; 8]).unwrap();
        let file = File::open(&path).unwrap();
        assert!(!ring.available());
        assert!(ring.read(&file, &mut buf, 0).is_err());
    }
}
