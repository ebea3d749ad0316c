//! Request/response structs for the syscall surface.
//!
//! Each syscall defines one request struct (copied in atomically by the
//! trap dispatcher's `copyin`) and one response struct (copied out the
//! same way); additional user buffers referenced by a request (a
//! `read`/`write` payload, a path string) are `copyin`/`copyout`/
//! `copyinstr`'d separately and are represented here only as a user
//! virtual address and length, never as a slice — the dispatcher, not
//! this crate, validates and maps them.

use hadron_core::addr::VirtAddr;
use hadron_core::id::{Fd, Pid, Tid};

/// `PATH_MAX`, shared by every request carrying a path.
pub const PATH_MAX: usize = 255;

bitflags::bitflags! {
    /// `open` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const RDONLY = 0;
        /// Open for writing.
        const WRONLY = 1 << 0;
        /// Open for reading and writing.
        const RDWR = 1 << 1;
        /// Create if it does not exist.
        const CREAT = 1 << 2;
        /// Fail if it already exists (with `CREAT`).
        const EXCL = 1 << 3;
        /// Truncate to zero length.
        const TRUNC = 1 << 4;
        /// Close on `exec`.
        const CLOEXEC = 1 << 5;
        /// Non-blocking mode. Not implemented: returns `ENOTSUP` on pipes.
        const NONBLOCK = 1 << 6;
    }
}

bitflags::bitflags! {
    /// `mmap` protection flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmapProt: u32 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXEC = 1 << 2;
    }
}

/// `proc_fork` request. No fields: the calling thread's own context is
/// the implicit argument.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ForkRequest;

/// `proc_fork` response.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ForkResponse {
    /// The child's PID, as observed by the parent. Zero in the child
    /// (the child's own view of the return value differs and is
    /// produced by the platform-specific register divergence the
    /// thread-fork contract describes, not by this struct).
    pub child_pid: Pid,
}

/// `exec` request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ExecRequest {
    /// User virtual address of the executable's path string.
    pub path: VirtAddr,
    /// Length of the path string, excluding the terminator.
    pub path_len: u32,
    /// User virtual address of a NUL-terminated `argv` array.
    pub argv: VirtAddr,
    /// User virtual address of a NUL-terminated `envp` array.
    pub envp: VirtAddr,
}

/// `wait` request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct WaitRequest {
    /// Specific child to wait for, or `None` to wait for any.
    pub pid: Option<Pid>,
}

/// `wait` response.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct WaitResponse {
    /// PID of the reaped child.
    pub pid: Pid,
    /// The child's exit status.
    pub exit_status: i32,
}

/// `exit` request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ExitRequest {
    /// Exit status to record for this process.
    pub status: i32,
}

/// `open` request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct OpenRequest {
    /// User virtual address of the path string.
    pub path: VirtAddr,
    /// Length of the path string, excluding the terminator.
    pub path_len: u32,
    /// Open flags.
    pub flags: OpenFlags,
    /// Permission bits used when `CREAT` creates a new entry.
    pub mode: u32,
}

/// `open` response.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct OpenResponse {
    /// The newly allocated file descriptor.
    pub fd: Fd,
}

/// `close` request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CloseRequest {
    /// File descriptor to close.
    pub fd: Fd,
}

/// `read` request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ReadRequest {
    /// File descriptor to read from.
    pub fd: Fd,
    /// User virtual address of the destination buffer.
    pub buf: VirtAddr,
    /// Maximum number of bytes to read.
    pub count: u32,
}

/// `read` response.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ReadResponse {
    /// Bytes actually read (may be less than requested; zero at EOF).
    pub nread: u32,
}

/// `write` request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct WriteRequest {
    /// File descriptor to write to.
    pub fd: Fd,
    /// User virtual address of the source buffer.
    pub buf: VirtAddr,
    /// Number of bytes to write.
    pub count: u32,
}

/// `write` response.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct WriteResponse {
    /// Bytes actually written.
    pub nwritten: u32,
}

/// Reference point for `lseek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SeekWhence {
    /// Relative to the start of the file.
    Set = 0,
    /// Relative to the current position.
    Cur = 1,
    /// Relative to the end of the file.
    End = 2,
}

/// `lseek` request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct LseekRequest {
    /// File descriptor to seek.
    pub fd: Fd,
    /// Signed offset, interpreted relative to `whence`.
    pub offset: i64,
    /// Reference point.
    pub whence: SeekWhence,
}

/// `lseek` response.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct LseekResponse {
    /// Resulting absolute offset.
    pub offset: i64,
}

/// `mmap` request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MmapRequest {
    /// Requested address, or `None` to let the kernel choose.
    pub addr_hint: Option<VirtAddr>,
    /// Length in bytes, rounded up to a page by the dispatcher.
    pub len: u32,
    /// Requested protection.
    pub prot: MmapProt,
    /// File descriptor to map, or `None` for an anonymous mapping.
    pub fd: Option<Fd>,
    /// Offset into the file at which the mapping starts.
    pub offset: u64,
}

/// `mmap` response.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MmapResponse {
    /// Base virtual address of the new mapping.
    pub addr: VirtAddr,
}

/// `munmap` request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MunmapRequest {
    /// Base virtual address of the mapping to remove.
    pub addr: VirtAddr,
    /// Length in bytes.
    pub len: u32,
}

/// Thread `create` request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ThreadCreateRequest {
    /// Entry point in the calling process's address space.
    pub entry: VirtAddr,
    /// Argument passed to the entry point.
    pub arg: VirtAddr,
    /// Initial scheduling priority.
    pub priority: u8,
}

/// Thread `create` response.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ThreadCreateResponse {
    /// The new thread's TID.
    pub tid: Tid,
}

/// Thread `sleep_ms` request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ThreadSleepRequest {
    /// Duration to sleep, in milliseconds.
    pub ms: u32,
}

/// Thread `setpriority`/`getpriority` request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ThreadPriorityRequest {
    /// Thread to target.
    pub tid: Tid,
    /// New priority; ignored for `getpriority`.
    pub priority: u8,
}

/// Thread `getpriority` response.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ThreadPriorityResponse {
    /// Current priority.
    pub priority: u8,
}

/// `priv_pcap` access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PrivCapMode {
    /// Read the effective set.
    GetEff = 0,
    /// Write the effective set (subject to the bounding set).
    SetEff = 1,
    /// Clear a bit in the effective set.
    ClrEff = 2,
    /// Read the bounding set.
    GetBnd = 3,
    /// Write the bounding set (kernel-internal policy only).
    SetBnd = 4,
    /// Clear a bit in the bounding set.
    ClrBnd = 5,
}

/// `priv_pcap` request.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PrivPcapRequest {
    /// Access mode.
    pub mode: PrivCapMode,
    /// Privilege number the mode applies to (ignored for `Get*`, which
    /// instead returns the whole bitmap via the response).
    pub priv_num: u16,
}

/// `priv_pcap` response.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PrivPcapResponse {
    /// Whether the requested bit, after the operation, is set.
    pub result: bool,
}

/// `sched_get_loadavg` response (the request carries no fields).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct LoadavgResponse {
    /// 1-, 5-, and 15-minute exponentially decayed load averages,
    /// fixed-point with `FSHIFT` (11) fractional bits, matching the
    /// reference kernel's `fixpt_t` convention.
    pub loads: [u32; 3],
}
