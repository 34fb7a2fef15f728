//! Shared-memory regions and transferable handles.
//!
//! A [`SharedMemory`] is an anonymous backing store mapped into this process.
//! A [`Handle`] describes how a peer can map the same pages: it owns either a
//! duplicated descriptor (socket backend) or a send right to a memory entry
//! (port backend), and encodes as an attachment. Encoding consumes the
//! handle, so the sender is left holding nothing it has promised away.
//!
//! Read-only handles are enforced by the kernel where possible: on Linux the
//! descriptor is reopened `O_RDONLY`, and `mmap` refuses `PROT_WRITE` on it.
//!
//! # Example
//!
//! ```
//! use procwire_ipc::shared_memory::{Protection, SharedMemory};
//!
//! let mut region = SharedMemory::allocate(4096).unwrap();
//! region.data_mut().unwrap()[..5].copy_from_slice(b"hello");
//!
//! let handle = region.create_handle(Protection::ReadOnly).unwrap();
//! let view = SharedMemory::map(handle, Protection::ReadOnly).unwrap();
//! assert_eq!(&view.data()[..5], b"hello");
//! assert!(SharedMemory::allocate(0).is_err());
//! ```

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::attachment::Attachment;
use crate::codec::{Decode, Decoder, Encode, Encoder};
use crate::error::{IpcError, Result};
use crate::port::{PortRight, PortSpace};

/// Access granted by a mapping or a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protection {
    ReadOnly = 0,
    ReadWrite = 1,
}

impl Protection {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ReadOnly),
            1 => Some(Self::ReadWrite),
            _ => None,
        }
    }

    /// Whether a resource granted with `self` may be mapped with `requested`.
    #[inline]
    pub fn permits(self, requested: Protection) -> bool {
        self == Protection::ReadWrite || requested == Protection::ReadOnly
    }

    fn mmap_flags(self) -> libc::c_int {
        match self {
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// A mapped shared-memory region.
pub struct SharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    protection: Protection,
    fd: OwnedFd,
    /// Read-write memory entry reused across port handles.
    port_entry: Option<PortRight>,
}

// SAFETY: the mapping is process-wide and only exposed through &/&mut borrows.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Allocate a zero-filled read-write region of `size` bytes.
    pub fn allocate(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(IpcError::Resource("cannot allocate an empty region".into()));
        }

        let file = File::from(create_backing_store()?);
        file.set_len(size as u64)?;
        let fd = OwnedFd::from(file);

        let ptr = map_fd(fd.as_fd(), size, Protection::ReadWrite)?;
        Ok(Self {
            ptr,
            size,
            protection: Protection::ReadWrite,
            fd,
            port_entry: None,
        })
    }

    /// Map the pages a peer handed over.
    ///
    /// Fails if `protection` asks for more access than the handle grants.
    pub fn map(handle: Handle, protection: Protection) -> Result<Self> {
        if !handle.protection.permits(protection) {
            return Err(IpcError::Resource(
                "read-only handle cannot be mapped read-write".into(),
            ));
        }
        let size = usize::try_from(handle.size)
            .map_err(|_| IpcError::Resource(format!("region of {} bytes", handle.size)))?;

        let fd = match handle.resource {
            HandleResource::Null => {
                return Err(IpcError::Resource("handle carries no resource".into()))
            }
            HandleResource::Fd(fd) => {
                // Pages past the end of the file fault on access
                let file = File::from(fd);
                let available = file.metadata()?.len();
                if available < handle.size {
                    return Err(IpcError::Resource(format!(
                        "descriptor of {} bytes is smaller than handle size {}",
                        available, handle.size
                    )));
                }
                OwnedFd::from(file)
            }
            HandleResource::MemoryEntry(right) => {
                let (fd, entry_size, entry_protection) = right.space().memory_entry(right.name())?;
                if !entry_protection.permits(protection) {
                    return Err(IpcError::Resource(
                        "memory entry is read-only".into(),
                    ));
                }
                if entry_size < handle.size {
                    return Err(IpcError::Resource(format!(
                        "memory entry of {} bytes is smaller than handle size {}",
                        entry_size, handle.size
                    )));
                }
                fd
            }
        };

        let ptr = map_fd(fd.as_fd(), size, protection)?;
        Ok(Self {
            ptr,
            size,
            protection,
            fd,
            port_entry: None,
        })
    }

    /// Duplicate the backing descriptor into a handle granting `protection`.
    pub fn create_handle(&self, protection: Protection) -> Result<Handle> {
        self.check_grant(protection)?;
        let fd = match protection {
            Protection::ReadOnly => reopen_read_only(&self.fd)?,
            Protection::ReadWrite => self.fd.try_clone()?,
        };
        Ok(Handle {
            size: self.size as u64,
            protection,
            resource: HandleResource::Fd(fd),
        })
    }

    /// Name this region with a memory-entry port in `space`.
    ///
    /// A read-write request reuses one cached entry. A read-only request
    /// always mints a new entry backed by a read-only descriptor, so it can
    /// never hand out the cached writable one.
    pub fn create_port_handle(
        &mut self,
        space: &Arc<PortSpace>,
        protection: Protection,
    ) -> Result<Handle> {
        self.check_grant(protection)?;
        let right = match protection {
            Protection::ReadWrite => match &self.port_entry {
                Some(entry) if Arc::ptr_eq(entry.space(), space) => entry.copy_send(),
                _ => {
                    let entry = space.make_memory_entry(
                        self.fd.try_clone()?,
                        self.size as u64,
                        Protection::ReadWrite,
                    );
                    let right = entry.copy_send();
                    self.port_entry = Some(entry);
                    right
                }
            },
            Protection::ReadOnly => space.make_memory_entry(
                reopen_read_only(&self.fd)?,
                self.size as u64,
                Protection::ReadOnly,
            ),
        };
        Ok(Handle {
            size: self.size as u64,
            protection,
            resource: HandleResource::MemoryEntry(right),
        })
    }

    fn check_grant(&self, protection: Protection) -> Result<()> {
        if self.protection.permits(protection) {
            Ok(())
        } else {
            Err(IpcError::Resource(
                "cannot grant write access from a read-only mapping".into(),
            ))
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: ptr maps `size` readable bytes for the lifetime of self
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Writable view, or `None` for a read-only mapping.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match self.protection {
            // SAFETY: the mapping is writable and uniquely borrowed
            Protection::ReadWrite => {
                Some(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) })
            }
            Protection::ReadOnly => None,
        }
    }
}

impl AsRef<[u8]> for SharedMemory {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        // SAFETY: ptr/size came from a successful mmap
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.size) };
        if rc != 0 {
            tracing::warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("size", &self.size)
            .field("protection", &self.protection)
            .finish()
    }
}

/// Map `size` bytes of `fd` shared.
pub(crate) fn map_fd(fd: BorrowedFd<'_>, size: usize, protection: Protection) -> Result<NonNull<u8>> {
    // SAFETY: a fresh shared mapping chosen by the kernel aliases nothing
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            protection.mmap_flags(),
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(IpcError::Io(io::Error::last_os_error()));
    }
    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| IpcError::Resource("mmap returned null".into()))
}

#[cfg(target_os = "linux")]
fn create_backing_store() -> Result<OwnedFd> {
    use std::os::fd::FromRawFd;

    // SAFETY: name is NUL-terminated
    let fd = unsafe { libc::memfd_create(b"procwire-ipc\0".as_ptr().cast(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(IpcError::Io(io::Error::last_os_error()));
    }
    // SAFETY: fd was just returned by memfd_create and is owned by no one else
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
fn create_backing_store() -> Result<OwnedFd> {
    let path = std::env::temp_dir().join(format!(
        "procwire-shm-{}-{:x}",
        std::process::id(),
        crate::transport::rand_u64()
    ));
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)?;
    std::fs::remove_file(&path)?;
    Ok(OwnedFd::from(file))
}

/// Open a second, read-only description of the same file.
#[cfg(target_os = "linux")]
fn reopen_read_only(fd: &OwnedFd) -> Result<OwnedFd> {
    let file = File::open(format!("/proc/self/fd/{}", fd.as_raw_fd()))?;
    Ok(OwnedFd::from(file))
}

#[cfg(not(target_os = "linux"))]
fn reopen_read_only(fd: &OwnedFd) -> Result<OwnedFd> {
    Ok(fd.try_clone()?)
}

/// Transferable description of a shared-memory region.
#[derive(Debug)]
pub struct Handle {
    size: u64,
    protection: Protection,
    resource: HandleResource,
}

#[derive(Debug)]
enum HandleResource {
    Null,
    Fd(OwnedFd),
    MemoryEntry(PortRight),
}

impl Handle {
    /// A handle that maps nothing.
    pub fn null() -> Self {
        Self {
            size: 0,
            protection: Protection::ReadOnly,
            resource: HandleResource::Null,
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self.resource, HandleResource::Null)
    }

    /// Port name of the memory entry, if this is a port handle.
    pub fn port_name(&self) -> Option<crate::port::PortName> {
        match &self.resource {
            HandleResource::MemoryEntry(right) => Some(right.name()),
            _ => None,
        }
    }

    /// Handle over a descriptor received from a peer.
    pub(crate) fn from_fd(fd: OwnedFd, size: u64, protection: Protection) -> Self {
        Self {
            size,
            protection,
            resource: HandleResource::Fd(fd),
        }
    }

    /// Descriptor behind an fd handle.
    pub(crate) fn into_fd(self) -> Option<OwnedFd> {
        match self.resource {
            HandleResource::Fd(fd) => Some(fd),
            _ => None,
        }
    }
}

impl Encode for Handle {
    fn encode(self, encoder: &mut Encoder) {
        encoder.encode(self.size);
        encoder.encode(self.protection as u8);
        match self.resource {
            HandleResource::Null => encoder.encode(false),
            HandleResource::Fd(fd) => {
                encoder.encode(true);
                encoder.add_attachment(Attachment::MappedMemory {
                    fd,
                    size: self.size,
                });
            }
            HandleResource::MemoryEntry(right) => {
                encoder.encode(true);
                encoder.add_attachment(Attachment::Port(right));
            }
        }
    }
}

impl Decode for Handle {
    fn decode(decoder: &mut Decoder) -> Option<Self> {
        let size = decoder.decode::<u64>()?;
        let protection = Protection::from_u8(decoder.decode::<u8>()?)?;
        let resource = if decoder.decode::<bool>()? {
            match decoder.take_attachment()? {
                Attachment::MappedMemory { fd, size: mapped } if mapped == size => {
                    HandleResource::Fd(fd)
                }
                Attachment::Port(right) => HandleResource::MemoryEntry(right),
                _ => return None,
            }
        } else {
            HandleResource::Null
        };
        Some(Self {
            size,
            protection,
            resource,
        })
    }
}
