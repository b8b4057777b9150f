//! Named shared memory regions, shared between a controller and the target process it runs.
//!
//! Every backend implements the same small interface: create a region under a name,
//! map an existing region by name, and unlink a name. Code above this module only
//! ever talks to [`ShMemProvider`] and [`ShMem`]; the platform is picked through
//! the [`StdShMemProvider`] alias.

use core::{
    fmt::{self, Debug, Display},
    ops::{Deref, DerefMut},
};
use std::env;

#[cfg(unix)]
pub use unix_shmem::{MmapShMem, MmapShMemProvider};
#[cfg(windows)]
pub use win32_shmem::{Win32ShMem, Win32ShMemProvider};

use crate::Error;

/// The default [`ShMemProvider`] for this os.
#[cfg(unix)]
pub type StdShMemProvider = MmapShMemProvider;

/// The default [`ShMemProvider`] for this os.
#[cfg(windows)]
pub type StdShMemProvider = Win32ShMemProvider;

/// The max number of bytes in a [`ShMemId`], including the trailing null byte.
pub const MAX_SHMEM_NAME_LEN: usize = 64;

/// The name of a shared memory region.
///
/// Both processes derive or receive the same name and use it to reach the same pages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShMemId {
    id: [u8; MAX_SHMEM_NAME_LEN],
}

impl Default for ShMemId {
    fn default() -> Self {
        Self {
            id: [0; MAX_SHMEM_NAME_LEN],
        }
    }
}

impl ShMemId {
    /// Create a new id from a string.
    ///
    /// Fails if the string does not fit, including its null terminator, or contains a null byte.
    pub fn try_from_str(val: &str) -> Result<Self, Error> {
        let bytes = val.as_bytes();
        if bytes.len() >= MAX_SHMEM_NAME_LEN {
            return Err(Error::illegal_argument(format!(
                "Shared memory name {val} is longer than {} bytes",
                MAX_SHMEM_NAME_LEN - 1
            )));
        }
        if bytes.contains(&0) {
            return Err(Error::illegal_argument(format!(
                "Shared memory name {val:?} contains a null byte"
            )));
        }
        let mut id = [0; MAX_SHMEM_NAME_LEN];
        id[..bytes.len()].copy_from_slice(bytes);
        Ok(Self { id })
    }

    /// Returns `true` if this `ShMemId` has an empty backing slice.
    /// If this is the case something went wrong, and this `ShMemId` may not be read from.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.id[0] == 0
    }

    /// Returns the first null-byte in or the end of the buffer
    #[must_use]
    pub fn null_pos(&self) -> usize {
        self.id
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(MAX_SHMEM_NAME_LEN)
    }

    /// Returns a `str` representation of this [`ShMemId`]
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Only ever built from a `&str` in `try_from_str`.
        core::str::from_utf8(&self.id[..self.null_pos()]).unwrap_or_default()
    }
}

impl Display for ShMemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A [`ShMem`] is a mapped, named shared memory region.
///
/// The mapping is released on [`Drop`]; the name stays reachable for other
/// processes until [`ShMemProvider::unlink`] is called.
pub trait ShMem: Debug + DerefMut<Target = [u8]> {
    /// Get the id of this shared memory mapping
    fn id(&self) -> ShMemId;
}

/// A [`ShMemProvider`] creates, opens and unlinks named shared maps.
pub trait ShMemProvider: Debug {
    /// The actual shared map handed out by this [`ShMemProvider`].
    type ShMem: ShMem;

    /// Create a new instance of the provider
    fn new() -> Result<Self, Error>
    where
        Self: Sized;

    /// Create a new shared memory mapping of `map_size` zeroed bytes, reachable under `id`.
    ///
    /// Fails if a region with this name already exists.
    fn new_shmem_with_id(&mut self, map_size: usize, id: &ShMemId)
        -> Result<Self::ShMem, Error>;

    /// Map an existing region given its id and size
    fn shmem_from_id_and_size(&mut self, id: &ShMemId, size: usize)
        -> Result<Self::ShMem, Error>;

    /// Remove the name of a region. Existing mappings stay valid until dropped.
    fn unlink(&mut self, id: &ShMemId) -> Result<(), Error>;

    /// Reads the region name from the env var `env_name`, then maps `size` bytes of it
    fn existing_from_env(&mut self, env_name: &str, size: usize) -> Result<Self::ShMem, Error> {
        let name = env::var(env_name)?;
        self.shmem_from_id_and_size(&ShMemId::try_from_str(&name)?, size)
    }
}

/// An [`ShMemProvider`] that does not share anything.
///
/// The resulting [`NopShMem`] is backed by a simple byte buffer. This is mainly for testing:
/// calling [`NopShMemProvider::shmem_from_id_and_size`] returns a new, zeroed map every time.
#[derive(Debug, Clone, Default)]
pub struct NopShMemProvider;

impl ShMemProvider for NopShMemProvider {
    type ShMem = NopShMem;

    fn new() -> Result<Self, Error> {
        Ok(Self)
    }

    fn new_shmem_with_id(
        &mut self,
        map_size: usize,
        id: &ShMemId,
    ) -> Result<Self::ShMem, Error> {
        self.shmem_from_id_and_size(id, map_size)
    }

    fn shmem_from_id_and_size(
        &mut self,
        id: &ShMemId,
        map_size: usize,
    ) -> Result<Self::ShMem, Error> {
        Ok(NopShMem {
            id: *id,
            buf: vec![0; map_size],
        })
    }

    fn unlink(&mut self, _id: &ShMemId) -> Result<(), Error> {
        Ok(())
    }
}

/// An [`ShMem`] that does not have any shared mem nor share anything.
#[derive(Debug, Clone, Default)]
pub struct NopShMem {
    id: ShMemId,
    buf: Vec<u8>,
}

impl ShMem for NopShMem {
    fn id(&self) -> ShMemId {
        self.id
    }
}

impl DerefMut for NopShMem {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Deref for NopShMem {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

/// Shared memory for unix, using [`libc::shm_open`] and [`libc::mmap`].
#[cfg(unix)]
pub mod unix_shmem {
    use core::{
        ops::{Deref, DerefMut},
        ptr, slice,
    };
    use std::{ffi::CString, process};

    use libc::{c_int, close, ftruncate, mmap, munmap, shm_open, shm_unlink};

    use crate::{
        shmem::{ShMem, ShMemId, ShMemProvider},
        Error,
    };

    /// POSIX shared memory names must start with a slash.
    fn posix_name(id: &ShMemId) -> Result<CString, Error> {
        Ok(CString::new(format!("/{}", id.as_str()))?)
    }

    /// Mmap-based shared map for unix using [`shm_open`] and [`mmap`].
    #[derive(Debug)]
    pub struct MmapShMem {
        /// The size of this map
        map_size: usize,
        /// The map ptr
        map: *mut u8,
        /// The name this map is reachable under
        id: ShMemId,
    }

    impl MmapShMem {
        /// Create a new named [`MmapShMem`] of `map_size` bytes.
        ///
        /// This will *NOT* automatically delete the name when dropped, see [`ShMemProvider::unlink`].
        pub fn new(map_size: usize, id: &ShMemId) -> Result<Self, Error> {
            let filename_path = posix_name(id)?;

            log::info!(
                "{} Creating shmem {} {:?}",
                map_size,
                process::id(),
                filename_path
            );

            // # Safety
            // No user-provided potentially unsafe parameters.
            // FFI Calls.
            unsafe {
                /* create the shared memory segment as if it was a file */
                let shm_fd = shm_open(
                    filename_path.as_ptr(),
                    libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                    0o600,
                );

                if shm_fd == -1 {
                    return Err(Error::last_os_error(format!(
                        "Failed to shm_open map with id {filename_path:?}",
                    )));
                }

                /* configure the size of the shared memory segment */
                if ftruncate(shm_fd, map_size.try_into()?) != 0 {
                    let err = Error::last_os_error(format!(
                        "ftruncate() failed for map with id {filename_path:?}",
                    ));
                    close(shm_fd);
                    shm_unlink(filename_path.as_ptr());
                    return Err(err);
                }

                let map = Self::map_fd(shm_fd, map_size);
                // The mapping keeps the segment alive, the fd is no longer needed.
                close(shm_fd);
                match map {
                    Ok(map) => Ok(Self {
                        map_size,
                        map,
                        id: *id,
                    }),
                    Err(err) => {
                        shm_unlink(filename_path.as_ptr());
                        Err(err)
                    }
                }
            }
        }

        fn shmem_from_id_and_size(id: &ShMemId, map_size: usize) -> Result<Self, Error> {
            let filename_path = posix_name(id)?;

            // # Safety
            // No user-provided potentially unsafe parameters.
            // FFI Calls.
            unsafe {
                /* attach to the shared memory segment as if it was a file */
                let shm_fd = shm_open(filename_path.as_ptr(), libc::O_RDWR, 0o600);
                if shm_fd == -1 {
                    log::info!(
                        "Trying to attach to {:?} but failed {}",
                        filename_path,
                        process::id()
                    );
                    return Err(Error::last_os_error(format!(
                        "Failed to shm_open map with id {filename_path:?}",
                    )));
                }
                let map = Self::map_fd(shm_fd, map_size);
                close(shm_fd);
                Ok(Self {
                    map_size,
                    map: map?,
                    id: *id,
                })
            }
        }

        /// Map `map_size` bytes of `shm_fd` into the address space of the process.
        fn map_fd(shm_fd: c_int, map_size: usize) -> Result<*mut u8, Error> {
            // # Safety
            // A fresh shared mapping, nothing else in this process points there.
            let map = unsafe {
                mmap(
                    ptr::null_mut(),
                    map_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    shm_fd,
                    0,
                )
            };
            if map == libc::MAP_FAILED {
                return Err(Error::last_os_error(format!(
                    "mmap() failed for map with fd {shm_fd:?}"
                )));
            }
            Ok(map.cast::<u8>())
        }
    }

    impl ShMem for MmapShMem {
        fn id(&self) -> ShMemId {
            self.id
        }
    }

    impl Deref for MmapShMem {
        type Target = [u8];

        fn deref(&self) -> &[u8] {
            // # Safety
            // `map` points to `map_size` mapped bytes for the whole lifetime of `self`.
            unsafe { slice::from_raw_parts(self.map, self.map_size) }
        }
    }

    impl DerefMut for MmapShMem {
        fn deref_mut(&mut self) -> &mut [u8] {
            // # Safety
            // `map` points to `map_size` mapped bytes for the whole lifetime of `self`.
            unsafe { slice::from_raw_parts_mut(self.map, self.map_size) }
        }
    }

    impl Drop for MmapShMem {
        fn drop(&mut self) {
            // # Safety
            // Mutable borrow so no possible race.
            unsafe {
                if munmap(self.map.cast(), self.map_size) != 0 {
                    log::warn!("Failed to unmap shmem {}", self.id);
                }
            }
            self.map = ptr::null_mut();
        }
    }

    /// A [`ShMemProvider`] which uses [`shm_open`] and [`mmap`] to provide shared memory mappings.
    #[derive(Clone, Debug, Default)]
    pub struct MmapShMemProvider {}

    impl ShMemProvider for MmapShMemProvider {
        type ShMem = MmapShMem;

        fn new() -> Result<Self, Error> {
            Ok(Self {})
        }

        fn new_shmem_with_id(
            &mut self,
            map_size: usize,
            id: &ShMemId,
        ) -> Result<Self::ShMem, Error> {
            MmapShMem::new(map_size, id)
        }

        fn shmem_from_id_and_size(
            &mut self,
            id: &ShMemId,
            size: usize,
        ) -> Result<Self::ShMem, Error> {
            MmapShMem::shmem_from_id_and_size(id, size)
        }

        fn unlink(&mut self, id: &ShMemId) -> Result<(), Error> {
            let filename_path = posix_name(id)?;
            log::debug!("Unlinking shmem {filename_path:?}");
            // # Safety
            // FFI call with a valid C string.
            if unsafe { shm_unlink(filename_path.as_ptr()) } != 0 {
                return Err(Error::last_os_error(format!(
                    "Failed to shm_unlink map with id {filename_path:?}"
                )));
            }
            Ok(())
        }
    }
}

/// Then `win32` implementation for shared memory.
#[cfg(windows)]
pub mod win32_shmem {
    use core::{
        ffi::c_void,
        fmt::{self, Debug, Formatter},
        ops::{Deref, DerefMut},
        slice,
    };

    use windows::{
        core::PCSTR,
        Win32::{
            Foundation::{CloseHandle, HANDLE},
            System::Memory::{
                CreateFileMappingA, MapViewOfFile, OpenFileMappingA, UnmapViewOfFile,
                FILE_MAP_ALL_ACCESS, MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
            },
        },
    };

    use crate::{
        shmem::{ShMem, ShMemId, ShMemProvider, MAX_SHMEM_NAME_LEN},
        Error,
    };

    const INVALID_HANDLE_VALUE: *mut c_void = -1isize as *mut c_void;

    /// The default [`ShMem`] impl for Windows using file mappings
    pub struct Win32ShMem {
        id: ShMemId,
        handle: HANDLE,
        map: *mut u8,
        map_size: usize,
    }

    impl Debug for Win32ShMem {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            f.debug_struct("Win32ShMem")
                .field("id", &self.id)
                .field("handle", &self.handle.0)
                .field("map", &self.map)
                .field("map_size", &self.map_size)
                .finish()
        }
    }

    fn c_name(id: &ShMemId) -> [u8; MAX_SHMEM_NAME_LEN] {
        let mut name = [0_u8; MAX_SHMEM_NAME_LEN];
        let bytes = id.as_str().as_bytes();
        name[..bytes.len()].copy_from_slice(bytes);
        name
    }

    impl Win32ShMem {
        fn new_shmem(map_size: usize, id: &ShMemId) -> Result<Self, Error> {
            let name = c_name(id);
            unsafe {
                let handle = CreateFileMappingA(
                    HANDLE(INVALID_HANDLE_VALUE),
                    None,
                    PAGE_READWRITE,
                    0,
                    map_size.try_into()?,
                    PCSTR(name.as_ptr()),
                )?;

                let map =
                    MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, map_size).Value as *mut u8;
                if map.is_null() {
                    let _ = CloseHandle(handle);
                    return Err(Error::unknown(format!("Cannot map shared memory {id}")));
                }

                Ok(Self {
                    id: *id,
                    handle,
                    map,
                    map_size,
                })
            }
        }

        fn shmem_from_id_and_size(id: &ShMemId, map_size: usize) -> Result<Self, Error> {
            let name = c_name(id);
            unsafe {
                let handle =
                    OpenFileMappingA(FILE_MAP_ALL_ACCESS.0, false, PCSTR(name.as_ptr()))?;

                let map =
                    MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, map_size).Value as *mut u8;
                if map.is_null() {
                    let _ = CloseHandle(handle);
                    return Err(Error::unknown(format!("Cannot map shared memory {id}")));
                }
                Ok(Self {
                    id: *id,
                    handle,
                    map,
                    map_size,
                })
            }
        }
    }

    impl ShMem for Win32ShMem {
        fn id(&self) -> ShMemId {
            self.id
        }
    }

    impl Deref for Win32ShMem {
        type Target = [u8];
        fn deref(&self) -> &[u8] {
            unsafe { slice::from_raw_parts(self.map, self.map_size) }
        }
    }
    impl DerefMut for Win32ShMem {
        fn deref_mut(&mut self) -> &mut [u8] {
            unsafe { slice::from_raw_parts_mut(self.map, self.map_size) }
        }
    }

    /// Deinit sharedmaps on [`Drop`]
    impl Drop for Win32ShMem {
        fn drop(&mut self) {
            unsafe {
                let res = UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                    Value: self.map as *mut c_void,
                });
                if let Err(err) = res {
                    // ignore result: nothing we can do if this goes wrong..
                    log::warn!("Failed to unmap memory at {:?}: {err}", self.map);
                }
                let res = CloseHandle(self.handle);
                if let Err(err) = res {
                    // ignore result: nothing we can do if this goes wrong..
                    log::warn!("Failed to close mem handle {:?}: {err}", self.handle);
                }
            }
        }
    }

    /// A [`ShMemProvider`] which uses `win32` functions to provide shared memory mappings.
    #[derive(Clone, Debug, Default)]
    pub struct Win32ShMemProvider {}

    /// Implement [`ShMemProvider`] for [`Win32ShMemProvider`]
    impl ShMemProvider for Win32ShMemProvider {
        type ShMem = Win32ShMem;

        fn new() -> Result<Self, Error> {
            Ok(Self {})
        }

        fn new_shmem_with_id(
            &mut self,
            map_size: usize,
            id: &ShMemId,
        ) -> Result<Self::ShMem, Error> {
            Win32ShMem::new_shmem(map_size, id)
        }

        fn shmem_from_id_and_size(
            &mut self,
            id: &ShMemId,
            size: usize,
        ) -> Result<Self::ShMem, Error> {
            Win32ShMem::shmem_from_id_and_size(id, size)
        }

        /// File mappings disappear with their last handle, there is no name to remove.
        fn unlink(&mut self, _id: &ShMemId) -> Result<(), Error> {
            Ok(())
        }
    }
}
