//! Input device management.
//!
//! Every `event*` node under `/dev/input` is attached to a libinput path
//! context through an interface that grabs the underlying evdev device
//! (EVIOCGRAB), so no other reader on the system sees raw input while we
//! run. The directory is watched with inotify to pick up hot-plugged
//! devices.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CStr;
use std::mem;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use input::{Device, Libinput, LibinputInterface};
use rustix::fs::inotify::{inotify_add_watch, inotify_init, CreateFlags, WatchFlags};
use rustix::fs::{open, Mode, OFlags};
use rustix::io::Errno;

const INPUT_DIR: &str = "/dev/input";
const EVENT_PREFIX: &str = "event";

// _IOW('E', 0x90, int)
const EVIOCGRAB: libc::c_ulong = 0x4004_4590;

/// Opens evdev nodes for libinput with an exclusive grab.
///
/// A refused grab means another process still receives raw input behind
/// our back, which defeats the whole exercise; the failure is parked in
/// the shared slot so the attach path can turn it into a fatal error
/// (libinput's callback signature cannot carry it out directly).
struct GrabInterface {
    grab_failure: Rc<RefCell<Option<String>>>,
}

impl LibinputInterface for GrabInterface {
    fn open_restricted(&mut self, path: &Path, flags: i32) -> std::result::Result<OwnedFd, i32> {
        let fd = open(
            path,
            OFlags::from_bits_retain(flags as u32) | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|err| -err.raw_os_error())?;

        let grab: libc::c_int = 1;
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), EVIOCGRAB, &grab) };
        if rc < 0 {
            *self.grab_failure.borrow_mut() =
                Some(path.to_string_lossy().into_owned());
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EINVAL);
            return Err(-errno);
        }

        Ok(fd)
    }

    fn close_restricted(&mut self, fd: OwnedFd) {
        drop(fd);
    }
}

/// The libinput context plus the registry of attached devices, keyed by
/// their `/dev/input` node name.
pub struct DeviceManager {
    pub context: Libinput,
    registry: HashMap<String, Device>,
    grab_failure: Rc<RefCell<Option<String>>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        let grab_failure = Rc::new(RefCell::new(None));
        let context = Libinput::new_from_path(GrabInterface {
            grab_failure: grab_failure.clone(),
        });
        Self {
            context,
            registry: HashMap::new(),
            grab_failure,
        }
    }

    /// Attaches every `event*` character device currently present.
    pub fn scan(&mut self) -> Result<()> {
        let entries = std::fs::read_dir(INPUT_DIR)
            .with_context(|| format!("could not open directory '{INPUT_DIR}'"))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("could not read '{INPUT_DIR}'"))?;
            let file_type = entry.file_type()?;
            if !file_type.is_char_device() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(EVENT_PREFIX) {
                continue;
            }
            self.attach(name)?;
        }
        Ok(())
    }

    /// Attaches one device node by name. A name that is already registered
    /// is detached first, which covers a device being unplugged and
    /// re-plugged faster than we noticed.
    pub fn attach(&mut self, name: &str) -> Result<()> {
        if self.registry.contains_key(name) {
            self.detach(name);
        }

        let path = format!("{INPUT_DIR}/{name}");
        let device = self.context.path_add_device(&path);

        if let Some(path) = self.grab_failure.borrow_mut().take() {
            bail!("could not grab evdev device '{path}'");
        }

        match device {
            Some(device) => {
                debug!("attached input device {path}");
                self.registry.insert(name.to_owned(), device);
            }
            // Not every event node is something libinput accepts; ignore.
            None => trace!("libinput rejected {path}"),
        }
        Ok(())
    }

    pub fn detach(&mut self, name: &str) {
        if let Some(device) = self.registry.remove(name) {
            debug!("detaching input device {INPUT_DIR}/{name}");
            self.context.path_remove_device(device);
        }
    }

    /// Processes pending inotify notifications for `/dev/input`.
    pub fn handle_hotplug(&mut self, fd: BorrowedFd) -> Result<()> {
        // u64 storage keeps the buffer aligned for the event headers.
        let mut storage = [0u64; 512];
        let buf: &mut [u8] = bytemuck::cast_slice_mut(&mut storage);
        let header_len = mem::size_of::<libc::inotify_event>();

        loop {
            let len = match rustix::io::read(fd, buf) {
                Ok(len) => len,
                Err(Errno::INTR) => continue,
                Err(Errno::AGAIN) => break,
                Err(err) => {
                    return Err(err).context("could not read from the inotify descriptor")
                }
            };
            if len == 0 {
                break;
            }

            let mut offset = 0;
            while offset + header_len <= len {
                let event: libc::inotify_event =
                    unsafe { std::ptr::read_unaligned(buf.as_ptr().add(offset).cast()) };
                let name_len = event.len as usize;
                let name = CStr::from_bytes_until_nul(
                    &buf[offset + header_len..offset + header_len + name_len],
                )
                .ok()
                .and_then(|name| name.to_str().ok());

                if let Some(name) = name {
                    if name.starts_with(EVENT_PREFIX) {
                        if event.mask & libc::IN_CREATE != 0 {
                            self.attach(name)?;
                        } else {
                            self.detach(name);
                        }
                    }
                }

                offset += header_len + name_len;
            }
        }

        Ok(())
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates the inotify descriptor watching `/dev/input` for device nodes
/// coming and going.
pub fn init_hotplug_watch() -> Result<OwnedFd> {
    let fd = inotify_init(CreateFlags::CLOEXEC | CreateFlags::NONBLOCK)
        .context("could not initialize inotify")?;
    inotify_add_watch(&fd, INPUT_DIR, WatchFlags::CREATE | WatchFlags::DELETE)
        .with_context(|| format!("could not add an inotify watch on {INPUT_DIR}"))?;
    Ok(fd)
}

/// calloop adapter exposing the libinput context's poll descriptor.
pub struct LibinputSource(pub Libinput);

impl AsFd for LibinputSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.0.as_raw_fd()) }
    }
}
