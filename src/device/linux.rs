//! Linux TUN/TAP device via /dev/net/tun.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Mutex;

use libc::{c_char, c_int, c_short, c_void, IFF_NO_PI, IFF_TAP, IFF_TUN, O_RDWR};
use tracing::{debug, info};

use super::{DeviceMode, TapDevice};

/// TUNSETIFF ioctl number.
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// Poll timeout for reads, so worker flags are observed between packets.
const READ_POLL_MS: c_int = 500;

/// Interface request structure for TUNSETIFF.
#[repr(C)]
struct IfReq {
    ifr_name: [c_char; libc::IFNAMSIZ],
    ifr_flags: c_short,
    _pad: [u8; 22],
}

/// A TUN or TAP device handle.
pub struct TunTapDevice {
    fd: Mutex<Option<OwnedFd>>,
    name: String,
    mode: DeviceMode,
    mtu: usize,
}

impl TunTapDevice {
    /// Open `/dev/net/tun` and attach to `name` (empty = kernel picks).
    pub fn open(name: &str, mode: DeviceMode, mtu: usize) -> io::Result<Self> {
        let path = b"/dev/net/tun\0";
        let fd = unsafe { libc::open(path.as_ptr() as *const c_char, O_RDWR) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut req = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: match mode {
                DeviceMode::Tun => (IFF_TUN | IFF_NO_PI) as c_short,
                DeviceMode::Tap => (IFF_TAP | IFF_NO_PI) as c_short,
            },
            _pad: [0; 22],
        };
        for (dst, src) in req.ifr_name.iter_mut().zip(name.bytes()) {
            *dst = src as c_char;
        }

        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &mut req) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let end = req
            .ifr_name
            .iter()
            .position(|c| *c == 0)
            .unwrap_or(libc::IFNAMSIZ);
        let assigned: String = req.ifr_name[..end]
            .iter()
            .map(|c| *c as u8 as char)
            .collect();

        info!(name = %assigned, ?mode, "virtual device opened");
        Ok(Self {
            fd: Mutex::new(Some(fd)),
            name: assigned,
            mode,
            mtu,
        })
    }

    fn raw_fd(&self) -> io::Result<c_int> {
        self.fd
            .lock()
            .unwrap()
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device closed"))
    }
}

impl TapDevice for TunTapDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_tun(&self) -> bool {
        self.mode == DeviceMode::Tun
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.raw_fd()?;

        let mut poll_fds = [libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        let ready = unsafe { libc::poll(poll_fds.as_mut_ptr(), 1, READ_POLL_MS) };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        if ready == 0 || poll_fds[0].revents & libc::POLLIN == 0 {
            return Ok(0);
        }

        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.raw_fd()?;
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn close(&self) {
        if let Some(fd) = self.fd.lock().unwrap().take() {
            debug!(name = %self.name, "virtual device closed");
            drop(fd);
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl Drop for TunTapDevice {
    fn drop(&mut self) {
        self.close();
    }
}
