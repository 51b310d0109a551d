//! Linux tun device construction: /dev/net/tun plus addressing and routes
//! applied through the `ip` tool.

use burrow_engine::{EngineError, TunBuilder, TunOptions};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::Command;

const TUN_DEVICE: &[u8] = b"/dev/net/tun\0";
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

// struct ifreq: 16 bytes of name followed by the request union.
#[repr(C)]
struct IfReq {
    name: [u8; 16],
    flags: libc::c_short,
    _pad: [u8; 22],
}

pub struct LinuxTunBuilder {
    name: String,
}

impl LinuxTunBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn configure(&self, options: &TunOptions) -> Result<(), EngineError> {
        let (gateway, prefix) = options.ipv4;
        run_ip(&["addr", "add", &format!("{gateway}/{prefix}"), "dev", &self.name])?;
        if let Some((gateway6, prefix6)) = options.ipv6 {
            run_ip(&["-6", "addr", "add", &format!("{gateway6}/{prefix6}"), "dev", &self.name])?;
        }
        run_ip(&[
            "link",
            "set",
            "dev",
            &self.name,
            "mtu",
            &options.mtu.to_string(),
            "up",
        ])?;
        if options.capture_default_route {
            run_ip(&["route", "add", "default", "dev", &self.name])?;
            if options.ipv6.is_some() {
                run_ip(&["-6", "route", "add", "default", "dev", &self.name])?;
            }
        }
        Ok(())
    }
}

impl TunBuilder for LinuxTunBuilder {
    fn establish(&mut self, options: &TunOptions) -> Result<OwnedFd, EngineError> {
        if self.name.len() >= 16 {
            return Err(EngineError::TunSetup(format!(
                "interface name '{}' too long",
                self.name
            )));
        }

        let raw = unsafe {
            libc::open(
                TUN_DEVICE.as_ptr() as *const libc::c_char,
                libc::O_RDWR | libc::O_NONBLOCK,
            )
        };
        if raw < 0 {
            return Err(EngineError::TunSetup(format!(
                "open /dev/net/tun: {}",
                std::io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut req = IfReq {
            name: [0; 16],
            flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        req.name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &req) };
        if rc < 0 {
            return Err(EngineError::TunSetup(format!(
                "TUNSETIFF: {}",
                std::io::Error::last_os_error()
            )));
        }

        if !options.apps.included.is_empty() || !options.apps.excluded.is_empty() {
            // The Linux builder has no per-application selector; platforms
            // that do receive the set unchanged.
            tracing::warn!("per-application tunnel selection is not supported here, ignoring");
        }

        self.configure(options)?;
        tracing::info!(device = %self.name, mtu = options.mtu, "tunnel established");
        Ok(fd)
    }
}

fn run_ip(args: &[&str]) -> Result<(), EngineError> {
    let status = Command::new("ip")
        .args(args)
        .status()
        .map_err(|e| EngineError::TunSetup(format!("ip {}: {e}", args.join(" "))))?;
    if !status.success() {
        return Err(EngineError::TunSetup(format!(
            "ip {} exited with {status}",
            args.join(" ")
        )));
    }
    Ok(())
}
