use std::{fs::OpenOptions, io, mem, os::fd::AsRawFd};

use nix::{ioctl_write_int, ioctl_write_ptr_bad, request_code_write};

// TUNSETIFF is declared _IOW('T', 202, int) but takes a struct ifreq pointer
ioctl_write_ptr_bad!(
    tun_set_iff,
    request_code_write!(b'T', 202, mem::size_of::<libc::c_int>()),
    libc::ifreq
);
ioctl_write_int!(tun_set_persist, b'T', 203);

/// Create a persistent TAP device named `name`.
///
/// The device must outlive our fd: QEMU attaches to it by name
/// (`ifname=...,script=no`), so we set TUNSETPERSIST before dropping the
/// tun fd. Removal is a plain netlink link delete.
pub fn create_persistent_tap(name: &str) -> io::Result<()> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name too long: {}", name),
        ));
    }

    let tun = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")?;

    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;

    unsafe {
        tun_set_iff(tun.as_raw_fd(), &ifr).map_err(io::Error::from)?;
        tun_set_persist(tun.as_raw_fd(), 1).map_err(io::Error::from)?;
    }

    Ok(())
}
