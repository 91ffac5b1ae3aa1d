// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Passing file descriptors to the monitor as `SCM_RIGHTS` ancillary data.

use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, RawFd};

use tokio::io::Interest;
use tokio::net::UnixStream;

/// Writes `payload` to `stream`, attaching `fd` to the first byte sent.
pub(crate) async fn send_with_fd(
    stream: &UnixStream,
    payload: &[u8],
    fd: RawFd,
) -> io::Result<()> {
    let mut sent = 0;
    while sent < payload.len() {
        stream.writable().await?;
        let attach = if sent == 0 { Some(fd) } else { None };
        match stream.try_io(Interest::WRITABLE, || {
            sendmsg(stream.as_raw_fd(), &payload[sent..], attach)
        }) {
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn sendmsg(sock: RawFd, buf: &[u8], fd: Option<RawFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // u64 storage keeps the control buffer aligned for cmsghdr.
    let mut control = [0u64; 8];

    // SAFETY: msghdr is plain data; a zeroed value is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        let fd_len = size_of::<RawFd>() as u32;
        // SAFETY: the control buffer is large enough for one descriptor,
        // and CMSG_FIRSTHDR returns a pointer into it once msg_control and
        // msg_controllen are set.
        unsafe {
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = libc::CMSG_SPACE(fd_len) as _;
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_len) as _;
            std::ptr::copy_nonoverlapping(
                &fd as *const RawFd as *const u8,
                libc::CMSG_DATA(cmsg),
                size_of::<RawFd>(),
            );
        }
    }

    // SAFETY: msg points at live buffers for the duration of the call.
    let n = unsafe { libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::fd::FromRawFd;

    fn recv_fd(sock: RawFd, buf: &mut [u8]) -> (usize, Option<RawFd>) {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = [0u64; 8];
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = std::mem::size_of_val(&control) as _;
        let n = unsafe { libc::recvmsg(sock, &mut msg, 0) };
        assert!(n >= 0, "recvmsg: {}", io::Error::last_os_error());
        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        let fd = if cmsg.is_null() {
            None
        } else {
            let mut fd: RawFd = -1;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    &mut fd as *mut RawFd as *mut u8,
                    size_of::<RawFd>(),
                );
            }
            Some(fd)
        };
        (n as usize, fd)
    }

    #[tokio::test]
    async fn descriptor_travels_with_payload() {
        let (a, b) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();

        send_with_fd(&a, b"{\"execute\":\"getfd\"}\n", file.as_raw_fd())
            .await
            .unwrap();

        b.readable().await.unwrap();
        let mut buf = [0u8; 64];
        let (n, fd) = recv_fd(b.as_raw_fd(), &mut buf);
        assert_eq!(&buf[..n], b"{\"execute\":\"getfd\"}\n");
        let fd = fd.expect("descriptor attached");
        assert_ne!(fd, file.as_raw_fd());
        drop(unsafe { std::fs::File::from_raw_fd(fd) });
    }
}
