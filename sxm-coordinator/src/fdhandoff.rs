//! NBD socket fd handoff (spec §4.5.2, §6.3, §6.4).
//!
//! The destination host already knows the mirror is live; what it's
//! missing is the actual byte pipe. This module performs the raw HTTP PUT
//! handshake against `/services/SM/nbd/{vm}/{dest_sr}/{mirror_vdi}/{mirror_dp}`,
//! takes ownership of the resulting socket, and donates that socket's file
//! descriptor to the local tapdisk process over `SCM_RIGHTS` so the
//! tapdisk's own NBD client can read off it directly.

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use std::io::{IoSlice, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use sxm_common::{DpId, Error, Result, SrId, VdiId};
use tracing::{debug, info};

/// Perform the HTTP PUT handshake that establishes the NBD pipe, then hand
/// the resulting socket's fd to the tapdisk identified by `pid` (spec
/// §4.5.2).
pub async fn hand_off_nbd_socket(
    dest_host: &str,
    dest_port: u16,
    vm: &str,
    dest_sr: &SrId,
    mirror_vdi: &VdiId,
    mirror_dp: &DpId,
    tapdisk_pid: u32,
) -> Result<()> {
    let dest_host = dest_host.to_string();
    let vm = vm.to_string();
    let dest_sr = dest_sr.clone();
    let mirror_vdi = mirror_vdi.clone();
    let mirror_dp = mirror_dp.clone();

    tokio::task::spawn_blocking(move || {
        let stream = put_handshake(&dest_host, dest_port, &vm, &dest_sr, &mirror_vdi, &mirror_dp)?;
        donate_fd_to_tapdisk(stream, tapdisk_pid, &mirror_dp)
    })
    .await
    .map_err(|e| Error::Internal(format!("fd handoff task panicked: {e}")))?
}

/// Issue the PUT and read past the response headers, leaving the
/// connection positioned to carry raw NBD traffic. Blocking: must run on a
/// `spawn_blocking` thread.
fn put_handshake(
    dest_host: &str,
    dest_port: u16,
    vm: &str,
    dest_sr: &SrId,
    mirror_vdi: &VdiId,
    mirror_dp: &DpId,
) -> Result<TcpStream> {
    let path = format!(
        "/services/SM/nbd/{}/{}/{}/{}",
        urlencoding::encode(vm),
        urlencoding::encode(dest_sr),
        urlencoding::encode(mirror_vdi),
        urlencoding::encode(mirror_dp),
    );

    let mut stream = TcpStream::connect((dest_host, dest_port))
        .map_err(|e| Error::Internal(format!("connect to {dest_host}:{dest_port} failed: {e}")))?;

    let request = format!(
        "PUT {path} HTTP/1.1\r\nHost: {dest_host}\r\nConnection: Upgrade\r\nContent-Length: 0\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .map_err(|e| Error::Internal(format!("failed to send nbd PUT handshake: {e}")))?;

    let status_line = read_http_status_line(&mut stream)?;
    if !status_line.contains("200") {
        return Err(Error::backend(
            "nbd-handoff".to_string(),
            vec![path],
            status_line,
        ));
    }

    debug!(%path, "nbd socket handshake complete");
    Ok(stream)
}

fn read_http_status_line(stream: &mut TcpStream) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    let mut prev_was_cr = false;

    loop {
        stream
            .read_exact(&mut byte)
            .map_err(|e| Error::Internal(format!("failed to read handoff response: {e}")))?;
        if prev_was_cr && byte[0] == b'\n' {
            break;
        }
        prev_was_cr = byte[0] == b'\r';
        line.push(byte[0]);
    }

    // Drain the remaining header block up to the blank line separating
    // headers from body; we don't need the header values themselves.
    let mut blank_run = 0;
    loop {
        stream
            .read_exact(&mut byte)
            .map_err(|e| Error::Internal(format!("failed to read handoff headers: {e}")))?;
        if byte[0] == b'\r' || byte[0] == b'\n' {
            blank_run += 1;
            if blank_run >= 4 {
                break;
            }
        } else {
            blank_run = 0;
        }
    }

    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

/// Socket the local tapdisk control plane listens on, by convention keyed
/// on pid (spec §6.4).
fn tapdisk_control_socket(pid: u32) -> PathBuf {
    PathBuf::from(format!("/var/run/blktap-control/nbdclient{pid}"))
}

/// Donate `stream`'s underlying fd to the tapdisk identified by `pid` over
/// `SCM_RIGHTS`, sending `dp`'s name as the accompanying regular payload so
/// the tapdisk knows which datapath the fd belongs to. Verifies the full
/// name was transferred (spec §6.4).
fn donate_fd_to_tapdisk(stream: TcpStream, pid: u32, dp: &DpId) -> Result<()> {
    let socket_path = tapdisk_control_socket(pid);
    let control = UnixStream::connect(&socket_path).map_err(|e| {
        Error::Internal(format!(
            "failed to connect to tapdisk control socket {}: {e}",
            socket_path.display()
        ))
    })?;

    let payload = dp.as_bytes();
    let iov = [IoSlice::new(payload)];
    let fds = [stream.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    let sent = sendmsg::<()>(control.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
        .map_err(|e| Error::Internal(format!("sendmsg to tapdisk control socket failed: {e}")))?;

    if sent != payload.len() {
        return Err(Error::Internal(format!(
            "short write donating fd to tapdisk: sent {sent} of {} bytes",
            payload.len()
        )));
    }

    info!(pid, %dp, socket = %socket_path.display(), "nbd socket fd donated to tapdisk");
    // `stream` and `control` close here; the tapdisk now owns a dup'd fd
    // referencing the same underlying socket.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tapdisk_control_socket_path_is_keyed_on_pid() {
        assert_eq!(
            tapdisk_control_socket(4242),
            PathBuf::from("/var/run/blktap-control/nbdclient4242")
        );
    }
}
