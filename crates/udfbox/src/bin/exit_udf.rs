//! Sample UDF: reads its request and exits without replying, closing its
//! socket. Exists to exercise crash reporting.

use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream;

use anyhow::Context;
use udfbox::frame;

fn main() -> anyhow::Result<()> {
    let mut stream = rpc_socket()?;
    frame::read_frame(&mut stream, frame::DEFAULT_MAX_FRAME_LEN)?;
    std::process::exit(42);
}

fn rpc_socket() -> anyhow::Result<UnixStream> {
    let arg = std::env::args().nth(1).context("missing fd argument")?;
    let fd: i32 = arg.parse().context("fd argument not numeric")?;
    // SAFETY: the launcher handed us ownership of this descriptor.
    Ok(unsafe { UnixStream::from_raw_fd(fd) })
}
