//! Sample UDF: prime sieve.
//!
//! The request is an optional 8-byte little-endian bound (default
//! 100000); the response is every prime up to the bound as consecutive
//! little-endian u32 values.

use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream;

use anyhow::Context;
use udfbox::frame;

const DEFAULT_BOUND: usize = 100_000;

fn main() -> anyhow::Result<()> {
    let mut stream = rpc_socket()?;
    let request = frame::read_frame(&mut stream, frame::DEFAULT_MAX_FRAME_LEN)?;
    let bound = match request.as_slice().try_into() {
        Ok(bytes) => u64::from_le_bytes(bytes) as usize,
        Err(_) => DEFAULT_BOUND,
    };

    let mut response = Vec::new();
    for prime in sieve(bound) {
        response.extend_from_slice(&(prime as u32).to_le_bytes());
    }
    frame::write_frame(&mut stream, &response, frame::DEFAULT_MAX_FRAME_LEN)?;
    Ok(())
}

fn sieve(bound: usize) -> Vec<usize> {
    if bound < 2 {
        return Vec::new();
    }
    let mut composite = vec![false; bound + 1];
    let mut primes = Vec::new();
    for n in 2..=bound {
        if composite[n] {
            continue;
        }
        primes.push(n);
        let mut multiple = n * n;
        while multiple <= bound {
            composite[multiple] = true;
            multiple += n;
        }
    }
    primes
}

fn rpc_socket() -> anyhow::Result<UnixStream> {
    let arg = std::env::args().nth(1).context("missing fd argument")?;
    let fd: i32 = arg.parse().context("fd argument not numeric")?;
    // SAFETY: the launcher handed us ownership of this descriptor.
    Ok(unsafe { UnixStream::from_raw_fd(fd) })
}
