//! PF_KEY socket transport
//!
//! A raw `PF_KEY`/`PF_KEY_V2` socket opened through `socket2` and driven by
//! tokio's `AsyncFd`. The handle is cheap to clone: the transaction engine
//! writes through one clone while the run loop reads through another.

use std::io::{Read, Write};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tracing::debug;

use super::constants::{MAX_MSG_LEN, PF_KEY_V2};
use super::engine::KernelTransport;
use crate::error::{Error, Result};

/// Non-blocking PF_KEY socket
#[derive(Clone)]
pub struct PfKeySocket {
    fd: Arc<AsyncFd<Socket>>,
}

impl PfKeySocket {
    /// Open the key-management socket
    ///
    /// Must be called from within a tokio runtime. Opening `PF_KEY`
    /// normally needs elevated privileges.
    pub fn open() -> Result<Self> {
        let socket = Socket::new(
            Domain::from(libc::PF_KEY),
            Type::RAW,
            Some(Protocol::from(i32::from(PF_KEY_V2))),
        )?;
        socket.set_nonblocking(true)?;
        let fd = AsyncFd::new(socket)?;
        debug!("PF_KEY socket open");
        Ok(Self { fd: Arc::new(fd) })
    }

    /// A buffer large enough for any PF_KEY message
    pub fn recv_buffer() -> Vec<u8> {
        vec![0u8; MAX_MSG_LEN]
    }

    /// Wait for and read one message
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| (&*inner.get_ref()).read(buf)) {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
    }
}

impl KernelTransport for PfKeySocket {
    fn send(&mut self, wire: &[u8]) -> Result<()> {
        let written = (&*self.fd.get_ref()).write(wire)?;
        if written != wire.len() {
            return Err(Error::Io(format!(
                "short PF_KEY write: {} of {} bytes",
                written,
                wire.len()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PfKeySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PfKeySocket").finish_non_exhaustive()
    }
}
