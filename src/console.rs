//! Byte streams to a running VM's serial console or VNC framebuffer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use virt::{connect::Connect, domain::Domain, stream::Stream, sys};

use crate::errors::{ComputeError, Result};
use crate::pool::LibvirtPool;
use crate::repository::VirtualMachineStream;
use crate::types::VirtualMachineGraphic;

/// Serial console over a daemon stream. Holds its own connection, outside
/// the pool, until closed. Stream calls run on the blocking thread pool.
pub struct ConsoleStream {
    pool: Arc<LibvirtPool>,
    vm_id: String,
    stream: Option<Arc<Stream>>,
    conn: Option<Connect>,
}

impl ConsoleStream {
    pub fn open(pool: Arc<LibvirtPool>, vm_id: &str) -> Result<Self> {
        let conn = pool.open_dedicated()?;
        let opened = (|| -> Result<Stream> {
            let domain = Domain::lookup_by_name(&conn, vm_id).map_err(|e| ComputeError::from_libvirt(vm_id, e))?;
            let stream = Stream::new(&conn, 0).map_err(|e| ComputeError::from_libvirt(vm_id, e))?;
            domain
                .open_console(None, &stream, sys::VIR_DOMAIN_CONSOLE_FORCE)
                .map_err(|e| ComputeError::from_libvirt(vm_id, e))?;
            Ok(stream)
        })();

        match opened {
            Ok(stream) => {
                debug!("Opened console stream for {}", vm_id);
                Ok(Self {
                    pool,
                    vm_id: vm_id.to_string(),
                    stream: Some(Arc::new(stream)),
                    conn: Some(conn),
                })
            }
            Err(e) => {
                pool.close_dedicated(conn);
                Err(e)
            }
        }
    }

    fn stream(&self) -> Result<Arc<Stream>> {
        self.stream
            .clone()
            .ok_or_else(|| ComputeError::Resource(format!("console stream for {} is closed", self.vm_id)))
    }

    fn shutdown(&mut self) -> Result<()> {
        let finished = match self.stream.take().map(Arc::try_unwrap) {
            Some(Ok(stream)) => stream.finish().map_err(|e| ComputeError::from_libvirt(&self.vm_id, e)),
            Some(Err(_)) => {
                warn!("Console stream for {} is still in use; closing without finish", self.vm_id);
                Ok(())
            }
            None => Ok(()),
        };
        if let Some(conn) = self.conn.take() {
            self.pool.close_dedicated(conn);
        }
        finished
    }
}

#[async_trait]
impl VirtualMachineStream for ConsoleStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream()?;
        let vm_id = self.vm_id.clone();
        read_blocking(buf, move |chunk| {
            stream.recv(chunk).map_err(|e| ComputeError::from_libvirt(&vm_id, e))
        })
        .await
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream()?;
        let vm_id = self.vm_id.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || stream.send(&data).map_err(|e| ComputeError::from_libvirt(&vm_id, e)))
            .await
            .map_err(|e| ComputeError::Resource(format!("console write for {} did not complete: {}", self.vm_id, e)))?
    }

    async fn close(&mut self) -> Result<()> {
        debug!("Closing console stream for {}", self.vm_id);
        self.shutdown()
    }
}

impl Drop for ConsoleStream {
    fn drop(&mut self) {
        if self.conn.is_some() {
            if let Err(e) = self.shutdown() {
                warn!("Failed to close console stream for {}: {}", self.vm_id, e);
            }
        }
    }
}

/// Runs a blocking `recv` on the blocking thread pool through an owned
/// buffer, then copies what it read into `buf`.
pub(crate) async fn read_blocking<F>(buf: &mut [u8], recv: F) -> Result<usize>
where
    F: FnOnce(&mut [u8]) -> Result<usize> + Send + 'static,
{
    let mut chunk = vec![0u8; buf.len()];
    let (chunk, read) = tokio::task::spawn_blocking(move || {
        let read = recv(&mut chunk);
        (chunk, read)
    })
    .await
    .map_err(|e| ComputeError::Resource(format!("console read did not complete: {}", e)))?;

    let read = read?.min(buf.len());
    buf[..read].copy_from_slice(&chunk[..read]);
    Ok(read)
}

/// Raw TCP connection to the VM's VNC server.
pub struct GraphicStream {
    vm_id: String,
    socket: Option<TcpStream>,
}

impl GraphicStream {
    pub async fn connect(vm_id: &str, graphic: &VirtualMachineGraphic) -> Result<Self> {
        if graphic.port <= 0 {
            return Err(ComputeError::Unsupported(format!("{} has no graphic port allocated", vm_id)));
        }
        let port = u16::try_from(graphic.port).map_err(|_| {
            ComputeError::Unsupported(format!("{} reports invalid graphic port {}", vm_id, graphic.port))
        })?;
        let host = match graphic.listen.as_str() {
            "" | "0.0.0.0" => "127.0.0.1",
            "::" => "::1",
            listen => listen,
        };
        let socket = TcpStream::connect((host, port))
            .await
            .map_err(|e| ComputeError::Resource(format!("graphic connection to {}:{} failed: {}", host, port, e)))?;
        debug!("Connected graphic stream for {} to {}:{}", vm_id, host, port);
        Ok(Self {
            vm_id: vm_id.to_string(),
            socket: Some(socket),
        })
    }

    fn socket(&mut self) -> Result<&mut TcpStream> {
        self.socket
            .as_mut()
            .ok_or_else(|| ComputeError::Resource(format!("graphic stream for {} is closed", self.vm_id)))
    }
}

#[async_trait]
impl VirtualMachineStream for GraphicStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let vm_id = self.vm_id.clone();
        self.socket()?
            .read(buf)
            .await
            .map_err(|e| ComputeError::Resource(format!("graphic stream for {}: {}", vm_id, e)))
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let vm_id = self.vm_id.clone();
        let socket = self.socket()?;
        socket
            .write_all(data)
            .await
            .map_err(|e| ComputeError::Resource(format!("graphic stream for {}: {}", vm_id, e)))?;
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.shutdown().await {
                debug!("Graphic stream shutdown for {}: {}", self.vm_id, e);
            }
        }
        Ok(())
    }
}
