// Child stdout/stderr capture pipes and their forwarding tasks

use crate::error::{MonitorError, Result};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tokio::net::unix::pipe::Receiver;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Which child stream a pipe carries; decides the log priority.
#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// The monitor-side ends of one child's stdout and stderr pipes.
///
/// The write ends are duplicated onto the child's stdio at launch and stay
/// open here so that restarted incarnations of the same command reuse the
/// same pipes. The read ends live inside forwarding tasks that turn child
/// output into log records. Dropping this value stops the tasks and closes
/// every descriptor.
#[derive(Debug)]
pub struct OutputPipes {
    stdout_write: OwnedFd,
    stderr_write: OwnedFd,
    readers: [JoinHandle<()>; 2],
}

impl OutputPipes {
    /// Create both pipes and spawn their forwarding tasks. Must be called
    /// from within the runtime.
    pub fn new(qualified: &str) -> Result<Self> {
        let (stdout_read, stdout_write) = Self::pipe_pair(qualified)?;
        let (stderr_read, stderr_write) = Self::pipe_pair(qualified)?;

        let stdout_rx = Self::receiver(stdout_read, qualified)?;
        let stderr_rx = Self::receiver(stderr_read, qualified)?;

        let readers = [
            tokio::spawn(forward_output(stdout_rx, qualified.to_string(), OutputStream::Stdout)),
            tokio::spawn(forward_output(stderr_rx, qualified.to_string(), OutputStream::Stderr)),
        ];

        Ok(Self {
            stdout_write,
            stderr_write,
            readers,
        })
    }

    fn pipe_pair(qualified: &str) -> Result<(OwnedFd, OwnedFd)> {
        pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| MonitorError::Pipe(format!("Unable to construct pipe for {}: {}", qualified, e)))
    }

    fn receiver(read_end: OwnedFd, qualified: &str) -> Result<Receiver> {
        Receiver::from_owned_fd(read_end)
            .map_err(|e| MonitorError::Pipe(format!("Unable to watch pipe for {}: {}", qualified, e)))
    }

    /// Raw write end for the child's stdout, for dup2 across the fork.
    pub fn stdout_fd(&self) -> RawFd {
        self.stdout_write.as_raw_fd()
    }

    /// Raw write end for the child's stderr, for dup2 across the fork.
    pub fn stderr_fd(&self) -> RawFd {
        self.stderr_write.as_raw_fd()
    }
}

impl Drop for OutputPipes {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// Forward one pipe into the log, one read per readiness event.
///
/// Each read takes at most 4096 bytes; complete lines become one record
/// each and an unterminated tail is emitted as its own record. A read error
/// other than an interruption unsubscribes the pipe for good.
async fn forward_output(receiver: Receiver, qualified: String, stream: OutputStream) {
    let mut buf = [0u8; 4096];
    loop {
        if receiver.readable().await.is_err() {
            return;
        }
        match receiver.try_read(&mut buf) {
            Ok(0) => return,
            Ok(len) => emit_lines(&buf[..len], &qualified, stream),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(
                    "Error while reading from {}, no longer logging output ({})",
                    qualified, e
                );
                return;
            }
        }
    }
}

fn emit_lines(chunk: &[u8], qualified: &str, stream: OutputStream) {
    let mut start = 0;
    for (i, byte) in chunk.iter().enumerate() {
        if *byte == b'\n' {
            emit_record(&chunk[start..i], qualified, stream);
            start = i + 1;
        }
    }
    if start < chunk.len() {
        emit_record(&chunk[start..], qualified, stream);
    }
}

fn emit_record(line: &[u8], qualified: &str, stream: OutputStream) {
    let text = String::from_utf8_lossy(line);
    match stream {
        OutputStream::Stdout => info!("{}: {}", qualified, text),
        OutputStream::Stderr => error!("{}: {}", qualified, text),
    }
}
