//! Serial console access
//!
//! The board's console is a USB CDC-ACM device. The line settings are applied
//! with `stty`, then the device node is opened non-blocking and polled through
//! the runtime's reactor. A read that is dropped leaves nothing parked on the
//! device, so the next reader sees all of the board's output.
//!
//! Regular files (console captures standing in for a device) cannot be
//! registered with the reactor and are read through `tokio::fs`.

use crate::{HarnessError, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::Command;

/// Serial console settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Device node
    pub device: PathBuf,
    /// Line speed; `None` leaves the line settings untouched
    pub baud: Option<u32>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/ttyACM0"),
            baud: Some(115_200),
        }
    }
}

impl SerialConfig {
    /// `stty` arguments for raw 8N1 at the configured speed
    pub fn stty_args(&self) -> Option<Vec<String>> {
        let baud = self.baud?;
        let mut args = vec![
            "-F".to_string(),
            self.device.display().to_string(),
            baud.to_string(),
        ];
        args.extend(
            ["raw", "-echo", "cs8", "-parenb", "-cstopb", "-crtscts"]
                .iter()
                .map(|s| s.to_string()),
        );
        Some(args)
    }
}

/// An open serial console
#[derive(Debug)]
pub enum SerialPort {
    /// Character device or FIFO, read when the reactor reports it readable
    Device(AsyncFd<File>),
    /// Regular file
    Capture(tokio::fs::File),
}

impl AsyncRead for SerialPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SerialPort::Capture(file) => Pin::new(file).poll_read(cx, buf),
            SerialPort::Device(fd) => loop {
                let mut guard = ready!(fd.poll_read_ready(cx))?;
                let unfilled = buf.initialize_unfilled();
                match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                    Ok(result) => {
                        let n = result?;
                        buf.advance(n);
                        return Poll::Ready(Ok(()));
                    }
                    Err(_would_block) => continue,
                }
            },
        }
    }
}

/// Configure the line and open the device for reading
pub async fn open_serial(config: &SerialConfig) -> Result<SerialPort> {
    if let Some(args) = config.stty_args() {
        let status = Command::new("stty")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| HarnessError::Spawn {
                tool: "stty".to_string(),
                source,
            })?;
        if !status.success() {
            return Err(HarnessError::ToolFailed {
                tool: format!("stty -F {}", config.device.display()),
                status: status.to_string(),
            });
        }
    }

    let context = || format!("opening {}", config.device.display());
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
        .open(&config.device)
        .map_err(|e| HarnessError::io(context(), e))?;

    let is_regular = file
        .metadata()
        .map_err(|e| HarnessError::io(context(), e))?
        .is_file();
    if is_regular {
        return Ok(SerialPort::Capture(tokio::fs::File::from_std(file)));
    }

    AsyncFd::new(file)
        .map(SerialPort::Device)
        .map_err(|e| HarnessError::io(context(), e))
}
