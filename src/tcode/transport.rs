// src/tcode/transport.rs

//! Write-only transports for T-Code frames
//!
//! The device never answers, so a transport only needs to push bytes out.
//! [`SerialTransport`] talks to real hardware; [`StdoutTransport`] is a dry
//! run that prints frames instead.

use log::info;
use std::io::{self, Write};
use std::time::Duration;

/// Default baud rate of T-Code firmware.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

const WRITE_TIMEOUT: Duration = Duration::from_millis(50);

pub trait Transport: Send {
    /// Writes one complete frame.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Human readable name for logs.
    fn describe(&self) -> String;
}

pub struct SerialTransport {
    path: String,
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    /// Opens a serial port.
    ///
    /// # Arguments
    /// * `path` - Port name, e.g. `/dev/ttyUSB0` or `COM3`
    /// * `baud_rate` - Baud rate agreed with the device firmware
    ///
    /// # Returns
    /// * `Ok(SerialTransport)` - Port ready for writing
    /// * `Err(String)` - Error message if the port cannot be opened
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, String> {
        let port = serialport::new(path, baud_rate)
            .timeout(WRITE_TIMEOUT)
            .open()
            .map_err(|e| format!("Failed to open serial port {}: {}", path, e))?;
        info!("Opened serial port {} at {} baud", path, baud_rate);
        Ok(Self {
            path: path.to_string(),
            port,
        })
    }
}

impl Transport for SerialTransport {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// Prints frames to stdout instead of a device.
pub struct StdoutTransport;

impl Transport for StdoutTransport {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(frame)?;
        stdout.flush()
    }

    fn describe(&self) -> String {
        "stdout".to_string()
    }
}

/// Opens the transport named by `path`; `-` selects the stdout dry run.
pub fn open_transport(path: &str, baud_rate: u32) -> Result<Box<dyn Transport>, String> {
    if path == "-" {
        info!("Using stdout as T-Code transport");
        return Ok(Box::new(StdoutTransport));
    }
    Ok(Box::new(SerialTransport::open(path, baud_rate)?))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every frame; can be told to fail writes.
    #[derive(Clone, Default)]
    pub struct RecordingTransport {
        pub frames: Arc<Mutex<Vec<String>>>,
        pub failing: Arc<Mutex<bool>>,
    }

    impl RecordingTransport {
        pub fn frames(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }

        pub fn set_failing(&self, failing: bool) {
            *self.failing.lock().unwrap() = failing;
        }
    }

    impl Transport for RecordingTransport {
        fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            if *self.failing.lock().unwrap() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
            }
            self.frames
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(frame).into_owned());
            Ok(())
        }

        fn describe(&self) -> String {
            "recording".to_string()
        }
    }
}
