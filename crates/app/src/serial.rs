use std::{
    io::{self, Write},
    path::Path,
    time::Duration,
};

use lightshow_core::SerialSink;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// DMX512 over a UART: 8N2 at the configured baud, with the break driven
/// through the port's break control.
pub struct SerialPortSink {
    port: Box<dyn SerialPort>,
}

impl SerialPortSink {
    pub fn open(path: &Path, baud_rate: u32) -> io::Result<Self> {
        let port = serialport::new(path.to_string_lossy(), baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::Two)
            .flow_control(FlowControl::None)
            .timeout(WRITE_TIMEOUT)
            .open()?;
        tracing::info!(?path, baud_rate, "serial port opened");
        Ok(Self { port })
    }
}

impl SerialSink for SerialPortSink {
    fn configure(&mut self, baud_rate: u32) -> io::Result<()> {
        self.port.set_baud_rate(baud_rate)?;
        self.port.set_data_bits(DataBits::Eight)?;
        self.port.set_parity(Parity::None)?;
        self.port.set_stop_bits(StopBits::Two)?;
        Ok(())
    }

    fn set_break(&mut self, active: bool) -> io::Result<()> {
        if active {
            self.port.set_break()?;
        } else {
            self.port.clear_break()?;
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl std::fmt::Debug for SerialPortSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPortSink")
            .field("port", &self.port.name())
            .finish()
    }
}
