use serialport::SerialPortType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::protocol::BAUD_RATE;
use super::{Result, SerialDeviceInfo, SerialError};

/// Byte-level transport the engine reads telemetry from and writes commands to.
///
/// Implemented for the real serial port and for scripted transports in tests.
#[async_trait::async_trait]
pub trait SerialPortIO: Send {
    async fn send_data(&mut self, data: &[u8]) -> Result<()>;

    /// Wait for the next chunk. Returns 0 when the port was closed by the peer.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn close(&mut self) -> Result<()>;
}

struct NativeSerialPort {
    stream: SerialStream,
}

#[async_trait::async_trait]
impl SerialPortIO for NativeSerialPort {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream.read(buf).await?)
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Owned handle to the probe's serial port.
pub struct SerialInterface {
    io: Option<Box<dyn SerialPortIO>>,
    device_info: Option<SerialDeviceInfo>,
}

impl SerialInterface {
    pub fn new() -> Self {
        Self {
            io: None,
            device_info: None,
        }
    }

    /// Wrap an already open transport.
    pub fn from_io(io: Box<dyn SerialPortIO>) -> Self {
        Self {
            io: Some(io),
            device_info: None,
        }
    }

    /// List serial ports present on this machine
    pub fn discover_ports() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let devices = ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: Some(usb_info.vid),
                    pid: Some(usb_info.pid),
                    serial_number: usb_info.serial_number,
                    manufacturer: usb_info.manufacturer,
                    product: usb_info.product,
                },
                _ => SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: None,
                    pid: None,
                    serial_number: None,
                    manufacturer: None,
                    product: None,
                },
            })
            .collect();
        Ok(devices)
    }

    /// Open a port at the probe's fixed baud rate
    pub fn connect(&mut self, port_name: &str) -> Result<()> {
        self.connect_with_baud(port_name, BAUD_RATE)
    }

    pub fn connect_with_baud(&mut self, port_name: &str, baud_rate: u32) -> Result<()> {
        let stream = tokio_serial::new(port_name, baud_rate)
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", port_name, e)))?;

        let device_info = Self::discover_ports()
            .unwrap_or_default()
            .into_iter()
            .find(|p| p.port_name == port_name)
            .unwrap_or(SerialDeviceInfo {
                port_name: port_name.to_string(),
                vid: None,
                pid: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            });

        self.io = Some(Box::new(NativeSerialPort { stream }));
        self.device_info = Some(device_info);

        log::info!("Connected to probe on {} at {} baud", port_name, baud_rate);
        Ok(())
    }

    /// Close the port. Errors are logged, never returned.
    pub async fn disconnect(&mut self) {
        if let Some(device) = &self.device_info {
            log::info!("Disconnecting from {}", device.port_name);
        }
        if let Some(mut io) = self.io.take() {
            if let Err(e) = io.close().await {
                log::warn!("Error while closing serial port: {}", e);
            }
        }
        self.device_info = None;
    }

    pub fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    pub fn device_info(&self) -> Option<&SerialDeviceInfo> {
        self.device_info.as_ref()
    }

    pub async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let io = self.io.as_mut().ok_or(SerialError::NotConnected)?;
        io.send_data(data).await
    }

    /// Send one newline terminated command line.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        log::debug!("Sending command: {}", command.trim_end());
        if command.ends_with('\n') {
            self.send_data(command.as_bytes()).await
        } else {
            self.send_data(format!("{}\n", command).as_bytes()).await
        }
    }

    /// Wait for the next chunk from the device. No timeout is applied.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let io = self.io.as_mut().ok_or(SerialError::NotConnected)?;
        io.read_chunk(buf).await
    }
}

impl Default for SerialInterface {
    fn default() -> Self {
        Self::new()
    }
}
