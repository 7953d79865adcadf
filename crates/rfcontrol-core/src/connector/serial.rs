//! Serial port connector

use std::collections::BTreeMap;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serialport::{SerialPort, SerialPortInfo, SerialPortType};

use super::reader::ReaderThread;
use super::{read_setting, ConnectionState, Connector, ConnectorKind, DataHandler, HandlerSlot};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::lock;

/// Read timeout of the reader thread; bounds how long `disconnect` waits
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Number of data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    /// 5 bits
    Five,
    /// 6 bits
    Six,
    /// 7 bits
    Seven,
    /// 8 bits
    Eight,
}

impl FromStr for DataBits {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).trim_start_matches("data") {
            "5" => Ok(DataBits::Five),
            "6" => Ok(DataBits::Six),
            "7" => Ok(DataBits::Seven),
            "8" => Ok(DataBits::Eight),
            _ => Err(invalid("databits", s)),
        }
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

/// Parity checking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// No parity bit
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

impl FromStr for Parity {
    type Err = Error;

    // Numeric ids are the ones written by older configuration files
    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).trim_end_matches("parity") {
            "none" | "no" | "0" => Ok(Parity::None),
            "even" | "2" => Ok(Parity::Even),
            "odd" | "3" => Ok(Parity::Odd),
            _ => Err(invalid("parity", s)),
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }
}

/// Number of stop bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    /// One stop bit
    One,
    /// Two stop bits
    Two,
}

impl FromStr for StopBits {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).trim_end_matches("stop") {
            "1" | "one" => Ok(StopBits::One),
            "2" | "two" => Ok(StopBits::Two),
            _ => Err(invalid("stopbits", s)),
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Flow control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    /// No flow control
    None,
    /// RTS/CTS
    Hardware,
    /// XON/XOFF
    Software,
}

impl FromStr for FlowControl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).trim_end_matches("control") {
            "none" | "noflow" | "0" => Ok(FlowControl::None),
            "hardware" | "rtscts" | "1" => Ok(FlowControl::Hardware),
            "software" | "xonxoff" | "2" => Ok(FlowControl::Software),
            _ => Err(invalid("flowcontrol", s)),
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
            FlowControl::Software => serialport::FlowControl::Software,
        }
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase().replace(['_', '-', ' '], "")
}

fn invalid(key: &str, value: &str) -> Error {
    Error::InvalidSetting {
        key: key.to_string(),
        message: format!("unsupported value '{}'", value),
    }
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialOptions {
    /// Device path such as `/dev/ttyUSB0` or `COM3`
    pub port_name: String,
    /// Line speed in baud
    pub baud_rate: u32,
    /// Data bits per character
    pub data_bits: DataBits,
    /// Parity mode
    pub parity: Parity,
    /// Stop bits per character
    pub stop_bits: StopBits,
    /// Flow control mode
    pub flow_control: FlowControl,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

/// Connector over a local serial port
pub struct SerialConnector {
    options: Mutex<SerialOptions>,
    /// Whether the last `configure` applied every recognized key
    configured_cleanly: AtomicBool,
    port: Mutex<Option<Box<dyn SerialPort>>>,
    reader: Mutex<Option<ReaderThread>>,
    connected: Arc<AtomicBool>,
    handlers: HandlerSlot,
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialConnector {
    /// Create a connector with default line settings and no port
    pub fn new() -> Self {
        Self::with_options(SerialOptions::default())
    }

    /// Create a connector with the given line settings
    pub fn with_options(options: SerialOptions) -> Self {
        Self {
            options: Mutex::new(options),
            configured_cleanly: AtomicBool::new(true),
            port: Mutex::new(None),
            reader: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            handlers: HandlerSlot::default(),
        }
    }

    /// Current line settings
    pub fn options(&self) -> SerialOptions {
        lock(&self.options).clone()
    }
}

impl Connector for SerialConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Serial
    }

    fn configure(&self, settings: &dyn Settings) {
        const OWNER: &str = "SerialConnector";
        let mut clean = true;
        let mut options = lock(&self.options);

        if let Some(baud) =
            read_setting::<u32>(OWNER, settings, "baudrate", |b| *b > 0, &mut clean)
        {
            options.baud_rate = baud;
        }
        if let Some(bits) =
            read_setting::<DataBits>(OWNER, settings, "databits", |_| true, &mut clean)
        {
            options.data_bits = bits;
        }
        if let Some(parity) =
            read_setting::<Parity>(OWNER, settings, "parity", |_| true, &mut clean)
        {
            options.parity = parity;
        }
        if let Some(bits) =
            read_setting::<StopBits>(OWNER, settings, "stopbits", |_| true, &mut clean)
        {
            options.stop_bits = bits;
        }
        if let Some(flow) =
            read_setting::<FlowControl>(OWNER, settings, "flowcontrol", |_| true, &mut clean)
        {
            options.flow_control = flow;
        }
        if let Some(name) =
            read_setting::<String>(OWNER, settings, "portname", |n| !n.is_empty(), &mut clean)
        {
            options.port_name = name;
        }

        if self.is_connected() {
            tracing::debug!("SerialConnector: new settings take effect on the next connect");
        }
        self.configured_cleanly.store(clean, Ordering::Release);
    }

    fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let options = self.options();
        if options.port_name.is_empty() {
            let err = Error::InvalidSetting {
                key: "portname".to_string(),
                message: "no serial port configured".to_string(),
            };
            tracing::error!("SerialConnector: {}", err);
            return Err(err);
        }

        let port = serialport::new(&options.port_name, options.baud_rate)
            .data_bits(options.data_bits.into())
            .parity(options.parity.into())
            .stop_bits(options.stop_bits.into())
            .flow_control(options.flow_control.into())
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| {
                tracing::error!(
                    "SerialConnector: opening {} failed with error '{}'",
                    options.port_name,
                    e
                );
                Error::from(e)
            })?;

        let reader_port = port.try_clone()?;
        let reader = ReaderThread::spawn(
            &format!("serial-reader {}", options.port_name),
            reader_port,
            self.handlers.clone(),
            self.connected.clone(),
        )?;

        *lock(&self.port) = Some(port);
        *lock(&self.reader) = Some(reader);
        self.connected.store(true, Ordering::Release);
        tracing::debug!("SerialConnector: opened {}", options.port_name);
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(reader) = lock(&self.reader).take() {
            reader.stop();
        }
        lock(&self.port).take();
    }

    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::Acquire) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn write(&self, data: &[u8]) {
        if data.is_empty() || !self.is_connected() {
            return;
        }
        if let Some(port) = lock(&self.port).as_mut() {
            if let Err(e) = port.write_all(data) {
                tracing::warn!("SerialConnector: write of {} bytes failed: {}", data.len(), e);
            }
        }
    }

    fn set_data_handler(&self, handler: DataHandler) {
        self.handlers.set(handler);
    }

    fn info(&self) -> String {
        if !self.configured_cleanly.load(Ordering::Acquire) {
            return "SerialConnector: This connector is in an error-state: not all settings could be \
                    changed in the last call to configure"
                .to_string();
        }

        let options = self.options();
        format!(
            "SerialConnector:\n\tportname: {}\n\tbaud rate: {}\n\tdata bits: {:?}\n\tparity: {:?}\n\tstop bits: {:?}\n\tflow control: {:?}\n\tstate: {:?}",
            if options.port_name.is_empty() { "<not set>" } else { options.port_name.as_str() },
            options.baud_rate,
            options.data_bits,
            options.parity,
            options.stop_bits,
            options.flow_control,
            self.state(),
        )
    }
}

impl Drop for SerialConnector {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// An available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,
    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,
    /// USB product ID (if USB device)
    pub pid: Option<u16>,
    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb) => (Some(usb.vid), Some(usb.pid), usb.product),
            _ => (None, None, None),
        };
        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

/// Sort key placing USB adapters (ttyUSB*, then ttyACM*) before other ports,
/// numerically by suffix
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in [(0u8, "ttyUSB"), (1, "ttyACM")] {
        if let Some(rest) = basename.strip_prefix(prefix) {
            return (rank, rest.parse().unwrap_or(usize::MAX), basename.to_string());
        }
    }
    (2, 0, basename.to_string())
}

/// Serial ports known to the OS, for diagnostics
pub fn list_ports() -> Vec<PortInfo> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            tracing::warn!("list_ports: unable to enumerate serial ports: {}", e);
            Vec::new()
        }
    };

    let unique: BTreeMap<String, PortInfo> = ports
        .into_iter()
        .map(PortInfo::from)
        .map(|p| (p.name.clone(), p))
        .collect();
    let mut ports: Vec<PortInfo> = unique.into_values().collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::config::JsonSettings;

    #[test]
    fn test_parse_line_settings() {
        assert_eq!("8".parse::<DataBits>().unwrap(), DataBits::Eight);
        assert_eq!("Data7".parse::<DataBits>().unwrap(), DataBits::Seven);
        assert_eq!("EvenParity".parse::<Parity>().unwrap(), Parity::Even);
        assert_eq!("0".parse::<Parity>().unwrap(), Parity::None);
        assert!("mark".parse::<Parity>().is_err());
        assert_eq!("TwoStop".parse::<StopBits>().unwrap(), StopBits::Two);
        assert!("1.5".parse::<StopBits>().is_err());
        assert_eq!(
            "HardwareControl".parse::<FlowControl>().unwrap(),
            FlowControl::Hardware
        );
        assert_eq!("2".parse::<FlowControl>().unwrap(), FlowControl::Software);
    }

    #[test]
    fn test_configure_applies_valid_settings() {
        let connector = SerialConnector::new();
        let settings = JsonSettings::new(json!({
            "portname": "/dev/ttyUSB3",
            "baudrate": 19200,
            "databits": 7,
            "parity": "odd",
            "stopbits": 2,
            "flowcontrol": "hardware"
        }));
        connector.configure(&settings);

        let options = connector.options();
        assert_eq!(options.port_name, "/dev/ttyUSB3");
        assert_eq!(options.baud_rate, 19200);
        assert_eq!(options.data_bits, DataBits::Seven);
        assert_eq!(options.parity, Parity::Odd);
        assert_eq!(options.stop_bits, StopBits::Two);
        assert_eq!(options.flow_control, FlowControl::Hardware);
        assert!(connector.info().contains("/dev/ttyUSB3"));
    }

    #[test]
    fn test_invalid_setting_keeps_previous_value() {
        let connector = SerialConnector::new();
        connector.configure(&JsonSettings::new(json!({ "baudrate": 115200 })));
        connector.configure(&JsonSettings::new(json!({
            "baudrate": -5,
            "parity": "space",
            "portname": "COM4"
        })));

        let options = connector.options();
        assert_eq!(options.baud_rate, 115200);
        assert_eq!(options.parity, Parity::None);
        // Later keys are still applied
        assert_eq!(options.port_name, "COM4");
        assert!(connector.info().contains("error-state"));
    }

    #[test]
    fn test_connect_without_port_fails() {
        let connector = SerialConnector::new();
        assert!(connector.connect().is_err());
        assert!(!connector.is_connected());
    }

    #[test]
    fn test_write_while_disconnected_is_dropped() {
        let connector = SerialConnector::new();
        connector.write(&[0x06]);
        connector.write(&[]);
        connector.disconnect();
        connector.disconnect();
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_port_sorting() {
        let mut names = vec![
            "/dev/ttyACM0",
            "/dev/ttyUSB10",
            "/dev/someport",
            "/dev/ttyUSB2",
        ];
        names.sort_by_key(|n| port_sort_key(n));
        assert_eq!(
            names,
            vec!["/dev/ttyUSB2", "/dev/ttyUSB10", "/dev/ttyACM0", "/dev/someport"]
        );
    }
}
