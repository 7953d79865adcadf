//! TCP connector

use std::io::Write;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::reader::ReaderThread;
use super::{read_setting, ConnectionState, Connector, ConnectorKind, DataHandler, HandlerSlot};
use crate::config::{Settings, DEFAULT_ETHERNET_CONNECT_WAIT_MS};
use crate::error::{Error, Result};
use crate::lock;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// TCP endpoint settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetOptions {
    /// Host name or IP address
    pub address: String,
    /// TCP port
    pub port: u16,
    /// Upper bound for `connect`, name resolution included
    pub connect_wait: Duration,
}

impl Default for EthernetOptions {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 0,
            connect_wait: Duration::from_millis(DEFAULT_ETHERNET_CONNECT_WAIT_MS),
        }
    }
}

/// Connector over a TCP socket
pub struct EthernetConnector {
    options: Mutex<EthernetOptions>,
    stream: Mutex<Option<TcpStream>>,
    reader: Mutex<Option<ReaderThread>>,
    connected: Arc<AtomicBool>,
    handlers: HandlerSlot,
}

impl Default for EthernetConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl EthernetConnector {
    /// Create a connector without endpoint
    pub fn new() -> Self {
        Self::with_options(EthernetOptions::default())
    }

    /// Create a connector for the given endpoint
    pub fn with_options(options: EthernetOptions) -> Self {
        Self {
            options: Mutex::new(options),
            stream: Mutex::new(None),
            reader: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            handlers: HandlerSlot::default(),
        }
    }

    /// Current endpoint settings
    pub fn options(&self) -> EthernetOptions {
        lock(&self.options).clone()
    }

    /// Resolve the endpoint before `deadline`. IP literals are used as is;
    /// host names are looked up on a helper thread so a slow resolver cannot
    /// hold `connect` past the deadline.
    fn resolve(options: &EthernetOptions, deadline: Instant) -> Result<Vec<SocketAddr>> {
        if let Ok(ip) = options.address.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, options.port)]);
        }

        let host = options.address.clone();
        let port = options.port;
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("ethernet-resolve {}", host))
            .spawn(move || {
                let resolved = (host.as_str(), port)
                    .to_socket_addrs()
                    .map(|addrs| addrs.collect::<Vec<_>>());
                let _ = tx.send(resolved);
            })?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(Ok(addrs)) => Ok(addrs),
            Ok(Err(e)) => Err(Error::ConnectionFailed(format!(
                "cannot resolve {}: {}",
                options.address, e
            ))),
            Err(_) => Err(Error::ConnectionFailed(format!(
                "resolving {} timed out",
                options.address
            ))),
        }
    }

    /// Try every resolved address until one connects or the wait runs out
    fn open(options: &EthernetOptions) -> Result<TcpStream> {
        let deadline = Instant::now() + options.connect_wait;
        let addrs = Self::resolve(options, deadline)?;

        let mut last_error = None;
        for addr in addrs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }

        Err(Error::ConnectionFailed(match last_error {
            Some(e) => format!("{}:{}: {}", options.address, options.port, e),
            None => format!("{}:{}: no address to connect to", options.address, options.port),
        }))
    }
}

impl Connector for EthernetConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Ethernet
    }

    fn configure(&self, settings: &dyn Settings) {
        const OWNER: &str = "EthernetConnector";
        let mut clean = true;
        let mut options = lock(&self.options);

        if let Some(address) =
            read_setting::<String>(OWNER, settings, "address", |a| !a.is_empty(), &mut clean)
        {
            options.address = address;
        }
        if let Some(port) = read_setting::<u16>(OWNER, settings, "port", |p| *p > 0, &mut clean) {
            options.port = port;
        }
        if let Some(wait) =
            read_setting::<u64>(OWNER, settings, "waittime", |w| *w > 0, &mut clean)
        {
            options.connect_wait = Duration::from_millis(wait);
        }

        if !clean {
            tracing::warn!("EthernetConnector: not all settings could be applied");
        }
    }

    fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let options = self.options();
        if options.address.is_empty() || options.port == 0 {
            let err = Error::InvalidSetting {
                key: "address".to_string(),
                message: "address and port must be set".to_string(),
            };
            tracing::error!("EthernetConnector: {}", err);
            return Err(err);
        }

        let stream = Self::open(&options).map_err(|e| {
            tracing::error!("EthernetConnector: connection error: {}", e);
            e
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("EthernetConnector: unable to disable Nagle: {}", e);
        }

        let reader_stream = stream.try_clone()?;
        reader_stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let reader = ReaderThread::spawn(
            &format!("ethernet-reader {}:{}", options.address, options.port),
            reader_stream,
            self.handlers.clone(),
            self.connected.clone(),
        )?;

        *lock(&self.stream) = Some(stream);
        *lock(&self.reader) = Some(reader);
        self.connected.store(true, Ordering::Release);
        tracing::debug!(
            "EthernetConnector: connected to {}:{}",
            options.address,
            options.port
        );
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(stream) = lock(&self.stream).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(reader) = lock(&self.reader).take() {
            reader.stop();
        }
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
        if let Some(stream) = lock(&self.stream).as_mut() {
            if let Err(e) = stream.write_all(data) {
                tracing::warn!("EthernetConnector: write of {} bytes failed: {}", data.len(), e);
            }
        }
    }

    fn set_data_handler(&self, handler: DataHandler) {
        self.handlers.set(handler);
    }

    fn info(&self) -> String {
        let options = self.options();
        format!(
            "EthernetConnector:\n\tIP Address: {}\n\tPort: {}\n\tConnect wait: {} ms\n\tstate: {:?}",
            if options.address.is_empty() { "<not set>" } else { options.address.as_str() },
            options.port,
            options.connect_wait.as_millis(),
            self.state(),
        )
    }
}

impl Drop for EthernetConnector {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Read;
    use std::net::TcpListener;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_configure() {
        let connector = EthernetConnector::new();
        connector.configure(&settings(&[
            ("address", "192.168.0.20"),
            ("port", "2000"),
            ("waittime", "250"),
        ]));
        let options = connector.options();
        assert_eq!(options.address, "192.168.0.20");
        assert_eq!(options.port, 2000);
        assert_eq!(options.connect_wait, Duration::from_millis(250));

        connector.configure(&settings(&[("port", "70000"), ("waittime", "0")]));
        let options = connector.options();
        assert_eq!(options.port, 2000);
        assert_eq!(options.connect_wait, Duration::from_millis(250));
        assert!(connector.info().contains("192.168.0.20"));
    }

    #[test]
    fn test_default_wait() {
        assert_eq!(
            EthernetOptions::default().connect_wait,
            Duration::from_millis(3000)
        );
    }

    #[test]
    fn test_connect_requires_endpoint() {
        let connector = EthernetConnector::new();
        assert!(matches!(
            connector.connect(),
            Err(Error::InvalidSetting { .. })
        ));
    }

    #[test]
    fn test_refused_connection_fails() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let connector = EthernetConnector::with_options(EthernetOptions {
            address: "127.0.0.1".to_string(),
            port,
            connect_wait: Duration::from_millis(500),
        });
        assert!(connector.connect().is_err());
        assert!(!connector.is_connected());
    }

    #[test]
    fn test_ip_literal_resolves_without_lookup() {
        let options = EthernetOptions {
            address: "127.0.0.1".to_string(),
            port: 4001,
            connect_wait: Duration::from_millis(100),
        };
        let addrs = EthernetConnector::resolve(&options, Instant::now()).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:4001".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_expired_deadline_fails_host_lookup() {
        let options = EthernetOptions {
            address: "generator.invalid".to_string(),
            port: 4001,
            connect_wait: Duration::from_millis(100),
        };
        let result = EthernetConnector::resolve(&options, Instant::now());
        assert!(matches!(result, Err(Error::ConnectionFailed(_))));
    }

    #[test]
    #[ignore = "needs a network that silently drops packets to 10.255.255.1"]
    fn test_unreachable_host_times_out_after_wait() {
        let wait = Duration::from_millis(300);
        let connector = EthernetConnector::with_options(EthernetOptions {
            address: "10.255.255.1".to_string(),
            port: 9,
            connect_wait: wait,
        });
        let started = Instant::now();
        let err = connector.connect().unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.to_string().contains("timed out"), "{}", err);
        assert!(elapsed >= wait / 2, "gave up after {:?}", elapsed);
        assert!(elapsed < wait * 5, "gave up after {:?}", elapsed);
    }

    #[test]
    fn test_round_trip_with_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();
        let connector = EthernetConnector::with_options(EthernetOptions {
            address: "127.0.0.1".to_string(),
            port,
            connect_wait: Duration::from_millis(1000),
        });
        connector.set_data_handler(Arc::new(move |data: &[u8]| {
            let _ = tx.send(data.to_vec());
        }));
        connector.connect().unwrap();
        assert!(connector.is_connected());

        let (mut peer, _) = listener.accept().unwrap();
        connector.write(b"HOFISTATU");
        let mut buf = [0u8; 9];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"HOFISTATU");

        peer.write_all(&[0x06]).unwrap();
        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, vec![0x06]);

        connector.disconnect();
        connector.disconnect();
        assert!(!connector.is_connected());
    }
}
