use std::collections::HashMap;
use std::io::Read;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use pretty_assertions::assert_eq;
use rfcontrol_core::connector::{ConnectionState, DataHandler, EthernetConnector};
use rfcontrol_core::device::cesar::codec::{encode_frame, u16_bytes, CesarCommand, ACK, NACK};
use rfcontrol_core::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rfcontrol_core=debug")
        .with_test_writer()
        .try_init();
}

fn setup() -> (CesarGenerator, MemoryConnector, EventBus) {
    init_tracing();
    let bus = EventBus::default();
    let connector = MemoryConnector::new();
    let generator = CesarGenerator::with_connector(Box::new(connector.clone()), bus.clone());
    generator.connect().unwrap();
    (generator, connector, bus)
}

fn frame(command: CesarCommand, data: &[u8]) -> Vec<u8> {
    encode_frame(0, command.code(), data)
        .unwrap()
        .as_bytes()
        .to_vec()
}

/// The generator's side of one query: acknowledge it, then answer
fn ack_and_reply(command: CesarCommand, data: &[u8]) -> Vec<u8> {
    let mut bytes = vec![ACK];
    bytes.extend(frame(command, data));
    bytes
}

fn capacitor_data(load: u16, tune: u16) -> Vec<u8> {
    let mut data = u16_bytes(load).to_vec();
    data.extend_from_slice(&u16_bytes(tune));
    data
}

fn full_cycle() -> Vec<u8> {
    let mut stream = Vec::new();
    stream.extend(ack_and_reply(
        CesarCommand::ReportSetPointAndRegulationMode,
        &u16_bytes(300),
    ));
    stream.extend(ack_and_reply(
        CesarCommand::ReportForwardPower,
        &u16_bytes(295),
    ));
    stream.extend(ack_and_reply(
        CesarCommand::ReportReflectedPower,
        &u16_bytes(5),
    ));
    stream.extend(ack_and_reply(
        CesarCommand::ReportExternalFeedback,
        &u16_bytes(120),
    ));
    stream.extend(ack_and_reply(
        CesarCommand::ReportCapacitorPositions,
        &capacitor_data(4000, 5000),
    ));
    stream
}

#[test]
fn test_full_reading_is_published_once() {
    let (generator, connector, bus) = setup();
    let mut events = bus.subscribe();

    generator.query_all().unwrap();
    assert_eq!(connector.written().len(), 1);

    connector.feed(&full_cycle());
    assert_eq!(generator.pending_commands(), 0);

    generator.update();
    generator.update();

    match events.try_recv().unwrap() {
        DeviceEvent::ParametersReady { device, reading } => {
            assert_eq!(device, generator.id());
            assert_eq!(reading.setpoint, 300);
            assert_eq!(reading.forward_power, 295);
            assert_eq!(reading.reflected_power, 5);
            assert_eq!(reading.external_feedback, 120);
            assert_eq!(reading.load_cap_position, 400);
            assert_eq!(reading.tune_cap_position, 500);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(events.try_recv().is_err());
    assert!(generator.parameters().is_empty());
}

#[test]
fn test_incomplete_reading_is_not_published() {
    let (generator, connector, bus) = setup();
    let mut events = bus.subscribe();

    generator.query_forward_power().unwrap();
    connector.feed(&ack_and_reply(
        CesarCommand::ReportForwardPower,
        &u16_bytes(10),
    ));
    generator.update();

    assert!(events.try_recv().is_err());
    assert_eq!(generator.parameters().forward_power, Some(10));
}

#[test]
fn test_every_query_and_reply_ack_is_written() {
    let (generator, connector, _) = setup();
    generator.query_all().unwrap();
    connector.feed(&full_cycle());

    let written = connector.take_written();
    let queries: Vec<&Vec<u8>> = written.iter().filter(|w| w.as_slice() != [ACK]).collect();
    let acks = written.iter().filter(|w| w.as_slice() == [ACK]).count();

    assert_eq!(
        queries,
        vec![
            &frame(CesarCommand::ReportSetPointAndRegulationMode, &[]),
            &frame(CesarCommand::ReportForwardPower, &[]),
            &frame(CesarCommand::ReportReflectedPower, &[]),
            &frame(CesarCommand::ReportExternalFeedback, &[]),
            &frame(CesarCommand::ReportCapacitorPositions, &[]),
        ]
    );
    assert_eq!(acks, 5);
}

#[test]
fn test_byte_wise_delivery_matches_single_read() {
    let (whole, whole_connector, _) = setup();
    whole.query_all().unwrap();
    whole_connector.feed(&full_cycle());

    let (split, split_connector, _) = setup();
    split.query_all().unwrap();
    for byte in full_cycle() {
        split_connector.feed(&[byte]);
    }

    assert_eq!(split.parameters(), whole.parameters());
    assert_eq!(split_connector.written(), whole_connector.written());
}

#[test]
fn test_ten_nacks_drop_the_command() {
    let (generator, connector, _) = setup();
    generator.output_on().unwrap();
    generator.set_target_power(300).unwrap();

    for _ in 0..10 {
        connector.feed(&[NACK]);
    }

    let written = connector.take_written();
    let output_on = frame(CesarCommand::OutputOn, &[]);
    assert_eq!(written.len(), 11);
    assert!(written[..10].iter().all(|w| *w == output_on));
    assert_eq!(written[10], vec![0x02, 0x08, 0x2C, 0x01, 0x27]);
    assert_eq!(generator.pending_commands(), 1);
}

#[test]
fn test_nine_nacks_then_ack() {
    let (generator, connector, _) = setup();
    generator.output_on().unwrap();
    generator.set_target_power(300).unwrap();

    for _ in 0..9 {
        connector.feed(&[NACK]);
    }
    assert_eq!(generator.pending_commands(), 2);

    connector.feed(&[ACK]);
    assert_eq!(generator.pending_commands(), 1);
    assert_eq!(
        connector.written().last().unwrap(),
        &frame(CesarCommand::SetPowerSetPoint, &u16_bytes(300))
    );
}

#[test]
fn test_queue_is_unbounded() {
    let (generator, connector, _) = setup();
    for _ in 0..1000 {
        generator.query_forward_power().unwrap();
    }
    assert_eq!(generator.pending_commands(), 1000);
    assert_eq!(connector.written().len(), 1);
}

#[test]
fn test_commands_queue_while_disconnected() {
    let (generator, connector, _) = setup();
    generator.disconnect();
    generator.output_on().unwrap();

    assert!(connector.written().is_empty());
    assert_eq!(generator.pending_commands(), 1);
}

#[test]
fn test_control_and_match_network_commands() {
    let (generator, connector, _) = setup();
    generator.set_control_mode(ControlMode::Local).unwrap();
    connector.feed(&[ACK]);
    generator
        .set_matchnetwork_mode(MatchNetworkMode::Automatic)
        .unwrap();
    connector.feed(&[ACK]);
    generator.set_load_capacitor_position(500).unwrap();

    assert_eq!(
        connector.take_written(),
        vec![
            frame(CesarCommand::SelectActiveControlMode, &[6]),
            frame(CesarCommand::SetMatchNetworkControl, &[1]),
            frame(CesarCommand::MoveLoadCapPosition, &u16_bytes(500)),
        ]
    );
    assert_eq!(generator.control_mode(), Some(ControlMode::Local));
}

#[test]
fn test_through_device_enum() {
    init_tracing();
    let connector = MemoryConnector::new();
    let device = Device::new(DeviceKind::Cesar, EventBus::default());
    device.connectable().set_connector(Box::new(connector.clone()));
    device.connectable().connect().unwrap();

    device.power().unwrap().output_off().unwrap();
    assert_eq!(
        connector.take_written(),
        vec![frame(CesarCommand::OutputOff, &[])]
    );
}

/// Generator that acknowledges every command from within `write`, the way a
/// transport delivering its read callback synchronously would
#[derive(Default)]
struct EchoAckConnector {
    connected: AtomicBool,
    acknowledge: AtomicBool,
    handler: Mutex<Option<DataHandler>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Connector for EchoAckConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Memory
    }

    fn configure(&self, _settings: &dyn Settings) {}

    fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn write(&self, data: &[u8]) {
        self.written.lock().unwrap().push(data.to_vec());
        if !self.acknowledge.load(Ordering::SeqCst) {
            return;
        }
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(&[ACK][..]);
        }
    }

    fn set_data_handler(&self, handler: DataHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn info(&self) -> String {
        "EchoAckConnector".to_string()
    }
}

#[test]
fn test_acknowledgment_inside_write_drains_queue() {
    init_tracing();
    let connector = EchoAckConnector {
        acknowledge: AtomicBool::new(true),
        ..Default::default()
    };
    let written = connector.written.clone();
    let generator = CesarGenerator::with_connector(Box::new(connector), EventBus::default());
    generator.connect().unwrap();

    generator.output_on().unwrap();
    generator.output_off().unwrap();
    generator.query_all().unwrap();

    assert_eq!(generator.pending_commands(), 0);
    assert_eq!(written.lock().unwrap().len(), 7);
}

#[test]
fn test_queued_commands_drain_through_nested_writes() {
    init_tracing();
    let bus = EventBus::default();
    let connector = Arc::new(EchoAckConnector::default());
    let generator = CesarGenerator::new(bus);
    generator.set_connector(Box::new(SharedConnector(connector.clone())));
    generator.connect().unwrap();

    generator.output_on().unwrap();
    generator.output_off().unwrap();
    generator.query_all().unwrap();
    assert_eq!(generator.pending_commands(), 7);
    assert_eq!(connector.written.lock().unwrap().len(), 1);

    // Every write from here on is acknowledged before it returns
    connector.acknowledge.store(true, Ordering::SeqCst);
    let handler = connector.handler.lock().unwrap().clone().unwrap();
    handler(&[ACK][..]);

    assert_eq!(generator.pending_commands(), 0);
    let written = connector.written.lock().unwrap();
    assert_eq!(written.len(), 7);
    assert_eq!(written[1], frame(CesarCommand::OutputOff, &[]));
    assert_eq!(
        written[6],
        frame(CesarCommand::ReportCapacitorPositions, &[])
    );
}

/// Lets the test keep a handle on a connector owned by the generator
struct SharedConnector(Arc<EchoAckConnector>);

impl Connector for SharedConnector {
    fn kind(&self) -> ConnectorKind {
        self.0.kind()
    }

    fn configure(&self, settings: &dyn Settings) {
        self.0.configure(settings)
    }

    fn connect(&self) -> Result<()> {
        self.0.connect()
    }

    fn disconnect(&self) {
        self.0.disconnect()
    }

    fn state(&self) -> ConnectionState {
        self.0.state()
    }

    fn write(&self, data: &[u8]) {
        self.0.write(data)
    }

    fn set_data_handler(&self, handler: DataHandler) {
        self.0.set_data_handler(handler)
    }

    fn info(&self) -> String {
        self.0.info()
    }
}

#[test]
fn test_bus_address_alongside_ethernet_settings() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut frame = [0u8; 3];
        stream.read_exact(&mut frame).unwrap();
        frame
    });

    let generator =
        CesarGenerator::with_connector(Box::new(EthernetConnector::new()), EventBus::default());
    let settings: HashMap<String, String> = [
        ("address", "127.0.0.1"),
        ("port", port.to_string().as_str()),
        ("waittime", "1000"),
        ("busaddress", "5"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    generator.init(&settings).unwrap();
    assert!(generator.is_connected());
    assert_eq!(generator.address(), 5);

    generator.output_on().unwrap();
    let received = server.join().unwrap();
    assert_eq!(received.to_vec(), frame_at(5, CesarCommand::OutputOn));

    generator.disconnect();
}

fn frame_at(address: u8, command: CesarCommand) -> Vec<u8> {
    encode_frame(address, command.code(), &[])
        .unwrap()
        .as_bytes()
        .to_vec()
}
