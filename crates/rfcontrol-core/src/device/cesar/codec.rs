//! Cesar AE bus framing
//!
//! ```text
//! +--------+---------+----------+-----------+----------+
//! | header | command | [length] | data ...  | checksum |
//! +--------+---------+----------+-----------+----------+
//! header = address << 3 | n
//! ```
//!
//! `n` is the data length for up to 6 bytes. `n == 7` means the length follows
//! the command byte. The checksum is chosen so that all frame bytes XOR to 0.
//! Single `ACK`/`NACK` bytes acknowledge the previous frame.

use byteorder::{ByteOrder, LittleEndian};

use crate::buffer::ReceiveBuffer;
use crate::error::{Error, Result};
use crate::queue::{to_hex, CommandFrame};

/// Positive acknowledgment
pub const ACK: u8 = 0x06;
/// Negative acknowledgment
pub const NACK: u8 = 0x15;
/// Highest bus address
pub const MAX_ADDRESS: u8 = 0x1F;

const EXTENDED_LENGTH: u8 = 7;

/// Command codes used by this library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CesarCommand {
    /// Switch RF output off
    OutputOff = 1,
    /// Switch RF output on
    OutputOn = 2,
    /// Power setpoint, 16-bit watts
    SetPowerSetPoint = 8,
    /// Match network mode, 0 manual, 1 automatic
    SetMatchNetworkControl = 13,
    /// Control mode, 2 remote, 6 local
    SelectActiveControlMode = 14,
    /// Reported by the generator, never sent
    ErrorMatchingNetworkNotConnected = 53,
    /// Load capacitor target, 16-bit
    MoveLoadCapPosition = 112,
    /// Tune capacitor target, 16-bit
    MoveTuneCapPosition = 122,
    /// Setpoint and regulation mode
    ReportSetPointAndRegulationMode = 0xA4,
    /// Forward power
    ReportForwardPower = 0xA5,
    /// Reflected power
    ReportReflectedPower = 0xA6,
    /// External feedback
    ReportExternalFeedback = 0xA8,
    /// Load and tune capacitor positions in tenths
    ReportCapacitorPositions = 0xAF,
    /// Fault status register
    ReportFaultStatusRegister = 0xDF,
}

impl CesarCommand {
    /// Command for a wire code, if it is one this library knows
    pub fn from_u8(code: u8) -> Option<Self> {
        use CesarCommand::*;
        Some(match code {
            1 => OutputOff,
            2 => OutputOn,
            8 => SetPowerSetPoint,
            13 => SetMatchNetworkControl,
            14 => SelectActiveControlMode,
            53 => ErrorMatchingNetworkNotConnected,
            112 => MoveLoadCapPosition,
            122 => MoveTuneCapPosition,
            0xA4 => ReportSetPointAndRegulationMode,
            0xA5 => ReportForwardPower,
            0xA6 => ReportReflectedPower,
            0xA8 => ReportExternalFeedback,
            0xAF => ReportCapacitorPositions,
            0xDF => ReportFaultStatusRegister,
            _ => return None,
        })
    }

    /// Wire code
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// A decoded frame: command code and data bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw command code
    pub command: u8,
    /// Data bytes, without command and length bytes
    pub data: Vec<u8>,
}

impl Packet {
    /// Known command of this packet
    pub fn command(&self) -> Option<CesarCommand> {
        CesarCommand::from_u8(self.command)
    }

    /// Little-endian 16-bit value at `offset` in the data
    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        self.data.get(offset..offset + 2).map(LittleEndian::read_u16)
    }
}

/// Something recognized in the receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// The in-flight command was accepted
    Ack,
    /// The in-flight command was refused
    Nack,
    /// A well-formed frame
    Packet(Packet),
    /// A complete frame whose checksum did not match
    Corrupt(Vec<u8>),
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Encode a 16-bit value as it appears on the bus
pub fn u16_bytes(value: u16) -> [u8; 2] {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, value);
    buf
}

/// Build a complete frame for `address`
pub fn encode_frame(address: u8, command: u8, data: &[u8]) -> Result<CommandFrame> {
    if address > MAX_ADDRESS {
        return Err(Error::OutOfRange {
            what: "bus address",
            value: address as i64,
            min: 0,
            max: MAX_ADDRESS as i64,
        });
    }
    if data.len() > u8::MAX as usize {
        return Err(Error::MalformedFrame(format!(
            "{} data bytes do not fit in one frame",
            data.len()
        )));
    }

    let mut frame = Vec::with_capacity(data.len() + 4);
    if data.len() < EXTENDED_LENGTH as usize {
        frame.push((address << 3) | data.len() as u8);
        frame.push(command);
    } else {
        frame.push((address << 3) | EXTENDED_LENGTH);
        frame.push(command);
        frame.push(data.len() as u8);
    }
    frame.extend_from_slice(data);
    frame.push(checksum(&frame));

    Ok(CommandFrame::new(frame))
}

/// Decode everything complete in `buffer` and consume it.
///
/// An incomplete frame at the end stays buffered. A `NACK` discards whatever
/// follows it in the buffer.
pub fn decode(buffer: &mut ReceiveBuffer) -> Vec<Decoded> {
    let mut decoded = Vec::new();
    let bytes = buffer.as_slice();
    let mut pos = 0;

    while pos < bytes.len() {
        match bytes[pos] {
            ACK => {
                decoded.push(Decoded::Ack);
                pos += 1;
            }
            NACK => {
                decoded.push(Decoded::Nack);
                let dropped = bytes.len() - pos - 1;
                if dropped > 0 {
                    tracing::debug!(
                        "CesarGenerator: discarding {} bytes received after NACK",
                        dropped
                    );
                }
                pos = bytes.len();
            }
            header => {
                let (data_len, offset) = if header & 0x07 == EXTENDED_LENGTH {
                    match bytes.get(pos + 2) {
                        Some(len) => (*len as usize, 3),
                        None => break,
                    }
                } else {
                    ((header & 0x07) as usize, 2)
                };

                let frame_len = offset + data_len + 1;
                let Some(frame) = bytes.get(pos..pos + frame_len) else {
                    break;
                };

                if checksum(frame) == 0 {
                    decoded.push(Decoded::Packet(Packet {
                        command: frame[1],
                        data: frame[offset..offset + data_len].to_vec(),
                    }));
                } else {
                    decoded.push(Decoded::Corrupt(frame.to_vec()));
                }
                pos += frame_len;
            }
        }
    }

    if pos < bytes.len() {
        tracing::trace!(
            "CesarGenerator: keeping incomplete data {}",
            to_hex(&bytes[pos..])
        );
    }
    buffer.consume(pos);
    decoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_bytes(chunks: &[&[u8]]) -> (Vec<Decoded>, ReceiveBuffer) {
        let mut buffer = ReceiveBuffer::new();
        let mut decoded = Vec::new();
        for chunk in chunks {
            buffer.extend(chunk);
            decoded.extend(decode(&mut buffer));
        }
        (decoded, buffer)
    }

    #[test]
    fn test_set_power_setpoint_300() {
        let frame =
            encode_frame(0, CesarCommand::SetPowerSetPoint.code(), &u16_bytes(300)).unwrap();
        assert_eq!(frame.as_bytes(), &[0x02, 0x08, 0x2C, 0x01, 0x27]);
        assert_eq!(checksum(frame.as_bytes()), 0);
    }

    #[test]
    fn test_address_in_header() {
        let frame = encode_frame(3, CesarCommand::OutputOn.code(), &[]).unwrap();
        assert_eq!(frame.as_bytes()[0], 3 << 3);
        assert_eq!(frame.len(), 3);

        assert!(matches!(
            encode_frame(32, CesarCommand::OutputOn.code(), &[]),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_extended_length() {
        let data: Vec<u8> = (1..=9).collect();
        let frame = encode_frame(1, 0xAF, &data).unwrap();
        let bytes = frame.as_bytes();
        assert_eq!(bytes[0], (1 << 3) | 7);
        assert_eq!(bytes[1], 0xAF);
        assert_eq!(bytes[2], 9);
        assert_eq!(&bytes[3..12], data.as_slice());
        assert_eq!(checksum(bytes), 0);

        let (decoded, rest) = decode_bytes(&[bytes]);
        assert_eq!(
            decoded,
            vec![Decoded::Packet(Packet {
                command: 0xAF,
                data
            })]
        );
        assert!(rest.is_empty());
    }

    #[test]
    fn test_round_trip() {
        let frame = encode_frame(0, 0xA5, &u16_bytes(1234)).unwrap();
        let (decoded, _) = decode_bytes(&[frame.as_bytes()]);
        match &decoded[..] {
            [Decoded::Packet(packet)] => {
                assert_eq!(packet.command(), Some(CesarCommand::ReportForwardPower));
                assert_eq!(packet.u16_at(0), Some(1234));
            }
            other => panic!("unexpected decode result {:?}", other),
        }
    }

    #[test]
    fn test_chunking_does_not_change_result() {
        let mut stream = vec![ACK];
        stream.extend_from_slice(encode_frame(0, 0xA5, &u16_bytes(500)).unwrap().as_bytes());
        stream.extend_from_slice(encode_frame(0, 0xA6, &u16_bytes(7)).unwrap().as_bytes());
        let extended = encode_frame(0, 0xAF, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        stream.extend_from_slice(extended.as_bytes());
        stream.push(ACK);

        let (whole, _) = decode_bytes(&[stream.as_slice()]);
        assert_eq!(whole.len(), 5);

        let bytewise: Vec<&[u8]> = stream.chunks(1).collect();
        let (split, rest) = decode_bytes(&bytewise);
        assert_eq!(split, whole);
        assert!(rest.is_empty());

        for cut in 1..stream.len() {
            let (halves, rest) = decode_bytes(&[&stream[..cut], &stream[cut..]]);
            assert_eq!(halves, whole, "split at {}", cut);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn test_incomplete_tail_is_kept() {
        let frame = encode_frame(0, 0xA8, &u16_bytes(42)).unwrap();
        let bytes = frame.as_bytes();
        let (decoded, rest) = decode_bytes(&[&[ACK][..], &bytes[..3]]);
        assert_eq!(decoded, vec![Decoded::Ack]);
        assert_eq!(rest.as_slice(), &bytes[..3]);
    }

    #[test]
    fn test_nack_discards_remaining_bytes() {
        let frame = encode_frame(0, 0xA5, &u16_bytes(1)).unwrap();
        let mut stream = vec![NACK];
        stream.extend_from_slice(frame.as_bytes());

        let (decoded, rest) = decode_bytes(&[stream.as_slice()]);
        assert_eq!(decoded, vec![Decoded::Nack]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_bad_checksum() {
        let mut bytes = encode_frame(0, 0xA5, &u16_bytes(100)).unwrap().as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let (decoded, rest) = decode_bytes(&[bytes.as_slice(), &[ACK][..]]);
        assert_eq!(decoded, vec![Decoded::Corrupt(bytes.clone()), Decoded::Ack]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_short_packet_fields() {
        let packet = Packet {
            command: 0xA5,
            data: vec![0x01],
        };
        assert_eq!(packet.u16_at(0), None);
        assert_eq!(CesarCommand::from_u8(0x42), None);
    }
}
