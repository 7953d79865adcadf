//! KJL echo protocol
//!
//! Commands are ASCII terminated by `CR`. The generator echoes the command and
//! appends its answer, so one reply reads `<command>CR<answer>CR`. An answer
//! starting with `N` means the command was not accepted.

use std::fmt;

use crate::buffer::ReceiveBuffer;
use crate::error::{Error, Result};
use crate::queue::to_hex;

/// Command and answer terminator
pub const CR: u8 = b'\r';

/// Capacitor positions accepted by the generator, in percent
pub const CAPACITOR_RANGE: (i32, i32) = (0, 100);

/// Outbound commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KjlCommand {
    /// `G`
    OutputOn,
    /// `S`
    OutputOff,
    /// `<watts>.0 W`
    SetPower(u32),
    /// `<percent> MPL`
    SetLoadCapacitor(u8),
    /// `<percent> MPT`
    SetTuneCapacitor(u8),
    /// `LPS`
    QueryLoadCapacitor,
    /// `TPS`
    QueryTuneCapacitor,
    /// `0?`
    QueryExternalFeedback,
    /// `W?`
    QueryForwardPower,
    /// `R?`
    QueryReflectedPower,
    /// `Q`, answered with setpoint, forward and reflected power
    QueryStatus,
}

impl fmt::Display for KjlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KjlCommand::OutputOn => f.write_str("G"),
            KjlCommand::OutputOff => f.write_str("S"),
            KjlCommand::SetPower(watts) => write!(f, "{}.0 W", watts),
            KjlCommand::SetLoadCapacitor(position) => write!(f, "{} MPL", position),
            KjlCommand::SetTuneCapacitor(position) => write!(f, "{} MPT", position),
            KjlCommand::QueryLoadCapacitor => f.write_str("LPS"),
            KjlCommand::QueryTuneCapacitor => f.write_str("TPS"),
            KjlCommand::QueryExternalFeedback => f.write_str("0?"),
            KjlCommand::QueryForwardPower => f.write_str("W?"),
            KjlCommand::QueryReflectedPower => f.write_str("R?"),
            KjlCommand::QueryStatus => f.write_str("Q"),
        }
    }
}

impl KjlCommand {
    /// Bytes to put on the wire, including the trailing `CR`
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.to_string().into_bytes();
        bytes.push(CR);
        bytes
    }
}

/// A reply the generator can send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Echo of an accepted setting command
    Accepted(String),
    /// Answer to `0?`
    ExternalFeedback(i32),
    /// Answer to `LPS`
    LoadCapacitor(i32),
    /// Answer to `TPS`
    TuneCapacitor(i32),
    /// Answer to `W?`
    ForwardPower(i32),
    /// Answer to `R?`
    ReflectedPower(i32),
    /// Answer to `Q`
    Status {
        /// Power setpoint in watts
        setpoint: i32,
        /// Forward power in watts
        forward_power: i32,
        /// Reflected power in watts
        reflected_power: i32,
    },
}

/// Remove every complete reply (everything up to and including the second
/// `CR`) from `buffer`
pub fn split_replies(buffer: &mut ReceiveBuffer) -> Vec<Vec<u8>> {
    let mut replies = Vec::new();
    while buffer.count(CR) >= 2 {
        let Some(first) = buffer.position_from(CR, 0) else {
            break;
        };
        let Some(second) = buffer.position_from(CR, first + 1) else {
            break;
        };
        replies.push(buffer.split_to(second + 1));
    }
    replies
}

fn is_setting_echo(command: &[u8]) -> bool {
    command == b"G"
        || command == b"S"
        || command.ends_with(b" W")
        || command.ends_with(b" MPL")
        || command.ends_with(b" MPT")
}

fn parse_int(bytes: &[u8], what: &str, raw: &[u8]) -> Result<i32> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
        .ok_or_else(|| {
            Error::Parse(format!(
                "invalid {} in reply '{}' (hex)",
                what,
                to_hex(raw)
            ))
        })
}

/// Interpret one reply as returned by [`split_replies`]
pub fn parse_reply(raw: &[u8]) -> Result<Reply> {
    let first = raw.iter().position(|b| *b == CR).ok_or_else(|| {
        Error::MalformedFrame(format!("no <cr> in reply '{}' (hex)", to_hex(raw)))
    })?;
    let second = raw[first + 1..]
        .iter()
        .position(|b| *b == CR)
        .map(|i| i + first + 1)
        .ok_or_else(|| {
            Error::MalformedFrame(format!(
                "missing second <cr> in reply '{}' (hex)",
                to_hex(raw)
            ))
        })?;

    let command = &raw[..first];
    let answer = &raw[first + 1..second];

    if answer.first() == Some(&b'N') {
        return Err(Error::CommandRejected(
            String::from_utf8_lossy(command).into_owned(),
        ));
    }

    match command {
        [b'0', b'?', ..] => Ok(Reply::ExternalFeedback(parse_int(
            answer,
            "external feedback",
            raw,
        )?)),
        [b'L', ..] => Ok(Reply::LoadCapacitor(parse_int(
            answer,
            "load capacitor position",
            raw,
        )?)),
        [b'T', ..] => Ok(Reply::TuneCapacitor(parse_int(
            answer,
            "tune capacitor position",
            raw,
        )?)),
        [b'R', ..] | [b'W', ..] => {
            // Power is the first four characters of the answer
            let field = raw.get(3..(3 + 4).min(second)).unwrap_or_default();
            let watts = parse_int(field, "power", raw)?;
            Ok(if command[0] == b'R' {
                Reply::ReflectedPower(watts)
            } else {
                Reply::ForwardPower(watts)
            })
        }
        [b'Q', ..] => {
            // XXXXXXX aaaa bbbb ccc dddd: status flags, setpoint, forward,
            // reflected and maximum power
            let text = std::str::from_utf8(answer).map_err(|_| {
                Error::Parse(format!("status reply is not text '{}' (hex)", to_hex(raw)))
            })?;
            let tokens: Vec<&str> = text.split_whitespace().collect();
            if tokens.len() < 4 {
                return Err(Error::Parse(format!(
                    "corrupted reply to status query '{}' (hex)",
                    to_hex(raw)
                )));
            }
            let field = |i: usize, what: &str| parse_int(tokens[i].as_bytes(), what, raw);
            Ok(Reply::Status {
                setpoint: field(1, "setpoint")?,
                forward_power: field(2, "forward power")?,
                reflected_power: field(3, "reflected power")?,
            })
        }
        _ if is_setting_echo(command) => Ok(Reply::Accepted(
            String::from_utf8_lossy(command).into_owned(),
        )),
        _ => Err(Error::MalformedFrame(format!(
            "unknown reply command '{}' (hex)",
            to_hex(raw)
        ))),
    }
}
