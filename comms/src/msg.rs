use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize};

type Header = u64;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR: Header = 0;
const CONTROL: Header = 1;
const VALUES: Header = 2;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Scalars of one reduction round, laid out in the order of the round's keys.
    Values(&'a [f64]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First message of a non hub rank, announces who is connecting.
    Join { rank: usize, world_size: usize },
    /// Sent by the hub once every rank joined.
    Ready,
    /// Announces the keys of the values frame that follows.
    Reduce { round: u64, keys: Vec<String> },
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }

    /// A short name of the message kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(_) => "control",
            Msg::Data(Payload::Values(_)) => "data/values",
            Msg::Err(_) => "err",
        }
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL.to_be_bytes());

                // `Command` derives its Serialize impl and holds no map with
                // non string keys, writing it into a vec can't fail.
                serde_json::to_writer(buf, cmd).expect("command serialization is infallible");
                None
            }
            Msg::Data(Payload::Values(values)) => {
                buf.extend_from_slice(&VALUES.to_be_bytes());
                Some(bytemuck::cast_slice(values))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at_mut(HEADER_SIZE);
        let mut kind = [0; HEADER_SIZE];
        kind.copy_from_slice(kind_buf);

        match Header::from_be_bytes(kind) {
            ERR => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            VALUES => {
                let values: &mut [f64] = bytemuck::try_cast_slice_mut(rest).map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("malformed values payload: {err}"),
                    )
                })?;

                Ok(Self::Data(Payload::Values(values)))
            }
            kind => Self::invalid_kind(kind),
        }
    }
}
