use crate::{MilterError, SmfiActions, SmfiProtocol};
use bytes::Buf;

/// A parsed command from the MTA. The single-letter codes are the
/// SMFIC_* constants from the milter protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 'O': option negotiation
    OptNeg {
        version: u32,
        actions: SmfiActions,
        protocol: SmfiProtocol,
    },
    /// 'D': macro definitions for a subsequent command
    Macro {
        cmdcode: u8,
        macros: Vec<(String, String)>,
    },
    /// 'C': new connection
    Connect {
        hostname: String,
        family: SocketFamily,
        port: u16,
        address: Option<String>,
    },
    /// 'H': HELO/EHLO
    Helo { hostname: String },
    /// 'M': MAIL FROM, address first, then ESMTP arguments
    MailFrom { args: Vec<String> },
    /// 'R': RCPT TO, address first, then ESMTP arguments
    RcptTo { args: Vec<String> },
    /// 'T': DATA
    Data,
    /// 'L': one header field
    Header { name: String, value: String },
    /// 'N': end of headers
    EndOfHeaders,
    /// 'B': a chunk of body content
    Body { chunk: Vec<u8> },
    /// 'E': end of body; the filter emits its modifications now
    EndOfBody,
    /// 'A': abandon the current message
    Abort,
    /// 'Q': close down
    Quit,
    /// 'K': close down this message, reuse the connection
    QuitNewConnection,
    /// 'U': an SMTP command the MTA did not recognise
    Unknown { arg: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFamily {
    Inet,
    Inet6,
    Unix,
    Unknown,
}

fn malformed(command: &'static str, reason: impl Into<String>) -> MilterError {
    MilterError::Malformed {
        command,
        reason: reason.into(),
    }
}

/// Split a payload of NUL-terminated strings
fn split_strings(command: &'static str, payload: &[u8]) -> Result<Vec<String>, MilterError> {
    let mut strings = vec![];
    let mut rest = payload;
    while !rest.is_empty() {
        match memchr::memchr(0, rest) {
            Some(idx) => {
                strings.push(String::from_utf8_lossy(&rest[..idx]).to_string());
                rest = &rest[idx + 1..];
            }
            None => return Err(malformed(command, "string missing NUL terminator")),
        }
    }
    Ok(strings)
}

fn take_string<'a>(
    command: &'static str,
    payload: &mut &'a [u8],
) -> Result<String, MilterError> {
    match memchr::memchr(0, payload) {
        Some(idx) => {
            let value = String::from_utf8_lossy(&payload[..idx]).to_string();
            *payload = &payload[idx + 1..];
            Ok(value)
        }
        None => Err(malformed(command, "string missing NUL terminator")),
    }
}

pub fn parse_command(code: u8, payload: &[u8]) -> Result<Command, MilterError> {
    match code {
        b'O' => {
            if payload.len() < 12 {
                return Err(malformed("OPTNEG", "payload too short"));
            }
            let mut buf = payload;
            let version = buf.get_u32();
            let actions = SmfiActions::from_bits_truncate(buf.get_u32());
            let protocol = SmfiProtocol::from_bits_truncate(buf.get_u32());
            Ok(Command::OptNeg {
                version,
                actions,
                protocol,
            })
        }
        b'D' => {
            if payload.is_empty() {
                return Err(malformed("MACRO", "missing command code"));
            }
            let cmdcode = payload[0];
            let strings = split_strings("MACRO", &payload[1..])?;
            let macros = strings
                .chunks(2)
                .filter(|pair| pair.len() == 2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            Ok(Command::Macro { cmdcode, macros })
        }
        b'C' => {
            let mut rest = payload;
            let hostname = take_string("CONNECT", &mut rest)?;
            if rest.is_empty() {
                return Err(malformed("CONNECT", "missing address family"));
            }
            let family = match rest[0] {
                b'4' => SocketFamily::Inet,
                b'6' => SocketFamily::Inet6,
                b'L' => SocketFamily::Unix,
                b'U' => SocketFamily::Unknown,
                other => {
                    return Err(malformed(
                        "CONNECT",
                        format!("unknown address family {:?}", other as char),
                    ))
                }
            };
            rest = &rest[1..];

            if family == SocketFamily::Unknown {
                return Ok(Command::Connect {
                    hostname,
                    family,
                    port: 0,
                    address: None,
                });
            }

            if rest.len() < 2 {
                return Err(malformed("CONNECT", "missing port"));
            }
            let mut buf = rest;
            let port = buf.get_u16();
            rest = buf;
            let address = take_string("CONNECT", &mut rest)?;
            Ok(Command::Connect {
                hostname,
                family,
                port,
                address: Some(address),
            })
        }
        b'H' => {
            let mut rest = payload;
            let hostname = take_string("HELO", &mut rest)?;
            Ok(Command::Helo { hostname })
        }
        b'M' => Ok(Command::MailFrom {
            args: split_strings("MAIL", payload)?,
        }),
        b'R' => Ok(Command::RcptTo {
            args: split_strings("RCPT", payload)?,
        }),
        b'T' => Ok(Command::Data),
        b'L' => {
            let mut rest = payload;
            let name = take_string("HEADER", &mut rest)?;
            let value = take_string("HEADER", &mut rest)?;
            Ok(Command::Header { name, value })
        }
        b'N' => Ok(Command::EndOfHeaders),
        b'B' => Ok(Command::Body {
            chunk: payload.to_vec(),
        }),
        b'E' => Ok(Command::EndOfBody),
        b'A' => Ok(Command::Abort),
        b'Q' => Ok(Command::Quit),
        b'K' => Ok(Command::QuitNewConnection),
        b'U' => Ok(Command::Unknown {
            arg: payload.to_vec(),
        }),
        other => Err(MilterError::UnknownCommand(other as char)),
    }
}
