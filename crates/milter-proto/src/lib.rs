//! The Sendmail mail-filter (milter) protocol, version 6, as spoken by
//! Sendmail and Postfix: SMFIC commands from the MTA, SMFIR replies from
//! the filter, and the option negotiation bitsets.

use thiserror::Error;

mod codec;
mod command;
mod reply;

pub use codec::{read_packet, write_reply, MAX_PACKET_SIZE};
pub use command::{parse_command, Command, SocketFamily};
pub use reply::Reply;

/// The protocol version we negotiate
pub const MILTER_VERSION: u32 = 6;

#[derive(Error, Debug)]
pub enum MilterError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("oversized frame: {0} bytes")]
    OversizedFrame(u32),
    #[error("unknown command {0:?}")]
    UnknownCommand(char),
    #[error("malformed {command} payload: {reason}")]
    Malformed {
        command: &'static str,
        reason: String,
    },
}

bitflags::bitflags! {
    /// SMFIF_*: the actions the filter may ask the MTA to take
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct SmfiActions: u32 {
        const ADD_HDRS = 0x0001;
        const CHG_BODY = 0x0002;
        const ADD_RCPT = 0x0004;
        const DEL_RCPT = 0x0008;
        const CHG_HDRS = 0x0010;
        const QUARANTINE = 0x0020;
        const CHG_FROM = 0x0040;
        const ADD_RCPT_PAR = 0x0080;
        const SETSYMLIST = 0x0100;
    }
}

bitflags::bitflags! {
    /// SMFIP_*: protocol content the MTA may skip or alter
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct SmfiProtocol: u32 {
        const NO_CONNECT = 0x0000_0001;
        const NO_HELO = 0x0000_0002;
        const NO_MAIL = 0x0000_0004;
        const NO_RCPT = 0x0000_0008;
        const NO_BODY = 0x0000_0010;
        const NO_HDRS = 0x0000_0020;
        const NO_EOH = 0x0000_0040;
        const NR_HDR = 0x0000_0080;
        const NO_UNKNOWN = 0x0000_0100;
        const NO_DATA = 0x0000_0200;
        const SKIP = 0x0000_0400;
        const RCPT_REJ = 0x0000_0800;
        const NR_CONN = 0x0000_1000;
        const NR_HELO = 0x0000_2000;
        const NR_MAIL = 0x0000_4000;
        const NR_RCPT = 0x0000_8000;
        const NR_DATA = 0x0001_0000;
        const NR_UNKN = 0x0002_0000;
        const NR_EOH = 0x0004_0000;
        const NR_BODY = 0x0008_0000;
        /// Header values are passed with their leading space intact,
        /// and the filter must emit them the same way
        const HDR_LEADSPC = 0x0010_0000;
    }
}
