use crate::{SmfiActions, SmfiProtocol};

/// A reply from the filter to the MTA. The single-letter codes are the
/// SMFIR_* constants from the milter protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// 'O': our side of option negotiation
    OptNeg {
        version: u32,
        actions: SmfiActions,
        protocol: SmfiProtocol,
    },
    /// 'c': proceed
    Continue,
    /// 'a': accept the message unconditionally
    Accept,
    /// 'i': insert a header at a 0-based index in the header list
    InsertHeader {
        index: u32,
        name: String,
        value: String,
    },
    /// 'h': append a header
    AddHeader { name: String, value: String },
}

impl Reply {
    pub(crate) fn code(&self) -> u8 {
        match self {
            Self::OptNeg { .. } => b'O',
            Self::Continue => b'c',
            Self::Accept => b'a',
            Self::InsertHeader { .. } => b'i',
            Self::AddHeader { .. } => b'h',
        }
    }

    pub(crate) fn payload(&self) -> Vec<u8> {
        match self {
            Self::OptNeg {
                version,
                actions,
                protocol,
            } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&version.to_be_bytes());
                payload.extend_from_slice(&actions.bits().to_be_bytes());
                payload.extend_from_slice(&protocol.bits().to_be_bytes());
                payload
            }
            Self::Continue | Self::Accept => vec![],
            Self::InsertHeader { index, name, value } => {
                let mut payload = Vec::with_capacity(4 + name.len() + value.len() + 2);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(name.as_bytes());
                payload.push(0);
                payload.extend_from_slice(value.as_bytes());
                payload.push(0);
                payload
            }
            Self::AddHeader { name, value } => {
                let mut payload = Vec::with_capacity(name.len() + value.len() + 2);
                payload.extend_from_slice(name.as_bytes());
                payload.push(0);
                payload.extend_from_slice(value.as_bytes());
                payload.push(0);
                payload
            }
        }
    }

    /// Encode the full packet: length prefix, code byte, payload
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut packet = Vec::with_capacity(5 + payload.len());
        packet.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
        packet.push(self.code());
        packet.extend_from_slice(&payload);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MILTER_VERSION;

    #[test]
    fn encode_continue() {
        assert_eq!(Reply::Continue.encode(), b"\x00\x00\x00\x01c");
    }

    #[test]
    fn encode_accept() {
        assert_eq!(Reply::Accept.encode(), b"\x00\x00\x00\x01a");
    }

    #[test]
    fn encode_insert_header() {
        let reply = Reply::InsertHeader {
            index: 0,
            name: "Authentication-Results".to_string(),
            value: "example.com; arc=none".to_string(),
        };
        let packet = reply.encode();
        assert_eq!(packet[4], b'i');
        assert_eq!(&packet[5..9], &[0, 0, 0, 0]);
        assert_eq!(
            &packet[9..],
            b"Authentication-Results\x00example.com; arc=none\x00"
        );
        let len = u32::from_be_bytes(packet[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, packet.len() - 4);
    }

    #[test]
    fn encode_optneg() {
        let reply = Reply::OptNeg {
            version: MILTER_VERSION,
            actions: SmfiActions::ADD_HDRS | SmfiActions::CHG_HDRS,
            protocol: SmfiProtocol::HDR_LEADSPC,
        };
        let packet = reply.encode();
        assert_eq!(packet.len(), 4 + 1 + 12);
        assert_eq!(packet[4], b'O');
        assert_eq!(&packet[5..9], &6u32.to_be_bytes());
        assert_eq!(&packet[9..13], &0x11u32.to_be_bytes());
        assert_eq!(&packet[13..17], &0x0010_0000u32.to_be_bytes());
    }
}
