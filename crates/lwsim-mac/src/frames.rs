//! LoRaWAN frame types.
//!
//! Frames exist to size payloads, carry the LinkADRReq command and feed
//! the MIC/dedup machinery. Only the fields the engine consumes are
//! modelled; the wire size accounts for the full MHDR/FHDR/MIC overhead
//! so airtime comes out right.

use serde::{Deserialize, Serialize};

use crate::MacError;

/// MHDR for an unconfirmed downlink.
pub const MHDR_UNCONFIRMED_DOWN: u8 = 0x60;
/// MHDR for a confirmed downlink.
pub const MHDR_CONFIRMED_DOWN: u8 = 0xA0;
/// MHDR for an unconfirmed uplink.
pub const MHDR_UNCONFIRMED_UP: u8 = 0x40;
/// FCtrl bit requesting an acknowledgement.
pub const FCTRL_ACK: u8 = 0x20;
/// FCtrl bit set by a device requesting an ADR acknowledgement.
pub const FCTRL_ADR_ACK_REQ: u8 = 0x40;

/// MHDR(1) + DevAddr(4) + FCtrl(1) + FCnt(2) + FPort(1) + MIC(4).
const FRAME_OVERHEAD_BYTES: usize = 13;

/// A data frame (uplink or downlink).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrame {
    pub mhdr: u8,
    pub fctrl: u8,
    pub fcnt: u32,
    pub payload: Vec<u8>,
    pub confirmed: bool,
    /// Ciphertext once session security is applied.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub encrypted_payload: Option<Vec<u8>>,
    /// Frame MIC once computed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mic: Option<[u8; 4]>,
}

impl DataFrame {
    pub fn uplink(fcnt: u32, payload: Vec<u8>) -> Self {
        DataFrame {
            mhdr: MHDR_UNCONFIRMED_UP,
            fctrl: 0,
            fcnt,
            payload,
            confirmed: false,
            encrypted_payload: None,
            mic: None,
        }
    }

    pub fn downlink(fcnt: u32, payload: Vec<u8>, confirmed: bool) -> Self {
        DataFrame {
            mhdr: if confirmed {
                MHDR_CONFIRMED_DOWN
            } else {
                MHDR_UNCONFIRMED_DOWN
            },
            fctrl: 0,
            fcnt,
            payload,
            confirmed,
            encrypted_payload: None,
            mic: None,
        }
    }

    /// Bytes on the wire, for airtime computation.
    pub fn wire_size(&self) -> usize {
        FRAME_OVERHEAD_BYTES + self.payload.len()
    }

    /// Whether the ADRACKReq bit is set.
    pub fn adr_ack_req(&self) -> bool {
        self.fctrl & FCTRL_ADR_ACK_REQ != 0
    }
}

/// LinkADRReq MAC command (CID 0x03): data rate, TX power index, channel
/// mask and redundancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAdrReq {
    pub data_rate: u8,
    pub tx_power_index: u8,
    pub ch_mask: u16,
    pub nb_trans: u8,
}

impl LinkAdrReq {
    pub const CID: u8 = 0x03;

    pub fn to_bytes(&self) -> Vec<u8> {
        vec![
            Self::CID,
            (self.data_rate << 4) | (self.tx_power_index & 0x0F),
            (self.ch_mask & 0xFF) as u8,
            (self.ch_mask >> 8) as u8,
            self.nb_trans & 0x0F,
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MacError> {
        if bytes.len() != 5 || bytes[0] != Self::CID {
            return Err(MacError::InvalidFrame(format!(
                "LinkADRReq expects 5 bytes starting with 0x03, got {} bytes",
                bytes.len()
            )));
        }
        Ok(LinkAdrReq {
            data_rate: bytes[1] >> 4,
            tx_power_index: bytes[1] & 0x0F,
            ch_mask: bytes[2] as u16 | ((bytes[3] as u16) << 8),
            nb_trans: bytes[4] & 0x0F,
        })
    }
}

/// OTAA join accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAccept {
    pub app_nonce: u32,
    pub net_id: u32,
    pub dev_addr: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mic: Option<[u8; 4]>,
}

impl JoinAccept {
    /// Join-accept wire size: MHDR(1) + AppNonce(3) + NetID(3) +
    /// DevAddr(4) + DLSettings(1) + RxDelay(1) + MIC(4).
    pub fn wire_size(&self) -> usize {
        17
    }
}

/// Any frame the server can queue for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownlinkFrame {
    Data(DataFrame),
    JoinAccept(JoinAccept),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_adr_req_round_trip() {
        let req = LinkAdrReq {
            data_rate: 5,
            tx_power_index: 2,
            ch_mask: 0x0007,
            nb_trans: 1,
        };
        let parsed = LinkAdrReq::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn link_adr_req_rejects_garbage() {
        assert!(LinkAdrReq::from_bytes(&[0x03, 0x00]).is_err());
        assert!(LinkAdrReq::from_bytes(&[0x04, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn wire_size_includes_overhead() {
        let f = DataFrame::uplink(0, vec![0u8; 20]);
        assert_eq!(f.wire_size(), 33);
        let empty = DataFrame::downlink(1, Vec::new(), false);
        assert_eq!(empty.wire_size(), 13);
    }

    #[test]
    fn downlink_mhdr_reflects_confirmation() {
        assert_eq!(DataFrame::downlink(0, vec![], true).mhdr, MHDR_CONFIRMED_DOWN);
        assert_eq!(
            DataFrame::downlink(0, vec![], false).mhdr,
            MHDR_UNCONFIRMED_DOWN
        );
    }
}
