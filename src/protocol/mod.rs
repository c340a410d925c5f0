//! LoRaWAN 1.0 PHY payload codec

pub mod crypto;
pub mod fhdr;
pub mod mac;
pub mod mhdr;
pub mod phy;

pub use fhdr::{FCtrl, FHdr};
pub use mac::{Cid, MacCommand, MacCommandSet, MAX_FOPTS_LEN};
pub use mhdr::{MHdr, MType};
pub use phy::{
    DlSettings, JoinAcceptPayload, JoinRequestPayload, MacPayload, Payload, PhyPayload,
    MAX_MAC_COMMAND_PAYLOAD, MINIMUM_MESSAGE_SIZE,
};
