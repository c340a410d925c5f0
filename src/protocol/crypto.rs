//! LoRaWAN 1.0 cryptographic primitives: MIC calculation, FRMPayload
//! encryption, Join-Accept wrapping and session key derivation.

use crate::model::lorawan::{AesKey, DevAddr, NetId};
use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

const BLOCK_SIZE: usize = 16;

/// Full 16-byte AES-CMAC tag
pub fn aes_cmac(key: &AesKey, data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key.as_bytes()));
    mac.update(data);
    let tag = mac.finalize().into_bytes();
    let mut ret = [0u8; 16];
    ret.copy_from_slice(&tag);
    ret
}

/// First four bytes of the CMAC, little endian. Used for join messages.
pub fn join_mic(key: &AesKey, message: &[u8]) -> u32 {
    let tag = aes_cmac(key, message);
    u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]])
}

/// MIC for data frames: CMAC over the B0 block followed by the message
/// (MHDR..FRMPayload, without the MIC itself)
pub fn data_mic(key: &AesKey, uplink: bool, dev_addr: DevAddr, fcnt: u16, message: &[u8]) -> u32 {
    let mut b0 = [0u8; BLOCK_SIZE];
    b0[0] = 0x49;
    b0[5] = direction(uplink);
    b0[6..10].copy_from_slice(&dev_addr.to_u32().to_le_bytes());
    b0[10..14].copy_from_slice(&u32::from(fcnt).to_le_bytes());
    b0[15] = message.len() as u8;

    let mut full = Vec::with_capacity(BLOCK_SIZE + message.len());
    full.extend_from_slice(&b0);
    full.extend_from_slice(message);
    join_mic(key, &full)
}

/// Encrypts or decrypts FRMPayload. The operation is its own inverse.
pub fn crypt_frm_payload(
    key: &AesKey,
    uplink: bool,
    dev_addr: DevAddr,
    fcnt: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    for (i, chunk) in payload.chunks(BLOCK_SIZE).enumerate() {
        let mut a = [0u8; BLOCK_SIZE];
        a[0] = 0x01;
        a[5] = direction(uplink);
        a[6..10].copy_from_slice(&dev_addr.to_u32().to_le_bytes());
        a[10..14].copy_from_slice(&u32::from(fcnt).to_le_bytes());
        a[15] = (i + 1) as u8;
        let s = key.encrypt_block(&a);
        out.extend(chunk.iter().zip(s.iter()).map(|(p, k)| p ^ k));
    }
    out
}

/// AES-ECB decrypt of whole blocks. The network wraps Join-Accept
/// payloads with a decrypt so the device only needs the encrypt path.
pub fn ecb_decrypt(key: &AesKey, data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        let mut block = GenericArray::from(block);
        cipher.decrypt_block(&mut block);
        out.extend_from_slice(&block[..chunk.len()]);
    }
    out
}

/// AES-ECB encrypt of whole blocks (the device side of Join-Accept)
pub fn ecb_encrypt(key: &AesKey, data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        let mut block = GenericArray::from(block);
        cipher.encrypt_block(&mut block);
        out.extend_from_slice(&block[..chunk.len()]);
    }
    out
}

/// Derives (NwkSKey, AppSKey) after a successful join
pub fn derive_session_keys(
    app_key: &AesKey,
    app_nonce: [u8; 3],
    net_id: NetId,
    dev_nonce: u16,
) -> (AesKey, AesKey) {
    (
        derive_key(0x01, app_key, app_nonce, net_id, dev_nonce),
        derive_key(0x02, app_key, app_nonce, net_id, dev_nonce),
    )
}

fn derive_key(prefix: u8, app_key: &AesKey, app_nonce: [u8; 3], net_id: NetId, dev_nonce: u16) -> AesKey {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = prefix;
    block[1..4].copy_from_slice(&app_nonce);
    block[4] = (net_id >> 16) as u8;
    block[5] = (net_id >> 8) as u8;
    block[6] = net_id as u8;
    block[7..9].copy_from_slice(&dev_nonce.to_be_bytes());
    AesKey::new(app_key.encrypt_block(&block))
}

fn direction(uplink: bool) -> u8 {
    if uplink {
        0
    } else {
        1
    }
}
