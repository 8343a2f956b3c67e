// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Typed records over the non-volatile settings store.
//!
//! Each record type serializes into a fixed layout under its own key; the
//! ChildInfo key holds a list with one record per attached child. A save
//! whose payload equals the stored value is skipped, so callers may save
//! eagerly without wearing the backing flash.

use kernel::hil::nonvolatile_storage::SettingsStore;
use kernel::ErrorCode;

use capsules_core::stream::SResult;
use capsules_core::stream::{decode_bytes, decode_u16, decode_u32, decode_u8};
use capsules_core::stream::{encode_bytes, encode_u16, encode_u32, encode_u8};

/// Record keys.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u16)]
pub enum Key {
    ActiveDataset = 1,
    PendingDataset = 2,
    NetworkInfo = 3,
    ParentInfo = 4,
    ChildInfo = 5,
}

/// The node's own persisted network state.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct NetworkInfo {
    pub role: u8,
    pub device_mode: u8,
    pub rloc16: u16,
    pub key_sequence: u32,
    pub mle_frame_counter: u32,
    pub mac_frame_counter: u32,
    pub previous_partition_id: u32,
    pub ext_address: [u8; 8],
    pub mesh_local_iid: [u8; 8],
}

const NETWORK_INFO_LEN: usize = 1 + 1 + 2 + 4 + 4 + 4 + 4 + 8 + 8;

impl NetworkInfo {
    fn encode(&self, buf: &mut [u8]) -> SResult {
        let mut off = enc_consume!(buf; encode_u8, self.role);
        off = enc_consume!(buf, off; encode_u8, self.device_mode);
        off = enc_consume!(buf, off; encode_u16, self.rloc16);
        off = enc_consume!(buf, off; encode_u32, self.key_sequence);
        off = enc_consume!(buf, off; encode_u32, self.mle_frame_counter);
        off = enc_consume!(buf, off; encode_u32, self.mac_frame_counter);
        off = enc_consume!(buf, off; encode_u32, self.previous_partition_id);
        off = enc_consume!(buf, off; encode_bytes, &self.ext_address);
        off = enc_consume!(buf, off; encode_bytes, &self.mesh_local_iid);
        stream_done!(off);
    }

    fn decode(buf: &[u8]) -> SResult<NetworkInfo> {
        let (off, role) = dec_consume!(buf; decode_u8);
        let (off, device_mode) = dec_consume!(buf, off; decode_u8);
        let (off, rloc16) = dec_consume!(buf, off; decode_u16);
        let (off, key_sequence) = dec_consume!(buf, off; decode_u32);
        let (off, mle_frame_counter) = dec_consume!(buf, off; decode_u32);
        let (off, mac_frame_counter) = dec_consume!(buf, off; decode_u32);
        let (off, previous_partition_id) = dec_consume!(buf, off; decode_u32);
        let mut ext_address = [0u8; 8];
        let (off, ()) = dec_consume!(buf, off; decode_bytes, &mut ext_address);
        let mut mesh_local_iid = [0u8; 8];
        let (off, ()) = dec_consume!(buf, off; decode_bytes, &mut mesh_local_iid);
        stream_done!(
            off,
            NetworkInfo {
                role,
                device_mode,
                rloc16,
                key_sequence,
                mle_frame_counter,
                mac_frame_counter,
                previous_partition_id,
                ext_address,
                mesh_local_iid,
            }
        );
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ParentInfo {
    pub ext_address: [u8; 8],
    pub version: u8,
}

const PARENT_INFO_LEN: usize = 8 + 1;

impl ParentInfo {
    fn encode(&self, buf: &mut [u8]) -> SResult {
        let mut off = enc_consume!(buf; encode_bytes, &self.ext_address);
        off = enc_consume!(buf, off; encode_u8, self.version);
        stream_done!(off);
    }

    fn decode(buf: &[u8]) -> SResult<ParentInfo> {
        let mut ext_address = [0u8; 8];
        let (off, ()) = dec_consume!(buf; decode_bytes, &mut ext_address);
        let (off, version) = dec_consume!(buf, off; decode_u8);
        stream_done!(off, ParentInfo { ext_address, version });
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ChildInfo {
    pub ext_address: [u8; 8],
    pub timeout: u32,
    pub rloc16: u16,
    pub mode: u8,
    pub version: u8,
}

const CHILD_INFO_LEN: usize = 8 + 4 + 2 + 1 + 1;

impl ChildInfo {
    fn encode(&self, buf: &mut [u8]) -> SResult {
        let mut off = enc_consume!(buf; encode_bytes, &self.ext_address);
        off = enc_consume!(buf, off; encode_u32, self.timeout);
        off = enc_consume!(buf, off; encode_u16, self.rloc16);
        off = enc_consume!(buf, off; encode_u8, self.mode);
        off = enc_consume!(buf, off; encode_u8, self.version);
        stream_done!(off);
    }

    fn decode(buf: &[u8]) -> SResult<ChildInfo> {
        let mut ext_address = [0u8; 8];
        let (off, ()) = dec_consume!(buf; decode_bytes, &mut ext_address);
        let (off, timeout) = dec_consume!(buf, off; decode_u32);
        let (off, rloc16) = dec_consume!(buf, off; decode_u16);
        let (off, mode) = dec_consume!(buf, off; decode_u8);
        let (off, version) = dec_consume!(buf, off; decode_u8);
        stream_done!(
            off,
            ChildInfo {
                ext_address,
                timeout,
                rloc16,
                mode,
                version,
            }
        );
    }
}

/// Largest record or dataset payload.
pub const MAX_SETTING_SIZE: usize = 128;

pub struct Settings<'a> {
    store: &'a dyn SettingsStore,
}

impl<'a> Settings<'a> {
    pub fn new(store: &'a dyn SettingsStore) -> Settings<'a> {
        Settings { store }
    }

    /// Save raw bytes under a key, skipping the write when the stored value
    /// is already identical.
    fn save_coalesced(&self, key: Key, value: &[u8]) -> Result<(), ErrorCode> {
        let mut current = [0u8; MAX_SETTING_SIZE];
        if let Ok(len) = self.store.get(key as u16, 0, &mut current) {
            if current[..len] == *value {
                kernel::debug!("[settings] re-saved {:?} unchanged", key);
                return Ok(());
            }
        }
        let result = self.store.set(key as u16, value);
        match result {
            Ok(()) => kernel::debug!("[settings] saved {:?} ({} bytes)", key, value.len()),
            Err(e) => kernel::debug!("[settings] error saving {:?}: {:?}", key, e),
        }
        result
    }

    pub fn read_network_info(&self) -> Result<NetworkInfo, ErrorCode> {
        let mut buf = [0u8; NETWORK_INFO_LEN];
        let len = self.store.get(Key::NetworkInfo as u16, 0, &mut buf)?;
        NetworkInfo::decode(&buf[..len])
            .done()
            .map(|(_, info)| info)
            .ok_or(ErrorCode::PARSE)
    }

    pub fn save_network_info(&self, info: &NetworkInfo) -> Result<(), ErrorCode> {
        let mut buf = [0u8; NETWORK_INFO_LEN];
        match info.encode(&mut buf).done() {
            Some((len, ())) => self.save_coalesced(Key::NetworkInfo, &buf[..len]),
            None => Err(ErrorCode::FAIL),
        }
    }

    pub fn delete_network_info(&self) -> Result<(), ErrorCode> {
        self.store.delete(Key::NetworkInfo as u16, None)
    }

    pub fn read_parent_info(&self) -> Result<ParentInfo, ErrorCode> {
        let mut buf = [0u8; PARENT_INFO_LEN];
        let len = self.store.get(Key::ParentInfo as u16, 0, &mut buf)?;
        ParentInfo::decode(&buf[..len])
            .done()
            .map(|(_, info)| info)
            .ok_or(ErrorCode::PARSE)
    }

    pub fn save_parent_info(&self, info: &ParentInfo) -> Result<(), ErrorCode> {
        let mut buf = [0u8; PARENT_INFO_LEN];
        match info.encode(&mut buf).done() {
            Some((len, ())) => self.save_coalesced(Key::ParentInfo, &buf[..len]),
            None => Err(ErrorCode::FAIL),
        }
    }

    pub fn delete_parent_info(&self) -> Result<(), ErrorCode> {
        self.store.delete(Key::ParentInfo as u16, None)
    }

    pub fn add_child_info(&self, info: &ChildInfo) -> Result<(), ErrorCode> {
        let mut buf = [0u8; CHILD_INFO_LEN];
        match info.encode(&mut buf).done() {
            Some((len, ())) => {
                let result = self.store.add(Key::ChildInfo as u16, &buf[..len]);
                if result.is_ok() {
                    kernel::debug!("[settings] added ChildInfo rloc 0x{:04x}", info.rloc16);
                }
                result
            }
            None => Err(ErrorCode::FAIL),
        }
    }

    pub fn child_info(&self, index: usize) -> Result<ChildInfo, ErrorCode> {
        let mut buf = [0u8; CHILD_INFO_LEN];
        let len = self.store.get(Key::ChildInfo as u16, index, &mut buf)?;
        ChildInfo::decode(&buf[..len])
            .done()
            .map(|(_, info)| info)
            .ok_or(ErrorCode::PARSE)
    }

    pub fn delete_child_info(&self, index: usize) -> Result<(), ErrorCode> {
        self.store.delete(Key::ChildInfo as u16, Some(index))
    }

    pub fn delete_all_child_info(&self) -> Result<(), ErrorCode> {
        self.store.delete(Key::ChildInfo as u16, None)
    }

    pub fn save_dataset(&self, active: bool, data: &[u8]) -> Result<(), ErrorCode> {
        if data.len() > MAX_SETTING_SIZE {
            return Err(ErrorCode::NOMEM);
        }
        let key = if active {
            Key::ActiveDataset
        } else {
            Key::PendingDataset
        };
        self.save_coalesced(key, data)
    }

    pub fn read_dataset(&self, active: bool, out: &mut [u8]) -> Result<usize, ErrorCode> {
        let key = if active {
            Key::ActiveDataset
        } else {
            Key::PendingDataset
        };
        self.store.get(key as u16, 0, out)
    }

    pub fn wipe(&self) {
        self.store.wipe();
        kernel::debug!("[settings] wiped all records");
    }

    /// Read-modify-write of the persisted MAC frame counter.
    pub fn record_mac_frame_counter(&self, counter: u32) {
        let mut info = self.read_network_info().unwrap_or_default();
        info.mac_frame_counter = counter;
        let _ = self.save_network_info(&info);
    }

    /// Read-modify-write of the persisted MLE frame counter.
    pub fn record_mle_frame_counter(&self, counter: u32) {
        let mut info = self.read_network_info().unwrap_or_default();
        info.mle_frame_counter = counter;
        let _ = self.save_network_info(&info);
    }
}

impl<'a> crate::ieee802154::framer::SecurityCounterClient for Settings<'a> {
    fn mac_frame_counter_advanced(&self, counter: u32) {
        self.record_mac_frame_counter(counter);
    }
}
