// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Thread network data and steering data.
//!
//! The leader owns the authoritative registry of on-mesh prefixes, external
//! routes and services, serialized as nested TLVs whose type byte carries
//! the stable flag in bit 0. Every accepted local edit bumps the data
//! version (and the stable version when a stable entry changed); other nodes
//! hold the serialized blob and fetch newer versions when advertisements
//! carry one.
//!
//! Steering data is the commissioner's joiner bloom filter: two CRC16s
//! (CCITT and ANSI) of the joiner id, each reduced modulo the filter width.

use kernel::utilities::cells::MapCell;
use kernel::ErrorCode;

use core::cell::Cell;

/// CRC16 with selectable polynomial, MSB first, zero initial value.
pub struct Crc16 {
    polynomial: u16,
    crc: u16,
}

/// CRC16-CCITT polynomial.
pub const CRC16_CCITT: u16 = 0x1021;
/// CRC16-ANSI polynomial.
pub const CRC16_ANSI: u16 = 0x8005;

impl Crc16 {
    pub fn new(polynomial: u16) -> Crc16 {
        Crc16 { polynomial, crc: 0 }
    }

    pub fn update(&mut self, byte: u8) {
        self.crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            self.crc = if self.crc & 0x8000 != 0 {
                (self.crc << 1) ^ self.polynomial
            } else {
                self.crc << 1
            };
        }
    }

    pub fn get(&self) -> u16 {
        self.crc
    }
}

/// Maximum steering data length in bytes.
pub const STEERING_DATA_MAX_LENGTH: usize = 16;

/// The joiner bloom filter advertised by the commissioner.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SteeringData {
    length: u8,
    bits: [u8; STEERING_DATA_MAX_LENGTH],
}

impl SteeringData {
    pub const fn empty() -> SteeringData {
        SteeringData {
            length: 0,
            bits: [0; STEERING_DATA_MAX_LENGTH],
        }
    }

    pub fn init(length: u8) -> SteeringData {
        let mut sd = SteeringData::empty();
        sd.length = length.min(STEERING_DATA_MAX_LENGTH as u8);
        sd
    }

    /// A one-byte filter of all ones: any joiner is permitted.
    pub fn permit_all() -> SteeringData {
        let mut sd = SteeringData::init(1);
        sd.bits[0] = 0xff;
        sd
    }

    pub fn length(&self) -> u8 {
        self.length
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits[..self.length as usize]
    }

    fn num_bits(&self) -> u16 {
        self.length as u16 * 8
    }

    fn bit(&self, index: u16) -> bool {
        let byte = self.length as usize - 1 - (index / 8) as usize;
        self.bits[byte] & (1 << (index % 8)) != 0
    }

    fn set_bit(&mut self, index: u16) {
        let byte = self.length as usize - 1 - (index / 8) as usize;
        self.bits[byte] |= 1 << (index % 8);
    }

    fn hash_indexes(joiner_id: &[u8; 8]) -> (u16, u16) {
        let mut ccitt = Crc16::new(CRC16_CCITT);
        let mut ansi = Crc16::new(CRC16_ANSI);
        for &b in joiner_id {
            ccitt.update(b);
            ansi.update(b);
        }
        (ccitt.get(), ansi.get())
    }

    /// Mark a joiner id in the filter.
    pub fn update_bloom(&mut self, joiner_id: &[u8; 8]) {
        if self.length == 0 {
            return;
        }
        let (a, b) = Self::hash_indexes(joiner_id);
        self.set_bit(a % self.num_bits());
        self.set_bit(b % self.num_bits());
    }

    /// Whether the filter admits the joiner: both hash bits set.
    pub fn contains(&self, joiner_id: &[u8; 8]) -> bool {
        if self.length == 0 {
            return false;
        }
        let (a, b) = Self::hash_indexes(joiner_id);
        self.bit(a % self.num_bits()) && self.bit(b % self.num_bits())
    }

    pub fn permits_all_joiners(&self) -> bool {
        self.length > 0 && self.as_bytes().iter().all(|&b| b == 0xff)
    }
}

impl Default for SteeringData {
    fn default() -> Self {
        Self::empty()
    }
}

/// A prefix: up to 128 bits plus a bit length.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Prefix {
    pub bytes: [u8; 16],
    pub length_bits: u8,
}

impl Prefix {
    pub fn new(bytes: [u8; 16], length_bits: u8) -> Prefix {
        Prefix { bytes, length_bits }
    }

    fn length_bytes(&self) -> usize {
        self.length_bits.div_ceil(8) as usize
    }
}

/// Border-router flags of an on-mesh prefix.
pub mod prefix_flags {
    pub const PREFERRED: u16 = 1 << 13;
    pub const SLAAC: u16 = 1 << 12;
    pub const DHCP: u16 = 1 << 11;
    pub const CONFIGURE: u16 = 1 << 10;
    pub const DEFAULT_ROUTE: u16 = 1 << 9;
    pub const ON_MESH: u16 = 1 << 8;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct OnMeshPrefix {
    pub prefix: Prefix,
    pub flags: u16,
    pub stable: bool,
    pub rloc16: u16,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ExternalRoute {
    pub prefix: Prefix,
    /// Route preference: -1, 0 or 1.
    pub preference: i8,
    pub stable: bool,
    pub rloc16: u16,
}

pub const MAX_SERVICE_DATA: usize = 16;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ServiceEntry {
    pub enterprise_number: u32,
    pub service_data: [u8; MAX_SERVICE_DATA],
    pub service_data_len: u8,
    pub server_data: [u8; MAX_SERVICE_DATA],
    pub server_data_len: u8,
    pub stable: bool,
    pub rloc16: u16,
}

const MAX_PREFIXES: usize = 4;
const MAX_ROUTES: usize = 4;
const MAX_SERVICES: usize = 4;

/// Serialized size bound of the leader's blob.
pub const MAX_NETWORK_DATA_SIZE: usize = 254;

mod netdata_tlv {
    pub const HAS_ROUTE: u8 = 0;
    pub const PREFIX: u8 = 1;
    pub const BORDER_ROUTER: u8 = 2;
    pub const SERVICE: u8 = 5;
}

/// The network data set. On the leader the structured registry is
/// authoritative and `serialize` produces the distributed blob; on every
/// other node the blob received from the leader is stored as-is.
pub struct NetworkData {
    prefixes: MapCell<[Option<OnMeshPrefix>; MAX_PREFIXES]>,
    routes: MapCell<[Option<ExternalRoute>; MAX_ROUTES]>,
    services: MapCell<[Option<ServiceEntry>; MAX_SERVICES]>,
    version: Cell<u8>,
    stable_version: Cell<u8>,
    /// Blob as received from the leader (non-leader nodes).
    blob: MapCell<([u8; MAX_NETWORK_DATA_SIZE], usize)>,
    steering: Cell<SteeringData>,
}

impl NetworkData {
    pub fn new() -> NetworkData {
        NetworkData {
            prefixes: MapCell::new([None; MAX_PREFIXES]),
            routes: MapCell::new([None; MAX_ROUTES]),
            services: MapCell::new([None; MAX_SERVICES]),
            version: Cell::new(0),
            stable_version: Cell::new(0),
            blob: MapCell::new(([0; MAX_NETWORK_DATA_SIZE], 0)),
            steering: Cell::new(SteeringData::empty()),
        }
    }

    pub fn version(&self) -> u8 {
        self.version.get()
    }

    pub fn stable_version(&self) -> u8 {
        self.stable_version.get()
    }

    pub fn steering_data(&self) -> SteeringData {
        self.steering.get()
    }

    pub fn set_steering_data(&self, steering: SteeringData) {
        self.steering.set(steering);
    }

    fn bump(&self, stable: bool) {
        self.version.set(self.version.get().wrapping_add(1));
        if stable {
            self.stable_version
                .set(self.stable_version.get().wrapping_add(1));
        }
    }

    /// Register an on-mesh prefix. A second registration of an identical
    /// entry reports `ALREADY` and changes nothing.
    pub fn register_on_mesh_prefix(&self, entry: OnMeshPrefix) -> Result<(), ErrorCode> {
        let result = self.prefixes.map_or(Err(ErrorCode::NOMEM), |table| {
            if table.iter().any(|slot| *slot == Some(entry)) {
                return Err(ErrorCode::ALREADY);
            }
            // Same prefix with different attributes: update in place.
            if let Some(slot) = table
                .iter_mut()
                .find(|slot| slot.is_some_and(|p| p.prefix == entry.prefix))
            {
                *slot = Some(entry);
                return Ok(());
            }
            match table.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => {
                    *slot = Some(entry);
                    Ok(())
                }
                None => Err(ErrorCode::NOMEM),
            }
        });
        if result.is_ok() {
            self.bump(entry.stable);
        }
        result
    }

    pub fn remove_on_mesh_prefix(&self, prefix: &Prefix) -> Result<(), ErrorCode> {
        let removed = self.prefixes.map_or(None, |table| {
            table
                .iter_mut()
                .find(|slot| slot.is_some_and(|p| p.prefix == *prefix))
                .and_then(|slot| slot.take())
        });
        match removed {
            Some(entry) => {
                self.bump(entry.stable);
                Ok(())
            }
            None => Err(ErrorCode::NOTFOUND),
        }
    }

    pub fn register_route(&self, entry: ExternalRoute) -> Result<(), ErrorCode> {
        let result = self.routes.map_or(Err(ErrorCode::NOMEM), |table| {
            if table.iter().any(|slot| *slot == Some(entry)) {
                return Err(ErrorCode::ALREADY);
            }
            if let Some(slot) = table
                .iter_mut()
                .find(|slot| slot.is_some_and(|r| r.prefix == entry.prefix))
            {
                *slot = Some(entry);
                return Ok(());
            }
            match table.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => {
                    *slot = Some(entry);
                    Ok(())
                }
                None => Err(ErrorCode::NOMEM),
            }
        });
        if result.is_ok() {
            self.bump(entry.stable);
        }
        result
    }

    pub fn register_service(&self, entry: ServiceEntry) -> Result<(), ErrorCode> {
        let result = self.services.map_or(Err(ErrorCode::NOMEM), |table| {
            if table.iter().any(|slot| *slot == Some(entry)) {
                return Err(ErrorCode::ALREADY);
            }
            match table.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => {
                    *slot = Some(entry);
                    Ok(())
                }
                None => Err(ErrorCode::NOMEM),
            }
        });
        if result.is_ok() {
            self.bump(entry.stable);
        }
        result
    }

    pub fn each_on_mesh_prefix(&self, mut f: impl FnMut(&OnMeshPrefix)) {
        self.prefixes.map(|table| {
            for entry in table.iter().flatten() {
                f(entry);
            }
        });
    }

    /// Serialize the leader registry into `out`, returning the length.
    ///
    /// Layout: `Prefix TLV { prefix, Border Router sub-TLV }` per on-mesh
    /// prefix, `Prefix TLV { prefix, Has Route sub-TLV }` per route, and a
    /// `Service TLV` per service. The type byte's bit 0 is the stable flag.
    pub fn serialize(&self, out: &mut [u8]) -> Result<usize, ErrorCode> {
        let mut off = 0;

        let mut write =
            |out: &mut [u8], off: &mut usize, bytes: &[u8]| -> Result<(), ErrorCode> {
                if *off + bytes.len() > out.len() {
                    return Err(ErrorCode::NOMEM);
                }
                out[*off..*off + bytes.len()].copy_from_slice(bytes);
                *off += bytes.len();
                Ok(())
            };

        let mut result = Ok(());
        self.prefixes.map(|table| {
            for entry in table.iter().flatten() {
                if result.is_err() {
                    return;
                }
                let plen = entry.prefix.length_bytes();
                // Sub-TLV: Border Router { rloc16, flags }.
                let sub_len = 2 + 4;
                let tlv_len = 2 + plen + sub_len;
                result = result
                    .and_then(|()| {
                        write(
                            out,
                            &mut off,
                            &[
                                (netdata_tlv::PREFIX << 1) | entry.stable as u8,
                                tlv_len as u8,
                                0, // domain id
                                entry.prefix.length_bits,
                            ],
                        )
                    })
                    .and_then(|()| write(out, &mut off, &entry.prefix.bytes[..plen]))
                    .and_then(|()| {
                        write(
                            out,
                            &mut off,
                            &[
                                (netdata_tlv::BORDER_ROUTER << 1) | entry.stable as u8,
                                4,
                                (entry.rloc16 >> 8) as u8,
                                entry.rloc16 as u8,
                                (entry.flags >> 8) as u8,
                                entry.flags as u8,
                            ],
                        )
                    });
            }
        });

        self.routes.map(|table| {
            for entry in table.iter().flatten() {
                if result.is_err() {
                    return;
                }
                let plen = entry.prefix.length_bytes();
                let sub_len = 2 + 3;
                let tlv_len = 2 + plen + sub_len;
                result = result
                    .and_then(|()| {
                        write(
                            out,
                            &mut off,
                            &[
                                (netdata_tlv::PREFIX << 1) | entry.stable as u8,
                                tlv_len as u8,
                                0,
                                entry.prefix.length_bits,
                            ],
                        )
                    })
                    .and_then(|()| write(out, &mut off, &entry.prefix.bytes[..plen]))
                    .and_then(|()| {
                        write(
                            out,
                            &mut off,
                            &[
                                (netdata_tlv::HAS_ROUTE << 1) | entry.stable as u8,
                                3,
                                (entry.rloc16 >> 8) as u8,
                                entry.rloc16 as u8,
                                (entry.preference as u8) << 6,
                            ],
                        )
                    });
            }
        });

        self.services.map(|table| {
            for entry in table.iter().flatten() {
                if result.is_err() {
                    return;
                }
                let s_len = entry.service_data_len as usize;
                let srv_len = entry.server_data_len as usize;
                let tlv_len = 5 + s_len + 2 + srv_len;
                result = result
                    .and_then(|()| {
                        write(
                            out,
                            &mut off,
                            &[
                                (netdata_tlv::SERVICE << 1) | entry.stable as u8,
                                tlv_len as u8,
                            ],
                        )
                    })
                    .and_then(|()| write(out, &mut off, &entry.enterprise_number.to_be_bytes()))
                    .and_then(|()| write(out, &mut off, &[s_len as u8]))
                    .and_then(|()| write(out, &mut off, &entry.service_data[..s_len]))
                    .and_then(|()| {
                        write(
                            out,
                            &mut off,
                            &[(entry.rloc16 >> 8) as u8, entry.rloc16 as u8],
                        )
                    })
                    .and_then(|()| write(out, &mut off, &entry.server_data[..srv_len]));
            }
        });

        result.map(|()| off)
    }

    /// Store the blob distributed by the leader.
    pub fn set_leader_blob(&self, data: &[u8], version: u8, stable_version: u8) -> Result<(), ErrorCode> {
        if data.len() > MAX_NETWORK_DATA_SIZE {
            return Err(ErrorCode::NOMEM);
        }
        self.blob.map(|(bytes, len)| {
            bytes[..data.len()].copy_from_slice(data);
            *len = data.len();
        });
        self.version.set(version);
        self.stable_version.set(stable_version);
        Ok(())
    }

    /// Run `f` over the stored blob.
    pub fn with_leader_blob<R>(&self, f: impl Fn(&[u8]) -> R) -> R {
        self.blob
            .map(|(bytes, len)| f(&bytes[..*len]))
            .unwrap_or_else(|| f(&[]))
    }
}

impl Default for NetworkData {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(last: u8) -> Prefix {
        let mut bytes = [0u8; 16];
        bytes[0] = 0xfd;
        bytes[7] = last;
        Prefix::new(bytes, 64)
    }

    #[test]
    fn prefix_registration_is_idempotent() {
        let nd = NetworkData::new();
        let entry = OnMeshPrefix {
            prefix: prefix(1),
            flags: prefix_flags::ON_MESH | prefix_flags::SLAAC,
            stable: true,
            rloc16: 0x0400,
        };
        assert_eq!(nd.register_on_mesh_prefix(entry), Ok(()));
        let v = nd.version();
        assert_eq!(nd.register_on_mesh_prefix(entry), Err(ErrorCode::ALREADY));
        // The duplicate neither bumps the version nor duplicates the entry.
        assert_eq!(nd.version(), v);
        let mut count = 0;
        nd.each_on_mesh_prefix(|_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn edits_bump_versions() {
        let nd = NetworkData::new();
        let v0 = nd.version();
        let s0 = nd.stable_version();
        nd.register_route(ExternalRoute {
            prefix: prefix(2),
            preference: 1,
            stable: false,
            rloc16: 0x0400,
        })
        .unwrap();
        assert_ne!(nd.version(), v0);
        assert_eq!(nd.stable_version(), s0);

        nd.register_on_mesh_prefix(OnMeshPrefix {
            prefix: prefix(3),
            flags: prefix_flags::ON_MESH,
            stable: true,
            rloc16: 0x0400,
        })
        .unwrap();
        assert_ne!(nd.stable_version(), s0);
    }

    #[test]
    fn serialized_blob_carries_stable_bit() {
        let nd = NetworkData::new();
        nd.register_on_mesh_prefix(OnMeshPrefix {
            prefix: prefix(1),
            flags: prefix_flags::ON_MESH,
            stable: true,
            rloc16: 0x0400,
        })
        .unwrap();
        let mut out = [0u8; MAX_NETWORK_DATA_SIZE];
        let len = nd.serialize(&mut out).unwrap();
        assert!(len > 0);
        // Type byte: prefix TLV type in bits 7:1, stable bit set.
        assert_eq!(out[0], (1 << 1) | 1);
    }

    #[test]
    fn steering_data_scenario() {
        // Filter width 16 bits.
        let mut sd = SteeringData::init(2);
        let joiner = [0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18];
        sd.update_bloom(&joiner);
        assert!(sd.contains(&joiner));
        // A different joiner id is rejected unless both its hash bits
        // happen to collide.
        let other = [0u8; 8];
        let (a, b) = SteeringData::hash_indexes(&other);
        let collides = sd.bit(a % sd.num_bits()) && sd.bit(b % sd.num_bits());
        assert_eq!(sd.contains(&other), collides);
        assert!(!collides);
    }

    #[test]
    fn permit_all_admits_everyone() {
        let sd = SteeringData::permit_all();
        assert!(sd.permits_all_joiners());
        assert!(sd.contains(&[0x11; 8]));
        assert!(sd.contains(&[0x00; 8]));
        assert!(!SteeringData::empty().contains(&[0x11; 8]));
    }

    #[test]
    fn leader_blob_roundtrip() {
        let nd = NetworkData::new();
        nd.set_leader_blob(&[1, 2, 3, 4], 7, 5).unwrap();
        assert_eq!(nd.version(), 7);
        assert_eq!(nd.stable_version(), 5);
        nd.with_leader_blob(|blob| assert_eq!(blob, &[1, 2, 3, 4]));
    }
}
