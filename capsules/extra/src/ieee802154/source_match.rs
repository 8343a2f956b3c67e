// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Software source-address match table.
//!
//! Radios with hardware assistance look incoming source addresses up in a
//! table to decide the frame-pending bit of the automatic acknowledgement;
//! this is the software rendition for radios without it. Entries store only a
//! 16-bit checksum (the sum of the address words and the PAN id), so distinct
//! addresses can collide. That is deliberate and must not be "fixed": a
//! collision sets the frame-pending bit spuriously, which merely keeps a
//! child awake a little longer, and it keeps behavior identical to the
//! hardware tables.

use kernel::utilities::cells::MapCell;
use kernel::ErrorCode;

pub const NUM_SHORT_ENTRIES: usize = 16;
pub const NUM_EXT_ENTRIES: usize = 16;

#[derive(Copy, Clone, Default)]
struct MatchEntry {
    checksum: u16,
    allocated: bool,
}

/// Per-PAN source match table for short and extended addresses.
pub struct SourceMatch {
    pan_id: MapCell<u16>,
    short_entries: MapCell<[MatchEntry; NUM_SHORT_ENTRIES]>,
    ext_entries: MapCell<[MatchEntry; NUM_EXT_ENTRIES]>,
}

fn short_checksum(pan_id: u16, short_addr: u16) -> u16 {
    short_addr.wrapping_add(pan_id)
}

fn ext_checksum(pan_id: u16, ext_addr: &[u8; 8]) -> u16 {
    let mut checksum = pan_id;
    for word in ext_addr.chunks(2) {
        checksum = checksum.wrapping_add((word[0] as u16) | ((word[1] as u16) << 8));
    }
    checksum
}

impl SourceMatch {
    pub fn new() -> SourceMatch {
        SourceMatch {
            pan_id: MapCell::new(0),
            short_entries: MapCell::new([MatchEntry::default(); NUM_SHORT_ENTRIES]),
            ext_entries: MapCell::new([MatchEntry::default(); NUM_EXT_ENTRIES]),
        }
    }

    pub fn set_pan_id(&self, pan_id: u16) {
        self.pan_id.put(pan_id);
    }

    fn pan_id(&self) -> u16 {
        self.pan_id.map_or(0, |pan| *pan)
    }

    /// Index of the first allocated entry matching the short address, or -1.
    pub fn find_short(&self, short_addr: u16) -> i16 {
        let checksum = short_checksum(self.pan_id(), short_addr);
        self.short_entries.map_or(-1, |entries| {
            entries
                .iter()
                .position(|e| e.allocated && e.checksum == checksum)
                .map_or(-1, |i| i as i16)
        })
    }

    /// Index of the first allocated entry matching the extended address,
    /// or -1.
    pub fn find_ext(&self, ext_addr: &[u8; 8]) -> i16 {
        let checksum = ext_checksum(self.pan_id(), ext_addr);
        self.ext_entries.map_or(-1, |entries| {
            entries
                .iter()
                .position(|e| e.allocated && e.checksum == checksum)
                .map_or(-1, |i| i as i16)
        })
    }

    pub fn add_short(&self, short_addr: u16) -> Result<(), ErrorCode> {
        let checksum = short_checksum(self.pan_id(), short_addr);
        self.short_entries.map_or(Err(ErrorCode::NOMEM), |entries| {
            match entries.iter_mut().find(|e| !e.allocated) {
                Some(entry) => {
                    entry.checksum = checksum;
                    entry.allocated = true;
                    Ok(())
                }
                None => Err(ErrorCode::NOMEM),
            }
        })
    }

    pub fn add_ext(&self, ext_addr: &[u8; 8]) -> Result<(), ErrorCode> {
        let checksum = ext_checksum(self.pan_id(), ext_addr);
        self.ext_entries.map_or(Err(ErrorCode::NOMEM), |entries| {
            match entries.iter_mut().find(|e| !e.allocated) {
                Some(entry) => {
                    entry.checksum = checksum;
                    entry.allocated = true;
                    Ok(())
                }
                None => Err(ErrorCode::NOMEM),
            }
        })
    }

    pub fn clear_short(&self, short_addr: u16) -> Result<(), ErrorCode> {
        let index = self.find_short(short_addr);
        if index < 0 {
            return Err(ErrorCode::NOADDR);
        }
        self.short_entries.map(|entries| {
            entries[index as usize] = MatchEntry::default();
        });
        Ok(())
    }

    pub fn clear_ext(&self, ext_addr: &[u8; 8]) -> Result<(), ErrorCode> {
        let index = self.find_ext(ext_addr);
        if index < 0 {
            return Err(ErrorCode::NOADDR);
        }
        self.ext_entries.map(|entries| {
            entries[index as usize] = MatchEntry::default();
        });
        Ok(())
    }

    pub fn clear_short_entries(&self) {
        self.short_entries
            .put([MatchEntry::default(); NUM_SHORT_ENTRIES]);
    }

    pub fn clear_ext_entries(&self) {
        self.ext_entries.put([MatchEntry::default(); NUM_EXT_ENTRIES]);
    }
}

impl Default for SourceMatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_add_find_clear() {
        let table = SourceMatch::new();
        table.set_pan_id(0x1234);

        assert_eq!(table.find_short(0x0005), -1);
        table.add_short(0x0005).unwrap();
        // checksum = 0x1234 + 0x0005 = 0x1239, slot 0
        assert_eq!(table.find_short(0x0005), 0);
        assert_eq!(table.find_short(0x0006), -1);

        table.clear_short_entries();
        assert_eq!(table.find_short(0x0005), -1);
    }

    #[test]
    fn full_table_reports_no_bufs() {
        let table = SourceMatch::new();
        table.set_pan_id(0);
        for i in 0..NUM_SHORT_ENTRIES as u16 {
            table.add_short(i).unwrap();
        }
        assert_eq!(table.add_short(0x8888), Err(ErrorCode::NOMEM));
    }

    #[test]
    fn clearing_unknown_address_reports_no_address() {
        let table = SourceMatch::new();
        assert_eq!(table.clear_short(0x4242), Err(ErrorCode::NOADDR));
        assert_eq!(table.clear_ext(&[9; 8]), Err(ErrorCode::NOADDR));
    }

    #[test]
    fn checksum_collisions_are_accepted() {
        let table = SourceMatch::new();
        table.set_pan_id(0x0010);
        table.add_short(0x0001).unwrap();
        // 0x0001 + 0x0010 == 0x0011: any address summing to the same value
        // matches the same slot. This mirrors the hardware acceleration
        // semantics.
        assert_eq!(table.find_short(0x0001), 0);
        table.set_pan_id(0x0000);
        assert_eq!(table.find_short(0x0011), 0);
    }

    #[test]
    fn ext_checksum_matches_word_sum() {
        let table = SourceMatch::new();
        table.set_pan_id(0x1234);
        let addr = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        table.add_ext(&addr).unwrap();
        assert_eq!(table.find_ext(&addr), 0);
        let other = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x09];
        assert_eq!(table.find_ext(&other), -1);
    }
}
