//! OTA engine
//!
//! Reads and rewrites the `otadata` partition that the ESP-IDF bootloader
//! consults to decide which `ota_N` app partition to boot. The on-flash
//! layout and selection rules mirror the `Ota`/`OtaSelectEntry` design used
//! by the ESP-IDF bootloader support in the `esp-bootloader-esp-idf` crate:
//! two 0x1000-byte sectors, each holding one [`OtaSelectEntry`] followed by
//! padding, with the higher sequence number winning and `0xFFFFFFFF` meaning
//! "never written".

use bytemuck::{bytes_of, from_bytes, Pod, Zeroable};
use crc::{Algorithm, Crc};

use crate::{error::Error, partition_io::PartitionIo};

const SECTOR_SIZE: u32 = 0x1000;
const SEQ_UNSET: u32 = 0xFFFF_FFFF;

const CRC32_ALGORITHM: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0,
    refin: true,
    refout: true,
    xorout: 0xFFFF_FFFF,
    check: 0,
    residue: 0,
};

/// Which `ota_N` app partition the bootloader will boot next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Neither slot has ever been selected; the bootloader falls back to
    /// `factory` or `ota_0`.
    None,
    Slot0,
    Slot1,
}

impl Slot {
    pub fn number(self) -> Option<u8> {
        match self {
            Slot::None => None,
            Slot::Slot0 => Some(0),
            Slot::Slot1 => Some(1),
        }
    }
}

/// Derives the active `ota_N` slot from a sequence number: `(seq - 1) mod
/// num_ota_slots`, per the ESP-IDF bootloader's selection rule. This crate
/// only targets 2-slot (`ota_0`/`ota_1`) devices, so `num_ota_slots` is
/// fixed at 2 rather than threaded through from the partition table.
fn slot_from_seq(seq: u32) -> Slot {
    match (seq - 1) % 2 {
        0 => Slot::Slot0,
        _ => Slot::Slot1,
    }
}

/// Boot-state attached to the currently selected slot, mirroring the states
/// ESP-IDF's rollback logic understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OtaImageState {
    New = 0,
    PendingVerify = 1,
    Valid = 2,
    Invalid = 3,
    Aborted = 4,
    Undefined = 0xFFFF_FFFF,
}

impl OtaImageState {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => OtaImageState::New,
            1 => OtaImageState::PendingVerify,
            2 => OtaImageState::Valid,
            3 => OtaImageState::Invalid,
            4 => OtaImageState::Aborted,
            _ => OtaImageState::Undefined,
        }
    }
}

/// On-flash layout of one `otadata` sector, as consumed by the ESP-IDF
/// bootloader. `seq_label` is unused by this crate beyond round-tripping it.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct OtaSelectEntry {
    ota_seq: u32,
    seq_label: [u8; 20],
    ota_state: u32,
    crc: u32,
}

impl OtaSelectEntry {
    fn blank() -> Self {
        OtaSelectEntry {
            ota_seq: SEQ_UNSET,
            seq_label: [0xFF; 20],
            ota_state: OtaImageState::Undefined as u32,
            crc: 0,
        }
    }

    fn parse(bytes: &[u8]) -> Self {
        *from_bytes(&bytes[..std::mem::size_of::<OtaSelectEntry>()])
    }

    fn crc_is_valid(&self) -> bool {
        if self.ota_seq == SEQ_UNSET {
            return true;
        }
        let crc = Crc::<u32>::new(&CRC32_ALGORITHM);
        crc.checksum(&self.ota_seq.to_le_bytes()) == self.crc
    }

    fn with_recomputed_crc(mut self) -> Self {
        let crc = Crc::<u32>::new(&CRC32_ALGORITHM);
        self.crc = crc.checksum(&self.ota_seq.to_le_bytes());
        self
    }

    fn emit(&self) -> Vec<u8> {
        bytes_of(self).to_vec()
    }
}

/// Reads and updates the two-sector `otadata` region for an app partition
/// set with `ota_count` `ota_N` slots.
pub struct Ota<'a, 'io> {
    io: &'a mut PartitionIo<'io>,
}

impl<'a, 'io> Ota<'a, 'io> {
    /// `io` must be a [`PartitionIo`] view over exactly the `otadata`
    /// partition (two `0x1000`-byte sectors).
    pub fn new(io: &'a mut PartitionIo<'io>) -> Result<Self, Error> {
        if io.len() < 2 * SECTOR_SIZE {
            return Err(Error::FsError(
                "otadata partition must be at least two 0x1000 sectors".into(),
            ));
        }
        Ok(Ota { io })
    }

    fn read_sector(&mut self, index: u32) -> Result<OtaSelectEntry, Error> {
        let bytes = self.io.read(index * SECTOR_SIZE, SECTOR_SIZE as usize)?;
        Ok(OtaSelectEntry::parse(&bytes))
    }

    fn write_sector(&mut self, index: u32, entry: &OtaSelectEntry) -> Result<(), Error> {
        let mut sector = entry.emit();
        sector.resize(SECTOR_SIZE as usize, 0xFF);
        self.io.erase(index * SECTOR_SIZE, SECTOR_SIZE as usize)?;
        self.io.write(index * SECTOR_SIZE, &sector)
    }

    /// The physical sector (0 or 1) currently holding the active record —
    /// the valid entry with the higher sequence number — together with its
    /// sequence number. `None` if neither sector has ever been written.
    /// This is distinct from the *slot* the sequence number resolves to:
    /// the two sectors ping-pong independently of which `ota_N` partition
    /// they currently point at.
    fn active_sector(&mut self) -> Result<Option<(u32, u32)>, Error> {
        let e0 = self.read_sector(0)?;
        let e1 = self.read_sector(1)?;
        let v0 = (e0.ota_seq != SEQ_UNSET && e0.crc_is_valid()).then_some((0u32, e0.ota_seq));
        let v1 = (e1.ota_seq != SEQ_UNSET && e1.crc_is_valid()).then_some((1u32, e1.ota_seq));
        Ok(match (v0, v1) {
            (None, None) => None,
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (Some(a), Some(b)) => Some(if a.1 >= b.1 { a } else { b }),
        })
    }

    /// The slot the bootloader will boot next: `(seq - 1) mod
    /// num_ota_slots` of whichever sector holds the higher valid sequence
    /// number, or [`Slot::None`] if neither sector has ever been written.
    pub fn current_slot(&mut self) -> Result<Slot, Error> {
        Ok(match self.active_sector()? {
            None => Slot::None,
            Some((_, seq)) => slot_from_seq(seq),
        })
    }

    /// Returns the boot state attached to the currently selected slot, or
    /// [`OtaImageState::Undefined`] if no slot has been selected.
    pub fn current_state(&mut self) -> Result<OtaImageState, Error> {
        match self.active_sector()? {
            None => Ok(OtaImageState::Undefined),
            Some((sector, _)) => {
                let entry = self.read_sector(sector)?;
                Ok(OtaImageState::from_u32(entry.ota_state))
            }
        }
    }

    /// Selects `slot` to boot next time: writes a sequence number one
    /// higher than the current maximum, and a fresh boot state of `New` so
    /// the bootloader treats it as an update pending first-boot
    /// verification, to whichever physical sector does *not* currently hold
    /// the active record — so the old record is always the last one
    /// overwritten, and a power loss mid-write leaves the previous active
    /// record intact.
    pub fn set_current_slot(&mut self, slot: Slot) -> Result<(), Error> {
        let target = slot
            .number()
            .ok_or_else(|| Error::user("ota_update", "cannot select the \"no slot\" state"))?;

        let active = self.active_sector()?;
        let max_seq = active.map(|(_, seq)| seq).unwrap_or(0);
        let new_seq = max_seq + 1;
        debug_assert_eq!(
            slot_from_seq(new_seq).number(),
            Some(target),
            "requested slot does not match the slot the next sequence number resolves to"
        );

        let write_sector = match active {
            Some((0, _)) => 1,
            _ => 0,
        };

        let entry = OtaSelectEntry {
            ota_seq: new_seq,
            ota_state: OtaImageState::New as u32,
            ..OtaSelectEntry::blank()
        }
        .with_recomputed_crc();

        self.write_sector(write_sector, &entry)
    }

    /// Marks the currently selected slot's image as valid, confirming the
    /// update and disabling automatic rollback on the next reset.
    pub fn confirm(&mut self) -> Result<(), Error> {
        self.set_state(OtaImageState::Valid)
    }

    /// Marks the currently selected slot's image as invalid, so the
    /// bootloader falls back to the other slot on the next reset.
    pub fn rollback(&mut self) -> Result<(), Error> {
        self.set_state(OtaImageState::Invalid)
    }

    fn set_state(&mut self, state: OtaImageState) -> Result<(), Error> {
        let (sector, _) = self
            .active_sector()?
            .ok_or_else(|| Error::FsError("no ota slot is currently selected".into()))?;
        let mut entry = self.read_sector(sector)?;
        entry.ota_state = state as u32;
        let entry = entry.with_recomputed_crc();
        self.write_sector(sector, &entry)
    }

    /// Slot that should receive a freshly written update image: the one
    /// that the next sequence number will resolve to, so the running image
    /// stays bootable until the new one is confirmed.
    pub fn next_update_slot(&mut self) -> Result<Slot, Error> {
        let max_seq = self.active_sector()?.map(|(_, seq)| seq).unwrap_or(0);
        Ok(slot_from_seq(max_seq + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash_io::FileFlashIo;
    use tempfile::NamedTempFile;

    fn fresh_ota() -> (NamedTempFile, FileFlashIo) {
        let tmp = NamedTempFile::new().unwrap();
        let io = FileFlashIo::create(tmp.path(), 0x2000).unwrap();
        (tmp, io)
    }

    #[test]
    fn unwritten_otadata_has_no_current_slot() {
        let (_tmp, mut io) = fresh_ota();
        let mut view = PartitionIo::new(&mut io, 0, 0x2000);
        let mut ota = Ota::new(&mut view).unwrap();
        assert_eq!(ota.current_slot().unwrap(), Slot::None);
    }

    #[test]
    fn selecting_a_slot_then_reading_it_back_round_trips() {
        let (_tmp, mut io) = fresh_ota();
        let mut view = PartitionIo::new(&mut io, 0, 0x2000);
        let mut ota = Ota::new(&mut view).unwrap();

        ota.set_current_slot(Slot::Slot0).unwrap();
        assert_eq!(ota.current_slot().unwrap(), Slot::Slot0);
        assert_eq!(ota.current_state().unwrap(), OtaImageState::New);

        ota.set_current_slot(Slot::Slot1).unwrap();
        assert_eq!(ota.current_slot().unwrap(), Slot::Slot1);
    }

    #[test]
    fn confirm_and_rollback_update_state_in_place() {
        let (_tmp, mut io) = fresh_ota();
        let mut view = PartitionIo::new(&mut io, 0, 0x2000);
        let mut ota = Ota::new(&mut view).unwrap();

        ota.set_current_slot(Slot::Slot0).unwrap();
        ota.confirm().unwrap();
        assert_eq!(ota.current_state().unwrap(), OtaImageState::Valid);

        ota.rollback().unwrap();
        assert_eq!(ota.current_state().unwrap(), OtaImageState::Invalid);
    }

    #[test]
    fn next_update_slot_alternates() {
        let (_tmp, mut io) = fresh_ota();
        let mut view = PartitionIo::new(&mut io, 0, 0x2000);
        let mut ota = Ota::new(&mut view).unwrap();

        assert_eq!(ota.next_update_slot().unwrap(), Slot::Slot0);
        ota.set_current_slot(Slot::Slot0).unwrap();
        assert_eq!(ota.next_update_slot().unwrap(), Slot::Slot1);
    }
}
