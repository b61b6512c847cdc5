//! Checkpoint selection: picks the highest-xid well-formed checkpoint out of
//! the descriptor ring, materialises its (possibly wrapping) block range, and
//! validates the ephemeral objects it names via its checkpoint-mapping blocks.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek};

use crate::error::{ApfsError, Result};
use crate::fletcher;
use crate::object::{self, ObjectHeader, OBJECT_TYPE_CHECKPOINT_MAP};
use crate::superblock::{self, NxSuperblock};

/// One entry of a `checkpoint_map_phys_t`'s mapping array.
#[derive(Debug, Clone)]
pub struct CheckpointMapEntry {
    pub obj_type: u32,
    pub subtype: u32,
    pub size: u32,
    pub fs_oid: u64,
    pub oid: u64,
    pub paddr: u64,
}

const CPM_ENTRY_SIZE: usize = 40;

/// A selected, fully-validated checkpoint: the NX superblock that names it,
/// and a map from ephemeral OID to the physical block it was materialised at.
pub struct Checkpoint {
    pub nxsb: NxSuperblock,
    pub ephemeral: HashMap<u64, u64>,
}

/// Locate the most recent usable checkpoint.
///
/// Scans the descriptor ring for every well-formed NX superblock candidate,
/// then — starting from the highest xid not exceeding `max_xid` — attempts to
/// materialise its checkpoint blocks and validate every ephemeral object they
/// name. If an ephemeral object is corrupt, falls back to the next-lower-xid
/// candidate (spec's preferred resolution for the source's unimplemented
/// fallback; see DESIGN.md).
pub fn locate_checkpoint<R: Read + Seek>(
    reader: &mut R,
    nxsb0: &NxSuperblock,
    max_xid: u64,
) -> Result<Checkpoint> {
    let mut candidates = superblock::scan_nxsb_candidates(reader, nxsb0)?;
    candidates.push(nxsb0.clone());
    candidates.retain(|c| c.header.xid <= max_xid);
    candidates.sort_by(|a, b| b.header.xid.cmp(&a.header.xid));
    candidates.dedup_by_key(|c| c.header.xid);

    if candidates.is_empty() {
        return Err(ApfsError::CorruptedData(
            "no checkpoint candidate with xid <= max_xid".into(),
        ));
    }

    for candidate in &candidates {
        match materialize(reader, candidate) {
            Ok(ephemeral) => {
                log::debug!("selected checkpoint xid={}", candidate.header.xid);
                return Ok(Checkpoint {
                    nxsb: candidate.clone(),
                    ephemeral,
                });
            }
            Err(e) => {
                log::warn!(
                    "checkpoint xid={} failed validation ({e}), falling back to next-older checkpoint",
                    candidate.header.xid
                );
            }
        }
    }

    Err(ApfsError::Unsupported(
        "no checkpoint in the descriptor ring had a fully valid ephemeral set".into(),
    ))
}

/// Materialise one candidate's checkpoint blocks and validate its ephemeral
/// objects, returning oid -> paddr for each one that checksums correctly.
fn materialize<R: Read + Seek>(
    reader: &mut R,
    nxsb: &NxSuperblock,
) -> Result<HashMap<u64, u64>> {
    const NON_CONTIGUOUS_FLAG: u32 = 0x8000_0000;
    if nxsb.xp_desc_len & NON_CONTIGUOUS_FLAG != 0 {
        return Err(ApfsError::Unsupported(
            "non-contiguous checkpoint descriptor area is not supported".into(),
        ));
    }

    let block_size = nxsb.block_size;
    let ring_base = nxsb.xp_desc_base;
    let ring_len = nxsb.xp_desc_blocks as u64;
    let index = nxsb.xp_desc_index as u64;
    let len = nxsb.xp_desc_len as u64;

    let mut ephemeral = HashMap::new();
    let mut cpm_entries: Vec<CheckpointMapEntry> = Vec::new();

    for i in 0..len {
        let ring_slot = (index + i) % ring_len;
        let block_num = ring_base + ring_slot;
        let block = object::read_block(reader, block_num, block_size)?;

        if !fletcher::verify_object(&block) {
            return Err(ApfsError::InvalidChecksum);
        }
        let header = ObjectHeader::parse(&block)?;
        if header.object_type() != OBJECT_TYPE_CHECKPOINT_MAP {
            continue;
        }

        cpm_entries.extend(parse_checkpoint_map(&block)?);
    }

    for entry in &cpm_entries {
        let block = object::read_block(reader, entry.paddr, block_size)?;
        if !fletcher::verify_object(&block) {
            return Err(ApfsError::InvalidChecksum);
        }
        ephemeral.insert(entry.oid, entry.paddr);
    }

    Ok(ephemeral)
}

/// Parse a `checkpoint_map_phys_t` block into its mapping entries.
fn parse_checkpoint_map(block: &[u8]) -> Result<Vec<CheckpointMapEntry>> {
    let mut cursor = Cursor::new(&block[ObjectHeader::SIZE..]);
    let _cpm_flags = cursor.read_u32::<LittleEndian>()?;
    let cpm_count = cursor.read_u32::<LittleEndian>()? as usize;

    let entries_start = ObjectHeader::SIZE + 8;
    let entries_end = entries_start + cpm_count * CPM_ENTRY_SIZE;
    if entries_end > block.len() {
        return Err(ApfsError::CorruptedData(
            "checkpoint-mapping block truncated".into(),
        ));
    }

    let mut entries = Vec::with_capacity(cpm_count);
    let mut cursor = Cursor::new(&block[entries_start..entries_end]);
    for _ in 0..cpm_count {
        let obj_type = cursor.read_u32::<LittleEndian>()?;
        let subtype = cursor.read_u32::<LittleEndian>()?;
        let size = cursor.read_u32::<LittleEndian>()?;
        let _pad = cursor.read_u32::<LittleEndian>()?;
        let fs_oid = cursor.read_u64::<LittleEndian>()?;
        let oid = cursor.read_u64::<LittleEndian>()?;
        let paddr = cursor.read_u64::<LittleEndian>()?;
        entries.push(CheckpointMapEntry {
            obj_type,
            subtype,
            size,
            fs_oid,
            oid,
            paddr,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_checkpoint_map_entries() {
        let mut block = vec![0u8; 4096];
        // object header: leave checksum/oid/xid zero, type = CHECKPOINT_MAP
        block[24..28].copy_from_slice(&OBJECT_TYPE_CHECKPOINT_MAP.to_le_bytes());

        // cpm_flags, cpm_count = 1
        block[32..36].copy_from_slice(&0u32.to_le_bytes());
        block[36..40].copy_from_slice(&1u32.to_le_bytes());

        let entry_off = 40;
        block[entry_off..entry_off + 4].copy_from_slice(&0x0Du32.to_le_bytes()); // obj_type = FS
        block[entry_off + 4..entry_off + 8].copy_from_slice(&0u32.to_le_bytes());
        block[entry_off + 8..entry_off + 12].copy_from_slice(&4096u32.to_le_bytes());
        block[entry_off + 12..entry_off + 16].copy_from_slice(&0u32.to_le_bytes());
        block[entry_off + 16..entry_off + 24].copy_from_slice(&7u64.to_le_bytes()); // fs_oid
        block[entry_off + 24..entry_off + 32].copy_from_slice(&0x4001u64.to_le_bytes()); // oid
        block[entry_off + 32..entry_off + 40].copy_from_slice(&500u64.to_le_bytes()); // paddr

        let entries = parse_checkpoint_map(&block).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].oid, 0x4001);
        assert_eq!(entries[0].paddr, 500);
        assert_eq!(entries[0].fs_oid, 7);
    }
}
