use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::btree::BTreeNode;
use crate::error::{ApfsError, Result};
use crate::object;

/// OMAP key: (oid: u64, xid: u64) — 16 bytes, fixed-size.
/// OMAP value: (flags: u32, size: u32, paddr: u64) — 16 bytes, fixed-size.
const OMAP_KEY_SIZE: u32 = 16;
const OMAP_VAL_SIZE: u32 = 16;

/// Read the OMAP structure at a given physical block and return the
/// physical block number of the OMAP B-tree root.
pub fn read_omap_tree_root<R: Read + Seek>(
    reader: &mut R,
    omap_block: u64,
    block_size: u32,
) -> Result<u64> {
    let (_header, block_data) = object::read_object(reader, omap_block, block_size)?;

    // omap_phys_t layout after obj_phys_t (32 bytes):
    //   om_flags: u32 (4)
    //   om_snap_count: u32 (4)
    //   om_tree_type: u32 (4)
    //   om_snapshot_tree_type: u32 (4)
    //   om_tree_oid: u64 (8)  <- B-tree root physical block
    let mut cursor = Cursor::new(&block_data[object::ObjectHeader::SIZE..]);
    let _om_flags = cursor.read_u32::<LittleEndian>()?;
    let _om_snap_count = cursor.read_u32::<LittleEndian>()?;
    let _om_tree_type = cursor.read_u32::<LittleEndian>()?;
    let _om_snap_tree_type = cursor.read_u32::<LittleEndian>()?;
    let om_tree_oid = cursor.read_u64::<LittleEndian>()?;

    Ok(om_tree_oid)
}

/// Decode an OMAP key into (oid, xid).
fn parse_omap_key(key: &[u8]) -> Result<(u64, u64)> {
    if key.len() < OMAP_KEY_SIZE as usize {
        return Err(ApfsError::InvalidBTree("omap key too short".into()));
    }
    let oid = u64::from_le_bytes([key[0], key[1], key[2], key[3], key[4], key[5], key[6], key[7]]);
    let xid = u64::from_le_bytes([key[8], key[9], key[10], key[11], key[12], key[13], key[14], key[15]]);
    Ok((oid, xid))
}

/// Whether a key selects as part of the floor lookup for `(target_oid, max_xid)`:
/// either it belongs to a lower OID entirely, or it shares the target OID with
/// an XID not exceeding the snapshot bound. Keys are sorted by `(oid, xid)`, so
/// this predicate is true for a prefix of any node's key sequence and false
/// after — the last key it holds for is the selected entry.
fn selects(key_oid: u64, key_xid: u64, target_oid: u64, max_xid: u64) -> bool {
    key_oid < target_oid || (key_oid == target_oid && key_xid <= max_xid)
}

/// Look up a virtual OID in an OMAP B-tree and return the physical block address.
///
/// Implements the floor selection spec.md §4.4 requires: the last entry
/// whose key satisfies `key.oid < oid`, or `key.oid == oid ∧ key.xid ≤
/// max_xid`. At each level, the last key satisfying the predicate identifies
/// the child to descend into (mirroring [`crate::btree::btree_lookup`]'s
/// per-level descent); at the leaf, that same rule picks the answer.
pub fn omap_lookup<R: Read + Seek>(
    reader: &mut R,
    omap_tree_root: u64,
    block_size: u32,
    target_oid: u64,
    max_xid: u64,
) -> Result<u64> {
    let (_header, block_data) = object::read_object(reader, omap_tree_root, block_size)?;
    let node = BTreeNode::parse(&block_data)?;

    match omap_lookup_node(reader, &node, block_size, target_oid, max_xid)? {
        Some(paddr) => Ok(paddr),
        None => {
            log::error!("omap lookup: oid {target_oid} not found (max_xid={max_xid})");
            Err(ApfsError::CorruptedData(format!(
                "OMAP lookup failed: OID {} not found with xid <= {}",
                target_oid, max_xid
            )))
        }
    }
}

fn omap_lookup_node<R: Read + Seek>(
    reader: &mut R,
    node: &BTreeNode,
    block_size: u32,
    target_oid: u64,
    max_xid: u64,
) -> Result<Option<u64>> {
    let nkeys = node.node_header.btn_nkeys as usize;

    // Linear scan from entry 0; keys are sorted, so the predicate holds for
    // a prefix and the last index where it holds is the floor entry.
    let mut selected: Option<usize> = None;
    for i in 0..nkeys {
        let key = node.key(i, OMAP_KEY_SIZE)?;
        let (key_oid, key_xid) = parse_omap_key(key)?;
        if selects(key_oid, key_xid, target_oid, max_xid) {
            selected = Some(i);
        } else {
            break;
        }
    }

    let idx = match selected {
        Some(i) => i,
        None => return Ok(None),
    };

    if node.node_header.is_leaf() {
        let (key_oid, _) = parse_omap_key(node.key(idx, OMAP_KEY_SIZE)?)?;
        if key_oid != target_oid {
            // The floor entry belongs to a lower OID entirely: no entry for
            // target_oid satisfies the selection rule.
            return Ok(None);
        }
        let val = node.value(idx, OMAP_VAL_SIZE)?;
        Ok(Some(parse_omap_val(val)?))
    } else {
        // OMAP trees are physical, so child OIDs here are already block numbers.
        let child_block = node.child_oid(idx)?;
        let (_header, child_data) = object::read_object(reader, child_block, block_size)?;
        let child_node = BTreeNode::parse(&child_data)?;
        omap_lookup_node(reader, &child_node, block_size, target_oid, max_xid)
    }
}

/// Parse an OMAP value: (flags: u32, size: u32, paddr: u64)
fn parse_omap_val(val: &[u8]) -> Result<u64> {
    if val.len() < 16 {
        return Err(ApfsError::InvalidBTree("omap value too short".into()));
    }
    let paddr = u64::from_le_bytes([val[8], val[9], val[10], val[11], val[12], val[13], val[14], val[15]]);
    Ok(paddr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::superblock;
    use std::io::BufReader;

    /// Requires ../tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_omap_lookup() {
        let file = std::fs::File::open("../tests/appfs.raw").unwrap();
        let mut reader = BufReader::new(file);

        let nxsb = superblock::read_nxsb(&mut reader).unwrap();
        let latest = crate::checkpoint::locate_checkpoint(&mut reader, &nxsb, u64::MAX).unwrap().nxsb;

        let omap_root = read_omap_tree_root(&mut reader, latest.omap_oid, latest.block_size).unwrap();

        let vol_oid = latest.fs_oids.iter().find(|&&o| o != 0).copied().unwrap();

        let vol_block = omap_lookup(&mut reader, omap_root, latest.block_size, vol_oid, latest.header.xid).unwrap();
        assert!(vol_block > 0 && vol_block < latest.block_count,
            "Physical block {} should be within container", vol_block);

        let (_header, vol_data) = object::read_object(&mut reader, vol_block, latest.block_size).unwrap();
        let vol_sb = superblock::ApfsSuperblock::parse(&vol_data).unwrap();
        assert_eq!(vol_sb.magic, superblock::APSB_MAGIC);
    }
}
