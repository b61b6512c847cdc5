//! `search` — linear block scanner for forensic rediscovery of directory
//! entries when catalog metadata has been overwritten but leaf B-tree nodes
//! are still intact somewhere in the container.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use apfs::btree::{BTreeNode, BTNODE_FIXED_KV_SIZE};
use apfs::catalog::{decode_catalog_key, decode_drec_name, J_TYPE_DIR_REC};
use apfs::fletcher;
use apfs::object::{self, ObjectHeader};

/// Scan a raw APFS container for directory-entry records by name, bypassing
/// the catalog tree entirely. The original tool hard-coded this window and
/// name list; both are flags here (spec.md §9 REDESIGN FLAGS).
#[derive(Parser, Debug)]
#[command(name = "search")]
struct Args {
    /// Path to the container image
    container: String,

    /// First physical block address to scan (hex or decimal)
    #[arg(long, value_parser = parse_addr, default_value = "0xa5e3c")]
    start: u64,

    /// One past the last physical block address to scan (hex or decimal)
    #[arg(long, value_parser = parse_addr, default_value = "0x120000")]
    end: u64,

    /// Newline-separated file containing the names to search for; falls
    /// back to a small built-in sample list when omitted.
    #[arg(long)]
    names: Option<PathBuf>,
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse::<u64>().map_err(|e| e.to_string())
    }
}

const DEFAULT_NAMES: &[&str] = &[
    "id_rsa",
    "id_rsa.pub",
    "authorized_keys",
    "known_hosts",
    ".ssh",
];

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(&args) {
        Ok(count) => {
            println!("finished search; found {count} matches.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> apfs::Result<usize> {
    let names: Vec<String> = match &args.names {
        Some(path) => std::fs::read_to_string(path)?
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        None => DEFAULT_NAMES.iter().map(|s| s.to_string()).collect(),
    };

    let file = File::open(&args.container)?;
    let mut reader = BufReader::new(file);

    let nxsb = apfs::superblock::read_nxsb(&mut reader)?;
    let block_size = nxsb.block_size;

    log::info!(
        "scanning blocks [{:#x}, {:#x}) of {} for {} name(s)",
        args.start,
        args.end,
        args.container,
        names.len()
    );

    let mut matches = 0usize;

    for addr in args.start..args.end {
        let block = match object::read_block(&mut reader, addr, block_size) {
            Ok(b) => b,
            Err(_) => break, // reached EOF or a seek failure; stop scanning
        };

        if !fletcher::verify_object(&block) {
            continue;
        }
        let header = match ObjectHeader::parse(&block) {
            Ok(h) => h,
            Err(_) => continue,
        };
        if !object::is_fs_tree(&header) {
            continue;
        }

        let node = match BTreeNode::parse(&block) {
            Ok(n) => n,
            Err(_) => continue,
        };
        if node.node_header.btn_flags & BTNODE_FIXED_KV_SIZE != 0 {
            continue;
        }
        if !node.node_header.is_leaf() {
            continue;
        }

        for i in 0..node.node_header.btn_nkeys as usize {
            let key = match node.key(i, 0) {
                Ok(k) => k,
                Err(_) => continue,
            };
            let (_oid, j_type) = match decode_catalog_key(key) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if j_type != J_TYPE_DIR_REC {
                continue;
            }
            let name = match decode_drec_name(key) {
                Ok(n) => n,
                Err(_) => continue,
            };
            if names.iter().any(|n| n == &name) {
                println!("{addr:#x}: {name}");
                matches += 1;
            }
        }
    }

    Ok(matches)
}
