use std::{
	io::{Error as IoError, ErrorKind, SeekFrom},
	path::Path,
};

use crate::{
	codec::{Backend, Codec},
	data::*,
	error::Result,
};

/// Options for building a fresh volume.
#[derive(Debug, Clone, Default)]
pub struct FormatOpts {
	/// Volume name, truncated to the superblock field.
	pub name: String,

	/// Requested inode count; rounded up to a whole inode-table block.
	/// Defaults to one inode per eight blocks.
	pub itotal: Option<u32>,

	/// Zero-fill the payload of every free cluster.
	pub zero: bool,
}

/// The geometry a format run settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
	pub ntotal:      u32,
	pub itable_size: u32,
	pub itotal:      u32,
	pub dzone_total: u32,
}

/// Build a fresh volume on the backing file at `path`.
pub fn format(path: &Path, opts: &FormatOpts) -> Result<Geometry> {
	let mut file = std::fs::File::options().read(true).write(true).open(path)?;
	format_backend(&mut file, opts)
}

pub(crate) fn format_backend<B: Backend>(file: &mut B, opts: &FormatOpts) -> Result<Geometry> {
	let len = file.seek(SeekFrom::End(0))?;
	if len == 0 || len % BLOCK_SIZE as u64 != 0 {
		return Err(IoError::new(
			ErrorKind::InvalidInput,
			format!("backing file size {len} is not a positive multiple of {BLOCK_SIZE}"),
		)
		.into());
	}
	let nblocks = (len / BLOCK_SIZE as u64) as u32;

	let requested = opts.itotal.unwrap_or(nblocks / 8).max(IPB as u32);
	let itable_size = requested.div_ceil(IPB as u32);
	let itotal = itable_size * IPB as u32;

	if nblocks < 1 + itable_size + BPC as u32 {
		return Err(IoError::new(
			ErrorKind::InvalidInput,
			format!("{nblocks} blocks cannot hold {itotal} inodes and a data zone"),
		)
		.into());
	}
	let dzone_total = (nblocks - 1 - itable_size) / BPC as u32;
	let ntotal = 1 + itable_size + dzone_total * BPC as u32;

	let geo = Geometry {
		ntotal,
		itable_size,
		itotal,
		dzone_total,
	};
	log::info!("formatting: {geo:?}");

	let mut file = Codec::new(file);
	let cred = Cred::current();
	let now = unix_now();

	// superblock
	let mut name = [0u8; VOLNAME_SIZE];
	let n = opts.name.len().min(VOLNAME_SIZE - 1);
	name[..n].copy_from_slice(&opts.name.as_bytes()[..n]);

	let sb = Superblock {
		magic: MAGIC,
		version: VERSION,
		name,
		ntotal,
		mstat: PRU,
		itable_start: 1,
		itable_size,
		itotal,
		ifree: itotal - 1,
		ihead: 1,
		itail: itotal - 1,
		dzone_start: 1 + itable_size,
		dzone_total,
		dzone_free: dzone_total - 1,
		retrieval: DzoneCache::empty_retrieval(),
		insertion: DzoneCache::empty_insertion(),
		dhead: if dzone_total > 1 { 1 } else { NULL_CLUSTER },
		dtail: if dzone_total > 1 {
			dzone_total - 1
		} else {
			NULL_CLUSTER
		},
		reserved: [0u8; SB_RESERVED],
	};
	file.encode_at(0, &sb)?;

	// inode table: the root in use, the rest one long free-clean chain
	let root = Inode {
		mode:     INODE_DIR | 0o777,
		refcount: 2,
		owner:    cred.uid,
		group:    cred.gid,
		size:     DIR_CLUSTER_SIZE as u32,
		clucount: 1,
		meta:     Meta::Used {
			atime: now,
			mtime: now,
		},
		d:        {
			let mut d = [NULL_CLUSTER; N_DIRECT];
			d[0] = 0;
			d
		},
		i1:       NULL_CLUSTER,
		i2:       NULL_CLUSTER,
	};

	for blk in 0..itable_size {
		let mut ib = InodeBlock {
			ino: [Inode::free_clean(NULL_INODE, NULL_INODE); IPB],
		};
		for slot in 0..IPB {
			let inr = blk * IPB as u32 + slot as u32;
			ib.ino[slot] = if inr == 0 {
				root
			} else {
				let prev = if inr == 1 { NULL_INODE } else { inr - 1 };
				let next = if inr == itotal - 1 {
					NULL_INODE
				} else {
					inr + 1
				};
				Inode::free_clean(prev, next)
			};
		}
		file.encode_at((sb.itable_start + blk) as u64 * BLOCK_SIZE as u64, &ib)?;
	}

	// cluster 0: the root directory
	let mut cl0 = Cluster::allocated(0);
	cl0.fill_empty_dir_entries();
	cl0.set_dir_entry(0, &DirEntry::new(".", 0));
	cl0.set_dir_entry(1, &DirEntry::new("..", 0));
	file.encode_at(sb.cluster_block(0) as u64 * BLOCK_SIZE as u64, &cl0)?;

	// remaining clusters: nodes of the general free list
	for ncl in 1..dzone_total {
		let prev = if ncl == 1 { NULL_CLUSTER } else { ncl - 1 };
		let next = if ncl == dzone_total - 1 {
			NULL_CLUSTER
		} else {
			ncl + 1
		};
		let off = sb.cluster_block(ncl) as u64 * BLOCK_SIZE as u64;
		if opts.zero {
			let cl = Cluster {
				prev,
				next,
				stat: NULL_INODE,
				data: [0u8; BSLPC],
			};
			file.encode_at(off, &cl)?;
		} else {
			// header only, payload left as found
			file.encode_at(off, &(prev, next, NULL_INODE))?;
		}
	}

	file.flush()?;
	Ok(geo)
}
