//! Read-only consistency predicates over already-loaded structures, shared
//! by the allocators, the upper layers and fsck. Each predicate reports a
//! distinct error kind and never repairs anything.

use crate::{
	data::*,
	error::{Error, Result},
};

/// Expected state of a data-cluster header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClusterState {
	AllocatedTo(u32),
	FreeClean,
	FreeDirty,
}

/// The superblock is internally consistent: header fields, inode-table
/// arithmetic, data-zone arithmetic and cache bounds.
pub(crate) fn check_superblock(sb: &Superblock) -> Result<()> {
	macro_rules! sbassert {
		($e:expr) => {
			if !($e) {
				log::error!("superblock corrupted: {}", stringify!($e));
				return Err(Error::InvalidSuperblock);
			}
		};
	}

	sbassert!(sb.magic == MAGIC);
	sbassert!(sb.version == VERSION);
	sbassert!(sb.mstat == PRU || sb.mstat == NPRU);

	sbassert!(sb.itable_start == 1);
	sbassert!(sb.itable_size > 0);
	sbassert!(sb.itotal == sb.itable_size * IPB as u32);
	sbassert!(sb.ifree < sb.itotal);

	sbassert!(sb.dzone_start == 1 + sb.itable_size);
	sbassert!(sb.dzone_total > 0);
	sbassert!(sb.ntotal == 1 + sb.itable_size + sb.dzone_total * BPC as u32);
	sbassert!(sb.dzone_free < sb.dzone_total);

	sbassert!((sb.ihead == NULL_INODE) == (sb.itail == NULL_INODE));
	sbassert!((sb.ihead == NULL_INODE) == (sb.ifree == 0));
	sbassert!(sb.ihead == NULL_INODE || sb.ihead < sb.itotal);
	sbassert!(sb.itail == NULL_INODE || sb.itail < sb.itotal);

	sbassert!((sb.dhead == NULL_CLUSTER) == (sb.dtail == NULL_CLUSTER));
	sbassert!(sb.dhead == NULL_CLUSTER || sb.dhead < sb.dzone_total);
	sbassert!(sb.dtail == NULL_CLUSTER || sb.dtail < sb.dzone_total);

	sbassert!(sb.retrieval.idx <= DZONE_CACHE_SIZE as u32);
	sbassert!(sb.insertion.idx <= DZONE_CACHE_SIZE as u32);
	for i in (sb.retrieval.idx as usize)..DZONE_CACHE_SIZE {
		sbassert!(sb.retrieval.entries[i] < sb.dzone_total);
	}
	for i in 0..(sb.insertion.idx as usize) {
		sbassert!(sb.insertion.entries[i] < sb.dzone_total);
	}

	Ok(())
}

fn ref_in_range(r: u32, sb: &Superblock) -> bool {
	r == NULL_CLUSTER || r < sb.dzone_total
}

/// An in-use inode carries exactly one type bit, plausible counters and
/// in-range reference fields.
pub(crate) fn check_inode_in_use(ino: &Inode, sb: &Superblock) -> Result<()> {
	// refcount floors are a directory-graph property, left to fsck; a
	// freshly allocated inode legitimately sits at zero until it is linked
	let ok = ino.is_in_use()
		&& ino.kind().is_some()
		&& (ino.mode & !(INODE_TYPE_MASK | PERM_MASK)) == 0
		&& ino.size as u64 <= MAX_FILE_SIZE
		&& ino.clucount <= MAX_FILE_CLUSTERS as u32
		&& ino.d.iter().all(|r| ref_in_range(*r, sb))
		&& ref_in_range(ino.i1, sb)
		&& ref_in_range(ino.i2, sb);

	if ok {
		Ok(())
	} else {
		Err(Error::InconsistentInodeInUse)
	}
}

/// A free clean inode: mode is exactly FREE, zero counters, null reference
/// fields, in-range free-list linkage.
pub(crate) fn check_inode_free_clean(ino: &Inode, sb: &Superblock) -> Result<()> {
	let link_ok = |n: u32| n == NULL_INODE || n < sb.itotal;
	let ok = ino.is_free_clean()
		&& ino.refcount == 0
		&& ino.size == 0
		&& ino.clucount == 0
		&& ino.d.iter().all(|r| *r == NULL_CLUSTER)
		&& ino.i1 == NULL_CLUSTER
		&& ino.i2 == NULL_CLUSTER
		&& link_ok(ino.prev())
		&& link_ok(ino.next());

	if ok {
		Ok(())
	} else {
		Err(Error::InconsistentFreeCleanInode)
	}
}

/// A free dirty inode: only the FREE bit and the linkage need to hold; the
/// rest is stale until cleaned.
pub(crate) fn check_inode_free_dirty(ino: &Inode, sb: &Superblock) -> Result<()> {
	let link_ok = |n: u32| n == NULL_INODE || n < sb.itotal;
	let ok = ino.is_free() && link_ok(ino.prev()) && link_ok(ino.next());

	if ok {
		Ok(())
	} else {
		Err(Error::InconsistentFreeDirtyInode)
	}
}

/// Every non-null entry of a reference cluster is within the data zone.
pub(crate) fn check_ref_list(cl: &Cluster, sb: &Superblock) -> Result<()> {
	for i in 0..RPC {
		if !ref_in_range(cl.ref_at(i), sb) {
			return Err(Error::InconsistentRefList);
		}
	}
	Ok(())
}

/// A data-cluster header matches the state the caller expects it in.
pub(crate) fn check_cluster_header(
	cl: &Cluster,
	expected: ClusterState,
	sb: &Superblock,
) -> Result<()> {
	let ok = match expected {
		ClusterState::AllocatedTo(n) => {
			cl.prev == NULL_CLUSTER && cl.next == NULL_CLUSTER && cl.stat == n
		}
		ClusterState::FreeClean => {
			cl.prev == NULL_CLUSTER && cl.next == NULL_CLUSTER && cl.stat == NULL_INODE
		}
		ClusterState::FreeDirty => {
			(cl.prev == NULL_CLUSTER || cl.prev < sb.dzone_total)
				&& (cl.next == NULL_CLUSTER || cl.next < sb.dzone_total)
		}
	};

	if ok {
		Ok(())
	} else {
		Err(Error::InconsistentClusterHeader)
	}
}

/// Directory contents are well formed: the size is a whole number of entry
/// clusters and the first cluster opens with `.` and `..`.
pub(crate) fn check_directory(dino: &Inode, self_inr: u32, first: &Cluster, sb: &Superblock) -> Result<()> {
	if !dino.is_dir() || dino.size as usize % DIR_CLUSTER_SIZE != 0 || dino.size == 0 {
		return Err(Error::InconsistentDirectory);
	}

	let dot = first.dir_entry(0);
	let dotdot = first.dir_entry(1);
	let ok = dot.name() == "."
		&& dot.ninode == self_inr
		&& dotdot.name() == ".."
		&& dotdot.ninode != NULL_INODE
		&& dotdot.ninode < sb.itotal;

	if ok {
		Ok(())
	} else {
		Err(Error::InconsistentDirectory)
	}
}

#[cfg(test)]
mod t {
	use super::*;

	fn sb() -> Superblock {
		Superblock {
			magic:        MAGIC,
			version:      VERSION,
			name:         [0u8; VOLNAME_SIZE],
			ntotal:       100,
			mstat:        PRU,
			itable_start: 1,
			itable_size:  7,
			itotal:       56,
			ifree:        55,
			ihead:        1,
			itail:        55,
			dzone_start:  8,
			dzone_total:  23,
			dzone_free:   22,
			retrieval:    DzoneCache::empty_retrieval(),
			insertion:    DzoneCache::empty_insertion(),
			dhead:        1,
			dtail:        22,
			reserved:     [0u8; SB_RESERVED],
		}
	}

	#[test]
	fn superblock_arithmetic() {
		assert!(check_superblock(&sb()).is_ok());

		let mut bad = sb();
		bad.ntotal += 1;
		assert!(check_superblock(&bad).is_err());

		let mut bad = sb();
		bad.itotal = 57;
		assert!(check_superblock(&bad).is_err());

		let mut bad = sb();
		bad.ihead = NULL_INODE;
		assert!(check_superblock(&bad).is_err());
	}

	#[test]
	fn in_use_inode() {
		let sb = sb();
		let mut ino = Inode {
			mode:     INODE_FILE | 0o644,
			refcount: 1,
			owner:    0,
			group:    0,
			size:     10,
			clucount: 1,
			meta:     Meta::Used {
				atime: 0,
				mtime: 0,
			},
			d:        [NULL_CLUSTER; N_DIRECT],
			i1:       NULL_CLUSTER,
			i2:       NULL_CLUSTER,
		};
		ino.d[0] = 5;
		assert!(check_inode_in_use(&ino, &sb).is_ok());

		ino.d[0] = sb.dzone_total;
		assert!(matches!(
			check_inode_in_use(&ino, &sb),
			Err(Error::InconsistentInodeInUse)
		));

		ino.d[0] = 5;
		ino.mode = INODE_FILE | INODE_DIR | 0o644;
		assert!(check_inode_in_use(&ino, &sb).is_err());

		ino.mode = INODE_FREE | INODE_FILE | 0o644;
		assert!(check_inode_in_use(&ino, &sb).is_err());
	}

	#[test]
	fn free_inodes() {
		let sb = sb();
		let ino = Inode::free_clean(3, 9);
		assert!(check_inode_free_clean(&ino, &sb).is_ok());
		assert!(check_inode_free_dirty(&ino, &sb).is_ok());

		let mut dirty = ino;
		dirty.mode = INODE_FREE | INODE_FILE | 0o600;
		dirty.size = 77;
		dirty.d[2] = 4;
		assert!(check_inode_free_clean(&dirty, &sb).is_err());
		assert!(check_inode_free_dirty(&dirty, &sb).is_ok());

		let mut bad = dirty;
		bad.set_next(sb.itotal);
		assert!(matches!(
			check_inode_free_dirty(&bad, &sb),
			Err(Error::InconsistentFreeDirtyInode)
		));
	}

	#[test]
	fn cluster_headers() {
		let sb = sb();
		let cl = Cluster::allocated(4);
		assert!(check_cluster_header(&cl, ClusterState::AllocatedTo(4), &sb).is_ok());
		assert!(check_cluster_header(&cl, ClusterState::AllocatedTo(5), &sb).is_err());
		assert!(check_cluster_header(&cl, ClusterState::FreeClean, &sb).is_err());
		assert!(check_cluster_header(&Cluster::free_clean(), ClusterState::FreeClean, &sb).is_ok());

		let mut linked = Cluster::free_clean();
		linked.prev = 2;
		linked.next = 9;
		assert!(check_cluster_header(&linked, ClusterState::FreeDirty, &sb).is_ok());
		linked.next = sb.dzone_total;
		assert!(check_cluster_header(&linked, ClusterState::FreeDirty, &sb).is_err());
	}

	#[test]
	fn ref_list_bounds() {
		let sb = sb();
		let mut cl = Cluster::allocated(1);
		cl.fill_null_refs();
		cl.set_ref(0, 3);
		assert!(check_ref_list(&cl, &sb).is_ok());
		cl.set_ref(RPC - 1, sb.dzone_total + 1);
		assert!(matches!(
			check_ref_list(&cl, &sb),
			Err(Error::InconsistentRefList)
		));
	}

	#[test]
	fn directory_contents() {
		let sb = sb();
		let dino = Inode {
			mode:     INODE_DIR | 0o755,
			refcount: 2,
			owner:    0,
			group:    0,
			size:     DIR_CLUSTER_SIZE as u32,
			clucount: 1,
			meta:     Meta::Used {
				atime: 0,
				mtime: 0,
			},
			d:        [0, NULL_CLUSTER, NULL_CLUSTER, NULL_CLUSTER, NULL_CLUSTER, NULL_CLUSTER, NULL_CLUSTER],
			i1:       NULL_CLUSTER,
			i2:       NULL_CLUSTER,
		};
		let mut first = Cluster::allocated(0);
		first.fill_empty_dir_entries();
		first.set_dir_entry(0, &DirEntry::new(".", 0));
		first.set_dir_entry(1, &DirEntry::new("..", 0));
		assert!(check_directory(&dino, 0, &first, &sb).is_ok());

		first.set_dir_entry(0, &DirEntry::new(".", 3));
		assert!(matches!(
			check_directory(&dino, 0, &first, &sb),
			Err(Error::InconsistentDirectory)
		));
	}
}
