use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{
	de::Decoder,
	enc::Encoder,
	error::{DecodeError, EncodeError},
	Decode, Encode,
};

/// SOFS11 superblock magic number ("SOFS" in little-endian byte order).
pub const MAGIC: u32 = 0x534F_4653;

/// On-disk format version.
pub const VERSION: u32 = 11;

/// `mstat` value of a properly unmounted volume.
pub const PRU: u32 = 0xFEFE;

/// `mstat` value of a volume that was not properly unmounted.
pub const NPRU: u32 = 0xFDFD;

/// Size of a block, the unit of backing-file I/O.
pub const BLOCK_SIZE: usize = 512;

/// Number of contiguous blocks in a cluster.
pub const BPC: usize = 4;

/// Total size of a cluster, header included.
pub const CLUSTER_SIZE: usize = BLOCK_SIZE * BPC;

/// Size of the cluster header: `prev`, `next` and `stat`, a u32 each.
pub const CLUSTER_HEADER_SIZE: usize = 12;

/// Payload bytes stored in one cluster.
pub const BSLPC: usize = CLUSTER_SIZE - CLUSTER_HEADER_SIZE;

/// Size of an on-disk inode.
pub const INODE_SIZE: usize = 64;

/// Inodes per block of the inode table.
pub const IPB: usize = BLOCK_SIZE / INODE_SIZE;

/// Direct data-cluster references in an inode.
pub const N_DIRECT: usize = 7;

/// Cluster references fitting in one reference cluster.
pub const RPC: usize = BSLPC / 4;

/// Size of a directory entry: name bytes plus the inode number.
pub const DIR_ENTRY_SIZE: usize = 64;

/// Maximum length of an entry name, excluding the terminating NUL.
pub const MAX_NAME: usize = DIR_ENTRY_SIZE - 4 - 1;

/// Directory entries per cluster.
pub const DPC: usize = BSLPC / DIR_ENTRY_SIZE;

/// Directory payload bytes per cluster; `size` of a directory grows in
/// these units.
pub const DIR_CLUSTER_SIZE: usize = DPC * DIR_ENTRY_SIZE;

/// Capacity of the in-superblock retrieval and insertion caches.
pub const DZONE_CACHE_SIZE: usize = 50;

/// Volume-name bytes in the superblock, NUL padded.
pub const VOLNAME_SIZE: usize = 24;

/// Reserved bytes padding the superblock record to a full block.
pub const SB_RESERVED: usize = 20;

/// Highest logical file-cluster index, exclusive.
pub const MAX_FILE_CLUSTERS: usize = N_DIRECT + RPC + RPC * RPC;

/// Largest representable file, in bytes.
pub const MAX_FILE_SIZE: u64 = MAX_FILE_CLUSTERS as u64 * BSLPC as u64;

/// Null inode reference.
pub const NULL_INODE: u32 = u32::MAX;

/// Null cluster reference.
pub const NULL_CLUSTER: u32 = u32::MAX;

/// Maximum number of symbolic-link expansions in one path resolution.
pub const MAX_SYMLINKS: u32 = 1;

/// regular file
pub const INODE_FILE: u16 = 0x1000;

/// directory
pub const INODE_DIR: u16 = 0x2000;

/// symbolic link
pub const INODE_SYMLINK: u16 = 0x4000;

/// free inode
pub const INODE_FREE: u16 = 0x8000;

/// mask of the file-type bits
pub const INODE_TYPE_MASK: u16 = INODE_FILE | INODE_DIR | INODE_SYMLINK;

/// mask of the permission bits
pub const PERM_MASK: u16 = 0o777;

/// read permission, for access checks
pub const ACCESS_R: u8 = 0b100;

/// write permission, for access checks
pub const ACCESS_W: u8 = 0b010;

/// execute permission, for access checks
pub const ACCESS_X: u8 = 0b001;

/// Seconds since the epoch, the on-disk timestamp granularity.
pub fn unix_now() -> u32 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as u32)
		.unwrap_or(0)
}

/// File type carried by an in-use inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
	RegularFile,
	Directory,
	Symlink,
}

impl InodeKind {
	pub fn bits(self) -> u16 {
		match self {
			Self::RegularFile => INODE_FILE,
			Self::Directory => INODE_DIR,
			Self::Symlink => INODE_SYMLINK,
		}
	}

	pub fn from_bits(mode: u16) -> Option<Self> {
		match mode & INODE_TYPE_MASK {
			INODE_FILE => Some(Self::RegularFile),
			INODE_DIR => Some(Self::Directory),
			INODE_SYMLINK => Some(Self::Symlink),
			_ => None,
		}
	}
}

/// The state an inode is expected to be in when read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeStatus {
	InUse,
	FreeClean,
	FreeDirty,
}

/// One of the in-superblock data-zone caches.
///
/// The retrieval cache fills from the top down (`idx == DZONE_CACHE_SIZE`
/// means empty, occupied entries live in `entries[idx..]`); the insertion
/// cache fills from the bottom up (`idx == 0` means empty, occupied entries
/// live in `entries[..idx]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct DzoneCache {
	pub idx:     u32,
	pub entries: [u32; DZONE_CACHE_SIZE],
}

impl DzoneCache {
	pub fn empty_retrieval() -> Self {
		Self {
			idx:     DZONE_CACHE_SIZE as u32,
			entries: [NULL_CLUSTER; DZONE_CACHE_SIZE],
		}
	}

	pub fn empty_insertion() -> Self {
		Self {
			idx:     0,
			entries: [NULL_CLUSTER; DZONE_CACHE_SIZE],
		}
	}
}

/// The superblock, a single record at block 0 padded to a full block.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Superblock {
	pub magic:        u32,
	pub version:      u32,
	pub name:         [u8; VOLNAME_SIZE],
	pub ntotal:       u32,
	pub mstat:        u32,
	pub itable_start: u32,
	pub itable_size:  u32,
	pub itotal:       u32,
	pub ifree:        u32,
	pub ihead:        u32,
	pub itail:        u32,
	pub dzone_start:  u32,
	pub dzone_total:  u32,
	pub dzone_free:   u32,
	pub retrieval:    DzoneCache,
	pub insertion:    DzoneCache,
	pub dhead:        u32,
	pub dtail:        u32,
	pub reserved:     [u8; SB_RESERVED],
}

impl Superblock {
	/// Physical block holding the inode `inr`.
	pub fn inode_block(&self, inr: u32) -> u32 {
		self.itable_start + inr / IPB as u32
	}

	/// Index of the inode `inr` within its block.
	pub fn inode_slot(inr: u32) -> usize {
		(inr % IPB as u32) as usize
	}

	/// Physical block starting the data cluster `ncl`.
	pub fn cluster_block(&self, ncl: u32) -> u32 {
		self.dzone_start + ncl * BPC as u32
	}

	/// Volume name, up to the first NUL.
	pub fn volume_name(&self) -> &str {
		let len = self
			.name
			.iter()
			.position(|b| *b == 0)
			.unwrap_or(VOLNAME_SIZE);
		std::str::from_utf8(&self.name[..len]).unwrap_or("")
	}
}

/// Timestamps of an in-use inode, or the free-list linkage overlaying them
/// in a free one. The FREE bit of the mode word selects the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Meta {
	Used { atime: u32, mtime: u32 },
	Free { prev: u32, next: u32 },
}

/// A fixed-size inode record, `IPB` per block of the inode table.
#[derive(Debug, Clone, Copy)]
pub struct Inode {
	pub mode:     u16,
	pub refcount: u16,
	pub owner:    u32,
	pub group:    u32,
	pub size:     u32,
	pub clucount: u32,
	pub meta:     Meta,
	pub d:        [u32; N_DIRECT],
	pub i1:       u32,
	pub i2:       u32,
}

impl Inode {
	/// A fresh member of the free list, linked between `prev` and `next`.
	pub fn free_clean(prev: u32, next: u32) -> Self {
		Self {
			mode:     INODE_FREE,
			refcount: 0,
			owner:    0,
			group:    0,
			size:     0,
			clucount: 0,
			meta:     Meta::Free { prev, next },
			d:        [NULL_CLUSTER; N_DIRECT],
			i1:       NULL_CLUSTER,
			i2:       NULL_CLUSTER,
		}
	}

	pub fn kind(&self) -> Option<InodeKind> {
		InodeKind::from_bits(self.mode)
	}

	pub fn perm(&self) -> u16 {
		self.mode & PERM_MASK
	}

	pub fn is_in_use(&self) -> bool {
		self.mode & INODE_FREE == 0
	}

	pub fn is_free(&self) -> bool {
		!self.is_in_use()
	}

	pub fn is_free_clean(&self) -> bool {
		self.mode == INODE_FREE
	}

	pub fn is_free_dirty(&self) -> bool {
		self.is_free() && self.mode != INODE_FREE
	}

	pub fn is_dir(&self) -> bool {
		self.is_in_use() && self.kind() == Some(InodeKind::Directory)
	}

	pub fn atime(&self) -> u32 {
		match self.meta {
			Meta::Used { atime, .. } => atime,
			Meta::Free { .. } => 0,
		}
	}

	pub fn mtime(&self) -> u32 {
		match self.meta {
			Meta::Used { mtime, .. } => mtime,
			Meta::Free { .. } => 0,
		}
	}

	/// Free-list predecessor; NULL_INODE on an in-use inode.
	pub fn prev(&self) -> u32 {
		match self.meta {
			Meta::Free { prev, .. } => prev,
			Meta::Used { .. } => NULL_INODE,
		}
	}

	/// Free-list successor; NULL_INODE on an in-use inode.
	pub fn next(&self) -> u32 {
		match self.meta {
			Meta::Free { next, .. } => next,
			Meta::Used { .. } => NULL_INODE,
		}
	}

	pub fn set_prev(&mut self, prev: u32) {
		if let Meta::Free { prev: p, .. } = &mut self.meta {
			*p = prev;
		}
	}

	pub fn set_next(&mut self, next: u32) {
		if let Meta::Free { next: n, .. } = &mut self.meta {
			*n = next;
		}
	}

	pub fn set_atime(&mut self, t: u32) {
		if let Meta::Used { atime, .. } = &mut self.meta {
			*atime = t;
		}
	}

	pub fn set_mtime(&mut self, t: u32) {
		if let Meta::Used { mtime, .. } = &mut self.meta {
			*mtime = t;
		}
	}
}

// The two overlay words sit at the offsets of the timestamps, so the codec
// has to pick the variant off the mode word instead of deriving.
impl<Context> Decode<Context> for Inode {
	fn decode<D: Decoder<Context = Context>>(d: &mut D) -> Result<Self, DecodeError> {
		let mode = u16::decode(d)?;
		let refcount = u16::decode(d)?;
		let owner = u32::decode(d)?;
		let group = u32::decode(d)?;
		let size = u32::decode(d)?;
		let clucount = u32::decode(d)?;
		let vd1 = u32::decode(d)?;
		let vd2 = u32::decode(d)?;
		let meta = if mode & INODE_FREE == 0 {
			Meta::Used {
				atime: vd1,
				mtime: vd2,
			}
		} else {
			Meta::Free {
				prev: vd1,
				next: vd2,
			}
		};

		Ok(Self {
			mode,
			refcount,
			owner,
			group,
			size,
			clucount,
			meta,
			d: <[u32; N_DIRECT]>::decode(d)?,
			i1: u32::decode(d)?,
			i2: u32::decode(d)?,
		})
	}
}

bincode::impl_borrow_decode!(Inode);

impl Encode for Inode {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.mode.encode(e)?;
		self.refcount.encode(e)?;
		self.owner.encode(e)?;
		self.group.encode(e)?;
		self.size.encode(e)?;
		self.clucount.encode(e)?;
		let (vd1, vd2) = match self.meta {
			Meta::Used { atime, mtime } => (atime, mtime),
			Meta::Free { prev, next } => (prev, next),
		};
		vd1.encode(e)?;
		vd2.encode(e)?;
		self.d.encode(e)?;
		self.i1.encode(e)?;
		self.i2.encode(e)
	}
}

/// One block of the inode table.
#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct InodeBlock {
	pub ino: [Inode; IPB],
}

/// A data cluster: the three-word header followed by the payload, which is
/// file bytes, a directory-entry array or a flat array of cluster
/// references depending on the owning inode.
#[derive(Clone, Encode, Decode)]
pub struct Cluster {
	pub prev: u32,
	pub next: u32,
	pub stat: u32,
	pub data: [u8; BSLPC],
}

impl Cluster {
	/// A cluster allocated to the inode `stat`, zero payload.
	pub fn allocated(stat: u32) -> Self {
		Self {
			prev: NULL_CLUSTER,
			next: NULL_CLUSTER,
			stat,
			data: [0u8; BSLPC],
		}
	}

	/// A clean free cluster.
	pub fn free_clean() -> Self {
		Self::allocated(NULL_INODE)
	}

	/// Header says the cluster is allocated: unlinked, with an owner stamp.
	pub fn is_allocated(&self) -> bool {
		self.prev == NULL_CLUSTER && self.next == NULL_CLUSTER && self.stat != NULL_INODE
	}

	/// Header says the cluster is on the general free list.
	pub fn is_linked(&self) -> bool {
		self.prev != NULL_CLUSTER || self.next != NULL_CLUSTER
	}

	/// Reference at index `i` of a reference cluster.
	pub fn ref_at(&self, i: usize) -> u32 {
		let off = i * 4;
		u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
	}

	pub fn set_ref(&mut self, i: usize, ncl: u32) {
		let off = i * 4;
		self.data[off..off + 4].copy_from_slice(&ncl.to_le_bytes());
	}

	/// Overwrite the payload with `RPC` null references.
	pub fn fill_null_refs(&mut self) {
		for i in 0..RPC {
			self.set_ref(i, NULL_CLUSTER);
		}
	}

	pub fn refs_all_null(&self) -> bool {
		(0..RPC).all(|i| self.ref_at(i) == NULL_CLUSTER)
	}

	/// Directory entry at slot `i`.
	pub fn dir_entry(&self, i: usize) -> DirEntry {
		let off = i * DIR_ENTRY_SIZE;
		DirEntry::from_bytes(&self.data[off..off + DIR_ENTRY_SIZE])
	}

	pub fn set_dir_entry(&mut self, i: usize, de: &DirEntry) {
		let off = i * DIR_ENTRY_SIZE;
		de.to_bytes(&mut self.data[off..off + DIR_ENTRY_SIZE]);
	}

	/// Overwrite the payload with `DPC` clean empty directory entries.
	pub fn fill_empty_dir_entries(&mut self) {
		self.data.fill(0u8);
		for i in 0..DPC {
			self.set_dir_entry(i, &DirEntry::empty());
		}
	}
}

/// A fixed-size directory entry: a NUL-terminated name and an inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
	pub name:   [u8; MAX_NAME + 1],
	pub ninode: u32,
}

impl DirEntry {
	pub fn empty() -> Self {
		Self {
			name:   [0u8; MAX_NAME + 1],
			ninode: NULL_INODE,
		}
	}

	/// Entry for `name`, which must fit `MAX_NAME` bytes.
	pub fn new(name: &str, ninode: u32) -> Self {
		let mut de = Self::empty();
		de.ninode = ninode;
		de.name[..name.len()].copy_from_slice(name.as_bytes());
		de
	}

	pub fn from_bytes(b: &[u8]) -> Self {
		let mut name = [0u8; MAX_NAME + 1];
		name.copy_from_slice(&b[..MAX_NAME + 1]);
		let ninode = u32::from_le_bytes(b[MAX_NAME + 1..DIR_ENTRY_SIZE].try_into().unwrap());
		Self {
			name,
			ninode,
		}
	}

	pub fn to_bytes(&self, b: &mut [u8]) {
		b[..MAX_NAME + 1].copy_from_slice(&self.name);
		b[MAX_NAME + 1..DIR_ENTRY_SIZE].copy_from_slice(&self.ninode.to_le_bytes());
	}

	/// Entry name up to the first NUL.
	pub fn name(&self) -> &str {
		let len = self
			.name
			.iter()
			.position(|b| *b == 0)
			.unwrap_or(MAX_NAME + 1);
		std::str::from_utf8(&self.name[..len]).unwrap_or("")
	}

	/// Never used, or cleanly vacated.
	pub fn is_clean(&self) -> bool {
		self.name[0] == 0 && self.ninode == NULL_INODE
	}

	/// Vacated by remove: dead name, residual bytes kept for offline
	/// recovery.
	pub fn is_dirty(&self) -> bool {
		self.name[0] == 0 && self.ninode != NULL_INODE
	}

	/// Empty in either representation; a populated entry is neither.
	pub fn is_free(&self) -> bool {
		self.name[0] == 0 || self.ninode == NULL_INODE
	}
}

/// Process credentials a mounted volume performs access checks with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cred {
	pub uid: u32,
	pub gid: u32,
}

impl Cred {
	/// Effective credentials of the calling process.
	pub fn current() -> Self {
		Self {
			uid: unsafe { libc::geteuid() },
			gid: unsafe { libc::getegid() },
		}
	}

	pub fn root() -> Self {
		Self {
			uid: 0,
			gid: 0,
		}
	}
}
