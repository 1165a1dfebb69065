use super::{ClusterOp, Sofs};
use crate::{
	codec::Backend,
	data::*,
	error::{Error, Result},
};

impl<B: Backend> Sofs<B> {
	/// Raw copy of the inode `inr`, no state validation, no stamping.
	pub(crate) fn peek_inode(&mut self, inr: u32) -> Result<Inode> {
		let sb = self.sb()?;
		if inr >= sb.itotal {
			return Err(Error::InvalidInode);
		}
		let blk = sb.inode_block(inr);
		let slot = Superblock::inode_slot(inr);
		self.cache().load_it(blk)?;
		Ok(self.cache().it()?.ino[slot])
	}

	/// Allocate an inode of the given type from the head of the free list.
	///
	/// The new inode is owned by the caller's credentials, carries no
	/// permission bits and no references, and is not yet linked anywhere:
	/// its reference count starts at zero.
	pub fn allocate_inode(&mut self, kind: InodeKind) -> Result<u32> {
		log::trace!("allocate_inode({kind:?});");
		if self.sb()?.ifree == 0 {
			return Err(Error::NoSpace);
		}

		let inr = self.sb()?.ihead;
		let popped = self.read_inode(inr, InodeStatus::FreeDirty)?;

		// detach the head
		let next = popped.next();
		if next == NULL_INODE {
			self.update_sb(|sb| {
				sb.ihead = NULL_INODE;
				sb.itail = NULL_INODE;
			})?;
		} else {
			let mut head = self.read_inode(next, InodeStatus::FreeDirty)?;
			head.set_prev(NULL_INODE);
			self.write_inode(head, next, InodeStatus::FreeDirty)?;
			self.update_sb(|sb| sb.ihead = next)?;
		}

		if !popped.is_free_clean() {
			self.clean_inode(inr)?;
		}

		let now = unix_now();
		let cred = self.cred();
		let ino = Inode {
			mode:     kind.bits(),
			refcount: 0,
			owner:    cred.uid,
			group:    cred.gid,
			size:     0,
			clucount: 0,
			meta:     Meta::Used {
				atime: now,
				mtime: now,
			},
			d:        [NULL_CLUSTER; N_DIRECT],
			i1:       NULL_CLUSTER,
			i2:       NULL_CLUSTER,
		};
		self.write_inode(ino, inr, InodeStatus::InUse)?;
		self.update_sb(|sb| sb.ifree -= 1)?;
		self.cache().flush()?;

		log::trace!("allocate_inode(): {inr}");
		Ok(inr)
	}

	/// Return the inode `inr` to the tail of the free list.
	///
	/// The inode goes free-dirty: only the FREE bit and the linkage are
	/// written, everything else stays stale until the lazy clean on reuse.
	pub fn free_inode(&mut self, inr: u32) -> Result<()> {
		log::trace!("free_inode({inr});");
		let sb = self.sb()?;
		if inr == 0 || inr >= sb.itotal {
			return Err(Error::InvalidInode);
		}

		let mut ino = self.peek_inode(inr)?;
		if ino.is_free() {
			return Err(Error::NotAllocated);
		}
		if ino.refcount != 0 {
			return Err(Error::RefsOutstanding);
		}

		let old_tail = self.sb()?.itail;
		ino.mode |= INODE_FREE;
		ino.meta = Meta::Free {
			prev: old_tail,
			next: NULL_INODE,
		};
		self.write_inode(ino, inr, InodeStatus::FreeDirty)?;

		if old_tail == NULL_INODE {
			self.update_sb(|sb| sb.ihead = inr)?;
		} else {
			let mut tail = self.read_inode(old_tail, InodeStatus::FreeDirty)?;
			tail.set_next(inr);
			self.write_inode(tail, old_tail, InodeStatus::FreeDirty)?;
		}
		self.update_sb(|sb| {
			sb.itail = inr;
			sb.ifree += 1;
		})?;
		self.cache().flush()
	}

	/// Clean a free-dirty inode in place: null every reference it still
	/// carries, zero the counters, keep the free-list linkage.
	pub fn clean_inode(&mut self, inr: u32) -> Result<()> {
		log::trace!("clean_inode({inr});");
		if inr == 0 || inr >= self.sb()?.itotal {
			return Err(Error::InvalidInode);
		}

		// validates the free-dirty state
		let _ = self.read_inode(inr, InodeStatus::FreeDirty)?;

		self.handle_file_clusters(inr, 0, ClusterOp::Clean)?;

		let mut ino = self.peek_inode(inr)?;
		ino.mode = INODE_FREE;
		ino.refcount = 0;
		ino.owner = 0;
		ino.group = 0;
		ino.size = 0;
		ino.clucount = 0;
		ino.d = [NULL_CLUSTER; N_DIRECT];
		ino.i1 = NULL_CLUSTER;
		ino.i2 = NULL_CLUSTER;
		self.write_inode(ino, inr, InodeStatus::FreeClean)?;
		self.cache().flush()
	}
}
