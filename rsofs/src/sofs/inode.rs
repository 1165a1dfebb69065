use super::{consist, Sofs};
use crate::{
	codec::Backend,
	data::*,
	error::{Error, Result},
};

impl<B: Backend> Sofs<B> {
	/// Read the inode `inr`, which must be in the state `status`.
	///
	/// Reading an in-use inode stamps its last-access time on the on-disk
	/// copy before returning.
	pub fn read_inode(&mut self, inr: u32, status: InodeStatus) -> Result<Inode> {
		log::trace!("read_inode({inr}, {status:?});");
		let sb = self.sb()?;
		if inr >= sb.itotal {
			return Err(Error::InvalidInode);
		}
		let blk = sb.inode_block(inr);
		let slot = Superblock::inode_slot(inr);

		self.cache().load_it(blk)?;
		let mut ino = self.cache().it()?.ino[slot];

		match status {
			InodeStatus::InUse => consist::check_inode_in_use(&ino, self.sb()?)?,
			InodeStatus::FreeClean => consist::check_inode_free_clean(&ino, self.sb()?)?,
			InodeStatus::FreeDirty => consist::check_inode_free_dirty(&ino, self.sb()?)?,
		}

		if status == InodeStatus::InUse {
			ino.set_atime(unix_now());
			self.cache().it_mut()?.ino[slot] = ino;
			self.cache().store_it()?;
		}

		Ok(ino)
	}

	/// Write the inode `inr` in the state `status`.
	///
	/// An in-use inode is stamped with the current access and modification
	/// times before it is stored.
	pub fn write_inode(&mut self, mut ino: Inode, inr: u32, status: InodeStatus) -> Result<()> {
		log::trace!("write_inode({inr}, {status:?});");
		let sb = self.sb()?;
		if inr >= sb.itotal {
			return Err(Error::InvalidInode);
		}

		if status == InodeStatus::InUse {
			let now = unix_now();
			ino.set_atime(now);
			ino.set_mtime(now);
		}

		match status {
			InodeStatus::InUse => consist::check_inode_in_use(&ino, self.sb()?)?,
			InodeStatus::FreeClean => consist::check_inode_free_clean(&ino, self.sb()?)?,
			InodeStatus::FreeDirty => consist::check_inode_free_dirty(&ino, self.sb()?)?,
		}

		let blk = self.sb()?.inode_block(inr);
		let slot = Superblock::inode_slot(inr);
		self.cache().load_it(blk)?;
		self.cache().it_mut()?.ino[slot] = ino;
		self.cache().store_it()
	}

	/// Check the requested operation mask against the caller's credentials.
	///
	/// A missing execute bit reports [`Error::ExecDenied`] (EACCES, used by
	/// path resolution); a missing read or write bit reports
	/// [`Error::AccessDenied`] (EPERM on the target).
	pub fn access_check(&mut self, inr: u32, mask: u8) -> Result<()> {
		log::trace!("access_check({inr}, {mask:#o});");
		if mask == 0 || mask & !(ACCESS_R | ACCESS_W | ACCESS_X) != 0 {
			return Err(Error::InvalidMode);
		}

		let ino = self.read_inode(inr, InodeStatus::InUse)?;
		let perm = ino.perm();
		let cred = self.cred();

		if cred.uid == 0 {
			// root may read and write anything, and execute whatever is
			// executable by someone
			if mask & ACCESS_X != 0 && perm & 0o111 == 0 {
				return Err(Error::ExecDenied);
			}
			return Ok(());
		}

		let triad = if cred.uid == ino.owner {
			(perm >> 6) & 0o7
		} else if cred.gid == ino.group {
			(perm >> 3) & 0o7
		} else {
			perm & 0o7
		} as u8;

		let deficit = mask & !triad;
		if deficit & ACCESS_X != 0 {
			Err(Error::ExecDenied)
		} else if deficit != 0 {
			Err(Error::AccessDenied)
		} else {
			Ok(())
		}
	}
}

#[cfg(test)]
mod t {
	use super::{super::tests::test_volume, *};

	#[test]
	fn read_validates_status() {
		let mut fs = test_volume(100, 56);
		let root = fs.read_inode(0, InodeStatus::InUse).unwrap();
		assert!(root.is_dir());
		assert_eq!(root.refcount, 2);

		// inode 1 is free clean after mkfs
		assert!(fs.read_inode(1, InodeStatus::FreeClean).is_ok());
		assert!(matches!(
			fs.read_inode(1, InodeStatus::InUse),
			Err(Error::InconsistentInodeInUse)
		));
		assert!(matches!(
			fs.read_inode(56, InodeStatus::InUse),
			Err(Error::InvalidInode)
		));
	}

	#[test]
	fn read_stamps_atime() {
		let mut fs = test_volume(100, 56);
		let before = fs.read_inode(0, InodeStatus::InUse).unwrap();
		let after = fs.read_inode(0, InodeStatus::InUse).unwrap();
		assert!(after.atime() >= before.atime());
		assert!(after.atime() > 0);
	}

	#[test]
	fn write_refuses_wrong_state() {
		let mut fs = test_volume(100, 56);
		let mut root = fs.read_inode(0, InodeStatus::InUse).unwrap();
		root.mode = INODE_DIR | INODE_FILE | 0o755;
		assert!(matches!(
			fs.write_inode(root, 0, InodeStatus::InUse),
			Err(Error::InconsistentInodeInUse)
		));
	}

	#[test]
	fn access_triads() {
		let mut fs = test_volume(100, 56);
		let inr = fs.allocate_inode(InodeKind::RegularFile).unwrap();

		let mut ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		ino.mode = INODE_FILE | 0o640;
		ino.owner = 100;
		ino.group = 200;
		ino.refcount = 1;
		fs.write_inode(ino, inr, InodeStatus::InUse).unwrap();

		fs.set_cred(Cred {
			uid: 100,
			gid: 7,
		});
		assert!(fs.access_check(inr, ACCESS_R | ACCESS_W).is_ok());
		assert!(matches!(
			fs.access_check(inr, ACCESS_X),
			Err(Error::ExecDenied)
		));

		// group: read only
		fs.set_cred(Cred {
			uid: 101,
			gid: 200,
		});
		assert!(fs.access_check(inr, ACCESS_R).is_ok());
		assert!(matches!(
			fs.access_check(inr, ACCESS_W),
			Err(Error::AccessDenied)
		));

		// other: nothing
		fs.set_cred(Cred {
			uid: 101,
			gid: 7,
		});
		assert!(matches!(
			fs.access_check(inr, ACCESS_R),
			Err(Error::AccessDenied)
		));

		// root reads and writes anything, but cannot execute a file with
		// no execute bit anywhere
		fs.set_cred(Cred::root());
		assert!(fs.access_check(inr, ACCESS_R | ACCESS_W).is_ok());
		assert!(matches!(
			fs.access_check(inr, ACCESS_X),
			Err(Error::ExecDenied)
		));
	}

	#[test]
	fn bad_mask() {
		let mut fs = test_volume(100, 56);
		assert!(matches!(
			fs.access_check(0, 0),
			Err(Error::InvalidMode)
		));
		assert!(matches!(
			fs.access_check(0, 0b1000),
			Err(Error::InvalidMode)
		));
	}
}
