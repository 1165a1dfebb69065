use super::{check_name, consist, ClusterOp, Sofs};
use crate::{
	codec::Backend,
	data::*,
	error::{Error, Result},
};

/// Result of resolving a path: the containing directory and the entry
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathEntry {
	pub parent: u32,
	pub inr:    u32,
}

/// What a directory scan found.
struct Lookup {
	/// Slot index and inode of the first populated entry matching the name.
	hit:        Option<(u32, u32)>,
	/// Smallest-index never-used (or cleanly vacated) slot.
	free_clean: Option<u32>,
	/// Smallest-index slot vacated by remove, residual bytes intact.
	free_dirty: Option<u32>,
	/// One past the last slot within the directory's current size.
	nslots:     u32,
}

impl Lookup {
	/// The slot an insertion should use; `nslots` triggers growth.
	fn insert_slot(&self) -> u32 {
		self.free_clean.or(self.free_dirty).unwrap_or(self.nslots)
	}
}

/// Split an absolute path into dirname and basename.
fn split_path(path: &str) -> (&str, &str) {
	let p = path.trim_end_matches('/');
	if p.is_empty() {
		return ("/", "");
	}
	match p.rfind('/') {
		Some(0) => ("/", &p[1..]),
		Some(i) => (&p[..i], &p[i + 1..]),
		None => ("/", p),
	}
}

fn join_path(dir: &str, rest: &str) -> String {
	if dir == "/" {
		format!("/{rest}")
	} else {
		format!("{dir}/{rest}")
	}
}

/// Normalise a symbolic-link target relative to the directory holding the
/// link. `.` and `..` components are left for entry lookup to resolve.
fn expand_link(dir: &str, target: &str) -> String {
	if target.starts_with('/') {
		target.to_string()
	} else if let Some(rest) = target.strip_prefix("./") {
		join_path(dir, rest)
	} else {
		join_path(dir, target)
	}
}

impl<B: Backend> Sofs<B> {
	/// Scan the directory `dinr` for `name`, tracking reusable free slots
	/// along the way.
	fn dir_scan(&mut self, dinr: u32, name: &str) -> Result<Lookup> {
		let dino = self.read_inode(dinr, InodeStatus::InUse)?;
		if !dino.is_dir() {
			return Err(Error::NotADirectory);
		}

		let first_ncl = self
			.fc_get(&dino, 0)?
			.ok_or(Error::InconsistentDirectory)?;
		let first = self.read_dcluster(first_ncl)?;
		consist::check_directory(&dino, dinr, &first, self.sb()?)?;

		let nclusters = dino.size / DIR_CLUSTER_SIZE as u32;
		let mut lk = Lookup {
			hit:        None,
			free_clean: None,
			free_dirty: None,
			nslots:     nclusters * DPC as u32,
		};

		'scan: for cidx in 0..nclusters {
			let cl = if cidx == 0 {
				first.clone()
			} else {
				let ncl = self
					.fc_get(&dino, cidx)?
					.ok_or(Error::InconsistentDirectory)?;
				self.read_dcluster(ncl)?
			};

			for off in 0..DPC {
				let slot = cidx * DPC as u32 + off as u32;
				let de = cl.dir_entry(off);
				if de.is_free() {
					if de.is_clean() {
						if lk.free_clean.is_none() {
							lk.free_clean = Some(slot);
						}
					} else if lk.free_dirty.is_none() {
						lk.free_dirty = Some(slot);
					}
					continue;
				}
				if de.name() == name {
					lk.hit = Some((slot, de.ninode));
					break 'scan;
				}
			}
		}
		Ok(lk)
	}

	/// Rewrite one entry slot of a directory in place.
	fn dir_patch_entry(
		&mut self,
		dino: &Inode,
		slot: u32,
		f: impl FnOnce(&mut DirEntry),
	) -> Result<()> {
		let cidx = slot / DPC as u32;
		let off = (slot % DPC as u32) as usize;
		let ncl = self
			.fc_get(dino, cidx)?
			.ok_or(Error::InconsistentDirectory)?;
		let mut cl = self.read_dcluster(ncl)?;
		let mut de = cl.dir_entry(off);
		f(&mut de);
		cl.set_dir_entry(off, &de);
		self.write_dcluster(ncl, &cl)
	}

	/// Write a fresh entry into the slot the scan chose, growing the
	/// directory by one zero-initialised cluster when every slot is taken.
	fn dir_insert_entry(
		&mut self,
		dinr: u32,
		dino: &mut Inode,
		lk: &Lookup,
		name: &str,
		einr: u32,
	) -> Result<()> {
		let slot = lk.insert_slot();
		if slot as usize >= MAX_FILE_CLUSTERS * DPC {
			return Err(Error::DirectoryFull);
		}
		let cidx = slot / DPC as u32;
		let off = (slot % DPC as u32) as usize;

		let ncl = if slot < lk.nslots {
			self.fc_get(dino, cidx)?
				.ok_or(Error::InconsistentDirectory)?
		} else {
			let ncl = self.fc_alloc(dinr, dino, cidx)?;
			let mut cl = self.read_dcluster(ncl)?;
			cl.fill_empty_dir_entries();
			self.write_dcluster(ncl, &cl)?;
			dino.size += DIR_CLUSTER_SIZE as u32;
			ncl
		};

		let mut cl = self.read_dcluster(ncl)?;
		cl.set_dir_entry(off, &DirEntry::new(name, einr));
		self.write_dcluster(ncl, &cl)
	}

	/// Write the initial `.`/`..` cluster of a fresh directory.
	fn dir_init(&mut self, einr: u32, parent: u32) -> Result<()> {
		let ncl = self
			.handle_file_cluster(einr, 0, ClusterOp::Alloc)?
			.ok_or(Error::InconsistentDirectory)?;
		let mut cl = self.read_dcluster(ncl)?;
		cl.fill_empty_dir_entries();
		cl.set_dir_entry(0, &DirEntry::new(".", einr));
		cl.set_dir_entry(1, &DirEntry::new("..", parent));
		self.write_dcluster(ncl, &cl)?;

		let mut eino = self.read_inode(einr, InodeStatus::InUse)?;
		eino.size = DIR_CLUSTER_SIZE as u32;
		self.write_inode(eino, einr, InodeStatus::InUse)
	}

	/// Repoint the `..` entry of a directory at a new parent.
	fn repoint_dotdot(&mut self, dinr: u32, parent: u32) -> Result<()> {
		let dino = self.read_inode(dinr, InodeStatus::InUse)?;
		self.dir_patch_entry(&dino, 1, |de| de.ninode = parent)
	}

	/// The operand of a directory operation must be an in-use directory.
	fn require_dir(&mut self, dinr: u32) -> Result<()> {
		let dino = self.read_inode(dinr, InodeStatus::InUse)?;
		if !dino.is_dir() {
			return Err(Error::NotADirectory);
		}
		Ok(())
	}

	/// Look `name` up in the directory `dinr`.
	pub fn get_dir_entry_by_name(&mut self, dinr: u32, name: &str) -> Result<u32> {
		log::trace!("get_dir_entry_by_name({dinr}, {name:?});");
		check_name(name)?;
		self.require_dir(dinr)?;
		self.access_check(dinr, ACCESS_X)?;
		let lk = self.dir_scan(dinr, name)?;
		lk.hit.map(|(_, inr)| inr).ok_or(Error::NotFound)
	}

	/// Resolve an absolute path to its parent directory and entry inodes,
	/// expanding at most one symbolic link along the way.
	pub fn get_dir_entry_by_path(&mut self, path: &str) -> Result<PathEntry> {
		log::trace!("get_dir_entry_by_path({path:?});");
		let mut links = 0u32;
		self.resolve_path(path, &mut links)
	}

	fn resolve_path(&mut self, path: &str, links: &mut u32) -> Result<PathEntry> {
		if !path.starts_with('/') {
			return Err(Error::NotAbsolutePath);
		}
		let (dir, base) = split_path(path);
		if base.is_empty() {
			return Ok(PathEntry {
				parent: 0,
				inr:    0,
			});
		}
		if base.len() > MAX_NAME {
			return Err(Error::NameTooLong);
		}

		let parent = self.resolve_path(dir, links)?.inr;
		let inr = self.get_dir_entry_by_name(parent, base)?;

		let ino = self.read_inode(inr, InodeStatus::InUse)?;
		if ino.kind() == Some(InodeKind::Symlink) {
			*links += 1;
			if *links > MAX_SYMLINKS {
				return Err(Error::Loop);
			}
			let target = self.symlink_read(inr)?;
			let expanded = expand_link(dir, &target);
			return self.resolve_path(&expanded, links);
		}

		Ok(PathEntry {
			parent,
			inr,
		})
	}

	/// Add the entry `name` -> `einr` to the directory `dinr`.
	///
	/// A fresh directory entry-inode gets its `.`/`..` cluster first, so a
	/// crash never leaves a reachable directory without them. Writes are
	/// ordered payload cluster, entry inode, directory inode.
	pub fn add_dir_entry(&mut self, dinr: u32, name: &str, einr: u32) -> Result<()> {
		log::trace!("add_dir_entry({dinr}, {name:?}, {einr});");
		check_name(name)?;
		if einr == dinr || einr >= self.sb()?.itotal {
			return Err(Error::InvalidInode);
		}
		self.require_dir(dinr)?;
		self.access_check(dinr, ACCESS_X)?;
		self.access_check(dinr, ACCESS_W)?;

		let mut dino = self.read_inode(dinr, InodeStatus::InUse)?;
		let lk = self.dir_scan(dinr, name)?;
		if lk.hit.is_some() {
			return Err(Error::AlreadyExists);
		}

		let mut eino = self.read_inode(einr, InodeStatus::InUse)?;
		let is_dir = eino.is_dir();
		let bump: u16 = if is_dir { 2 } else { 1 };
		if u16::MAX - eino.refcount < bump || (is_dir && dino.refcount == u16::MAX) {
			return Err(Error::TooManyLinks);
		}

		if is_dir && eino.size == 0 {
			self.dir_init(einr, dinr)?;
			eino = self.read_inode(einr, InodeStatus::InUse)?;
		}

		self.dir_insert_entry(dinr, &mut dino, &lk, name, einr)?;

		eino.refcount += bump;
		self.write_inode(eino, einr, InodeStatus::InUse)?;

		if is_dir {
			dino.refcount += 1;
		}
		self.write_inode(dino, dinr, InodeStatus::InUse)?;
		self.cache().flush()
	}

	/// Remove the entry `name` from the directory `dinr`.
	///
	/// The slot is marked dirty: the first name byte dies, the residual
	/// bytes stay for offline recovery. The entry inode is freed once its
	/// last reference goes; cleaning is deferred to reuse.
	pub fn remove_dir_entry(&mut self, dinr: u32, name: &str) -> Result<()> {
		log::trace!("remove_dir_entry({dinr}, {name:?});");
		check_name(name)?;
		if name == "." || name == ".." {
			return Err(Error::InvalidMode);
		}
		self.require_dir(dinr)?;
		self.access_check(dinr, ACCESS_X)?;
		self.access_check(dinr, ACCESS_W)?;

		let mut dino = self.read_inode(dinr, InodeStatus::InUse)?;
		let lk = self.dir_scan(dinr, name)?;
		let (slot, einr) = lk.hit.ok_or(Error::NotFound)?;

		let mut eino = self.read_inode(einr, InodeStatus::InUse)?;
		let is_dir = eino.is_dir();
		if is_dir {
			self.check_directory_emptiness(einr)?;
		}

		self.dir_patch_entry(&dino, slot, |de| de.name[0] = 0)?;

		let dec: u16 = if is_dir { 2 } else { 1 };
		eino.refcount = eino.refcount.saturating_sub(dec);
		self.write_inode(eino, einr, InodeStatus::InUse)?;

		if is_dir {
			dino.refcount = dino.refcount.saturating_sub(1);
		}
		self.write_inode(dino, dinr, InodeStatus::InUse)?;

		if eino.refcount == 0 {
			self.handle_file_clusters(einr, 0, ClusterOp::Free)?;
			self.free_inode(einr)?;
		}
		self.cache().flush()
	}

	/// Rewrite the name of an entry in place; the entry's inode is
	/// untouched, so hard-link counts do not change.
	pub fn rename_dir_entry(&mut self, dinr: u32, old: &str, new: &str) -> Result<()> {
		log::trace!("rename_dir_entry({dinr}, {old:?}, {new:?});");
		check_name(old)?;
		check_name(new)?;
		if old == "." || old == ".." {
			return Err(Error::InvalidMode);
		}
		self.require_dir(dinr)?;
		self.access_check(dinr, ACCESS_X)?;
		self.access_check(dinr, ACCESS_W)?;

		let dino = self.read_inode(dinr, InodeStatus::InUse)?;
		if self.dir_scan(dinr, new)?.hit.is_some() {
			return Err(Error::AlreadyExists);
		}
		let lk = self.dir_scan(dinr, old)?;
		let (slot, _) = lk.hit.ok_or(Error::NotFound)?;

		self.dir_patch_entry(&dino, slot, |de| {
			de.name = [0u8; MAX_NAME + 1];
			de.name[..new.len()].copy_from_slice(new.as_bytes());
		})?;

		self.write_inode(dino, dinr, InodeStatus::InUse)?;
		self.cache().flush()
	}

	/// Succeeds iff the directory holds nothing besides `.` and `..`.
	pub fn check_directory_emptiness(&mut self, dinr: u32) -> Result<()> {
		log::trace!("check_directory_emptiness({dinr});");
		let dino = self.read_inode(dinr, InodeStatus::InUse)?;
		if !dino.is_dir() {
			return Err(Error::NotADirectory);
		}

		let nclusters = dino.size / DIR_CLUSTER_SIZE as u32;
		for cidx in 0..nclusters {
			let ncl = self
				.fc_get(&dino, cidx)?
				.ok_or(Error::InconsistentDirectory)?;
			let cl = self.read_dcluster(ncl)?;
			for off in 0..DPC {
				let slot = cidx * DPC as u32 + off as u32;
				let de = cl.dir_entry(off);
				match slot {
					0 => {
						if de.name() != "." {
							return Err(Error::InconsistentDirectory);
						}
					}
					1 => {
						if de.name() != ".." {
							return Err(Error::InconsistentDirectory);
						}
					}
					_ => {
						if de.name[0] != 0 {
							return Err(Error::NotEmpty);
						}
					}
				}
			}
		}
		Ok(())
	}

	/// Install the edge `name` -> `sdinr` in the base directory and repoint
	/// the sub-directory's `..` at its new parent. Used by the
	/// cross-directory move of a fully built directory.
	pub fn attach_directory(&mut self, bdinr: u32, name: &str, sdinr: u32) -> Result<()> {
		log::trace!("attach_directory({bdinr}, {name:?}, {sdinr});");
		check_name(name)?;
		if sdinr == 0 || sdinr == bdinr || sdinr >= self.sb()?.itotal {
			return Err(Error::InvalidInode);
		}
		self.require_dir(bdinr)?;
		self.access_check(bdinr, ACCESS_X)?;
		self.access_check(bdinr, ACCESS_W)?;

		let mut bino = self.read_inode(bdinr, InodeStatus::InUse)?;
		let lk = self.dir_scan(bdinr, name)?;
		if lk.hit.is_some() {
			return Err(Error::AlreadyExists);
		}

		let mut sino = self.read_inode(sdinr, InodeStatus::InUse)?;
		if !sino.is_dir() {
			return Err(Error::NotADirectory);
		}
		if sino.refcount == u16::MAX || bino.refcount == u16::MAX {
			return Err(Error::TooManyLinks);
		}

		self.dir_insert_entry(bdinr, &mut bino, &lk, name, sdinr)?;
		self.dir_patch_entry(&sino, 1, |de| de.ninode = bdinr)?;

		sino.refcount += 1;
		self.write_inode(sino, sdinr, InodeStatus::InUse)?;
		bino.refcount += 1;
		self.write_inode(bino, bdinr, InodeStatus::InUse)?;
		self.cache().flush()
	}

	/// Drop the edge `name` out of the base directory without freeing the
	/// sub-directory. The reverse of [`Sofs::attach_directory`].
	pub fn detach_dir_entry(&mut self, bdinr: u32, name: &str) -> Result<()> {
		log::trace!("detach_dir_entry({bdinr}, {name:?});");
		check_name(name)?;
		if name == "." || name == ".." {
			return Err(Error::InvalidMode);
		}
		self.require_dir(bdinr)?;
		self.access_check(bdinr, ACCESS_X)?;
		self.access_check(bdinr, ACCESS_W)?;

		let mut bino = self.read_inode(bdinr, InodeStatus::InUse)?;
		let lk = self.dir_scan(bdinr, name)?;
		let (slot, einr) = lk.hit.ok_or(Error::NotFound)?;

		let mut eino = self.read_inode(einr, InodeStatus::InUse)?;
		if !eino.is_dir() {
			return Err(Error::NotADirectory);
		}

		self.dir_patch_entry(&bino, slot, |de| de.name[0] = 0)?;

		eino.refcount = eino.refcount.saturating_sub(1);
		self.write_inode(eino, einr, InodeStatus::InUse)?;
		bino.refcount = bino.refcount.saturating_sub(1);
		self.write_inode(bino, bdinr, InodeStatus::InUse)?;
		self.cache().flush()
	}

	fn throwaway_name(&mut self, dinr: u32, einr: u32) -> Result<String> {
		let mut salt = 0u32;
		loop {
			let name = format!("~mv{einr:08x}.{salt}");
			if self.dir_scan(dinr, &name)?.hit.is_none() {
				return Ok(name);
			}
			salt += 1;
		}
	}

	/// Move an entry between directories, possibly replacing the
	/// destination. Composite of the primitives above; every step that can
	/// fail rolls the prior steps back.
	pub fn move_dir_entry(
		&mut self,
		src_dinr: u32,
		src_name: &str,
		dst_dinr: u32,
		dst_name: &str,
	) -> Result<()> {
		log::trace!("move_dir_entry({src_dinr}, {src_name:?}, {dst_dinr}, {dst_name:?});");
		check_name(src_name)?;
		check_name(dst_name)?;
		if src_name == "." || src_name == ".." || dst_name == "." || dst_name == ".." {
			return Err(Error::InvalidMode);
		}

		let einr = self.get_dir_entry_by_name(src_dinr, src_name)?;
		let eino = self.read_inode(einr, InodeStatus::InUse)?;
		let moving_dir = eino.is_dir();

		if src_dinr == dst_dinr && src_name == dst_name {
			return Ok(());
		}

		// an existing destination is set aside under a throwaway name
		let mut throwaway = None;
		if let Some((_, old)) = self.dir_scan(dst_dinr, dst_name)?.hit {
			let old_ino = self.read_inode(old, InodeStatus::InUse)?;
			if moving_dir && !old_ino.is_dir() {
				return Err(Error::NotADirectory);
			}
			if !moving_dir && old_ino.is_dir() {
				return Err(Error::IsADirectory);
			}
			if old_ino.is_dir() {
				self.check_directory_emptiness(old)?;
			}
			let tmp = self.throwaway_name(dst_dinr, old)?;
			self.rename_dir_entry(dst_dinr, dst_name, &tmp)?;
			throwaway = Some(tmp);
		}

		let moved = if src_dinr == dst_dinr {
			self.rename_dir_entry(src_dinr, src_name, dst_name)
		} else if moving_dir {
			match self.attach_directory(dst_dinr, dst_name, einr) {
				Ok(()) => match self.detach_dir_entry(src_dinr, src_name) {
					Ok(()) => Ok(()),
					Err(e) => {
						let _ = self.detach_dir_entry(dst_dinr, dst_name);
						let _ = self.repoint_dotdot(einr, src_dinr);
						Err(e)
					}
				},
				Err(e) => Err(e),
			}
		} else {
			match self.add_dir_entry(dst_dinr, dst_name, einr) {
				Ok(()) => match self.remove_dir_entry(src_dinr, src_name) {
					Ok(()) => Ok(()),
					Err(e) => {
						let _ = self.remove_dir_entry(dst_dinr, dst_name);
						Err(e)
					}
				},
				Err(e) => Err(e),
			}
		};

		if let Err(e) = moved {
			if let Some(tmp) = &throwaway {
				let _ = self.rename_dir_entry(dst_dinr, tmp, dst_name);
			}
			return Err(e);
		}

		if let Some(tmp) = &throwaway {
			self.remove_dir_entry(dst_dinr, tmp)?;
		}
		Ok(())
	}
}
