use std::{fs::File, path::Path};

use crate::{
	codec::{Backend, Codec},
	data::*,
	error::{Error, Result},
};

/// One write-back slot of the cache.
struct Slot<T> {
	addr:  Option<u32>,
	val:   Option<T>,
	dirty: bool,
}

impl<T> Slot<T> {
	fn empty() -> Self {
		Self {
			addr:  None,
			val:   None,
			dirty: false,
		}
	}

	fn get(&self) -> Result<&T> {
		self.val.as_ref().ok_or(Error::DeviceNotOpen)
	}

	fn get_mut(&mut self) -> Result<&mut T> {
		self.dirty = true;
		self.val.as_mut().ok_or(Error::DeviceNotOpen)
	}
}

/// Write-back cache over the backing file, the process's single source of
/// truth for on-disk content.
///
/// Four distinguished slots, each typed to its role: the superblock, the
/// current inode-table block, the current direct-refs cluster and the
/// current single-indirect-refs cluster. Loading a new physical address
/// into a slot discards any uncommitted change in it; callers store first.
pub struct Cache<B: Backend> {
	file: Codec<B>,
	sb:   Slot<Superblock>,
	it:   Slot<InodeBlock>,
	dref: Slot<Cluster>,
	iref: Slot<Cluster>,
}

impl Cache<File> {
	pub fn open(path: &Path) -> Result<Self> {
		Ok(Self::new(Codec::open(path, true)?))
	}
}

impl<B: Backend> Cache<B> {
	pub fn new(file: Codec<B>) -> Self {
		Self {
			file,
			sb: Slot::empty(),
			it: Slot::empty(),
			dref: Slot::empty(),
			iref: Slot::empty(),
		}
	}

	fn blkoff(blk: u32) -> u64 {
		blk as u64 * BLOCK_SIZE as u64
	}

	// superblock slot

	pub fn load_sb(&mut self) -> Result<()> {
		self.sb.val = Some(self.file.decode_at(0)?);
		self.sb.addr = Some(0);
		self.sb.dirty = false;
		Ok(())
	}

	pub fn sb(&self) -> Result<&Superblock> {
		self.sb.get()
	}

	pub fn sb_mut(&mut self) -> Result<&mut Superblock> {
		self.sb.get_mut()
	}

	pub fn store_sb(&mut self) -> Result<()> {
		if let Some(sb) = &self.sb.val {
			self.file.encode_at(0, sb)?;
			self.sb.dirty = false;
		}
		Ok(())
	}

	// inode-table slot

	pub fn load_it(&mut self, blk: u32) -> Result<()> {
		if self.it.addr == Some(blk) && self.it.val.is_some() {
			return Ok(());
		}
		if self.it.dirty {
			log::trace!("cache: discarding dirty inode-table block {:?}", self.it.addr);
		}
		self.it.val = Some(self.file.decode_at(Self::blkoff(blk))?);
		self.it.addr = Some(blk);
		self.it.dirty = false;
		Ok(())
	}

	pub fn it(&self) -> Result<&InodeBlock> {
		self.it.get()
	}

	pub fn it_mut(&mut self) -> Result<&mut InodeBlock> {
		self.it.get_mut()
	}

	pub fn store_it(&mut self) -> Result<()> {
		if let (Some(blk), Some(it)) = (self.it.addr, &self.it.val) {
			self.file.encode_at(Self::blkoff(blk), it)?;
			self.it.dirty = false;
		}
		Ok(())
	}

	// direct-refs cluster slot

	pub fn load_dref(&mut self, blk: u32) -> Result<()> {
		if self.dref.addr == Some(blk) && self.dref.val.is_some() {
			return Ok(());
		}
		if self.dref.dirty {
			log::trace!("cache: discarding dirty dref cluster {:?}", self.dref.addr);
		}
		self.dref.val = Some(self.file.decode_at(Self::blkoff(blk))?);
		self.dref.addr = Some(blk);
		self.dref.dirty = false;
		Ok(())
	}

	pub fn dref(&self) -> Result<&Cluster> {
		self.dref.get()
	}

	pub fn dref_mut(&mut self) -> Result<&mut Cluster> {
		self.dref.get_mut()
	}

	pub fn store_dref(&mut self) -> Result<()> {
		if let (Some(blk), Some(cl)) = (self.dref.addr, &self.dref.val) {
			self.file.encode_at(Self::blkoff(blk), cl)?;
			self.dref.dirty = false;
		}
		Ok(())
	}

	// single-indirect-refs cluster slot

	pub fn load_iref(&mut self, blk: u32) -> Result<()> {
		if self.iref.addr == Some(blk) && self.iref.val.is_some() {
			return Ok(());
		}
		if self.iref.dirty {
			log::trace!("cache: discarding dirty iref cluster {:?}", self.iref.addr);
		}
		self.iref.val = Some(self.file.decode_at(Self::blkoff(blk))?);
		self.iref.addr = Some(blk);
		self.iref.dirty = false;
		Ok(())
	}

	pub fn iref(&self) -> Result<&Cluster> {
		self.iref.get()
	}

	pub fn iref_mut(&mut self) -> Result<&mut Cluster> {
		self.iref.get_mut()
	}

	pub fn store_iref(&mut self) -> Result<()> {
		if let (Some(blk), Some(cl)) = (self.iref.addr, &self.iref.val) {
			self.file.encode_at(Self::blkoff(blk), cl)?;
			self.iref.dirty = false;
		}
		Ok(())
	}

	// raw cluster access, for free-list surgery on clusters without a slot

	/// Read a whole cluster starting at physical block `blk`.
	pub fn read_cluster(&mut self, blk: u32) -> Result<Cluster> {
		if self.dref.addr == Some(blk) {
			if let Some(cl) = &self.dref.val {
				return Ok(cl.clone());
			}
		}
		if self.iref.addr == Some(blk) {
			if let Some(cl) = &self.iref.val {
				return Ok(cl.clone());
			}
		}
		self.file.decode_at(Self::blkoff(blk))
	}

	/// Write a whole cluster starting at physical block `blk`, invalidating
	/// any slot caching the same address.
	pub fn write_cluster(&mut self, blk: u32, cl: &Cluster) -> Result<()> {
		if self.dref.addr == Some(blk) {
			self.dref = Slot::empty();
		}
		if self.iref.addr == Some(blk) {
			self.iref = Slot::empty();
		}
		self.file.encode_at(Self::blkoff(blk), cl)
	}

	/// Store every dirty slot and flush the backing file.
	pub fn flush(&mut self) -> Result<()> {
		if self.sb.dirty {
			self.store_sb()?;
		}
		if self.it.dirty {
			self.store_it()?;
		}
		if self.dref.dirty {
			self.store_dref()?;
		}
		if self.iref.dirty {
			self.store_iref()?;
		}
		self.file.flush()
	}

	/// Flush and release the backing file.
	pub fn close(mut self) -> Result<()> {
		self.flush()
	}
}
