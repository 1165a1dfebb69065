use std::{fs::File, path::Path};

mod calloc;
mod clusters;
mod consist;
mod dir;
mod fsck;
mod ialloc;
mod inode;
mod mkfs;
mod symlink;

pub use clusters::ClusterOp;
pub use dir::PathEntry;
pub use fsck::{check, CheckOpts, CheckReport};
pub use mkfs::{format, FormatOpts, Geometry};

use crate::{
	cache::Cache,
	codec::{Backend, Codec},
	data::*,
	error::{Error, Result},
};

/// Summary of volume statistics.
#[derive(Debug, Clone)]
#[doc(alias = "Statfs")]
pub struct Stats {
	/// Volume name.
	pub name: String,

	/// Total number of blocks.
	pub ntotal: u32,

	/// Number of inodes.
	pub itotal: u32,

	/// Number of free inodes.
	pub ifree: u32,

	/// Number of data clusters.
	pub dzone_total: u32,

	/// Number of free data clusters.
	pub dzone_free: u32,

	/// Block size.
	pub block_size: u32,

	/// Cluster size.
	pub cluster_size: u32,
}

/// A mounted SOFS11 volume.
///
/// All operations are synchronous and run to completion; the enclosing host
/// serialises calls. Every mutating operation flushes its dirty blocks
/// before returning success.
pub struct Sofs<B: Backend> {
	cache: Cache<B>,
	cred:  Cred,
}

impl Sofs<File> {
	/// Mount the volume backed by `path`.
	pub fn mount(path: &Path) -> Result<Self> {
		let file = File::options().read(true).write(true).open(path)?;
		Self::new(file)
	}
}

impl<B: Backend> Sofs<B> {
	/// Mount the volume held by an already-open backing file.
	///
	/// A volume whose `mstat` says it was not properly unmounted is checked
	/// before the mount proceeds; an inconsistent volume refuses to mount.
	pub fn new(file: B) -> Result<Self> {
		let mut file = Codec::new(file);
		let sb: Superblock = file.decode_at(0)?;

		if sb.magic != MAGIC || sb.version != VERSION {
			log::error!(
				"invalid superblock: magic={:#x}, version={}",
				sb.magic,
				sb.version
			);
			return Err(Error::InvalidSuperblock);
		}

		if sb.mstat != PRU {
			log::warn!("volume was not properly unmounted, checking");
			fsck::check_backend(&mut file, &CheckOpts::default())?;
		}

		let mut cache = Cache::new(file);
		cache.load_sb()?;
		consist::check_superblock(cache.sb()?)?;

		log::info!("Summary:");
		log::info!("Volume Name: {:?}", cache.sb()?.volume_name());
		log::info!("# Blocks: {}", cache.sb()?.ntotal);
		log::info!("# Inodes: {}", cache.sb()?.itotal);
		log::info!("# Clusters: {}", cache.sb()?.dzone_total);

		cache.sb_mut()?.mstat = NPRU;
		cache.store_sb()?;

		Ok(Self {
			cache,
			cred: Cred::current(),
		})
	}

	/// Cleanly unmount: mark the volume properly unmounted and flush.
	pub fn unmount(mut self) -> Result<()> {
		self.cache.sb_mut()?.mstat = PRU;
		self.cache.store_sb()?;
		self.cache.close()
	}

	/// Credentials used for access checks and ownership of new inodes.
	pub fn cred(&self) -> Cred {
		self.cred
	}

	pub fn set_cred(&mut self, cred: Cred) {
		self.cred = cred;
	}

	/// Get volume statistics.
	#[doc(alias("statfs", "statvfs"))]
	pub fn stats(&self) -> Result<Stats> {
		let sb = self.cache.sb()?;
		Ok(Stats {
			name:         sb.volume_name().to_string(),
			ntotal:       sb.ntotal,
			itotal:       sb.itotal,
			ifree:        sb.ifree,
			dzone_total:  sb.dzone_total,
			dzone_free:   sb.dzone_free,
			block_size:   BLOCK_SIZE as u32,
			cluster_size: CLUSTER_SIZE as u32,
		})
	}

	/// Flush every dirty block to the backing file.
	pub fn flush(&mut self) -> Result<()> {
		self.cache.flush()
	}

	pub(crate) fn sb(&self) -> Result<&Superblock> {
		self.cache.sb()
	}

	pub(crate) fn update_sb(&mut self, f: impl FnOnce(&mut Superblock)) -> Result<()> {
		f(self.cache.sb_mut()?);
		self.cache.store_sb()
	}

	pub(crate) fn cache(&mut self) -> &mut Cache<B> {
		&mut self.cache
	}
}

pub(crate) fn check_name(name: &str) -> Result<()> {
	if name.is_empty() || name.contains(['/', '\0']) {
		return Err(Error::InvalidMode);
	}
	if name.len() > MAX_NAME {
		return Err(Error::NameTooLong);
	}
	Ok(())
}
