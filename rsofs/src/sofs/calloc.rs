use super::Sofs;
use crate::{
	codec::Backend,
	data::*,
	error::{Error, Result},
};

impl<B: Backend> Sofs<B> {
	/// Read the data cluster with logical number `ncl`.
	pub(crate) fn read_dcluster(&mut self, ncl: u32) -> Result<Cluster> {
		let blk = self.sb()?.cluster_block(ncl);
		self.cache().read_cluster(blk)
	}

	/// Write the data cluster with logical number `ncl`.
	pub(crate) fn write_dcluster(&mut self, ncl: u32, cl: &Cluster) -> Result<()> {
		let blk = self.sb()?.cluster_block(ncl);
		self.cache().write_cluster(blk, cl)
	}

	/// Allocate a data cluster to the in-use inode `inr`.
	///
	/// The cluster comes from the retrieval cache, replenished from the
	/// general free list when empty. A dirty cluster is cleaned before it
	/// is handed out, so the payload is always zeroed.
	pub fn allocate_data_cluster(&mut self, inr: u32) -> Result<u32> {
		log::trace!("allocate_data_cluster({inr});");
		let ino = self.peek_inode(inr)?;
		if !ino.is_in_use() {
			return Err(Error::InvalidInode);
		}
		if self.sb()?.dzone_free == 0 {
			return Err(Error::NoSpace);
		}

		if self.sb()?.retrieval.idx == DZONE_CACHE_SIZE as u32 {
			self.replenish()?;
		}

		let idx = self.sb()?.retrieval.idx as usize;
		if idx == DZONE_CACHE_SIZE {
			// dzone_free promised a cluster but none was reachable
			return Err(Error::NotOnList);
		}
		let ncl = self.sb()?.retrieval.entries[idx];
		self.update_sb(|sb| {
			sb.retrieval.entries[idx] = NULL_CLUSTER;
			sb.retrieval.idx += 1;
		})?;

		let cl = self.read_dcluster(ncl)?;
		if cl.stat != NULL_INODE {
			self.clean_data_cluster(cl.stat, ncl)?;
		}

		self.write_dcluster(ncl, &Cluster::allocated(inr))?;
		self.update_sb(|sb| sb.dzone_free -= 1)?;
		self.cache().flush()?;

		log::trace!("allocate_data_cluster(): {ncl}");
		Ok(ncl)
	}

	/// Free the data cluster `ncl` into the insertion cache.
	///
	/// The owner stamp is left in the header for the lazy clean on reuse.
	pub fn free_data_cluster(&mut self, ncl: u32) -> Result<()> {
		log::trace!("free_data_cluster({ncl});");
		let sb = self.sb()?;
		if ncl == 0 || ncl >= sb.dzone_total {
			return Err(Error::InvalidCluster);
		}

		let mut cl = self.read_dcluster(ncl)?;
		if !cl.is_allocated() {
			return Err(Error::NotAllocated);
		}

		if self.sb()?.insertion.idx == DZONE_CACHE_SIZE as u32 {
			self.deplete()?;
		}

		cl.prev = NULL_CLUSTER;
		cl.next = NULL_CLUSTER;
		self.write_dcluster(ncl, &cl)?;

		self.update_sb(|sb| {
			sb.insertion.entries[sb.insertion.idx as usize] = ncl;
			sb.insertion.idx += 1;
			sb.dzone_free += 1;
		})?;
		self.cache().flush()
	}

	/// Move up to a cache-full of clusters from the head of the general
	/// free list into the retrieval cache, filling it from the end down.
	///
	/// When the list runs dry mid-replenish, the insertion cache is
	/// depleted into it first.
	fn replenish(&mut self) -> Result<()> {
		log::trace!("replenish();");
		let mut idx = self.sb()?.retrieval.idx;

		while idx > 0 {
			if self.sb()?.dhead == NULL_CLUSTER {
				if self.sb()?.insertion.idx > 0 {
					self.deplete()?;
					continue;
				}
				break;
			}

			let head = self.sb()?.dhead;
			let mut cl = self.read_dcluster(head)?;
			let next = cl.next;

			if next == NULL_CLUSTER {
				self.update_sb(|sb| {
					sb.dhead = NULL_CLUSTER;
					sb.dtail = NULL_CLUSTER;
				})?;
			} else {
				let mut ncl = self.read_dcluster(next)?;
				ncl.prev = NULL_CLUSTER;
				self.write_dcluster(next, &ncl)?;
				self.update_sb(|sb| sb.dhead = next)?;
			}

			cl.prev = NULL_CLUSTER;
			cl.next = NULL_CLUSTER;
			self.write_dcluster(head, &cl)?;

			idx -= 1;
			self.update_sb(|sb| {
				sb.retrieval.entries[idx as usize] = head;
				sb.retrieval.idx = idx;
			})?;
		}

		Ok(())
	}

	/// Flush the entire insertion cache onto the tail of the general free
	/// list. Idempotent on an empty cache.
	fn deplete(&mut self) -> Result<()> {
		log::trace!("deplete();");
		let count = self.sb()?.insertion.idx as usize;

		for k in 0..count {
			let ncl = self.sb()?.insertion.entries[k];
			let tail = self.sb()?.dtail;

			let mut cl = self.read_dcluster(ncl)?;
			cl.prev = tail;
			cl.next = NULL_CLUSTER;
			self.write_dcluster(ncl, &cl)?;

			if tail == NULL_CLUSTER {
				self.update_sb(|sb| {
					sb.dhead = ncl;
					sb.dtail = ncl;
				})?;
			} else {
				let mut tc = self.read_dcluster(tail)?;
				tc.next = ncl;
				self.write_dcluster(tail, &tc)?;
				self.update_sb(|sb| sb.dtail = ncl)?;
			}

			self.update_sb(|sb| sb.insertion.entries[k] = NULL_CLUSTER)?;
		}

		self.update_sb(|sb| sb.insertion.idx = 0)
	}
}
