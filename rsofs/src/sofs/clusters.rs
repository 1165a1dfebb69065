use super::{consist, consist::ClusterState, Sofs};
use crate::{
	codec::Backend,
	data::*,
	error::{Error, Result},
};

/// Operation on the data cluster at a logical file-cluster index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterOp {
	/// Resolve the index to a physical cluster, if any.
	Get,
	/// Materialise the cluster (and any missing reference clusters).
	Alloc,
	/// Free the terminal cluster, leaving reference words stale.
	Free,
	/// Free the terminal cluster and null the references to it, cascading
	/// the release of reference clusters that become empty.
	FreeClean,
	/// Null the references without freeing anything; for free-dirty inodes
	/// whose clusters were already released.
	Clean,
}

/// Zone of a logical file-cluster index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Zone {
	Direct(usize),
	Single(usize),
	Double(usize, usize),
}

pub(super) fn zone_of(idx: u32) -> Result<Zone> {
	let i = idx as usize;
	if i < N_DIRECT {
		Ok(Zone::Direct(i))
	} else if i < N_DIRECT + RPC {
		Ok(Zone::Single(i - N_DIRECT))
	} else if i < MAX_FILE_CLUSTERS {
		let x = i - N_DIRECT - RPC;
		Ok(Zone::Double(x / RPC, x % RPC))
	} else {
		Err(Error::FileTooBig)
	}
}

fn nz(ncl: u32) -> Option<u32> {
	(ncl != NULL_CLUSTER).then_some(ncl)
}

impl<B: Backend> Sofs<B> {
	/// Operate on the data cluster at logical index `idx` of the file held
	/// by inode `inr`. `Get` and `Alloc` return the physical cluster
	/// number.
	pub fn handle_file_cluster(
		&mut self,
		inr: u32,
		idx: u32,
		op: ClusterOp,
	) -> Result<Option<u32>> {
		log::trace!("handle_file_cluster({inr}, {idx}, {op:?});");
		let status = if op == ClusterOp::Clean {
			InodeStatus::FreeDirty
		} else {
			InodeStatus::InUse
		};
		let mut ino = self.read_inode(inr, status)?;

		let res = match op {
			ClusterOp::Get => return self.fc_get(&ino, idx),
			ClusterOp::Alloc => Some(self.fc_alloc(inr, &mut ino, idx)?),
			ClusterOp::Free => {
				self.fc_free(inr, &mut ino, idx, false)?;
				None
			}
			ClusterOp::FreeClean => {
				self.fc_free(inr, &mut ino, idx, true)?;
				None
			}
			ClusterOp::Clean => {
				self.fc_clean(inr, &mut ino, idx)?;
				None
			}
		};

		self.write_inode(ino, inr, status)?;
		self.cache().flush()?;
		Ok(res)
	}

	pub(super) fn fc_get(&mut self, ino: &Inode, idx: u32) -> Result<Option<u32>> {
		match zone_of(idx)? {
			Zone::Direct(i) => Ok(nz(ino.d[i])),
			Zone::Single(off) => {
				let Some(rc) = nz(ino.i1) else {
					return Ok(None);
				};
				let blk = self.sb()?.cluster_block(rc);
				self.cache().load_dref(blk)?;
				Ok(nz(self.cache().dref()?.ref_at(off)))
			}
			Zone::Double(hi, lo) => {
				let Some(rc) = nz(ino.i2) else {
					return Ok(None);
				};
				let blk = self.sb()?.cluster_block(rc);
				self.cache().load_iref(blk)?;
				let Some(inner) = nz(self.cache().iref()?.ref_at(hi)) else {
					return Ok(None);
				};
				let blk = self.sb()?.cluster_block(inner);
				self.cache().load_dref(blk)?;
				Ok(nz(self.cache().dref()?.ref_at(lo)))
			}
		}
	}

	/// Allocate a reference cluster for `inr` and initialise it to all-null
	/// references.
	fn alloc_ref_cluster(&mut self, inr: u32) -> Result<u32> {
		let rc = self.allocate_data_cluster(inr)?;
		let mut cl = Cluster::allocated(inr);
		cl.fill_null_refs();
		self.write_dcluster(rc, &cl)?;
		Ok(rc)
	}

	pub(super) fn fc_alloc(&mut self, inr: u32, ino: &mut Inode, idx: u32) -> Result<u32> {
		match zone_of(idx)? {
			Zone::Direct(i) => {
				if ino.d[i] != NULL_CLUSTER {
					return Err(Error::AlreadyAllocated);
				}
				let ncl = self.allocate_data_cluster(inr)?;
				ino.d[i] = ncl;
				ino.clucount += 1;
				Ok(ncl)
			}
			Zone::Single(off) => {
				if ino.i1 == NULL_CLUSTER {
					let rc = self.alloc_ref_cluster(inr)?;
					ino.i1 = rc;
					ino.clucount += 1;
					// link the reference cluster before filling it
					self.write_inode(*ino, inr, InodeStatus::InUse)?;
				}
				let blk = self.sb()?.cluster_block(ino.i1);
				self.cache().load_dref(blk)?;
				let sb = self.sb()?.clone();
				consist::check_ref_list(self.cache().dref()?, &sb)?;
				if self.cache().dref()?.ref_at(off) != NULL_CLUSTER {
					return Err(Error::AlreadyAllocated);
				}

				let ncl = self.allocate_data_cluster(inr)?;
				self.cache().load_dref(blk)?;
				self.cache().dref_mut()?.set_ref(off, ncl);
				self.cache().store_dref()?;
				ino.clucount += 1;
				Ok(ncl)
			}
			Zone::Double(hi, lo) => {
				if ino.i2 == NULL_CLUSTER {
					let rc = self.alloc_ref_cluster(inr)?;
					ino.i2 = rc;
					ino.clucount += 1;
					self.write_inode(*ino, inr, InodeStatus::InUse)?;
				}
				let outer_blk = self.sb()?.cluster_block(ino.i2);
				self.cache().load_iref(outer_blk)?;
				let sb = self.sb()?.clone();
				consist::check_ref_list(self.cache().iref()?, &sb)?;

				let mut inner = self.cache().iref()?.ref_at(hi);
				if inner == NULL_CLUSTER {
					let rc = self.alloc_ref_cluster(inr)?;
					self.cache().load_iref(outer_blk)?;
					self.cache().iref_mut()?.set_ref(hi, rc);
					self.cache().store_iref()?;
					ino.clucount += 1;
					self.write_inode(*ino, inr, InodeStatus::InUse)?;
					inner = rc;
				}

				let inner_blk = self.sb()?.cluster_block(inner);
				self.cache().load_dref(inner_blk)?;
				let sb = self.sb()?.clone();
				consist::check_ref_list(self.cache().dref()?, &sb)?;
				if self.cache().dref()?.ref_at(lo) != NULL_CLUSTER {
					return Err(Error::AlreadyAllocated);
				}

				let ncl = self.allocate_data_cluster(inr)?;
				self.cache().load_dref(inner_blk)?;
				self.cache().dref_mut()?.set_ref(lo, ncl);
				self.cache().store_dref()?;
				ino.clucount += 1;
				Ok(ncl)
			}
		}
	}

	fn fc_free(&mut self, inr: u32, ino: &mut Inode, idx: u32, clean: bool) -> Result<()> {
		match zone_of(idx)? {
			Zone::Direct(i) => {
				let Some(ncl) = nz(ino.d[i]) else {
					return Err(Error::NotAllocated);
				};
				self.free_data_cluster(ncl)?;
				ino.d[i] = NULL_CLUSTER;
				ino.clucount = ino.clucount.saturating_sub(1);
				Ok(())
			}
			Zone::Single(off) => {
				let Some(rc) = nz(ino.i1) else {
					return Err(Error::NotAllocated);
				};
				let blk = self.sb()?.cluster_block(rc);
				self.cache().load_dref(blk)?;
				let sb = self.sb()?.clone();
				consist::check_cluster_header(
					self.cache().dref()?,
					ClusterState::AllocatedTo(inr),
					&sb,
				)?;
				let Some(ncl) = nz(self.cache().dref()?.ref_at(off)) else {
					return Err(Error::NotAllocated);
				};
				self.free_data_cluster(ncl)?;
				ino.clucount = ino.clucount.saturating_sub(1);

				if clean {
					self.cache().load_dref(blk)?;
					self.cache().dref_mut()?.set_ref(off, NULL_CLUSTER);
					self.cache().store_dref()?;
					if self.cache().dref()?.refs_all_null() {
						self.free_data_cluster(rc)?;
						ino.i1 = NULL_CLUSTER;
						ino.clucount = ino.clucount.saturating_sub(1);
					}
				}
				Ok(())
			}
			Zone::Double(hi, lo) => {
				let Some(outer) = nz(ino.i2) else {
					return Err(Error::NotAllocated);
				};
				let outer_blk = self.sb()?.cluster_block(outer);
				self.cache().load_iref(outer_blk)?;
				let sb = self.sb()?.clone();
				consist::check_cluster_header(
					self.cache().iref()?,
					ClusterState::AllocatedTo(inr),
					&sb,
				)?;
				let Some(inner) = nz(self.cache().iref()?.ref_at(hi)) else {
					return Err(Error::NotAllocated);
				};
				let inner_blk = self.sb()?.cluster_block(inner);
				self.cache().load_dref(inner_blk)?;
				let sb = self.sb()?.clone();
				consist::check_cluster_header(
					self.cache().dref()?,
					ClusterState::AllocatedTo(inr),
					&sb,
				)?;
				let Some(ncl) = nz(self.cache().dref()?.ref_at(lo)) else {
					return Err(Error::NotAllocated);
				};
				self.free_data_cluster(ncl)?;
				ino.clucount = ino.clucount.saturating_sub(1);

				if clean {
					self.cache().load_dref(inner_blk)?;
					self.cache().dref_mut()?.set_ref(lo, NULL_CLUSTER);
					self.cache().store_dref()?;
					if self.cache().dref()?.refs_all_null() {
						self.free_data_cluster(inner)?;
						ino.clucount = ino.clucount.saturating_sub(1);
						self.cache().load_iref(outer_blk)?;
						self.cache().iref_mut()?.set_ref(hi, NULL_CLUSTER);
						self.cache().store_iref()?;
						if self.cache().iref()?.refs_all_null() {
							self.free_data_cluster(outer)?;
							ino.i2 = NULL_CLUSTER;
							ino.clucount = ino.clucount.saturating_sub(1);
						}
					}
				}
				Ok(())
			}
		}
	}

	/// Null the reference words for `idx` without freeing anything. A
	/// reference cluster whose owner stamp no longer matches was recycled
	/// after the bulk free; the stale pointer to it is dropped without
	/// descending.
	fn fc_clean(&mut self, inr: u32, ino: &mut Inode, idx: u32) -> Result<()> {
		match zone_of(idx)? {
			Zone::Direct(i) => {
				if ino.d[i] == NULL_CLUSTER {
					return Err(Error::NotAllocated);
				}
				ino.d[i] = NULL_CLUSTER;
				ino.clucount = ino.clucount.saturating_sub(1);
				Ok(())
			}
			Zone::Single(off) => {
				let Some(rc) = nz(ino.i1) else {
					return Err(Error::NotAllocated);
				};
				let blk = self.sb()?.cluster_block(rc);
				self.cache().load_dref(blk)?;
				if self.cache().dref()?.stat != inr {
					ino.i1 = NULL_CLUSTER;
					ino.clucount = ino.clucount.saturating_sub(1);
					return Ok(());
				}
				self.cache().dref_mut()?.set_ref(off, NULL_CLUSTER);
				self.cache().store_dref()?;
				ino.clucount = ino.clucount.saturating_sub(1);
				if self.cache().dref()?.refs_all_null() {
					ino.i1 = NULL_CLUSTER;
					ino.clucount = ino.clucount.saturating_sub(1);
				}
				Ok(())
			}
			Zone::Double(hi, lo) => {
				let Some(outer) = nz(ino.i2) else {
					return Err(Error::NotAllocated);
				};
				let outer_blk = self.sb()?.cluster_block(outer);
				self.cache().load_iref(outer_blk)?;
				if self.cache().iref()?.stat != inr {
					ino.i2 = NULL_CLUSTER;
					ino.clucount = ino.clucount.saturating_sub(1);
					return Ok(());
				}
				let Some(inner) = nz(self.cache().iref()?.ref_at(hi)) else {
					return Err(Error::NotAllocated);
				};
				let inner_blk = self.sb()?.cluster_block(inner);
				self.cache().load_dref(inner_blk)?;
				if self.cache().dref()?.stat == inr {
					self.cache().dref_mut()?.set_ref(lo, NULL_CLUSTER);
					self.cache().store_dref()?;
				}
				ino.clucount = ino.clucount.saturating_sub(1);

				let drop_inner = self.cache().dref()?.stat != inr
					|| self.cache().dref()?.refs_all_null();
				if drop_inner {
					self.cache().load_iref(outer_blk)?;
					self.cache().iref_mut()?.set_ref(hi, NULL_CLUSTER);
					self.cache().store_iref()?;
					ino.clucount = ino.clucount.saturating_sub(1);
					if self.cache().iref()?.refs_all_null() {
						ino.i2 = NULL_CLUSTER;
						ino.clucount = ino.clucount.saturating_sub(1);
					}
				}
				Ok(())
			}
		}
	}

	/// Apply `op` to every allocated cluster from the top of the file down
	/// to `start`, double-indirect zone first, then single-indirect, then
	/// direct. Working top-down makes each cascading cleanup of a parent
	/// happen exactly once.
	pub fn handle_file_clusters(&mut self, inr: u32, start: u32, op: ClusterOp) -> Result<()> {
		log::trace!("handle_file_clusters({inr}, {start}, {op:?});");
		if !matches!(op, ClusterOp::Free | ClusterOp::FreeClean | ClusterOp::Clean) {
			return Err(Error::InvalidMode);
		}
		if start as usize >= MAX_FILE_CLUSTERS {
			return Err(Error::FileTooBig);
		}
		let status = if op == ClusterOp::Clean {
			InodeStatus::FreeDirty
		} else {
			InodeStatus::InUse
		};
		let mut ino = self.read_inode(inr, status)?;

		self.range_double(inr, &mut ino, start, op)?;
		self.range_single(inr, &mut ino, start, op)?;
		self.range_direct(&mut ino, start, op)?;

		self.write_inode(ino, inr, status)?;
		self.cache().flush()
	}

	fn range_direct(&mut self, ino: &mut Inode, start: u32, op: ClusterOp) -> Result<()> {
		for i in ((start as usize).min(N_DIRECT)..N_DIRECT).rev() {
			let Some(ncl) = nz(ino.d[i]) else {
				continue;
			};
			match op {
				ClusterOp::Free | ClusterOp::FreeClean => {
					self.free_data_cluster(ncl)?;
				}
				ClusterOp::Clean => {}
				_ => unreachable!(),
			}
			ino.d[i] = NULL_CLUSTER;
			ino.clucount = ino.clucount.saturating_sub(1);
		}
		Ok(())
	}

	fn range_single(&mut self, inr: u32, ino: &mut Inode, start: u32, op: ClusterOp) -> Result<()> {
		let Some(rc) = nz(ino.i1) else {
			return Ok(());
		};
		let zone_lo = N_DIRECT as u32;
		if start >= zone_lo + RPC as u32 {
			return Ok(());
		}
		let fully = start <= zone_lo;

		let blk = self.sb()?.cluster_block(rc);
		self.cache().load_dref(blk)?;
		if self.cache().dref()?.stat != inr {
			if op == ClusterOp::Clean {
				// recycled after the bulk free; drop the stale pointer
				if fully {
					ino.i1 = NULL_CLUSTER;
					ino.clucount = ino.clucount.saturating_sub(1);
				}
				return Ok(());
			}
			return Err(Error::InconsistentClusterHeader);
		}

		let lo_off = start.saturating_sub(zone_lo) as usize;
		for off in (lo_off..RPC).rev() {
			let Some(ncl) = nz(self.cache().dref()?.ref_at(off)) else {
				continue;
			};
			match op {
				ClusterOp::Free => {
					self.free_data_cluster(ncl)?;
					self.cache().load_dref(blk)?;
				}
				ClusterOp::FreeClean => {
					self.free_data_cluster(ncl)?;
					self.cache().load_dref(blk)?;
					self.cache().dref_mut()?.set_ref(off, NULL_CLUSTER);
				}
				ClusterOp::Clean => {
					self.cache().dref_mut()?.set_ref(off, NULL_CLUSTER);
				}
				_ => unreachable!(),
			}
			ino.clucount = ino.clucount.saturating_sub(1);
		}

		match op {
			ClusterOp::Free => {
				if fully {
					self.free_data_cluster(rc)?;
					ino.clucount = ino.clucount.saturating_sub(1);
				}
			}
			ClusterOp::FreeClean => {
				self.cache().store_dref()?;
				if self.cache().dref()?.refs_all_null() {
					self.free_data_cluster(rc)?;
					ino.i1 = NULL_CLUSTER;
					ino.clucount = ino.clucount.saturating_sub(1);
				}
			}
			ClusterOp::Clean => {
				self.cache().store_dref()?;
				if self.cache().dref()?.refs_all_null() {
					ino.i1 = NULL_CLUSTER;
					ino.clucount = ino.clucount.saturating_sub(1);
				}
			}
			_ => unreachable!(),
		}
		Ok(())
	}

	fn range_double(&mut self, inr: u32, ino: &mut Inode, start: u32, op: ClusterOp) -> Result<()> {
		let Some(outer) = nz(ino.i2) else {
			return Ok(());
		};
		let base = (N_DIRECT + RPC) as u32;
		let fully = start <= base;

		let outer_blk = self.sb()?.cluster_block(outer);
		self.cache().load_iref(outer_blk)?;
		if self.cache().iref()?.stat != inr {
			if op == ClusterOp::Clean {
				if fully {
					ino.i2 = NULL_CLUSTER;
					ino.clucount = ino.clucount.saturating_sub(1);
				}
				return Ok(());
			}
			return Err(Error::InconsistentClusterHeader);
		}

		for hi in (0..RPC).rev() {
			let inner_lo = base + (hi * RPC) as u32;
			if start >= inner_lo + RPC as u32 {
				break;
			}
			self.cache().load_iref(outer_blk)?;
			let Some(inner) = nz(self.cache().iref()?.ref_at(hi)) else {
				continue;
			};
			let inner_fully = start <= inner_lo;
			let lo_off = start.saturating_sub(inner_lo) as usize;

			let inner_blk = self.sb()?.cluster_block(inner);
			self.cache().load_dref(inner_blk)?;
			if self.cache().dref()?.stat != inr {
				if op == ClusterOp::Clean {
					if inner_fully {
						self.cache().iref_mut()?.set_ref(hi, NULL_CLUSTER);
						ino.clucount = ino.clucount.saturating_sub(1);
					}
					continue;
				}
				return Err(Error::InconsistentClusterHeader);
			}

			for off in (lo_off..RPC).rev() {
				let Some(ncl) = nz(self.cache().dref()?.ref_at(off)) else {
					continue;
				};
				match op {
					ClusterOp::Free => {
						self.free_data_cluster(ncl)?;
						self.cache().load_dref(inner_blk)?;
					}
					ClusterOp::FreeClean => {
						self.free_data_cluster(ncl)?;
						self.cache().load_dref(inner_blk)?;
						self.cache().dref_mut()?.set_ref(off, NULL_CLUSTER);
					}
					ClusterOp::Clean => {
						self.cache().dref_mut()?.set_ref(off, NULL_CLUSTER);
					}
					_ => unreachable!(),
				}
				ino.clucount = ino.clucount.saturating_sub(1);
			}

			match op {
				ClusterOp::Free => {
					if inner_fully {
						self.free_data_cluster(inner)?;
						ino.clucount = ino.clucount.saturating_sub(1);
					}
				}
				ClusterOp::FreeClean => {
					self.cache().store_dref()?;
					if self.cache().dref()?.refs_all_null() {
						self.free_data_cluster(inner)?;
						ino.clucount = ino.clucount.saturating_sub(1);
						self.cache().load_iref(outer_blk)?;
						self.cache().iref_mut()?.set_ref(hi, NULL_CLUSTER);
					}
				}
				ClusterOp::Clean => {
					self.cache().store_dref()?;
					if self.cache().dref()?.refs_all_null() {
						self.cache().load_iref(outer_blk)?;
						self.cache().iref_mut()?.set_ref(hi, NULL_CLUSTER);
						ino.clucount = ino.clucount.saturating_sub(1);
					}
				}
				_ => unreachable!(),
			}
		}

		match op {
			ClusterOp::Free => {
				if fully {
					self.free_data_cluster(outer)?;
					ino.clucount = ino.clucount.saturating_sub(1);
				}
			}
			ClusterOp::FreeClean => {
				self.cache().load_iref(outer_blk)?;
				self.cache().store_iref()?;
				if self.cache().iref()?.refs_all_null() {
					self.free_data_cluster(outer)?;
					ino.i2 = NULL_CLUSTER;
					ino.clucount = ino.clucount.saturating_sub(1);
				}
			}
			ClusterOp::Clean => {
				self.cache().load_iref(outer_blk)?;
				self.cache().store_iref()?;
				if self.cache().iref()?.refs_all_null() {
					ino.i2 = NULL_CLUSTER;
					ino.clucount = ino.clucount.saturating_sub(1);
				}
			}
			_ => unreachable!(),
		}
		Ok(())
	}

	/// Clean a free-dirty data cluster in place: zero the payload and drop
	/// the owner stamp. Invoked by the allocator when a dirty cluster is
	/// about to be reused.
	pub fn clean_data_cluster(&mut self, inr: u32, ncl: u32) -> Result<()> {
		log::trace!("clean_data_cluster({inr}, {ncl});");
		let sb = self.sb()?;
		if inr >= sb.itotal {
			return Err(Error::InvalidInode);
		}
		if ncl >= sb.dzone_total {
			return Err(Error::InvalidCluster);
		}

		let mut cl = self.read_dcluster(ncl)?;
		if cl.stat != inr {
			return Err(Error::WrongInodeStamp);
		}
		cl.data.fill(0u8);
		cl.stat = NULL_INODE;
		self.write_dcluster(ncl, &cl)
	}

	/// Read the payload of the file cluster at logical index `idx` into
	/// `buf`, which must hold a full cluster payload. A hole reads as
	/// zeros.
	pub fn read_file_cluster(&mut self, inr: u32, idx: u32, buf: &mut [u8]) -> Result<()> {
		assert_eq!(buf.len(), BSLPC);
		match self.handle_file_cluster(inr, idx, ClusterOp::Get)? {
			Some(ncl) => {
				let cl = self.read_dcluster(ncl)?;
				buf.copy_from_slice(&cl.data);
			}
			None => buf.fill(0u8),
		}
		Ok(())
	}

	/// Write the payload of the file cluster at logical index `idx`,
	/// allocating it if it was never written.
	pub fn write_file_cluster(&mut self, inr: u32, idx: u32, buf: &[u8]) -> Result<()> {
		assert_eq!(buf.len(), BSLPC);
		let ncl = match self.handle_file_cluster(inr, idx, ClusterOp::Get)? {
			Some(ncl) => ncl,
			None => self
				.handle_file_cluster(inr, idx, ClusterOp::Alloc)?
				.expect("Alloc returns a cluster"),
		};
		let mut cl = self.read_dcluster(ncl)?;
		cl.data.copy_from_slice(buf);
		self.write_dcluster(ncl, &cl)?;
		self.cache().flush()
	}

	/// Read file bytes starting at `offset`. Returns the number of bytes
	/// read, zero at or past end of file.
	pub fn read_file(&mut self, inr: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
		log::trace!("read_file({inr}, {offset}, {});", buf.len());
		let ino = self.read_inode(inr, InodeStatus::InUse)?;
		if offset >= ino.size as u64 {
			return Ok(0);
		}
		let len = (buf.len() as u64).min(ino.size as u64 - offset) as usize;
		let end = offset + len as u64;

		let mut cbuf = [0u8; BSLPC];
		let mut pos = offset;
		let mut done = 0usize;
		while pos < end {
			let idx = (pos / BSLPC as u64) as u32;
			let off = (pos % BSLPC as u64) as usize;
			let n = (BSLPC - off).min((end - pos) as usize);
			self.read_file_cluster(inr, idx, &mut cbuf)?;
			buf[done..done + n].copy_from_slice(&cbuf[off..off + n]);
			done += n;
			pos += n as u64;
		}
		Ok(done)
	}

	/// Write file bytes starting at `offset`, extending the file and
	/// allocating clusters on demand.
	pub fn write_file(&mut self, inr: u32, offset: u64, buf: &[u8]) -> Result<usize> {
		log::trace!("write_file({inr}, {offset}, {});", buf.len());
		let mut ino = self.read_inode(inr, InodeStatus::InUse)?;
		if ino.is_dir() {
			return Err(Error::IsADirectory);
		}
		let end = offset + buf.len() as u64;
		if end > MAX_FILE_SIZE {
			return Err(Error::FileTooBig);
		}

		if end > ino.size as u64 {
			ino.size = end as u32;
			self.write_inode(ino, inr, InodeStatus::InUse)?;
		}

		let mut cbuf = [0u8; BSLPC];
		let mut pos = offset;
		let mut done = 0usize;
		while pos < end {
			let idx = (pos / BSLPC as u64) as u32;
			let off = (pos % BSLPC as u64) as usize;
			let n = (BSLPC - off).min((end - pos) as usize);
			self.read_file_cluster(inr, idx, &mut cbuf)?;
			cbuf[off..off + n].copy_from_slice(&buf[done..done + n]);
			self.write_file_cluster(inr, idx, &cbuf)?;
			done += n;
			pos += n as u64;
		}
		Ok(done)
	}
}

#[cfg(test)]
mod t {
	use super::{super::tests::test_volume, *};

	const S0: u32 = N_DIRECT as u32; // first single-indirect index
	const D0: u32 = (N_DIRECT + RPC) as u32; // first double-indirect index

	fn file_inode<B: Backend>(fs: &mut Sofs<B>) -> u32 {
		fs.allocate_inode(InodeKind::RegularFile).unwrap()
	}

	#[test]
	fn direct_zone_round_trip() {
		let mut fs = test_volume(100, 16);
		let inr = file_inode(&mut fs);
		let free0 = fs.sb().unwrap().dzone_free;

		assert_eq!(
			fs.handle_file_cluster(inr, 3, ClusterOp::Get).unwrap(),
			None
		);
		let ncl = fs
			.handle_file_cluster(inr, 3, ClusterOp::Alloc)
			.unwrap()
			.unwrap();
		assert_eq!(
			fs.handle_file_cluster(inr, 3, ClusterOp::Get).unwrap(),
			Some(ncl)
		);
		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		assert_eq!(ino.clucount, 1);
		assert_eq!(ino.d[3], ncl);

		assert!(matches!(
			fs.handle_file_cluster(inr, 3, ClusterOp::Alloc),
			Err(Error::AlreadyAllocated)
		));

		fs.handle_file_cluster(inr, 3, ClusterOp::Free).unwrap();
		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		assert_eq!(ino.clucount, 0);
		assert_eq!(ino.d[3], NULL_CLUSTER);
		assert_eq!(fs.sb().unwrap().dzone_free, free0);

		assert!(matches!(
			fs.handle_file_cluster(inr, 3, ClusterOp::Free),
			Err(Error::NotAllocated)
		));
	}

	#[test]
	fn single_zone_cascades_once() {
		let mut fs = test_volume(100, 16);
		let inr = file_inode(&mut fs);
		let free0 = fs.sb().unwrap().dzone_free;

		let ncl = fs
			.handle_file_cluster(inr, S0 + 5, ClusterOp::Alloc)
			.unwrap()
			.unwrap();
		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		// terminal plus the materialised reference cluster
		assert_eq!(ino.clucount, 2);
		assert_ne!(ino.i1, NULL_CLUSTER);
		assert_eq!(
			fs.handle_file_cluster(inr, S0 + 5, ClusterOp::Get).unwrap(),
			Some(ncl)
		);

		// freeing the only terminal cascades the reference cluster exactly
		// one level further
		fs.handle_file_cluster(inr, S0 + 5, ClusterOp::FreeClean)
			.unwrap();
		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		assert_eq!(ino.clucount, 0);
		assert_eq!(ino.i1, NULL_CLUSTER);
		assert_eq!(fs.sb().unwrap().dzone_free, free0);
	}

	#[test]
	fn single_zone_keeps_live_siblings() {
		let mut fs = test_volume(100, 16);
		let inr = file_inode(&mut fs);

		fs.handle_file_cluster(inr, S0, ClusterOp::Alloc).unwrap();
		fs.handle_file_cluster(inr, S0 + 1, ClusterOp::Alloc)
			.unwrap();
		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		assert_eq!(ino.clucount, 3);

		fs.handle_file_cluster(inr, S0, ClusterOp::FreeClean)
			.unwrap();
		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		// sibling still referenced, so the reference cluster stays
		assert_eq!(ino.clucount, 2);
		assert_ne!(ino.i1, NULL_CLUSTER);
		assert!(fs
			.handle_file_cluster(inr, S0 + 1, ClusterOp::Get)
			.unwrap()
			.is_some());
	}

	#[test]
	fn double_zone_round_trip() {
		let mut fs = test_volume(100, 16);
		let inr = file_inode(&mut fs);
		let free0 = fs.sb().unwrap().dzone_free;

		let ncl = fs
			.handle_file_cluster(inr, D0 + 1, ClusterOp::Alloc)
			.unwrap()
			.unwrap();
		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		// terminal + inner reference cluster + outer reference cluster
		assert_eq!(ino.clucount, 3);
		assert_ne!(ino.i2, NULL_CLUSTER);
		assert_eq!(
			fs.handle_file_cluster(inr, D0 + 1, ClusterOp::Get).unwrap(),
			Some(ncl)
		);
		assert_eq!(
			fs.handle_file_cluster(inr, D0, ClusterOp::Get).unwrap(),
			None
		);

		fs.handle_file_cluster(inr, D0 + 1, ClusterOp::FreeClean)
			.unwrap();
		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		assert_eq!(ino.clucount, 0);
		assert_eq!(ino.i2, NULL_CLUSTER);
		assert_eq!(fs.sb().unwrap().dzone_free, free0);
	}

	#[test]
	fn bulk_free_clean_partial_range() {
		let mut fs = test_volume(1000, 56);
		let inr = file_inode(&mut fs);

		for i in 0..20 {
			fs.handle_file_cluster(inr, i, ClusterOp::Alloc).unwrap();
		}
		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		// 20 terminals + 1 single-indirect reference cluster
		assert_eq!(ino.clucount, 21);

		fs.handle_file_clusters(inr, 10, ClusterOp::FreeClean)
			.unwrap();
		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		assert_eq!(ino.clucount, 11);
		assert_ne!(ino.i1, NULL_CLUSTER);
		assert!(fs
			.handle_file_cluster(inr, 9, ClusterOp::Get)
			.unwrap()
			.is_some());
		assert!(fs
			.handle_file_cluster(inr, 10, ClusterOp::Get)
			.unwrap()
			.is_none());

		fs.handle_file_clusters(inr, 0, ClusterOp::FreeClean)
			.unwrap();
		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		assert_eq!(ino.clucount, 0);
		assert_eq!(ino.i1, NULL_CLUSTER);
	}

	#[test]
	fn bulk_free_leaves_stale_refs_then_clean_recovers() {
		let mut fs = test_volume(1000, 56);
		let inr = file_inode(&mut fs);
		let free0 = fs.sb().unwrap().dzone_free;

		for i in 0..12 {
			fs.handle_file_cluster(inr, i, ClusterOp::Alloc).unwrap();
		}

		// unlink path: bulk-FREE releases every attributed cluster but
		// leaves the reference words stale
		fs.handle_file_clusters(inr, 0, ClusterOp::Free).unwrap();
		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		assert_eq!(ino.clucount, 0);
		assert_ne!(ino.i1, NULL_CLUSTER);
		assert_eq!(fs.sb().unwrap().dzone_free, free0);

		fs.free_inode(inr).unwrap();
		fs.clean_inode(inr).unwrap();
		let ino = fs.read_inode(inr, InodeStatus::FreeClean).unwrap();
		assert_eq!(ino.i1, NULL_CLUSTER);
		assert!(ino.d.iter().all(|r| *r == NULL_CLUSTER));
	}

	#[test]
	fn clean_skips_recycled_reference_cluster() {
		let mut fs = test_volume(100, 16);
		let a = file_inode(&mut fs);

		for i in 0..12 {
			fs.handle_file_cluster(a, i, ClusterOp::Alloc).unwrap();
		}
		fs.handle_file_clusters(a, 0, ClusterOp::Free).unwrap();
		fs.free_inode(a).unwrap();

		// a big enough file recycles a's freed clusters, the old
		// single-indirect reference cluster among them
		let b = file_inode(&mut fs);
		let payload: Vec<u8> = (0..(20 * BSLPC) as u32).map(|i| (i % 239) as u8).collect();
		fs.write_file(b, 0, &payload).unwrap();

		// cleaning a sees foreign owner stamps and must not touch b
		fs.clean_inode(a).unwrap();

		let ai = fs.read_inode(a, InodeStatus::FreeClean).unwrap();
		assert_eq!(ai.i1, NULL_CLUSTER);

		let bi = fs.read_inode(b, InodeStatus::InUse).unwrap();
		assert_eq!(bi.clucount, 21);
		let mut back = vec![0u8; payload.len()];
		assert_eq!(fs.read_file(b, 0, &mut back).unwrap(), payload.len());
		assert_eq!(back, payload);
	}

	#[test]
	fn singular_clean_on_free_dirty_inode() {
		let mut fs = test_volume(100, 16);
		let a = file_inode(&mut fs);

		fs.handle_file_cluster(a, S0, ClusterOp::Alloc).unwrap();
		fs.handle_file_cluster(a, S0 + 1, ClusterOp::Alloc)
			.unwrap();
		let t0 = fs
			.handle_file_cluster(a, S0, ClusterOp::Get)
			.unwrap()
			.unwrap();

		// singular FREE releases the terminals but leaves the stale
		// references inside the reference cluster and the inode
		fs.handle_file_cluster(a, S0, ClusterOp::Free).unwrap();
		fs.handle_file_cluster(a, S0 + 1, ClusterOp::Free).unwrap();
		fs.free_inode(a).unwrap();

		// forge a stale direct reference too, as an interrupted release
		// would leave behind
		let mut ino = fs.peek_inode(a).unwrap();
		ino.d[0] = t0;
		fs.write_inode(ino, a, InodeStatus::FreeDirty).unwrap();

		fs.handle_file_cluster(a, 0, ClusterOp::Clean).unwrap();
		assert_eq!(fs.peek_inode(a).unwrap().d[0], NULL_CLUSTER);

		// one reference still stale, so the reference cluster pointer stays
		fs.handle_file_cluster(a, S0, ClusterOp::Clean).unwrap();
		assert_ne!(fs.peek_inode(a).unwrap().i1, NULL_CLUSTER);

		// the last one goes, and the pointer with it; nothing was freed
		fs.handle_file_cluster(a, S0 + 1, ClusterOp::Clean)
			.unwrap();
		assert_eq!(fs.peek_inode(a).unwrap().i1, NULL_CLUSTER);
	}

	#[test]
	fn singular_clean_skips_recycled_reference_cluster() {
		let mut fs = test_volume(100, 16);
		let a = file_inode(&mut fs);

		fs.handle_file_cluster(a, S0, ClusterOp::Alloc).unwrap();
		let x1 = fs.peek_inode(a).unwrap().i1;
		fs.handle_file_cluster(a, S0, ClusterOp::Free).unwrap();
		fs.free_data_cluster(x1).unwrap();
		fs.free_inode(a).unwrap();

		// another file recycles the old reference cluster
		let b = file_inode(&mut fs);
		let mut got = fs.allocate_data_cluster(b).unwrap();
		while got != x1 {
			got = fs.allocate_data_cluster(b).unwrap();
		}

		// the owner stamp no longer matches: the stale pointer is dropped
		// without descending into b's cluster
		fs.handle_file_cluster(a, S0, ClusterOp::Clean).unwrap();
		assert_eq!(fs.peek_inode(a).unwrap().i1, NULL_CLUSTER);

		let cl = fs.read_dcluster(x1).unwrap();
		assert_eq!(cl.stat, b);
		assert!(cl.data.iter().all(|byte| *byte == 0));
	}

	#[test]
	fn file_bytes_round_trip() {
		let mut fs = test_volume(100, 16);
		let inr = file_inode(&mut fs);

		let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
		assert_eq!(fs.write_file(inr, 0, &payload).unwrap(), 200);

		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		assert_eq!(ino.size, 200);
		assert_eq!(ino.clucount, 1);

		let mut back = vec![0u8; 200];
		assert_eq!(fs.read_file(inr, 0, &mut back).unwrap(), 200);
		assert_eq!(back, payload);

		// reads past the end return nothing
		assert_eq!(fs.read_file(inr, 200, &mut back).unwrap(), 0);
	}

	#[test]
	fn cluster_spanning_file() {
		let mut fs = test_volume(1000, 56);
		let inr = file_inode(&mut fs);

		let payload: Vec<u8> = (0..40000u32).map(|i| (i % 241) as u8).collect();
		assert_eq!(fs.write_file(inr, 0, &payload).unwrap(), payload.len());

		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		assert_eq!(ino.size as usize, payload.len());

		// 20 payload clusters plus the single-indirect reference cluster
		let terminals = payload.len().div_ceil(BSLPC);
		assert_eq!(terminals, 20);
		assert_eq!(ino.clucount as usize, terminals + 1);

		// direct slots filled in order, then the single-indirect zone
		assert!(ino.d.iter().all(|r| *r != NULL_CLUSTER));
		assert_ne!(ino.i1, NULL_CLUSTER);
		assert_eq!(ino.i2, NULL_CLUSTER);
		for i in 0..terminals as u32 {
			assert!(fs
				.handle_file_cluster(inr, i, ClusterOp::Get)
				.unwrap()
				.is_some());
		}

		let mut back = vec![0u8; payload.len()];
		assert_eq!(fs.read_file(inr, 0, &mut back).unwrap(), payload.len());
		assert_eq!(back, payload);
	}

	#[test]
	fn sparse_holes_read_zero() {
		let mut fs = test_volume(1000, 56);
		let inr = file_inode(&mut fs);

		fs.write_file(inr, 3 * BSLPC as u64, b"tail").unwrap();
		let mut buf = vec![0xFFu8; BSLPC];
		assert_eq!(fs.read_file(inr, 0, &mut buf).unwrap(), BSLPC);
		assert!(buf.iter().all(|b| *b == 0));

		let ino = fs.read_inode(inr, InodeStatus::InUse).unwrap();
		assert_eq!(ino.clucount, 1);
	}

	#[test]
	fn out_of_range_index() {
		let mut fs = test_volume(100, 16);
		let inr = file_inode(&mut fs);
		assert!(matches!(
			fs.handle_file_cluster(inr, MAX_FILE_CLUSTERS as u32, ClusterOp::Get),
			Err(Error::FileTooBig)
		));
	}

	#[test]
	fn clean_stamp_mismatch() {
		let mut fs = test_volume(100, 16);
		let inr = file_inode(&mut fs);
		let ncl = fs
			.handle_file_cluster(inr, 0, ClusterOp::Alloc)
			.unwrap()
			.unwrap();
		assert!(matches!(
			fs.clean_data_cluster(inr + 1, ncl),
			Err(Error::WrongInodeStamp)
		));
	}
}
