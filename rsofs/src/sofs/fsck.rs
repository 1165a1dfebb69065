//! Offline whole-volume consistency pass.
//!
//! Six phases over a read-only view of the backing file, short-circuiting
//! on the first hard error: superblock, inode table and free list, data
//! zone and general free list, superblock caches, cluster-to-inode
//! reference graph, directory tree reachability.

use std::{
	fs,
	path::{Path, PathBuf},
};

use super::{
	clusters::{zone_of, Zone},
	consist,
};
use crate::{
	codec::{Backend, Codec},
	data::*,
	error::{Error, Result},
};

/// Options of a check run.
#[derive(Debug, Clone, Default)]
pub struct CheckOpts {
	/// Duplicate the report into this file.
	pub logfile: Option<PathBuf>,
}

/// Tallies of a successful check.
#[derive(Debug, Clone)]
pub struct CheckReport {
	pub itotal:              u32,
	pub ifree:               u32,
	pub in_use_inodes:       u32,
	pub directories:         u32,
	pub dzone_total:         u32,
	pub dzone_free:          u32,
	pub referenced_clusters: u32,
}

impl CheckReport {
	pub fn lines(&self) -> Vec<String> {
		vec![
			format!("inodes: {} total, {} free, {} in use", self.itotal, self.ifree, self.in_use_inodes),
			format!("directories: {}", self.directories),
			format!(
				"clusters: {} total, {} free, {} referenced",
				self.dzone_total, self.dzone_free, self.referenced_clusters
			),
		]
	}
}

/// Check the volume backed by `path`.
pub fn check(path: &Path, opts: &CheckOpts) -> Result<CheckReport> {
	log::info!("checking {}", path.display());
	let mut file = Codec::open(path, false)?;
	check_backend(&mut file, opts)
}

pub(crate) fn check_backend<B: Backend>(
	file: &mut Codec<B>,
	opts: &CheckOpts,
) -> Result<CheckReport> {
	let mut ck = Fsck::load(file)?;
	ck.check_inode_table()?;
	ck.check_data_zone()?;
	ck.check_caches()?;
	ck.check_references()?;
	ck.check_directory_tree()?;

	let report = ck.report();
	for line in report.lines() {
		log::info!("{line}");
	}
	if let Some(path) = &opts.logfile {
		fs::write(path, report.lines().join("\n") + "\n")?;
	}
	Ok(report)
}

/// Where a data cluster was accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
	Unknown,
	FreeList,
	Retrieval,
	Insertion,
	Inode(u32),
}

struct Fsck<'a, B: Backend> {
	file:    &'a mut Codec<B>,
	sb:      Superblock,
	inodes:  Vec<Inode>,
	headers: Vec<(u32, u32, u32)>,
	owner:   Vec<Owner>,
	in_use:  u32,
	dirs:    u32,
}

impl<'a, B: Backend> Fsck<'a, B> {
	/// Phase 1: superblock header integrity and table arithmetic.
	fn load(file: &'a mut Codec<B>) -> Result<Self> {
		let sb: Superblock = file.decode_at(0)?;
		consist::check_superblock(&sb)?;
		log::info!("phase 1: superblock ok, volume {:?}", sb.volume_name());

		let mut inodes = Vec::with_capacity(sb.itotal as usize);
		for blk in 0..sb.itable_size {
			let ib: InodeBlock =
				file.decode_at((sb.itable_start + blk) as u64 * BLOCK_SIZE as u64)?;
			inodes.extend_from_slice(&ib.ino);
		}

		let mut headers = Vec::with_capacity(sb.dzone_total as usize);
		for ncl in 0..sb.dzone_total {
			let hdr: (u32, u32, u32) =
				file.decode_at(sb.cluster_block(ncl) as u64 * BLOCK_SIZE as u64)?;
			headers.push(hdr);
		}

		let owner = vec![Owner::Unknown; sb.dzone_total as usize];
		Ok(Self {
			file,
			sb,
			inodes,
			headers,
			owner,
			in_use: 0,
			dirs: 0,
		})
	}

	fn cluster(&mut self, ncl: u32) -> Result<Cluster> {
		self.file
			.decode_at(self.sb.cluster_block(ncl) as u64 * BLOCK_SIZE as u64)
	}

	/// Phase 2: every inode passes the predicate of its state, and the
	/// free list covers exactly the free inodes.
	fn check_inode_table(&mut self) -> Result<()> {
		let root = &self.inodes[0];
		if !root.is_dir() || root.refcount < 2 || root.d[0] != 0 {
			log::error!("phase 2: root inode corrupted");
			return Err(Error::InconsistentInodeInUse);
		}

		for ino in &self.inodes {
			if ino.is_in_use() {
				consist::check_inode_in_use(ino, &self.sb)?;
				self.in_use += 1;
			} else if ino.is_free_clean() {
				consist::check_inode_free_clean(ino, &self.sb)?;
			} else {
				consist::check_inode_free_dirty(ino, &self.sb)?;
			}
		}

		// walk the free list, bounded by ifree to catch loops
		let mut on_list = vec![false; self.inodes.len()];
		let mut prev = NULL_INODE;
		let mut cur = self.sb.ihead;
		let mut count = 0u32;
		while cur != NULL_INODE {
			if count == self.sb.ifree || on_list[cur as usize] {
				log::error!("phase 2: inode free list loops at {cur}");
				return Err(Error::AlreadyOnList);
			}
			let ino = &self.inodes[cur as usize];
			if ino.is_in_use() {
				log::error!("phase 2: in-use inode {cur} on the free list");
				return Err(Error::AlreadyOnList);
			}
			if ino.prev() != prev {
				log::error!("phase 2: bad prev linkage at inode {cur}");
				return Err(Error::InconsistentFreeDirtyInode);
			}
			on_list[cur as usize] = true;
			count += 1;
			prev = cur;
			cur = ino.next();
		}
		if count != self.sb.ifree || prev != self.sb.itail {
			log::error!(
				"phase 2: free list has {count} nodes ending at {prev}, superblock says {} / {}",
				self.sb.ifree,
				self.sb.itail
			);
			return Err(Error::InvalidSuperblock);
		}
		for (inr, ino) in self.inodes.iter().enumerate() {
			if ino.is_free() && !on_list[inr] {
				log::error!("phase 2: free inode {inr} missing from the free list");
				return Err(Error::NotOnList);
			}
		}

		log::info!("phase 2: inode table ok, {} in use", self.in_use);
		Ok(())
	}

	/// Phase 3: classify every cluster header and walk the general free
	/// list, bounded by dzone_free.
	fn check_data_zone(&mut self) -> Result<()> {
		let (p0, n0, s0) = self.headers[0];
		if p0 != NULL_CLUSTER || n0 != NULL_CLUSTER || s0 != 0 {
			log::error!("phase 3: cluster 0 is not the root directory cluster");
			return Err(Error::InconsistentClusterHeader);
		}

		let mut prev = NULL_CLUSTER;
		let mut cur = self.sb.dhead;
		let mut count = 0u32;
		while cur != NULL_CLUSTER {
			if count == self.sb.dzone_free || self.owner[cur as usize] != Owner::Unknown {
				log::error!("phase 3: general free list loops at {cur}");
				return Err(Error::AlreadyOnList);
			}
			let (hp, hn, _) = self.headers[cur as usize];
			if hp != prev {
				log::error!("phase 3: bad prev linkage at cluster {cur}");
				return Err(Error::InconsistentClusterHeader);
			}
			self.owner[cur as usize] = Owner::FreeList;
			count += 1;
			prev = cur;
			cur = hn;
		}
		if prev != self.sb.dtail {
			log::error!("phase 3: free list ends at {prev}, superblock says {}", self.sb.dtail);
			return Err(Error::InvalidSuperblock);
		}

		// linked headers are exactly the walked members
		for ncl in 0..self.sb.dzone_total {
			let (hp, hn, _) = self.headers[ncl as usize];
			let linked = hp != NULL_CLUSTER || hn != NULL_CLUSTER;
			if linked && self.owner[ncl as usize] != Owner::FreeList {
				log::error!("phase 3: cluster {ncl} has list linkage but is unreachable");
				return Err(Error::AlreadyOnList);
			}
		}

		log::info!("phase 3: data zone ok, {count} clusters on the general list");
		Ok(())
	}

	fn place(&mut self, ncl: u32, at: Owner) -> Result<()> {
		if ncl >= self.sb.dzone_total {
			return Err(Error::InvalidCluster);
		}
		if self.owner[ncl as usize] != Owner::Unknown {
			log::error!(
				"phase 4: cluster {ncl} accounted twice: {:?} and {at:?}",
				self.owner[ncl as usize]
			);
			return Err(Error::AlreadyOnList);
		}
		let (hp, hn, _) = self.headers[ncl as usize];
		if hp != NULL_CLUSTER || hn != NULL_CLUSTER {
			log::error!("phase 4: cached cluster {ncl} still carries list linkage");
			return Err(Error::InconsistentClusterHeader);
		}
		self.owner[ncl as usize] = at;
		Ok(())
	}

	/// Phase 4: cache entries are free clusters, and the free partition
	/// adds up to dzone_free.
	fn check_caches(&mut self) -> Result<()> {
		for i in (self.sb.retrieval.idx as usize)..DZONE_CACHE_SIZE {
			self.place(self.sb.retrieval.entries[i], Owner::Retrieval)?;
		}
		for i in 0..(self.sb.insertion.idx as usize) {
			self.place(self.sb.insertion.entries[i], Owner::Insertion)?;
		}

		let free = self
			.owner
			.iter()
			.filter(|o| !matches!(o, Owner::Unknown))
			.count() as u32;
		if free != self.sb.dzone_free {
			log::error!(
				"phase 4: {free} clusters in the free structures, superblock says {}",
				self.sb.dzone_free
			);
			return Err(Error::InvalidSuperblock);
		}

		// a fully clean cluster lives in the retrieval cache or nowhere
		for ncl in 1..self.sb.dzone_total {
			let (hp, hn, hs) = self.headers[ncl as usize];
			let clean = hp == NULL_CLUSTER && hn == NULL_CLUSTER && hs == NULL_INODE;
			if clean && self.owner[ncl as usize] == Owner::Unknown {
				log::error!("phase 4: free clean cluster {ncl} lost");
				return Err(Error::NotOnList);
			}
		}

		log::info!("phase 4: caches ok, {free} free clusters accounted");
		Ok(())
	}

	fn reference(&mut self, inr: u32, ncl: u32) -> Result<()> {
		if ncl >= self.sb.dzone_total {
			return Err(Error::InconsistentRefList);
		}
		match self.owner[ncl as usize] {
			Owner::Unknown => {}
			Owner::Inode(other) => {
				log::error!("phase 5: cluster {ncl} referenced by inodes {other} and {inr}");
				return Err(Error::AlreadyAllocated);
			}
			at => {
				log::error!("phase 5: cluster {ncl} referenced by inode {inr} but free in {at:?}");
				return Err(Error::AlreadyOnList);
			}
		}
		let (hp, hn, hs) = self.headers[ncl as usize];
		if hp != NULL_CLUSTER || hn != NULL_CLUSTER || hs != inr {
			log::error!("phase 5: cluster {ncl} header does not say allocated-to-{inr}");
			return Err(Error::InconsistentClusterHeader);
		}
		self.owner[ncl as usize] = Owner::Inode(inr);
		Ok(())
	}

	/// Phase 5: mark every cluster reachable from an in-use inode; a
	/// double reference or an unaccounted cluster is a hard error.
	fn check_references(&mut self) -> Result<()> {
		for inr in 0..self.inodes.len() as u32 {
			let ino = self.inodes[inr as usize];
			if !ino.is_in_use() {
				continue;
			}

			for r in ino.d {
				if r != NULL_CLUSTER {
					self.reference(inr, r)?;
				}
			}
			if ino.i1 != NULL_CLUSTER {
				self.reference(inr, ino.i1)?;
				let cl = self.cluster(ino.i1)?;
				consist::check_ref_list(&cl, &self.sb)?;
				for i in 0..RPC {
					let r = cl.ref_at(i);
					if r != NULL_CLUSTER {
						self.reference(inr, r)?;
					}
				}
			}
			if ino.i2 != NULL_CLUSTER {
				self.reference(inr, ino.i2)?;
				let outer = self.cluster(ino.i2)?;
				consist::check_ref_list(&outer, &self.sb)?;
				for hi in 0..RPC {
					let inner = outer.ref_at(hi);
					if inner == NULL_CLUSTER {
						continue;
					}
					self.reference(inr, inner)?;
					let cl = self.cluster(inner)?;
					consist::check_ref_list(&cl, &self.sb)?;
					for lo in 0..RPC {
						let r = cl.ref_at(lo);
						if r != NULL_CLUSTER {
							self.reference(inr, r)?;
						}
					}
				}
			}
		}

		if self.owner[0] != Owner::Inode(0) {
			log::error!("phase 5: cluster 0 is not referenced by the root inode");
			return Err(Error::InconsistentClusterHeader);
		}
		for ncl in 0..self.sb.dzone_total {
			if self.owner[ncl as usize] == Owner::Unknown {
				log::error!("phase 5: cluster {ncl} neither free nor referenced");
				return Err(Error::NotOnList);
			}
		}

		log::info!("phase 5: reference graph ok");
		Ok(())
	}

	/// Resolve a logical file-cluster index through the reference tree,
	/// read-only.
	fn file_cluster(&mut self, ino: &Inode, idx: u32) -> Result<Option<u32>> {
		let ncl = match zone_of(idx)? {
			Zone::Direct(i) => ino.d[i],
			Zone::Single(off) => {
				if ino.i1 == NULL_CLUSTER {
					return Ok(None);
				}
				self.cluster(ino.i1)?.ref_at(off)
			}
			Zone::Double(hi, lo) => {
				if ino.i2 == NULL_CLUSTER {
					return Ok(None);
				}
				let inner = self.cluster(ino.i2)?.ref_at(hi);
				if inner == NULL_CLUSTER {
					return Ok(None);
				}
				self.cluster(inner)?.ref_at(lo)
			}
		};
		Ok((ncl != NULL_CLUSTER).then_some(ncl))
	}

	/// Phase 6: depth-first walk of the directory tree from the root,
	/// checking `.`/`..`, loop-freedom, reachability and the reference
	/// counts.
	fn check_directory_tree(&mut self) -> Result<()> {
		let n = self.inodes.len();
		let mut tally = vec![0u32; n];
		let mut reached = vec![false; n];
		let mut visited = vec![false; n];
		reached[0] = true;
		visited[0] = true;

		let mut stack = vec![(0u32, 0u32)];
		while let Some((dinr, parent)) = stack.pop() {
			let dino = self.inodes[dinr as usize];
			if dino.size as usize % DIR_CLUSTER_SIZE != 0 || dino.size == 0 {
				log::error!("phase 6: directory {dinr} has size {}", dino.size);
				return Err(Error::InconsistentDirectory);
			}
			self.dirs += 1;

			let nclusters = dino.size / DIR_CLUSTER_SIZE as u32;
			for cidx in 0..nclusters {
				let Some(ncl) = self.file_cluster(&dino, cidx)? else {
					log::error!("phase 6: directory {dinr} has a hole at cluster {cidx}");
					return Err(Error::InconsistentDirectory);
				};
				let cl = self.cluster(ncl)?;

				for off in 0..DPC {
					let slot = cidx * DPC as u32 + off as u32;
					let de = cl.dir_entry(off);
					match slot {
						0 => {
							if de.name() != "." || de.ninode != dinr {
								log::error!("phase 6: directory {dinr} has a bad `.`");
								return Err(Error::InconsistentDirectory);
							}
							tally[dinr as usize] += 1;
						}
						1 => {
							if de.name() != ".." || de.ninode != parent {
								log::error!("phase 6: directory {dinr} has a bad `..`");
								return Err(Error::InconsistentDirectory);
							}
							tally[parent as usize] += 1;
						}
						_ => {
							if de.is_free() {
								continue;
							}
							let einr = de.ninode;
							if einr >= self.sb.itotal
								|| !self.inodes[einr as usize].is_in_use()
							{
								log::error!(
									"phase 6: entry {:?} of directory {dinr} points at bad inode {einr}",
									de.name()
								);
								return Err(Error::InconsistentDirectory);
							}
							tally[einr as usize] += 1;
							reached[einr as usize] = true;
							if self.inodes[einr as usize].is_dir() {
								if visited[einr as usize] {
									log::error!(
										"phase 6: directory {einr} reached twice, tree loops"
									);
									return Err(Error::Loop);
								}
								visited[einr as usize] = true;
								stack.push((einr, dinr));
							}
						}
					}
				}
			}
		}

		for inr in 0..n {
			let ino = &self.inodes[inr];
			if !ino.is_in_use() {
				continue;
			}
			if !reached[inr] {
				log::error!("phase 6: in-use inode {inr} unreachable from the root");
				return Err(Error::InconsistentDirectory);
			}
			if tally[inr] != ino.refcount as u32 {
				log::error!(
					"phase 6: inode {inr} has refcount {} but {} references",
					ino.refcount,
					tally[inr]
				);
				return Err(Error::InconsistentInodeInUse);
			}
		}

		log::info!("phase 6: directory tree ok, {} directories", self.dirs);
		Ok(())
	}

	fn report(&self) -> CheckReport {
		let referenced = self
			.owner
			.iter()
			.filter(|o| matches!(o, Owner::Inode(_)))
			.count() as u32;
		CheckReport {
			itotal: self.sb.itotal,
			ifree: self.sb.ifree,
			in_use_inodes: self.in_use,
			directories: self.dirs,
			dzone_total: self.sb.dzone_total,
			dzone_free: self.sb.dzone_free,
			referenced_clusters: referenced,
		}
	}
}
