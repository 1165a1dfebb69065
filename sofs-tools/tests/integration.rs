use std::{fs, path::PathBuf, process::Command};

use assert_cmd::cargo::CommandCargoExt;
use rsofs::{Cred, InodeKind, InodeStatus, Sofs};
use tempfile::TempDir;

const BLOCK_SIZE: u64 = 512;

struct Harness {
	dir: TempDir,
	dev: PathBuf,
}

impl Harness {
	fn new(nblocks: u64) -> Self {
		let dir = tempfile::tempdir().unwrap();
		let dev = dir.path().join("volume.img");
		let f = fs::File::create(&dev).unwrap();
		f.set_len(nblocks * BLOCK_SIZE).unwrap();
		Self {
			dir,
			dev,
		}
	}

	fn mksofs(&self, args: &[&str]) -> std::process::Output {
		let mut cmd = Command::cargo_bin("mksofs").unwrap();
		cmd.args(args).arg(&self.dev);
		cmd.output().unwrap()
	}

	fn sofsck(&self, extra: &[&str]) -> std::process::Output {
		let mut cmd = Command::cargo_bin("sofsck").unwrap();
		cmd.arg("-f").arg(&self.dev).args(extra);
		cmd.output().unwrap()
	}
}

#[test]
fn mkfs_then_fsck_round_trip() {
	let h = Harness::new(100);

	let out = h.mksofs(&["-n", "itest", "-i", "56"]);
	assert!(out.status.success(), "mksofs failed: {out:?}");
	let stdout = String::from_utf8(out.stdout).unwrap();
	assert!(stdout.contains("100 blocks"), "unexpected output: {stdout}");
	assert!(stdout.contains("56 inodes"));

	let out = h.sofsck(&[]);
	assert!(out.status.success(), "sofsck failed: {out:?}");
	let stdout = String::from_utf8(out.stdout).unwrap();
	assert!(stdout.contains("clean"), "unexpected output: {stdout}");
}

#[test]
fn fsck_writes_logfile() {
	let h = Harness::new(100);
	assert!(h.mksofs(&["-z"]).status.success());

	let log = h.dir.path().join("fsck.log");
	let out = h.sofsck(&["-l", log.to_str().unwrap()]);
	assert!(out.status.success());
	let text = fs::read_to_string(&log).unwrap();
	assert!(text.contains("inodes:"), "unexpected log: {text}");
}

#[test]
fn mkfs_rejects_a_volume_too_small() {
	let h = Harness::new(3);
	let out = h.mksofs(&[]);
	assert!(!out.status.success());
}

#[test]
fn fsck_rejects_garbage() {
	let h = Harness::new(100);
	fs::write(&h.dev, vec![0xA5u8; 100 * BLOCK_SIZE as usize]).unwrap();
	let out = h.sofsck(&[]);
	assert!(!out.status.success());
	assert!(!out.stderr.is_empty());
}

#[test]
fn quiet_mkfs_prints_nothing() {
	let h = Harness::new(100);
	let out = h.mksofs(&["-q"]);
	assert!(out.status.success());
	assert!(out.stdout.is_empty());
}

#[test]
fn mount_modify_unmount_stays_clean() {
	let h = Harness::new(200);
	assert!(h.mksofs(&["-n", "e2e", "-i", "32"]).status.success());

	let mut fs = Sofs::mount(&h.dev).unwrap();
	fs.set_cred(Cred::root());

	let d = fs.allocate_inode(InodeKind::Directory).unwrap();
	let mut ino = fs.read_inode(d, InodeStatus::InUse).unwrap();
	ino.mode |= 0o755;
	fs.write_inode(ino, d, InodeStatus::InUse).unwrap();
	fs.add_dir_entry(0, "home", d).unwrap();

	let f = fs.allocate_inode(InodeKind::RegularFile).unwrap();
	let mut ino = fs.read_inode(f, InodeStatus::InUse).unwrap();
	ino.mode |= 0o644;
	fs.write_inode(ino, f, InodeStatus::InUse).unwrap();
	fs.add_dir_entry(d, "data", f).unwrap();
	fs.write_file(f, 0, &vec![0x42u8; 5000]).unwrap();

	let hit = fs.get_dir_entry_by_path("/home/data").unwrap();
	assert_eq!(hit.inr, f);
	let mut buf = vec![0u8; 5000];
	assert_eq!(fs.read_file(f, 0, &mut buf).unwrap(), 5000);
	assert!(buf.iter().all(|b| *b == 0x42));

	// unlink the file again so the tree is shallow but the free lists are
	// exercised, then unmount
	fs.remove_dir_entry(d, "data").unwrap();
	fs.read_inode(f, InodeStatus::FreeDirty).unwrap();
	fs.unmount().unwrap();

	let out = h.sofsck(&[]);
	assert!(out.status.success(), "sofsck failed: {out:?}");
}
