//! Consistency checking of a mounted volume.

use crate::volume::{Volume, block_run_in_bounds};
use bfs_error::Result;
use bfs_inode::Inode;
use bfs_types::{BlockRun, InodeId};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// One failed check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckVerdict {
    /// What was checked, e.g. `inode[515]` or `used_blocks`.
    pub component: String,
    pub detail: String,
}

/// Outcome of walking the volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub inodes: u64,
    pub directories: u64,
    pub files: u64,
    pub indices: u64,
    pub passed: u64,
    pub failed: u64,
    /// Used blocks counted from the bitmap.
    pub bitmap_used_blocks: u64,
    /// Used blocks recorded in the superblock.
    pub recorded_used_blocks: u64,
    pub issues: Vec<CheckVerdict>,
}

impl CheckReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.failed == 0
    }

    fn pass(&mut self) {
        self.passed += 1;
    }

    fn fail(&mut self, component: String, detail: String) {
        self.failed += 1;
        self.issues.push(CheckVerdict { component, detail });
    }
}

/// Walks every inode reachable from the root and the indices directory.
///
/// Checks only report; they never panic the volume or modify it.
#[derive(Debug, Default)]
pub struct CheckVisitor {
    report: Option<CheckReport>,
}

impl CheckVisitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report of the last completed run.
    #[must_use]
    pub fn report(&self) -> Option<&CheckReport> {
        self.report.as_ref()
    }

    pub(crate) fn into_report(self) -> Option<CheckReport> {
        self.report
    }

    pub(crate) fn run(&mut self, volume: &Volume) -> Result<CheckReport> {
        let mut report = CheckReport::default();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([volume.root().id()]);
        if let Some(indices) = volume.indices() {
            queue.push_back(indices.id());
        }

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let component = format!("inode[{id}]");
            let inode = match load(volume, id) {
                Ok(inode) => inode,
                Err(detail) => {
                    report.fail(component, detail);
                    continue;
                }
            };
            report.inodes += 1;
            match check_runs(volume, &inode) {
                Ok(()) => report.pass(),
                Err(detail) => report.fail(component.clone(), detail),
            }

            if !inode.is_container() {
                report.files += 1;
                continue;
            }
            if inode.is_index_directory() {
                report.indices += 1;
            } else {
                report.directories += 1;
            }
            match inode.entries(volume.cache()) {
                Ok(entries) => queue.extend(entries.into_iter().map(|entry| entry.inode)),
                Err(err) => report.fail(component, err.to_string()),
            }
        }

        report.bitmap_used_blocks = volume
            .allocator()
            .group_stats(volume.cache())?
            .iter()
            .map(|stats| u64::from(stats.used_blocks))
            .sum();
        report.recorded_used_blocks = volume.superblock().used_blocks;
        if report.bitmap_used_blocks == report.recorded_used_blocks {
            report.pass();
        } else {
            report.fail(
                "used_blocks".to_owned(),
                format!(
                    "bitmap counts {} used blocks, superblock records {}",
                    report.bitmap_used_blocks, report.recorded_used_blocks
                ),
            );
        }

        tracing::info!(
            target: "bfs::volume",
            inodes = report.inodes,
            passed = report.passed,
            failed = report.failed,
            "check_completed"
        );
        self.report = Some(report.clone());
        Ok(report)
    }
}

fn load(volume: &Volume, id: InodeId) -> std::result::Result<Inode, String> {
    let block = id.into();
    if !volume.is_valid_inode_block(block) {
        return Err("block cannot hold an inode".to_owned());
    }
    let inode = Inode::load(volume.cache(), volume.ag_shift(), id).map_err(|e| e.to_string())?;
    inode.init_check().map_err(|e| e.to_string())?;
    Ok(inode)
}

/// The inode's own run and its data runs must be in bounds and allocated.
fn check_runs(volume: &Volume, inode: &Inode) -> std::result::Result<(), String> {
    let node = inode.read_node(volume.cache()).map_err(|e| e.to_string())?;
    std::iter::once(inode.block_run())
        .chain(node.data.runs())
        .try_for_each(|run| check_run(volume, run))
}

fn check_run(volume: &Volume, run: BlockRun) -> std::result::Result<(), String> {
    if !block_run_in_bounds(run, volume.num_ags(), volume.ag_shift()) {
        return Err(format!("block run {run} outside the volume"));
    }
    match volume.allocator().is_allocated(volume.cache(), run) {
        Ok(true) => Ok(()),
        Ok(false) => Err(format!("block run {run} is not marked in use")),
        Err(err) => Err(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use crate::{InitializeOptions, MountOptions, Volume};
    use bfs_alloc::bitmap_clear;
    use bfs_block::{ByteDevice, MemoryByteDevice};
    use bfs_types::{ByteOffset, TypeCode};
    use std::sync::Arc;

    fn formatted() -> Arc<MemoryByteDevice> {
        let mem = Arc::new(MemoryByteDevice::new(12_000 * 1024));
        let options = InitializeOptions {
            block_size: 1024,
            volume_id_seed: Some(1),
            ..InitializeOptions::default()
        };
        Volume::initialize(mem.clone(), "check", &options).expect("initialize");
        mem
    }

    #[test]
    fn fresh_volume_is_consistent() {
        let mem = formatted();
        let volume = Volume::mount_device(mem, &MountOptions::default()).expect("mount");
        let root = volume.root().id();
        let mut txn = volume.begin_transaction().expect("begin");
        let dir = txn.create_directory(root, "dir").expect("dir");
        let file = txn.create_file(dir.id(), "file").expect("file");
        txn.write_attribute(file.id(), "size", TypeCode::INT64, &9_i64.to_le_bytes())
            .expect("write");
        txn.done().expect("commit");

        volume.create_check_visitor().expect("visitor");
        let report = volume.run_check().expect("run");
        assert!(report.is_consistent(), "{report:?}");
        // root, dir, file, indices directory and its four indices
        assert_eq!(report.inodes, 8);
        assert_eq!(report.directories, 2);
        assert_eq!(report.files, 1);
        assert_eq!(report.indices, 5);
        assert_eq!(report.bitmap_used_blocks, report.recorded_used_blocks);
    }

    #[test]
    fn cleared_bitmap_bit_is_reported() {
        let mem = formatted();
        let (sb, _) = Volume::identify(mem.as_ref()).expect("identify");
        let root_block = sb.root_dir.to_block(sb.ag_shift).expect("root block");

        // Clear the root's bit in bitmap block 1 behind the volume's back.
        let mut bitmap = vec![0_u8; 1024];
        mem.read_exact_at(ByteOffset(1024), &mut bitmap).expect("read");
        #[expect(clippy::cast_possible_truncation)]
        bitmap_clear(&mut bitmap, root_block.0 as u32);
        mem.write_all_at(ByteOffset(1024), &bitmap).expect("write");

        let options = MountOptions {
            read_only: true,
            ..MountOptions::default()
        };
        let volume = Volume::mount_device(mem, &options).expect("mount");
        assert!(volume.mount_report().corrected_used_blocks.is_some());
        volume.create_check_visitor().expect("visitor");
        let report = volume.run_check().expect("run");
        assert!(!report.is_consistent());
        assert_eq!(report.failed, 2, "{report:?}");
        assert!(report.issues.iter().any(|issue| issue.component == "used_blocks"));
        assert!(report.issues.iter().any(|issue| issue.detail.contains("not marked in use")));
    }
}
