//! High-level operations behind the subcommands
//!
//! Thin, reusable entry points: listings, directory management, tree
//! checking, and the move helper shared by dedupe and track-renames.
//! The heavy lifting lives in the sync and transfer engines.

use crate::accounting::AccountHandle;
use crate::backend::{DynBackend, DynObject, ObjectInfo};
use crate::error::{Result, SyncError};
use crate::hash::common_alg;
use crate::list::{ListLevel, Lister};
use chrono::{DateTime, Utc};
use std::io::Write;
use std::time::SystemTime;

/// Move an object to a new name within one store, preferring a
/// server-side rename, then server-side copy+delete, then streaming.
pub fn move_object(fs: &DynBackend, obj: &DynObject, new_name: &str) -> Result<DynObject> {
    let features = fs.features();
    if features.move_obj {
        return fs.move_obj(obj.as_ref(), new_name);
    }
    if features.copy {
        let copied = fs.copy(obj.as_ref(), new_name)?;
        obj.remove()?;
        return Ok(copied);
    }
    let info = ObjectInfo::from_object(obj.as_ref(), new_name);
    let mut reader = obj.open()?;
    let new_obj = fs.put(&mut reader, &info)?;
    obj.remove()?;
    Ok(new_obj)
}

/// Render an mtime the way listings print it
pub(crate) fn format_mod_time(t: Option<SystemTime>) -> String {
    match t {
        Some(t) => {
            let dt: DateTime<Utc> = t.into();
            dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
        }
        None => "unknown".to_string(),
    }
}

fn write_line(out: &mut dyn Write, line: String) -> Result<()> {
    writeln!(out, "{line}").map_err(|e| SyncError::fatal(format!("writing output: {e}")))
}

/// `ls`: size and path of every object, recursively
pub fn list_objects(fs: DynBackend, out: &mut dyn Write) -> Result<()> {
    let listing = Lister::new().get_all(fs.clone(), "")?;
    if listing.root_missing {
        return Err(SyncError::DirNotFound(fs.id()));
    }
    for obj in listing.objects() {
        write_line(out, format!("{:>9} {}", obj.size(), obj.remote()))?;
    }
    Ok(())
}

/// `lsl`: size, mtime and path of every object, recursively
pub fn list_long(fs: DynBackend, out: &mut dyn Write) -> Result<()> {
    let listing = Lister::new().get_all(fs.clone(), "")?;
    if listing.root_missing {
        return Err(SyncError::DirNotFound(fs.id()));
    }
    for obj in listing.objects() {
        write_line(
            out,
            format!(
                "{:>9} {} {}",
                obj.size(),
                format_mod_time(obj.mod_time()),
                obj.remote()
            ),
        )?;
    }
    Ok(())
}

/// `lsd`: the top-level directories
pub fn list_dirs(fs: DynBackend, out: &mut dyn Write) -> Result<()> {
    let listing = Lister::new()
        .level(ListLevel::One)
        .get_all(fs.clone(), "")?;
    if listing.root_missing {
        return Err(SyncError::DirNotFound(fs.id()));
    }
    for dir in listing.dirs() {
        let count = dir.count.map(|c| c as i64).unwrap_or(-1);
        write_line(
            out,
            format!(
                "{:>12} {} {}",
                count,
                format_mod_time(dir.mod_time),
                dir.remote
            ),
        )?;
    }
    Ok(())
}

/// `mkdir`: create the root directory of a remote
pub fn mkdir(fs: &DynBackend) -> Result<()> {
    fs.mkdir("")
}

/// `rmdir`: remove the root directory; fails unless empty
pub fn rmdir(fs: &DynBackend) -> Result<()> {
    fs.rmdir("")
}

/// `purge`: delete a remote's whole tree, using the store's fast path
/// when it has one
pub fn purge(fs: &DynBackend, dry_run: bool, account: &AccountHandle) -> Result<()> {
    if dry_run {
        tracing::info!("(dry run) would purge {}", fs.id());
        return Ok(());
    }
    if fs.features().purge {
        return fs.purge("");
    }

    // no fast path: remove every object, then directories bottom-up
    let listing = Lister::new().get_all(fs.clone(), "")?;
    if listing.root_missing {
        return Err(SyncError::DirNotFound(fs.id()));
    }
    for obj in listing.objects() {
        obj.remove()?;
        account.inc_deletes();
    }
    let mut dirs: Vec<String> = listing.dirs().into_iter().map(|d| d.remote).collect();
    dirs.sort_by(|a, b| b.cmp(a));
    for dir in dirs {
        fs.rmdir(&dir)?;
    }
    fs.rmdir("")
}

/// `cleanup`: empty the store's trash, where supported
pub fn cleanup(fs: &DynBackend) -> Result<()> {
    if !fs.features().cleanup {
        return Err(SyncError::unsupported(fs.name(), "cleanup"));
    }
    fs.cleanup()
}

/// Outcome of `check`
#[derive(Debug, Default)]
pub struct CheckReport {
    /// Present on both sides with equal content
    pub matches: u64,
    /// Present on both sides but different
    pub differs: u64,
    /// Present only at the destination
    pub missing_src: u64,
    /// Present only at the source
    pub missing_dst: u64,
}

impl CheckReport {
    /// Total number of discrepancies
    pub fn differences(&self) -> u64 {
        self.differs + self.missing_src + self.missing_dst
    }
}

/// `check`: compare two trees without transferring anything
pub fn check(
    src_fs: DynBackend,
    dst_fs: DynBackend,
    account: &AccountHandle,
) -> Result<CheckReport> {
    let lister = Lister::new();
    let src_list = lister.get_all(src_fs.clone(), "")?;
    if src_list.root_missing {
        return Err(SyncError::DirNotFound(src_fs.id()));
    }
    let dst_list = lister.get_all(dst_fs.clone(), "")?;
    if dst_list.root_missing {
        return Err(SyncError::DirNotFound(dst_fs.id()));
    }

    let index = |objs: Vec<DynObject>| {
        objs.into_iter()
            .map(|o| (o.remote().to_string(), o))
            .collect::<std::collections::BTreeMap<_, _>>()
    };
    let src_objs = index(src_list.objects());
    let mut dst_objs = index(dst_list.objects());

    let mut report = CheckReport::default();
    let alg = common_alg(&src_fs.hashes(), &dst_fs.hashes());

    for (name, src_obj) in &src_objs {
        match dst_objs.remove(name) {
            None => {
                tracing::error!("{name}: missing at destination");
                report.missing_dst += 1;
            }
            Some(dst_obj) => {
                account.inc_checks();
                let equal = match alg {
                    Some(alg) => match (src_obj.hash(alg)?, dst_obj.hash(alg)?) {
                        (Some(a), Some(b)) => a == b,
                        _ => src_obj.size() == dst_obj.size(),
                    },
                    None => src_obj.size() == dst_obj.size(),
                };
                if equal {
                    report.matches += 1;
                } else {
                    tracing::error!("{name}: differs");
                    report.differs += 1;
                }
            }
        }
    }

    for name in dst_objs.keys() {
        tracing::error!("{name}: missing at source");
        report.missing_src += 1;
    }

    if report.differences() > 0 {
        tracing::error!("{} differences found", report.differences());
    }
    Ok(report)
}
