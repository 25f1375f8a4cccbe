//! Duplicate detection and resolution
//!
//! Some stores allow several objects with the same name in the same
//! directory. The dedupe engine finds those groups, silently removes
//! byte-identical copies, and resolves what remains under one of six
//! policies. Operations within one group are serialized; dry-run logs
//! every decision and touches nothing.

use crate::accounting::AccountHandle;
use crate::backend::{DynBackend, DynObject};
use crate::error::{Result, SyncError};
use crate::hash::HashAlg;
use crate::list::Lister;
use crate::ops::{format_mod_time, move_object};
use crate::prompt::Prompt;
use clap::ValueEnum;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Resolution policy for duplicate names
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DedupeMode {
    /// Ask a human per group
    Interactive,
    /// Remove identical copies, leave the rest
    Skip,
    /// Keep the first enumerated
    First,
    /// Keep the most recently modified
    Newest,
    /// Keep the least recently modified
    Oldest,
    /// Keep everything under distinct names
    Rename,
}

impl FromStr for DedupeMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "interactive" => Ok(Self::Interactive),
            "skip" => Ok(Self::Skip),
            "first" => Ok(Self::First),
            "newest" => Ok(Self::Newest),
            "oldest" => Ok(Self::Oldest),
            "rename" => Ok(Self::Rename),
            other => Err(SyncError::Usage(format!("unknown dedupe mode: {other}"))),
        }
    }
}

impl std::fmt::Display for DedupeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Interactive => "interactive",
            Self::Skip => "skip",
            Self::First => "first",
            Self::Newest => "newest",
            Self::Oldest => "oldest",
            Self::Rename => "rename",
        };
        f.write_str(name)
    }
}

/// Find and resolve duplicate-name groups on a store
pub fn dedupe(
    fs: DynBackend,
    mode: DedupeMode,
    prompt: &dyn Prompt,
    dry_run: bool,
    account: &AccountHandle,
) -> Result<()> {
    tracing::info!("{}: looking for duplicates using {mode:?} mode", fs.id());

    let listing = Lister::new().get_all(fs.clone(), "")?;
    if listing.root_missing {
        return Err(SyncError::DirNotFound(fs.id()));
    }

    // group by full relative path, keeping enumeration order per group
    let mut groups: BTreeMap<String, Vec<DynObject>> = BTreeMap::new();
    let mut existing_names: BTreeSet<String> = BTreeSet::new();
    for obj in listing.objects() {
        existing_names.insert(obj.remote().to_string());
        groups.entry(obj.remote().to_string()).or_default().push(obj);
    }

    for (name, group) in groups {
        if group.len() < 2 {
            continue;
        }
        resolve_group(&fs, &name, group, mode, prompt, dry_run, account, &mut existing_names)?;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn resolve_group(
    fs: &DynBackend,
    name: &str,
    group: Vec<DynObject>,
    mode: DedupeMode,
    prompt: &dyn Prompt,
    dry_run: bool,
    account: &AccountHandle,
    existing_names: &mut BTreeSet<String>,
) -> Result<()> {
    tracing::info!("{name}: found {} duplicates - deleting identical copies", group.len());

    let survivors = delete_identical(name, group, dry_run, account);
    if survivors.len() < 2 {
        return Ok(());
    }

    match mode {
        DedupeMode::Skip => {
            tracing::info!(
                "{name}: skipping {} files with duplicate names",
                survivors.len()
            );
        }
        DedupeMode::First => {
            keep_one(name, &survivors, 0, dry_run, account);
        }
        DedupeMode::Newest => {
            let idx = pick_by_mtime(&survivors, true);
            keep_one(name, &survivors, idx, dry_run, account);
        }
        DedupeMode::Oldest => {
            let idx = pick_by_mtime(&survivors, false);
            keep_one(name, &survivors, idx, dry_run, account);
        }
        DedupeMode::Rename => {
            rename_all(fs, name, &survivors, existing_names, dry_run, account);
        }
        DedupeMode::Interactive => {
            resolve_interactive(
                fs,
                name,
                &survivors,
                prompt,
                dry_run,
                account,
                existing_names,
            )?;
        }
    }

    Ok(())
}

/// Partition a group by MD5 and silently delete all but the first of
/// every identical partition. Returns the survivors, one per distinct
/// content, in enumeration order.
fn delete_identical(
    name: &str,
    group: Vec<DynObject>,
    dry_run: bool,
    account: &AccountHandle,
) -> Vec<(DynObject, String)> {
    // partitions keyed by digest, in first-seen order
    let mut order: Vec<String> = Vec::new();
    let mut partitions: BTreeMap<String, Vec<DynObject>> = BTreeMap::new();

    for (idx, obj) in group.into_iter().enumerate() {
        let digest = match obj.hash(HashAlg::Md5) {
            Ok(Some(digest)) => digest,
            Ok(None) => {
                tracing::warn!("{name}: no md5 for duplicate {idx}, treating as distinct");
                format!("missing-{idx}")
            }
            Err(e) => {
                tracing::warn!("{name}: md5 failed for duplicate {idx}: {e}");
                account.record_error(&e);
                format!("error-{idx}")
            }
        };
        if !partitions.contains_key(&digest) {
            order.push(digest.clone());
        }
        partitions.entry(digest).or_default().push(obj);
    }

    let mut survivors = Vec::new();
    for digest in order {
        let members = partitions.remove(&digest).expect("partition exists");
        let total = members.len();
        if total > 1 {
            tracing::info!(
                "{name}: deleting {}/{} identical duplicates (md5 {digest:?})",
                total - 1,
                total,
            );
        }
        let mut members = members.into_iter();
        let keeper = members.next().expect("non-empty partition");
        for extra in members {
            delete_object(name, &extra, dry_run, account);
        }
        survivors.push((keeper, digest));
    }

    if survivors.len() > 1 {
        tracing::info!("{name}: {} duplicates remain", survivors.len());
    }
    survivors
}

fn delete_object(name: &str, obj: &DynObject, dry_run: bool, account: &AccountHandle) {
    if dry_run {
        tracing::info!("(dry run) would delete one copy of {name}");
        return;
    }
    match obj.remove() {
        Ok(()) => account.inc_deletes(),
        Err(e) => {
            tracing::error!("{name}: delete failed: {e}");
            account.record_error(&e);
        }
    }
}

/// Keep `keep_idx`, delete the rest
fn keep_one(
    name: &str,
    survivors: &[(DynObject, String)],
    keep_idx: usize,
    dry_run: bool,
    account: &AccountHandle,
) {
    for (idx, (obj, _)) in survivors.iter().enumerate() {
        if idx != keep_idx {
            delete_object(name, obj, dry_run, account);
        }
    }
    tracing::info!("{name}: deleted {} extra copies", survivors.len() - 1);
}

/// Index of the newest (or oldest) survivor; equal mtimes keep the
/// earlier enumerated one.
fn pick_by_mtime(survivors: &[(DynObject, String)], newest: bool) -> usize {
    let mut best = 0;
    let mut best_time = survivors[0].0.mod_time();
    for (idx, (obj, _)) in survivors.iter().enumerate().skip(1) {
        let t = obj.mod_time();
        let better = match (t, best_time) {
            (Some(t), Some(b)) => {
                if newest {
                    t > b
                } else {
                    t < b
                }
            }
            (Some(_), None) => true,
            _ => false,
        };
        if better {
            best = idx;
            best_time = t;
        }
    }
    best
}

/// Rename every survivor to `stem-N.ext`, skipping names already taken
fn rename_all(
    fs: &DynBackend,
    name: &str,
    survivors: &[(DynObject, String)],
    existing_names: &mut BTreeSet<String>,
    dry_run: bool,
    account: &AccountHandle,
) {
    let mut counter = 1;
    for (obj, _) in survivors {
        let new_name = loop {
            let candidate = numbered_name(name, counter);
            counter += 1;
            if !existing_names.contains(&candidate) {
                break candidate;
            }
        };

        if dry_run {
            tracing::info!("(dry run) {new_name}: would rename from {name}");
            existing_names.insert(new_name);
            continue;
        }

        match move_object(fs, obj, &new_name) {
            Ok(_) => {
                tracing::info!("{new_name}: renamed from {name}");
                account.inc_renames();
                existing_names.insert(new_name);
            }
            Err(e) => {
                tracing::error!("{name}: rename to {new_name} failed: {e}");
                account.record_error(&e);
            }
        }
    }
}

/// `dir/stem-N.ext` for `dir/stem.ext`
fn numbered_name(name: &str, n: usize) -> String {
    let (dir, base) = crate::backend::split_name(name);
    let renamed = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{n}.{ext}"),
        _ => format!("{base}-{n}"),
    };
    crate::backend::join_remote(dir, &renamed)
}

fn resolve_interactive(
    fs: &DynBackend,
    name: &str,
    survivors: &[(DynObject, String)],
    prompt: &dyn Prompt,
    dry_run: bool,
    account: &AccountHandle,
    existing_names: &mut BTreeSet<String>,
) -> Result<()> {
    let mut question = String::new();
    for (idx, (obj, digest)) in survivors.iter().enumerate() {
        question.push_str(&format!(
            "  {}: {:>9} bytes, {}, md5sum {}\n",
            idx + 1,
            obj.size(),
            format_mod_time(obj.mod_time()),
            digest,
        ));
    }
    question.push_str("s) Skip and do nothing\n");
    question.push_str("k) Keep just one (choose which in next step)\n");
    question.push_str("r) Rename all to be different (by changing file.jpg to file-1.jpg)");

    match prompt.ask(&question, &['s', 'k', 'r'])? {
        's' => {
            tracing::info!("{name}: skipped");
        }
        'k' => {
            let keep = prompt.ask_int("Enter the number of the file to keep", 1..=survivors.len())?;
            keep_one(name, survivors, keep - 1, dry_run, account);
        }
        'r' => {
            rename_all(fs, name, survivors, existing_names, dry_run, account);
        }
        _ => unreachable!("prompt only returns offered choices"),
    }
    Ok(())
}
