// src/disposition.rs

//! File disposition resolution
//!
//! Three passes turn `Unknown` per-file actions into terminal dispositions
//! before any byte is written:
//!
//! - policy skips per element (network-shared paths, languages, docs,
//!   configs, emptied directories)
//! - conflicts between each element and installed packages sharing a
//!   fingerprint
//! - overlaps between transaction elements sharing a fingerprint
//!
//! Skip-like decisions are final; later passes refine but never resurrect
//! a skipped file.

use std::path::Path;

use tracing::debug;

use crate::config::{EngineConfig, safe_join};
use crate::element::{ElementType, TransactionElement};
use crate::fileinfo::{
    FileAction, FileFlags, FileInfoSet, FileState, MapFlags, SharedFileInfo, file_digest,
    is_directory, is_regular,
};
use crate::fingerprint::{FileRef, SharedFileIndex};
use crate::nevra::Nevra;
use crate::problems::{ProblemKind, ProblemSet};

/// Apply per-element policy skips before conflict resolution
pub fn skip_files(fi: &mut FileInfoSet, config: &EngineConfig, tx_color: u32) {
    let langs_active = !config.install_langs.is_empty()
        && !config.install_langs.iter().any(|l| l == "all");

    for i in 0..fi.file_count() {
        let path = fi.path(i);

        // Colored files outside the transaction color are never installed.
        if tx_color != 0 && fi.colors[i] != 0 && tx_color & fi.colors[i] == 0 {
            fi.set_action(i, FileAction::SkipColor);
            fi.states[i] = FileState::WrongColor;
            continue;
        }

        if config
            .net_shared_paths
            .iter()
            .any(|prefix| under_prefix(&path, prefix))
        {
            fi.set_action(i, FileAction::SkipNetShared);
            fi.states[i] = FileState::NetShared;
            continue;
        }

        if langs_active && !fi.langs[i].is_empty() {
            let wanted = fi.langs[i]
                .split('|')
                .any(|l| l.is_empty() || config.install_langs.iter().any(|w| w == l));
            if !wanted {
                fi.set_action(i, FileAction::SkipNstate);
                fi.states[i] = FileState::NotInstalled;
                continue;
            }
        }

        if config.exclude_docs && fi.flags[i].contains(FileFlags::DOC) {
            fi.set_action(i, FileAction::SkipNstate);
            fi.states[i] = FileState::NotInstalled;
            continue;
        }

        if config.exclude_configs && fi.flags[i].contains(FileFlags::CONFIG) {
            fi.set_action(i, FileAction::SkipNstate);
            fi.states[i] = FileState::NotInstalled;
        }
    }

    skip_emptied_dirs(fi);
}

/// Skip directory entries whose every contained file was skipped
fn skip_emptied_dirs(fi: &mut FileInfoSet) {
    let dc = fi.dir_count();
    let mut children = vec![0usize; dc];
    let mut skipped = vec![0usize; dc];
    for i in 0..fi.file_count() {
        let dx = fi.dir_indexes[i] as usize;
        children[dx] += 1;
        if fi.actions[i].is_skipped() {
            skipped[dx] += 1;
        }
    }

    for i in 0..fi.file_count() {
        if !is_directory(fi.modes[i]) || fi.actions[i].is_skipped() {
            continue;
        }
        let as_dir = format!("{}/", fi.path(i));
        let emptied = fi
            .dir_names
            .iter()
            .position(|d| *d == as_dir)
            .is_some_and(|j| children[j] > 0 && children[j] == skipped[j]);
        if emptied {
            debug!("skipping emptied directory {}", fi.path(i));
            fi.set_action(i, FileAction::SkipNstate);
            fi.states[i] = FileState::NotInstalled;
        }
    }
}

/// Prefix match on path-segment boundaries
fn under_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return false;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Resolve one added element against one installed package sharing files
///
/// `shared` pairs (our file index, installed file index) whose fingerprints
/// match. Installed files not in the normal state are dead claims and are
/// ignored.
#[allow(clippy::too_many_arguments)]
pub fn handle_inst_installed_files(
    fi: &mut FileInfoSet,
    package: &Nevra,
    other: &FileInfoSet,
    other_nevra: &Nevra,
    shared: &[(usize, usize)],
    being_removed: bool,
    tx_color: u32,
    pref_color: u32,
    root: &Path,
    skip_missing_config: bool,
    problems: &mut ProblemSet,
) {
    for &(file_num, other_num) in shared {
        if fi.actions[file_num].is_skipped() {
            continue;
        }
        if other.states[other_num] != FileState::Normal {
            continue;
        }
        // Ghosts on either side claim the path but never its content.
        if (fi.flags[file_num] | other.flags[other_num]).contains(FileFlags::GHOST) {
            continue;
        }

        if is_regular(other.modes[other_num]) && other.modes[other_num] & 0o6000 != 0 {
            // The file being replaced carries set-id bits; the payload
            // writer must re-verify them after laying the new file down.
            fi.map_flags |= MapFlags::SBIT_CHECK;
        }

        let is_config = fi.flags[file_num].contains(FileFlags::CONFIG)
            && other.flags[other_num].contains(FileFlags::CONFIG);

        if fi.differs_from(file_num, other, other_num) {
            let fcolor = fi.colors[file_num] & tx_color;
            let ocolor = other.colors[other_num] & tx_color;
            // A package leaving in this same transaction cannot conflict;
            // its claim on the path dies with it.
            let mut report = !being_removed;

            if tx_color != 0 && fcolor != 0 && fcolor != ocolor {
                if ocolor & pref_color != 0 {
                    // The installed file wins the color contest; ours is
                    // quietly left uninstalled.
                    fi.set_action(file_num, FileAction::SkipColor);
                    fi.states[file_num] = FileState::WrongColor;
                    report = false;
                } else if fcolor & pref_color != 0 {
                    fi.set_action(file_num, FileAction::Create);
                    report = false;
                }
            }

            if report {
                problems.append(
                    package.clone(),
                    ProblemKind::FileConflict {
                        path: fi.path(file_num),
                        other: other_nevra.clone(),
                    },
                );
            }

            if !is_config && !fi.actions[file_num].is_skipped() && !being_removed {
                fi.replaced.push(SharedFileInfo {
                    pkg_file_num: file_num as u32,
                    other_pkg: other.record,
                    other_file_num: other_num as u32,
                    is_removed: being_removed,
                });
            }
        }

        if is_config && !fi.actions[file_num].is_skipped() {
            let fate = fi.decide_fate(file_num, other, other_num, skip_missing_config, root);
            fi.set_action(file_num, fate);
        }

        fi.replaced_sizes[file_num] = other.sizes[other_num];
    }
}

/// Resolve one removed element against an installed package sharing files
///
/// A file still owned in the normal state by another installed package must
/// survive this removal.
pub fn handle_rmvd_installed_files(
    fi: &mut FileInfoSet,
    other_states: &[FileState],
    shared: &[(usize, usize)],
) {
    for &(file_num, other_num) in shared {
        if other_states.get(other_num) != Some(&FileState::Normal) {
            continue;
        }
        fi.set_action(file_num, FileAction::Skip);
    }
}

/// Resolve overlaps between transaction elements sharing fingerprints
///
/// Elements are visited in transaction order, files in header order, so
/// resolution is deterministic. Among added claimants the later create
/// simply lands last; among removed claimants the last remover erases and
/// condemns earlier removers to skip.
pub fn handle_overlapped_files(
    elements: &mut [TransactionElement],
    index: &SharedFileIndex,
    tx_color: u32,
    pref_color: u32,
    root: &Path,
    problems: &mut ProblemSet,
) {
    for p in 0..elements.len() {
        if elements[p].failed {
            continue;
        }
        let kind = elements[p].kind;
        let file_count = elements[p].fi.as_ref().map_or(0, FileInfoSet::file_count);

        for i in 0..file_count {
            // Skip-like decisions from earlier passes are terminal.
            if elements[p]
                .fi
                .as_ref()
                .is_some_and(|fi| fi.actions[i].is_skipped())
            {
                continue;
            }
            let Some(fp) = elements[p]
                .fi
                .as_ref()
                .and_then(|fi| fi.fingerprints.get(i).cloned())
            else {
                continue;
            };
            let claimants = index.claimants(&fp);
            let self_pos = claimants
                .iter()
                .position(|r| r.element == p && r.file == i);

            // Nearest earlier claimant whose action is already decided.
            // Added elements only contend with other added elements here;
            // their relation to removals is expressed by the removal side.
            let mut other: Option<FileRef> = None;
            if let Some(sp) = self_pos {
                for cand in claimants[..sp].iter().rev() {
                    let ote = &elements[cand.element];
                    if kind == ElementType::Added && ote.kind != ElementType::Added {
                        continue;
                    }
                    let Some(ofi) = ote.fi.as_ref() else { continue };
                    if ofi.actions[cand.file] != FileAction::Unknown {
                        other = Some(*cand);
                        break;
                    }
                }
            }

            match kind {
                ElementType::Added => resolve_added_overlap(
                    elements, p, i, other, tx_color, pref_color, root, problems,
                ),
                ElementType::Removed => resolve_removed_overlap(elements, p, i, other, root),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn resolve_added_overlap(
    elements: &mut [TransactionElement],
    p: usize,
    i: usize,
    other: Option<FileRef>,
    tx_color: u32,
    pref_color: u32,
    root: &Path,
    problems: &mut ProblemSet,
) {
    let (path, flags, exists) = {
        let Some(fi) = elements[p].fi.as_ref() else {
            return;
        };
        let path = fi.path(i);
        let exists = safe_join(root, &path)
            .map(|joined| joined.symlink_metadata().is_ok())
            .unwrap_or(false);
        (path, fi.flags[i], exists)
    };

    let Some(o) = other else {
        // Sole claimant within the transaction.
        let Some(fi) = elements[p].fi.as_mut() else {
            return;
        };
        if exists {
            fi.flags[i] |= FileFlags::EXISTS;
        }
        if fi.actions[i] != FileAction::Unknown {
            return;
        }
        if flags.contains(FileFlags::CONFIG) && exists {
            // Pre-existing unowned config file.
            let fate = if flags.contains(FileFlags::NOREPLACE) {
                FileAction::AltName
            } else {
                FileAction::Backup
            };
            fi.set_action(i, fate);
        } else {
            fi.set_action(i, FileAction::Create);
        }
        return;
    };

    let (differs, self_color, other_size, other_color, other_nevra) = {
        let (sfi, ofi) = match (elements[p].fi.as_ref(), elements[o.element].fi.as_ref()) {
            (Some(a), Some(b)) => (a, b),
            _ => return,
        };
        (
            sfi.differs_from(i, ofi, o.file),
            sfi.colors[i],
            ofi.sizes[o.file],
            ofi.colors[o.file],
            elements[o.element].nevra.clone(),
        )
    };

    // Color pairing among added claimants: the preferred color wins
    // silently whichever order the claims arrive in, and two uncolored
    // claims resolve silently last-in-wins.
    let fcolor = self_color & tx_color;
    let ocolor = other_color & tx_color;
    let mut report = differs;
    let mut skip_self = false;
    let mut done = false;
    if differs && tx_color != 0 {
        if fcolor & pref_color != 0 {
            if let Some(ofi) = elements[o.element].fi.as_mut() {
                ofi.set_action(o.file, FileAction::SkipColor);
                ofi.states[o.file] = FileState::WrongColor;
            }
            report = false;
            done = true;
        } else if ocolor & pref_color != 0 {
            skip_self = true;
            report = false;
            done = true;
        } else if fcolor == 0 && ocolor == 0 {
            report = false;
        }
    }

    let package = elements[p].nevra.clone();
    let Some(fi) = elements[p].fi.as_mut() else {
        return;
    };
    if exists {
        fi.flags[i] |= FileFlags::EXISTS;
    }

    if skip_self {
        fi.set_action(i, FileAction::SkipColor);
        fi.states[i] = FileState::WrongColor;
    } else if done {
        fi.set_action(i, FileAction::Create);
    }

    if report {
        problems.append(
            package,
            ProblemKind::NewFileConflict {
                path,
                other: other_nevra,
            },
        );
    }

    // Keep the accounting honest even under a conflict: the earlier
    // claimant's copy is what ours replaces on disk.
    fi.replaced_sizes[i] = other_size;

    if flags.contains(FileFlags::CONFIG) && exists {
        // Pre-existing config file claimed twice in this transaction: the
        // earlier claimant handles it, ours steps aside.
        let fate = if flags.contains(FileFlags::NOREPLACE) {
            FileAction::AltName
        } else {
            FileAction::Skip
        };
        fi.set_action(i, fate);
    } else if !done {
        fi.set_action(i, FileAction::Create);
    }
}

fn resolve_removed_overlap(
    elements: &mut [TransactionElement],
    p: usize,
    i: usize,
    other: Option<FileRef>,
    root: &Path,
) {
    if let Some(o) = other {
        let other_erases = elements[o.element]
            .fi
            .as_ref()
            .is_some_and(|ofi| ofi.actions[o.file] == FileAction::Erase);

        if !other_erases {
            // An install in this transaction keeps the path alive (or an
            // earlier claimant otherwise disposed of it): nothing to erase.
            if let Some(fi) = elements[p].fi.as_mut() {
                fi.set_action(i, FileAction::Skip);
            }
            return;
        }

        // Two removals share the file: the last remover erases, earlier
        // ones stand down.
        if let Some(ofi) = elements[o.element].fi.as_mut() {
            ofi.actions[o.file] = FileAction::Skip;
        }
    }

    let Some(fi) = elements[p].fi.as_mut() else {
        return;
    };
    if fi.actions[i].is_skipped() {
        return;
    }
    if fi.states[i] != FileState::Normal {
        // Never laid down by the install; nothing on disk to erase.
        return;
    }
    if !(is_regular(fi.modes[i]) && fi.flags[i].contains(FileFlags::CONFIG)) {
        fi.set_action(i, FileAction::Erase);
        return;
    }

    // A modified config file is saved aside rather than destroyed.
    let modified = safe_join(root, &fi.path(i))
        .ok()
        .and_then(|joined| file_digest(&joined).ok())
        .is_some_and(|disk| !fi.digests[i].is_empty() && disk != fi.digests[i]);
    if modified {
        fi.set_action(i, FileAction::Backup);
    } else {
        fi.set_action(i, FileAction::Erase);
    }
}
