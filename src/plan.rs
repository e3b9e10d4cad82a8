use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::PathBuf;

use crate::api::{EXTRACT_HARDLINK, EXTRACT_NTFS, EXTRACT_SYMLINK};
use crate::wim::dentry::{DentryId, DentryTree};
use crate::wim::lookup::{LookupTable, StreamId};

/// Stream ids an inode's hashes resolved to at plan time.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResolvedStreams {
    pub unnamed: Option<StreamId>,
    pub ads: Vec<Option<StreamId>>,
}

/// Per-extraction state of one stream descriptor. Living in the plan's
/// side table rather than on the descriptor makes the reset-at-start
/// invariant structural.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    pub out_refcnt: u32,
    /// Dentries enqueued under this stream; each dentry appears under
    /// exactly one stream (its first reachable one).
    pub dentries: Vec<DentryId>,
}

/// Paths already materialised for shared streams during a link-mode
/// extraction. Lives across the commands of one public extract call so
/// later commands link against files extracted by earlier ones.
#[derive(Debug, Default)]
pub(crate) struct LinkRegistry {
    map: HashMap<StreamId, PathBuf>,
}

impl LinkRegistry {
    pub fn get(&self, id: StreamId) -> Option<&PathBuf> {
        self.map.get(&id)
    }

    pub fn insert(&mut self, id: StreamId, path: PathBuf) {
        self.map.insert(id, path);
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.map.contains_key(&id)
    }
}

/// Work list produced by [`plan`]: the distinct streams to read, the
/// dentries sharing each, and the transient per-dentry flags.
pub(crate) struct ExtractPlan {
    pub stream_list: Vec<StreamId>,
    state: Vec<StreamState>,
    resolved: Vec<ResolvedStreams>,
    needs_extraction: Vec<bool>,
    pub total_bytes: u64,
    pub num_streams: u64,
}

impl ExtractPlan {
    pub fn state_of(&self, id: StreamId) -> &StreamState {
        &self.state[id.0]
    }

    pub fn needs(&self, dentry: DentryId) -> bool {
        self.needs_extraction[dentry.0]
    }

    pub fn clear_needs(&mut self, dentry: DentryId) {
        self.needs_extraction[dentry.0] = false;
    }

    /// The resolved, non-empty unnamed stream of a dentry's inode.
    pub fn nonempty_unnamed(
        &self,
        tree: &DentryTree,
        lookup: &LookupTable,
        dentry: DentryId,
    ) -> Option<StreamId> {
        let inode = tree.dentry(dentry).inode;
        self.resolved[inode.0]
            .unnamed
            .filter(|id| lookup.get(*id).size() > 0)
    }
}

/// Build the extraction work list for the subtree rooted at `root`.
///
/// Two pre-order passes: the first resolves every inode stream hash to a
/// descriptor and clears the per-extraction state of every touched
/// stream, so planning starts clean even after an aborted run; the second
/// marks dentries, counts output references, and collects the distinct
/// stream list in discovery order.
pub(crate) fn plan(
    tree: &DentryTree,
    root: DentryId,
    lookup: &LookupTable,
    flags: u32,
    registry: &LinkRegistry,
) -> ExtractPlan {
    let mut resolved = vec![ResolvedStreams::default(); tree.num_inodes()];
    let mut state: Vec<StreamState> = Vec::new();
    state.resize_with(lookup.len(), StreamState::default);
    let mut needs_extraction = vec![false; tree.num_dentries()];
    let mut visited = vec![false; tree.num_inodes()];
    let mut stream_list: Vec<StreamId> = Vec::new();

    // Pass 1: resolve hashes, clear transient state of touched streams.
    let _: ControlFlow<()> = tree.walk_pre_order(root, &mut |d| {
        let inode_id = tree.dentry(d).inode;
        let inode = tree.inode(inode_id);
        let r = ResolvedStreams {
            unnamed: inode.unnamed_hash.as_ref().and_then(|h| lookup.lookup(h)),
            ads: inode
                .ads
                .iter()
                .map(|a| a.hash.as_ref().and_then(|h| lookup.lookup(h)))
                .collect(),
        };
        for id in r.ads.iter().flatten().chain(r.unnamed.iter()) {
            state[id.0] = StreamState::default();
        }
        resolved[inode_id.0] = r;
        ControlFlow::Continue(())
    });

    // Alternate data streams are included when applying to an NTFS volume
    // on any platform, or unconditionally on Windows.
    let include_ads = flags & EXTRACT_NTFS != 0 || cfg!(windows);

    // Pass 2: mark dentries and collect distinct streams.
    let _: ControlFlow<()> = tree.walk_pre_order(root, &mut |d| {
        needs_extraction[d.0] = true;
        let inode_id = tree.dentry(d).inode;
        let first_visit = !visited[inode_id.0];
        let mut dentry_added = false;

        if let Some(sid) = resolved[inode_id.0].unnamed {
            if lookup.get(sid).size() > 0 {
                if first_visit {
                    bump(&mut state, &mut stream_list, sid);
                }
                state[sid.0].dentries.push(d);
                dentry_added = true;
            }
        }

        if include_ads {
            for (i, entry) in tree.inode(inode_id).ads.iter().enumerate() {
                if entry.name.is_empty() {
                    continue;
                }
                if let Some(sid) = resolved[inode_id.0].ads[i] {
                    if lookup.get(sid).size() == 0 {
                        continue;
                    }
                    if first_visit {
                        bump(&mut state, &mut stream_list, sid);
                    }
                    if !dentry_added {
                        state[sid.0].dentries.push(d);
                        dentry_added = true;
                    }
                }
            }
        }

        visited[inode_id.0] = true;
        ControlFlow::Continue(())
    });

    // Progress totals: in the link modes each distinct stream is
    // materialised once by reference, so it is counted once; otherwise
    // every output reference performs its own I/O.
    let mut total_bytes = 0u64;
    let mut num_streams = 0u64;
    for &sid in &stream_list {
        let size = lookup.get(sid).size();
        if flags & (EXTRACT_SYMLINK | EXTRACT_HARDLINK) != 0 {
            if !registry.contains(sid) {
                num_streams += 1;
                total_bytes += size;
            }
        } else {
            let rc = state[sid.0].out_refcnt as u64;
            num_streams += rc;
            total_bytes += rc * size;
        }
    }

    ExtractPlan {
        stream_list,
        state,
        resolved,
        needs_extraction,
        total_bytes,
        num_streams,
    }
}

fn bump(state: &mut [StreamState], stream_list: &mut Vec<StreamId>, sid: StreamId) {
    state[sid.0].out_refcnt += 1;
    if state[sid.0].out_refcnt == 1 {
        stream_list.push(sid);
    }
}
