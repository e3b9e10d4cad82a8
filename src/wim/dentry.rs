use std::ops::ControlFlow;

use crate::wim::lookup::Sha1Hash;

/// Windows file-attribute bits used by the engine.
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
pub const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x0000_0400;

/// Index of a dentry within a tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DentryId(pub(crate) usize);

/// Index of an inode within a tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId(pub(crate) usize);

/// A named alternate data stream attached to an inode.
#[derive(Debug, Clone)]
pub struct AdsEntry {
    pub name: String,
    pub hash: Option<Sha1Hash>,
}

/// Reparse-point payload. Absolute substitute paths are rewritten during
/// extraction when reparse fixups are enabled.
#[derive(Debug, Clone)]
pub struct ReparseData {
    pub target: String,
    pub relative: bool,
}

/// UNIX-specific metadata carried when the image was captured with it.
#[derive(Debug, Clone, Copy)]
pub struct UnixData {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// One inode. Shared by every dentry that is a hard link of the same file.
#[derive(Debug, Clone)]
pub struct Inode {
    pub ino: u64,
    pub attributes: u32,
    /// Timestamps in 100ns intervals since 1601-01-01 (Windows FILETIME).
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    pub unnamed_hash: Option<Sha1Hash>,
    pub ads: Vec<AdsEntry>,
    pub reparse: Option<ReparseData>,
    pub unix: Option<UnixData>,
}

impl Inode {
    pub fn new(ino: u64, attributes: u32) -> Self {
        Inode {
            ino,
            attributes,
            creation_time: 0,
            last_access_time: 0,
            last_write_time: 0,
            unnamed_hash: None,
            ads: Vec::new(),
            reparse: None,
            unix: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }

    pub fn is_reparse_point(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0
    }

    pub fn is_regular_file(&self) -> bool {
        !self.is_directory() && !self.is_reparse_point()
    }
}

/// One edge from a parent directory to a named child.
#[derive(Debug)]
pub struct Dentry {
    pub name: String,
    pub parent: Option<DentryId>,
    /// Children, kept ordered by name.
    pub children: Vec<DentryId>,
    pub inode: InodeId,
    /// Canonical path from the tree root, no leading slash, "" for the
    /// root. Materialised lazily for the subtree being worked on.
    full_path: Option<String>,
}

/// Per-image directory tree. Owns the dentry and inode arenas; every
/// cross-reference is an index.
pub struct DentryTree {
    dentries: Vec<Dentry>,
    inodes: Vec<Inode>,
    root: DentryId,
}

impl DentryTree {
    /// Create a tree whose root is a directory with the given inode.
    pub fn new(root_inode: Inode) -> Self {
        let inodes = vec![root_inode];
        let dentries = vec![Dentry {
            name: String::new(),
            parent: None,
            children: Vec::new(),
            inode: InodeId(0),
            full_path: Some(String::new()),
        }];
        DentryTree {
            dentries,
            inodes,
            root: DentryId(0),
        }
    }

    pub fn root(&self) -> DentryId {
        self.root
    }

    pub fn dentry(&self, id: DentryId) -> &Dentry {
        &self.dentries[id.0]
    }

    pub fn inode(&self, id: InodeId) -> &Inode {
        &self.inodes[id.0]
    }

    pub fn inode_mut(&mut self, id: InodeId) -> &mut Inode {
        &mut self.inodes[id.0]
    }

    pub fn inode_of(&self, dentry: DentryId) -> &Inode {
        &self.inodes[self.dentries[dentry.0].inode.0]
    }

    pub fn num_inodes(&self) -> usize {
        self.inodes.len()
    }

    pub fn num_dentries(&self) -> usize {
        self.dentries.len()
    }

    /// Add an inode to the arena without linking it anywhere yet.
    pub fn add_inode(&mut self, inode: Inode) -> InodeId {
        let id = InodeId(self.inodes.len());
        self.inodes.push(inode);
        id
    }

    /// Add a child dentry under `parent` for a fresh inode.
    pub fn add_child(&mut self, parent: DentryId, name: &str, inode: Inode) -> DentryId {
        let inode_id = self.add_inode(inode);
        self.add_link(parent, name, inode_id)
    }

    /// Add a child dentry under `parent` referencing an existing inode
    /// (a hard link when the inode already has another name).
    pub fn add_link(&mut self, parent: DentryId, name: &str, inode: InodeId) -> DentryId {
        let id = DentryId(self.dentries.len());
        self.dentries.push(Dentry {
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            inode,
            full_path: None,
        });
        let pos = self.dentries[parent.0]
            .children
            .partition_point(|c| self.dentries[c.0].name.as_str() < name);
        self.dentries[parent.0].children.insert(pos, id);
        id
    }

    /// Pre-order traversal rooted at `root`. The first `Break` returned by
    /// the callback short-circuits the walk.
    pub fn walk_pre_order<B>(
        &self,
        root: DentryId,
        f: &mut impl FnMut(DentryId) -> ControlFlow<B>,
    ) -> ControlFlow<B> {
        f(root)?;
        // Children are visited in name order; the child list is immutable
        // during the walk so indexing stays valid.
        for i in 0..self.dentries[root.0].children.len() {
            let child = self.dentries[root.0].children[i];
            self.walk_pre_order(child, f)?;
        }
        ControlFlow::Continue(())
    }

    /// Post-order ("depth") traversal rooted at `root`: children before
    /// their parent. Same short-circuit contract as pre-order.
    pub fn walk_post_order<B>(
        &self,
        root: DentryId,
        f: &mut impl FnMut(DentryId) -> ControlFlow<B>,
    ) -> ControlFlow<B> {
        for i in 0..self.dentries[root.0].children.len() {
            let child = self.dentries[root.0].children[i];
            self.walk_post_order(child, f)?;
        }
        f(root)
    }

    /// Materialise the canonical full path of every dentry under `root`,
    /// relative to the tree root.
    pub fn materialise_paths(&mut self, root: DentryId) {
        let base = match self.dentries[root.0].parent {
            None => String::new(),
            Some(_) => {
                let mut segments = Vec::new();
                let mut cur = root;
                while let Some(parent) = self.dentries[cur.0].parent {
                    segments.push(self.dentries[cur.0].name.clone());
                    cur = parent;
                }
                segments.reverse();
                segments.join("/")
            }
        };
        self.materialise_below(root, base);
    }

    fn materialise_below(&mut self, dentry: DentryId, path: String) {
        for i in 0..self.dentries[dentry.0].children.len() {
            let child = self.dentries[dentry.0].children[i];
            let child_path = if path.is_empty() {
                self.dentries[child.0].name.clone()
            } else {
                format!("{}/{}", path, self.dentries[child.0].name)
            };
            self.materialise_below(child, child_path);
        }
        self.dentries[dentry.0].full_path = Some(path);
    }

    /// The materialised full path of `dentry`, or `None` if
    /// [`materialise_paths`](Self::materialise_paths) has not covered it.
    pub fn full_path(&self, dentry: DentryId) -> Option<&str> {
        self.dentries[dentry.0].full_path.as_deref()
    }

    /// Look up a dentry by canonical path: slash-separated, no leading or
    /// trailing slash. The empty string names the root.
    pub fn lookup_path(&self, path: &str) -> Option<DentryId> {
        let mut cur = self.root;
        if path.is_empty() {
            return Some(cur);
        }
        for segment in path.split('/') {
            let children = &self.dentries[cur.0].children;
            cur = *children
                .iter()
                .find(|c| self.dentries[c.0].name == segment)?;
        }
        Some(cur)
    }
}
