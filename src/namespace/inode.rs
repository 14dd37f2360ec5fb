//! Inode tree types for the in-memory namespace
//!
//! The tree keeps directory children in a BTreeMap keyed by name bytes, which
//! gives the lexicographic child ordering the re-encryption walk depends on.
//! Cursor seeks (`next_child`) are range queries over that map, so the walker
//! never has to hold a directory snapshot across a lock release.

use crate::error::{NamespaceError, NamespaceResult};
use crate::kms::EncryptedKeyVersion;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// Opaque inode identifier
pub type InodeId = u64;

/// Id of an encryption zone's root directory
pub type ZoneId = InodeId;

/// Cursor value meaning "start from the first child"
pub const EMPTY_NAME: &[u8] = b"";

/// Per-file encryption metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEncryptionInfo {
    /// The wrapped per-file key, including the zone key version it is
    /// currently wrapped under
    pub edek: EncryptedKeyVersion,
}

impl FileEncryptionInfo {
    /// Create encryption metadata from a wrapped key
    pub fn new(edek: EncryptedKeyVersion) -> Self {
        Self { edek }
    }

    /// Zone key version the file's EDEK is wrapped under
    pub fn ez_key_version_name(&self) -> &str {
        &self.edek.version_name
    }
}

/// Extra state carried by a directory that is an encryption zone root
#[derive(Debug, Clone, Default)]
pub struct EzRootInfo {
    /// Name of the zone key
    pub key_name: String,

    /// Opaque re-encryption status extended attribute
    pub status_xattr: Option<Vec<u8>>,
}

/// Inode payload
#[derive(Debug, Clone)]
pub enum INodeKind {
    /// Regular file, optionally carrying encryption metadata
    File { encryption: Option<FileEncryptionInfo> },

    /// Directory with lexicographically ordered children
    Directory {
        children: BTreeMap<Vec<u8>, InodeId>,
        /// Present when this directory is an encryption zone root
        ez_root: Option<EzRootInfo>,
    },
}

/// A node in the namespace tree
#[derive(Debug, Clone)]
pub struct INode {
    pub id: InodeId,
    pub name: Vec<u8>,
    pub parent: Option<InodeId>,
    pub kind: INodeKind,
}

impl INode {
    /// True if this inode is a directory
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, INodeKind::Directory { .. })
    }

    /// True if this inode is a regular file
    pub fn is_file(&self) -> bool {
        matches!(self.kind, INodeKind::File { .. })
    }

    /// Encryption metadata, if this is an encrypted file
    pub fn encryption_info(&self) -> Option<&FileEncryptionInfo> {
        match &self.kind {
            INodeKind::File { encryption } => encryption.as_ref(),
            INodeKind::Directory { .. } => None,
        }
    }
}

/// The namespace tree. Callers access it through the `Namespace` lock; the
/// tree itself is single-threaded code.
#[derive(Debug)]
pub struct FsTree {
    inodes: HashMap<InodeId, INode>,
    root: InodeId,
    next_id: InodeId,
}

impl FsTree {
    /// Create a tree containing only the root directory "/"
    pub fn new() -> Self {
        let root = 1;
        let mut inodes = HashMap::new();
        inodes.insert(
            root,
            INode {
                id: root,
                name: Vec::new(),
                parent: None,
                kind: INodeKind::Directory {
                    children: BTreeMap::new(),
                    ez_root: None,
                },
            },
        );
        Self {
            inodes,
            root,
            next_id: root + 1,
        }
    }

    /// Root directory id
    pub fn root(&self) -> InodeId {
        self.root
    }

    /// Look up an inode by id
    pub fn get(&self, id: InodeId) -> Option<&INode> {
        self.inodes.get(&id)
    }

    /// Local name of an inode
    pub fn name_of(&self, id: InodeId) -> NamespaceResult<Vec<u8>> {
        Ok(self.require(id)?.name.clone())
    }

    /// Parent of an inode, None for the root
    pub fn parent_of(&self, id: InodeId) -> NamespaceResult<Option<InodeId>> {
        Ok(self.require(id)?.parent)
    }

    /// Full path of an inode from the root
    pub fn full_path(&self, id: InodeId) -> NamespaceResult<String> {
        let mut components: Vec<&[u8]> = Vec::new();
        let mut curr = self.require(id)?;
        while let Some(parent) = curr.parent {
            components.push(&curr.name);
            curr = self.require(parent)?;
        }
        if components.is_empty() {
            return Ok("/".to_string());
        }
        let mut path = String::new();
        for name in components.iter().rev() {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(name));
        }
        Ok(path)
    }

    /// Resolve an absolute path to an inode id
    pub fn resolve_path(&self, path: &str) -> Option<InodeId> {
        let mut curr = self.root;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            curr = self.child(curr, component.as_bytes())?;
        }
        Some(curr)
    }

    /// Resolve an absolute path, returning the inode ids of every component
    /// from the root down. Resolution stops at the first missing component;
    /// the returned list covers the resolved prefix only.
    pub fn inodes_in_path(&self, path: &str) -> Vec<InodeId> {
        let mut ids = vec![self.root];
        let mut curr = self.root;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            match self.child(curr, component.as_bytes()) {
                Some(next) => {
                    ids.push(next);
                    curr = next;
                }
                None => break,
            }
        }
        ids
    }

    /// Look up a directory child by name
    pub fn child(&self, parent: InodeId, name: &[u8]) -> Option<InodeId> {
        match &self.get(parent)?.kind {
            INodeKind::Directory { children, .. } => children.get(name).copied(),
            INodeKind::File { .. } => None,
        }
    }

    /// First child of `parent` whose name is strictly after `after`, in
    /// lexicographic byte order. Passing [`EMPTY_NAME`] yields the first
    /// child.
    pub fn next_child(
        &self,
        parent: InodeId,
        after: &[u8],
    ) -> NamespaceResult<Option<(Vec<u8>, InodeId)>> {
        let parent_node = self.require(parent)?;
        match &parent_node.kind {
            INodeKind::Directory { children, .. } => Ok(children
                .range::<[u8], _>((Bound::Excluded(after), Bound::Unbounded))
                .next()
                .map(|(name, id)| (name.clone(), *id))),
            INodeKind::File { .. } => Err(NamespaceError::NotADirectory(
                self.full_path(parent).unwrap_or_default(),
            )),
        }
    }

    /// Number of direct children of a directory
    pub fn child_count(&self, parent: InodeId) -> usize {
        match self.get(parent).map(|n| &n.kind) {
            Some(INodeKind::Directory { children, .. }) => children.len(),
            _ => 0,
        }
    }

    /// True if the inode is the root of an encryption zone
    pub fn is_encryption_zone_root(&self, id: InodeId) -> bool {
        matches!(
            self.get(id).map(|n| &n.kind),
            Some(INodeKind::Directory { ez_root: Some(_), .. })
        )
    }

    /// Zone key name of an encryption zone root
    pub fn zone_key_name(&self, id: ZoneId) -> NamespaceResult<String> {
        match &self.require(id)?.kind {
            INodeKind::Directory { ez_root: Some(info), .. } => Ok(info.key_name.clone()),
            _ => Err(NamespaceError::NotFound(format!("zone {}", id))),
        }
    }

    /// All encryption zone root ids, in id order
    pub fn zone_roots(&self) -> Vec<ZoneId> {
        let mut roots: Vec<ZoneId> = self
            .inodes
            .values()
            .filter(|n| matches!(&n.kind, INodeKind::Directory { ez_root: Some(_), .. }))
            .map(|n| n.id)
            .collect();
        roots.sort_unstable();
        roots
    }

    /// Encryption metadata of a file inode
    pub fn file_encryption_info(&self, id: InodeId) -> Option<&FileEncryptionInfo> {
        self.get(id).and_then(|n| n.encryption_info())
    }

    // mutations

    /// Create a directory. The parent path must already exist.
    pub fn mkdir(&mut self, path: &str) -> NamespaceResult<InodeId> {
        self.insert_node(path, |_| INodeKind::Directory {
            children: BTreeMap::new(),
            ez_root: None,
        })
    }

    /// Create a directory that is an encryption zone root
    pub fn create_zone(&mut self, path: &str, key_name: &str) -> NamespaceResult<ZoneId> {
        let key_name = key_name.to_string();
        self.insert_node(path, move |_| INodeKind::Directory {
            children: BTreeMap::new(),
            ez_root: Some(EzRootInfo {
                key_name,
                status_xattr: None,
            }),
        })
    }

    /// Create a file, optionally with encryption metadata
    pub fn create_file(
        &mut self,
        path: &str,
        encryption: Option<FileEncryptionInfo>,
    ) -> NamespaceResult<InodeId> {
        self.insert_node(path, move |_| INodeKind::File { encryption })
    }

    /// Delete an inode (recursively for directories)
    pub fn delete(&mut self, path: &str) -> NamespaceResult<()> {
        let id = self
            .resolve_path(path)
            .ok_or_else(|| NamespaceError::NotFound(path.to_string()))?;
        if id == self.root {
            return Err(NamespaceError::NotFound(path.to_string()));
        }
        let node = self.require(id)?.clone();
        if let Some(parent) = node.parent {
            if let Some(INodeKind::Directory { children, .. }) =
                self.inodes.get_mut(&parent).map(|n| &mut n.kind)
            {
                children.remove(&node.name);
            }
        }
        self.remove_subtree(id);
        Ok(())
    }

    /// Replace a file's EDEK with a re-encrypted one
    pub fn set_file_encryption_info(
        &mut self,
        id: InodeId,
        new_edek: EncryptedKeyVersion,
    ) -> NamespaceResult<()> {
        let path = self.full_path(id)?;
        let node = self
            .inodes
            .get_mut(&id)
            .ok_or(NamespaceError::InodeNotFound(id))?;
        match &mut node.kind {
            INodeKind::File { encryption: Some(info) } => {
                info.edek = new_edek;
                Ok(())
            }
            INodeKind::File { encryption: None } => Err(NamespaceError::NotEncrypted(path)),
            INodeKind::Directory { .. } => Err(NamespaceError::NotAFile(path)),
        }
    }

    /// Store the opaque re-encryption status attribute on a zone root
    pub fn set_zone_status_xattr(
        &mut self,
        zone_id: ZoneId,
        xattr: Option<Vec<u8>>,
    ) -> NamespaceResult<()> {
        let node = self
            .inodes
            .get_mut(&zone_id)
            .ok_or(NamespaceError::InodeNotFound(zone_id))?;
        match &mut node.kind {
            INodeKind::Directory { ez_root: Some(info), .. } => {
                info.status_xattr = xattr;
                Ok(())
            }
            _ => Err(NamespaceError::NotFound(format!("zone {}", zone_id))),
        }
    }

    /// Read the opaque re-encryption status attribute of a zone root
    pub fn zone_status_xattr(&self, zone_id: ZoneId) -> Option<&[u8]> {
        match &self.get(zone_id)?.kind {
            INodeKind::Directory { ez_root: Some(info), .. } => info.status_xattr.as_deref(),
            _ => None,
        }
    }

    fn require(&self, id: InodeId) -> NamespaceResult<&INode> {
        self.get(id).ok_or(NamespaceError::InodeNotFound(id))
    }

    fn remove_subtree(&mut self, id: InodeId) {
        if let Some(node) = self.inodes.remove(&id) {
            if let INodeKind::Directory { children, .. } = node.kind {
                for child in children.into_values() {
                    self.remove_subtree(child);
                }
            }
        }
    }

    fn insert_node<F>(&mut self, path: &str, make_kind: F) -> NamespaceResult<InodeId>
    where
        F: FnOnce(InodeId) -> INodeKind,
    {
        let (parent_path, name) = split_parent(path)?;
        let parent = self
            .resolve_path(parent_path)
            .ok_or_else(|| NamespaceError::NotFound(parent_path.to_string()))?;
        if !self.require(parent)?.is_directory() {
            return Err(NamespaceError::NotADirectory(parent_path.to_string()));
        }
        if self.child(parent, name.as_bytes()).is_some() {
            return Err(NamespaceError::AlreadyExists(path.to_string()));
        }

        let id = self.next_id;
        self.next_id += 1;
        let kind = make_kind(id);
        self.inodes.insert(
            id,
            INode {
                id,
                name: name.as_bytes().to_vec(),
                parent: Some(parent),
                kind,
            },
        );
        if let Some(INodeKind::Directory { children, .. }) =
            self.inodes.get_mut(&parent).map(|n| &mut n.kind)
        {
            children.insert(name.as_bytes().to_vec(), id);
        }
        Ok(id)
    }
}

impl Default for FsTree {
    fn default() -> Self {
        Self::new()
    }
}

fn split_parent(path: &str) -> NamespaceResult<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(NamespaceError::AlreadyExists("/".to_string()));
    }
    match trimmed.rfind('/') {
        Some(0) => Ok(("/", &trimmed[1..])),
        Some(idx) => Ok((&trimmed[..idx], &trimmed[idx + 1..])),
        None => Err(NamespaceError::NotFound(path.to_string())),
    }
}
