//! In-memory disk: a forest of serialized file trees plus lookup tables
//!
//! A disk is a list of trees. Each tree is one contiguous byte buffer whose
//! first item is the tree root (the MF for the first tree, an ADF for every
//! other tree) followed by all descendants in depth-first order. Trees are
//! self-delimiting: the root item header's size field is the tree length.
//!
//! Lookups go through sorted key/value tables: one SID table per tree and a
//! single disk-wide ID table that also records which tree a file lives in.
//! The tables are rebuilt from the tree buffers on load and are never
//! persisted.

use crate::error::{IccError, IccResult};
use crate::fs::{self, Endianness, File, ItemType, Lcs};
use std::fs as stdfs;
use std::path::Path;

/// Disk file magic, 16 bytes. The two trailing bytes differ between little-
/// and big-endian producers and tell the loader how to read every
/// multi-byte integer in the image.
pub const MAGIC_LEN: usize = 16;
const MAGIC_COMMON: [u8; 14] = [
    0x00, 0x73, 0x77, 0x49, 0x43, 0x43, 0x91, 0xCC, 0x2E, 0x2E, 0x2E, 0x2E, 0x46, 0x53,
];

fn magic_for(endian: Endianness) -> [u8; MAGIC_LEN] {
    let mut magic = [0u8; MAGIC_LEN];
    magic[..14].copy_from_slice(&MAGIC_COMMON);
    match endian {
        Endianness::Little => {
            magic[14] = 0xF0;
            magic[15] = 0x0F;
        }
        Endianness::Big => {
            magic[14] = 0x0F;
            magic[15] = 0xF0;
        }
    }
    magic
}

/// Initial lookup table capacity in entries
pub const LUT_COUNT_START: usize = 64;

/// How many entries a full lookup table grows by
pub const LUT_COUNT_RESIZE: usize = 8;

/// A sorted key/value lookup table
///
/// Keys are kept in ascending order with binary-search insertion so lookups
/// are O(log n).
#[derive(Debug, Clone)]
pub struct Lut<K: Ord + Copy, V: Copy> {
    keys: Vec<K>,
    vals: Vec<V>,
}

impl<K: Ord + Copy, V: Copy> Lut<K, V> {
    pub fn new() -> Self {
        Lut {
            keys: Vec::with_capacity(LUT_COUNT_START),
            vals: Vec::with_capacity(LUT_COUNT_START),
        }
    }

    pub fn insert(&mut self, key: K, val: V) {
        if self.keys.len() == self.keys.capacity() {
            self.keys.reserve(LUT_COUNT_RESIZE);
            self.vals.reserve(LUT_COUNT_RESIZE);
        }
        let pos = self.keys.partition_point(|k| *k < key);
        self.keys.insert(pos, key);
        self.vals.insert(pos, val);
    }

    pub fn lookup(&self, key: K) -> Option<V> {
        self.keys.binary_search(&key).ok().map(|idx| self.vals[idx])
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys in table order (ascending)
    pub fn keys(&self) -> &[K] {
        &self.keys
    }
}

impl<K: Ord + Copy, V: Copy> Default for Lut<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// One serialized tree of the forest plus its SID lookup table
#[derive(Debug, Clone)]
pub struct Tree {
    buf: Vec<u8>,
    endian: Endianness,
    /// SID → tree-relative offset of the file header
    lutsid: Lut<u8, u32>,
}

impl Tree {
    /// Occupied length of the tree buffer
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Raw serialized bytes of the whole tree
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Parse the file whose header starts at `offset`
    pub fn file_at(&self, offset: u32) -> IccResult<File> {
        File::parse(&self.buf, offset, self.endian)
    }

    /// The MF or ADF at the root of this tree
    pub fn root(&self) -> IccResult<File> {
        let root = self.file_at(0)?;
        if !matches!(root.item.kind, ItemType::Mf | ItemType::Adf) {
            return Err(IccError::Param(format!(
                "tree root is a {:?}, expected MF or ADF",
                root.item.kind
            )));
        }
        Ok(root)
    }

    /// Parent of `file`, resolved through its parent-relative offset
    pub fn parent_of(&self, file: &File) -> IccResult<File> {
        if file.item.offset_prel == 0 {
            return Err(IccError::FsNotFound);
        }
        if file.item.offset_prel > file.item.offset_trel {
            return Err(IccError::Param("parent offset points before tree start".into()));
        }
        let parent = self.file_at(file.item.offset_trel - file.item.offset_prel)?;
        if !parent.is_folder() {
            return Err(IccError::Param("parent is not a folder".into()));
        }
        Ok(parent)
    }

    /// Contents of a file (everything past its headers)
    pub fn file_data(&self, file: &File) -> &[u8] {
        let start = file.data_offset as usize;
        &self.buf[start..start + file.data_size as usize]
    }

    /// Number of records in a record-structured EF
    pub fn record_count(&self, file: &File) -> IccResult<u32> {
        let rcrd_size = file
            .rcrd_size()
            .ok_or_else(|| IccError::Param("file has no records".into()))?;
        if rcrd_size == 0 {
            return Err(IccError::Param("record size is zero".into()));
        }
        Ok(file.data_size / u32::from(rcrd_size))
    }

    /// Record `idx` (zero-based) of a record-structured EF
    ///
    /// Record k starts at `data_offset + record_size * k`. Cyclic and
    /// linear-fixed files share this raw addressing.
    pub fn record(&self, file: &File, idx: u8) -> IccResult<&[u8]> {
        let count = self.record_count(file)?;
        if u32::from(idx) >= count {
            return Err(IccError::FsNotFound);
        }
        let rcrd_size = usize::from(file.rcrd_size().unwrap_or(0));
        let start = file.data_offset as usize + rcrd_size * usize::from(idx);
        Ok(&self.buf[start..start + rcrd_size])
    }

    /// Visit `start` and, if it is a folder, its children depth-first by
    /// offset. Children that are themselves folders are descended into only
    /// when `recursive` is set. The callback may stop the walk early by
    /// returning an error.
    ///
    /// The walk is depth-bounded to `fs::DEPTH_MAX` levels counted from
    /// `start` (tree-root → DF → EF); a tree nested deeper than that is
    /// malformed and fails the walk.
    pub fn for_each_file<F>(&self, start: &File, recursive: bool, cb: &mut F) -> IccResult<()>
    where
        F: FnMut(&Tree, &File) -> IccResult<()>,
    {
        cb(self, start)?;
        if start.is_folder() {
            self.walk_children(start, 1, recursive, cb)?;
        }
        Ok(())
    }

    /// `depth` is the level of `folder` itself; its children live one
    /// level deeper.
    fn walk_children<F>(
        &self,
        folder: &File,
        depth: usize,
        recursive: bool,
        cb: &mut F,
    ) -> IccResult<()>
    where
        F: FnMut(&Tree, &File) -> IccResult<()>,
    {
        if depth >= fs::DEPTH_MAX {
            return Err(IccError::Param(format!(
                "folder nesting exceeds the maximum depth of {}",
                fs::DEPTH_MAX
            )));
        }
        let mut offset = folder.data_offset;
        let end = folder.item.offset_trel + folder.item.size;
        while offset < end {
            let child = self.file_at(offset)?;
            if child.item.size == 0 {
                return Err(IccError::Param("zero-size item in tree".into()));
            }
            cb(self, &child)?;
            if recursive && child.is_folder() {
                self.walk_children(&child, depth + 1, recursive, cb)?;
            }
            offset += child.item.size;
        }
        Ok(())
    }

    /// Look up a file by its short ID
    pub fn lookup_by_sid(&self, sid: u8) -> IccResult<File> {
        let offset = self.lutsid.lookup(sid).ok_or(IccError::FsNotFound)?;
        self.file_at(offset)
    }

    /// Rebuild the SID table from the tree contents
    pub fn lutsid_rebuild(&mut self) -> IccResult<()> {
        let mut lut = Lut::new();
        let root = self.root()?;
        self.for_each_file(&root, true, &mut |_, file| {
            if file.sid != fs::SID_MISSING && file.is_ef() {
                lut.insert(file.sid, file.item.offset_trel);
            }
            Ok(())
        })?;
        self.lutsid = lut;
        Ok(())
    }

    pub fn lutsid(&self) -> &Lut<u8, u32> {
        &self.lutsid
    }
}

/// Iterator over the trees of the forest
///
/// Mirrors the forward-only shape of the forest: `by_index` cannot rewind,
/// and a failed seek leaves the iterator at the furthest reached tree.
#[derive(Debug)]
pub struct TreeIter<'a> {
    trees: &'a [Tree],
    idx: usize,
}

impl<'a> TreeIter<'a> {
    /// Tree currently at the head of the iterator
    pub fn current(&self) -> &'a Tree {
        &self.trees[self.idx]
    }

    pub fn index(&self) -> u8 {
        self.idx as u8
    }

    /// Advance to the next tree
    pub fn advance(&mut self) -> IccResult<&'a Tree> {
        if self.idx + 1 >= self.trees.len() {
            return Err(IccError::FsNotFound);
        }
        self.idx += 1;
        Ok(&self.trees[self.idx])
    }

    /// Advance until the given tree index is at the head
    pub fn by_index(&mut self, tree_idx: u8) -> IccResult<&'a Tree> {
        while self.idx != usize::from(tree_idx) {
            self.advance()?;
        }
        Ok(&self.trees[self.idx])
    }
}

/// A mounted card disk
#[derive(Debug, Clone)]
pub struct Disk {
    trees: Vec<Tree>,
    endian: Endianness,
    /// ID → (tree index, tree-relative offset)
    lutid: Lut<u16, (u8, u32)>,
}

impl Disk {
    /// Assemble a disk from serialized tree buffers and rebuild all lookup
    /// tables. The first buffer must be rooted at an MF, all others at ADFs.
    pub fn from_tree_bufs(bufs: Vec<Vec<u8>>, endian: Endianness) -> IccResult<Disk> {
        if bufs.is_empty() {
            return Err(IccError::Param("disk has no trees".into()));
        }
        if bufs.len() > usize::from(u8::MAX) {
            return Err(IccError::Param("too many trees".into()));
        }
        let mut trees = Vec::with_capacity(bufs.len());
        for (idx, buf) in bufs.into_iter().enumerate() {
            let mut tree = Tree {
                buf,
                endian,
                lutsid: Lut::new(),
            };
            let root = tree.root()?;
            if root.item.size as usize != tree.buf.len() {
                return Err(IccError::Param(format!(
                    "tree {idx} root size {} does not match buffer length {}",
                    root.item.size,
                    tree.buf.len()
                )));
            }
            let expected = if idx == 0 { ItemType::Mf } else { ItemType::Adf };
            if root.item.kind != expected {
                return Err(IccError::Param(format!(
                    "tree {idx} is rooted at a {:?}, expected {expected:?}",
                    root.item.kind
                )));
            }
            tree.lutsid_rebuild()?;
            trees.push(tree);
        }
        let mut disk = Disk {
            trees,
            endian,
            lutid: Lut::new(),
        };
        disk.lutid_rebuild()?;
        Ok(disk)
    }

    /// Load a disk image from a file
    pub fn load<P: AsRef<Path>>(path: P) -> IccResult<Disk> {
        let raw = stdfs::read(path.as_ref())?;
        if raw.len() < MAGIC_LEN {
            return Err(IccError::Param("disk file shorter than magic".into()));
        }
        let endian = if raw[..MAGIC_LEN] == magic_for(Endianness::Little) {
            Endianness::Little
        } else if raw[..MAGIC_LEN] == magic_for(Endianness::Big) {
            Endianness::Big
        } else {
            return Err(IccError::Param("bad disk magic".into()));
        };

        // Trees are self-delimiting: the root item header of each gives the
        // total tree length.
        let mut bufs = Vec::new();
        let mut at = MAGIC_LEN;
        while at < raw.len() {
            if raw.len() - at < fs::ITEM_HDR_LEN {
                return Err(IccError::Param("trailing garbage after last tree".into()));
            }
            let size = endian.read_u32(&raw[at..]) as usize;
            if size < fs::ITEM_HDR_LEN || at + size > raw.len() {
                return Err(IccError::Param(format!("tree at {at} has bad size {size}")));
            }
            bufs.push(raw[at..at + size].to_vec());
            at += size;
        }
        let disk = Disk::from_tree_bufs(bufs, endian)?;
        log::info!(
            "loaded disk: {} tree(s), {} file ID(s)",
            disk.trees.len(),
            disk.lutid.len()
        );
        Ok(disk)
    }

    /// Save the disk image to a file. The tree buffers are written verbatim
    /// so a load/save pair is byte-identical.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> IccResult<()> {
        let mut out = Vec::with_capacity(MAGIC_LEN + self.trees.iter().map(Tree::len).sum::<usize>());
        out.extend_from_slice(&magic_for(self.endian));
        for tree in &self.trees {
            out.extend_from_slice(&tree.buf);
        }
        stdfs::write(path.as_ref(), out)?;
        Ok(())
    }

    pub fn endian(&self) -> Endianness {
        self.endian
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn tree(&self, idx: u8) -> IccResult<&Tree> {
        self.trees.get(usize::from(idx)).ok_or(IccError::FsNotFound)
    }

    /// Iterator positioned at the first tree
    pub fn tree_iter(&self) -> IccResult<TreeIter<'_>> {
        if self.trees.is_empty() {
            return Err(IccError::FsNotFound);
        }
        Ok(TreeIter {
            trees: &self.trees,
            idx: 0,
        })
    }

    /// Look up a file anywhere on the disk by its ID
    pub fn lookup_by_id(&self, id: u16) -> IccResult<(u8, File)> {
        let (tree_idx, offset) = self.lutid.lookup(id).ok_or(IccError::FsNotFound)?;
        let mut iter = self.tree_iter()?;
        let tree = iter.by_index(tree_idx)?;
        Ok((tree_idx, tree.file_at(offset)?))
    }

    /// Rebuild the disk-wide ID table from all trees
    pub fn lutid_rebuild(&mut self) -> IccResult<()> {
        let mut lut = Lut::new();
        for (tree_idx, tree) in self.trees.iter().enumerate() {
            let root = tree.root()?;
            tree.for_each_file(&root, true, &mut |_, file| {
                if file.id != fs::ID_MISSING {
                    lut.insert(file.id, (tree_idx as u8, file.item.offset_trel));
                }
                Ok(())
            })?;
        }
        self.lutid = lut;
        Ok(())
    }

    pub fn lutid(&self) -> &Lut<u16, (u8, u32)> {
        &self.lutid
    }
}

pub mod build {
    //! Programmatic construction of serialized trees
    //!
    //! This is how test fixtures and tooling produce disk images; the card
    //! engine itself only ever reads them.

    use super::*;

    /// Identity shared by every file
    #[derive(Debug, Clone, Copy)]
    pub struct FileAttrs {
        pub id: u16,
        pub sid: u8,
        pub lcs: Lcs,
    }

    impl FileAttrs {
        pub fn new(id: u16, sid: u8) -> Self {
            FileAttrs {
                id,
                sid,
                lcs: Lcs::OperActivated,
            }
        }
    }

    /// One node of a tree under construction
    #[derive(Debug, Clone)]
    pub struct Node {
        pub attrs: FileAttrs,
        pub kind: NodeKind,
    }

    #[derive(Debug, Clone)]
    pub enum NodeKind {
        Mf {
            name: [u8; fs::NAME_LEN],
            children: Vec<Node>,
        },
        Df {
            name: [u8; fs::NAME_LEN],
            children: Vec<Node>,
        },
        Adf {
            aid: crate::fs::Aid,
            children: Vec<Node>,
        },
        EfTransparent {
            data: Vec<u8>,
        },
        EfLinearFixed {
            rcrd_size: u8,
            data: Vec<u8>,
        },
        EfCyclic {
            rcrd_size: u8,
            data: Vec<u8>,
        },
    }

    /// Pad or truncate a label into a 16-byte file name
    pub fn name16(label: &str) -> [u8; fs::NAME_LEN] {
        let mut name = [0u8; fs::NAME_LEN];
        let bytes = label.as_bytes();
        let len = bytes.len().min(fs::NAME_LEN);
        name[..len].copy_from_slice(&bytes[..len]);
        name
    }

    impl Node {
        fn item_type(&self) -> ItemType {
            match self.kind {
                NodeKind::Mf { .. } => ItemType::Mf,
                NodeKind::Df { .. } => ItemType::Df,
                NodeKind::Adf { .. } => ItemType::Adf,
                NodeKind::EfTransparent { .. } => ItemType::EfTransparent,
                NodeKind::EfLinearFixed { .. } => ItemType::EfLinearFixed,
                NodeKind::EfCyclic { .. } => ItemType::EfCyclic,
            }
        }

        fn size(&self) -> u32 {
            let hdr = self.item_type().header_len() as u32;
            let content: u32 = match &self.kind {
                NodeKind::Mf { children, .. }
                | NodeKind::Df { children, .. }
                | NodeKind::Adf { children, .. } => children.iter().map(Node::size).sum(),
                NodeKind::EfTransparent { data }
                | NodeKind::EfLinearFixed { data, .. }
                | NodeKind::EfCyclic { data, .. } => data.len() as u32,
            };
            hdr + content
        }

        fn encode(&self, out: &mut Vec<u8>, offset_prel: u32, endian: Endianness) {
            let kind = self.item_type();
            let my_offset = out.len() as u32;
            let mut hdr = [0u8; fs::FILE_HDR_LEN];
            endian.write_u32(&mut hdr[0..], self.size());
            endian.write_u32(&mut hdr[4..], offset_prel);
            hdr[8] = kind as u8;
            hdr[9] = self.attrs.lcs as u8;
            endian.write_u16(&mut hdr[10..], self.attrs.id);
            hdr[12] = self.attrs.sid;
            out.extend_from_slice(&hdr);

            match &self.kind {
                NodeKind::Mf { name, children } | NodeKind::Df { name, children } => {
                    out.extend_from_slice(name);
                    for child in children {
                        let child_prel = out.len() as u32 - my_offset;
                        child.encode(out, child_prel, endian);
                    }
                }
                NodeKind::Adf { aid, children } => {
                    out.extend_from_slice(&aid.to_bytes());
                    for child in children {
                        let child_prel = out.len() as u32 - my_offset;
                        child.encode(out, child_prel, endian);
                    }
                }
                NodeKind::EfTransparent { data } => out.extend_from_slice(data),
                NodeKind::EfLinearFixed { rcrd_size, data }
                | NodeKind::EfCyclic { rcrd_size, data } => {
                    out.push(*rcrd_size);
                    out.extend_from_slice(data);
                }
            }
        }

        /// Serialize this node as a complete tree buffer
        pub fn to_tree_bytes(&self, endian: Endianness) -> Vec<u8> {
            let mut out = Vec::with_capacity(self.size() as usize);
            self.encode(&mut out, 0, endian);
            out
        }
    }
}
