//! Validity area: the card's current selection state
//!
//! For the basic logical channel, the validity area summarizes the result
//! of all successful file selections (ISO 7816-4:2020 section 7.2.1). Every
//! selection operation either commits a complete new state or leaves the
//! area untouched.

use crate::disk::Disk;
use crate::error::{IccError, IccResult};
use crate::fs::{self, File, Path, PathAnchor};

/// Current selection state
#[derive(Debug, Clone, Default)]
pub struct ValidityArea {
    /// Index of the tree the selection lives in
    pub cur_tree: Option<u8>,
    /// Root of the current tree (the MF or current ADF)
    pub cur_root: Option<File>,
    pub cur_df: Option<File>,
    pub cur_ef: Option<File>,
    /// The file most recently selected, folder or EF
    pub cur_file: Option<File>,
    /// Currently selected record of `cur_ef`, zero-based
    pub cur_rcrd: Option<u8>,
}

impl ValidityArea {
    /// Reset to the state expected right after card startup: MF selected
    pub fn reset(&mut self, disk: &Disk) -> IccResult<()> {
        *self = ValidityArea::default();
        self.select_by_id(disk, 0x3F00)
    }

    /// Select an application by AID. The AID may be right-truncated: the
    /// 5-byte RID must match in full, the PIX only over `pix_len` bytes.
    pub fn select_adf(&mut self, disk: &Disk, aid: &[u8], pix_len: usize) -> IccResult<()> {
        if aid.len() < fs::AID_RID_LEN || pix_len > fs::AID_PIX_LEN
            || aid.len() < fs::AID_RID_LEN + pix_len
        {
            return Err(IccError::Param("AID shorter than indicated".into()));
        }
        for tree_idx in 0..disk.tree_count() as u8 {
            let tree = disk.tree(tree_idx)?;
            let root = tree.root()?;
            let Some(root_aid) = root.aid() else {
                continue;
            };
            if root_aid.rid[..] == aid[..fs::AID_RID_LEN]
                && root_aid.pix[..pix_len] == aid[fs::AID_RID_LEN..fs::AID_RID_LEN + pix_len]
            {
                *self = ValidityArea {
                    cur_tree: Some(tree_idx),
                    cur_root: Some(root),
                    cur_df: Some(root),
                    cur_ef: None,
                    cur_file: Some(root),
                    cur_rcrd: None,
                };
                return Ok(());
            }
        }
        Err(IccError::FsNotFound)
    }

    /// Select an MF or DF by its name. The name may be right-truncated;
    /// the stored remainder must be zero padding for a match.
    pub fn select_by_df_name(&mut self, disk: &Disk, name: &[u8]) -> IccResult<()> {
        if name.is_empty() || name.len() > fs::NAME_LEN {
            return Err(IccError::Param("bad DF name length".into()));
        }
        for tree_idx in 0..disk.tree_count() as u8 {
            let tree = disk.tree(tree_idx)?;
            let root = tree.root()?;
            let mut found: Option<File> = None;
            let walk = tree.for_each_file(&root, true, &mut |_, file| {
                if let Some(file_name) = file.name() {
                    if file_name[..name.len()] == *name
                        && file_name[name.len()..].iter().all(|&b| b == 0)
                    {
                        found = Some(*file);
                        // Stop the walk at the first match.
                        return Err(IccError::FsNotFound);
                    }
                }
                Ok(())
            });
            match (walk, found) {
                (_, Some(file)) => {
                    *self = ValidityArea {
                        cur_tree: Some(tree_idx),
                        cur_root: Some(root),
                        cur_df: Some(file),
                        cur_ef: None,
                        cur_file: Some(file),
                        cur_rcrd: None,
                    };
                    return Ok(());
                }
                (Err(IccError::FsNotFound), None) | (Ok(()), None) => {}
                (Err(other), None) => return Err(other),
            }
        }
        Err(IccError::FsNotFound)
    }

    /// Select a file anywhere on the disk by its 2-byte identifier
    ///
    /// ISO 7816-4:2020 section 7.2.2: selecting a folder replaces the
    /// current DF and unsets the current EF; selecting an EF makes its
    /// parent the current DF.
    pub fn select_by_id(&mut self, disk: &Disk, id: u16) -> IccResult<()> {
        let (tree_idx, file) = disk.lookup_by_id(id)?;
        let tree = disk.tree(tree_idx)?;
        self.commit(disk, tree_idx, &file, tree.parent_of(&file).ok())
    }

    /// Select an EF in the current tree by its short identifier
    ///
    /// Only the current EF changes; the current DF stays as it is.
    pub fn select_by_sid(&mut self, disk: &Disk, sid: u8) -> IccResult<()> {
        let tree_idx = self.cur_tree.ok_or(IccError::FsNotFound)?;
        let file = disk.tree(tree_idx)?.lookup_by_sid(sid)?;
        if !file.is_ef() {
            return Err(IccError::FsNotFound);
        }
        self.cur_ef = Some(file);
        self.cur_file = Some(file);
        self.cur_rcrd = None;
        Ok(())
    }

    /// Select a file by walking a sequence of IDs from the MF or from the
    /// current DF. Every intermediate ID must name a child of the previous
    /// step.
    pub fn select_by_path(&mut self, disk: &Disk, path: &Path) -> IccResult<()> {
        if path.ids.is_empty() {
            return Err(IccError::Param("empty path".into()));
        }
        let (tree_idx, mut at) = match path.anchor {
            PathAnchor::Mf => (0u8, disk.tree(0)?.root()?),
            PathAnchor::CurrentDf => {
                let tree_idx = self.cur_tree.ok_or(IccError::FsNotFound)?;
                (tree_idx, self.cur_df.ok_or(IccError::FsNotFound)?)
            }
        };
        let tree = disk.tree(tree_idx)?;
        for &id in &path.ids {
            if !at.is_folder() {
                return Err(IccError::FsNotFound);
            }
            let mut next: Option<File> = None;
            let walk = tree.for_each_file(&at, false, &mut |_, file| {
                if file.id == id && file.item.offset_trel != at.item.offset_trel {
                    next = Some(*file);
                    return Err(IccError::FsNotFound);
                }
                Ok(())
            });
            match (walk, next) {
                (_, Some(file)) => at = file,
                (Err(IccError::FsNotFound), None) | (Ok(()), None) => {
                    return Err(IccError::FsNotFound)
                }
                (Err(other), None) => return Err(other),
            }
        }
        self.commit(disk, tree_idx, &at, tree.parent_of(&at).ok())
    }

    /// Select a record of the current EF by zero-based index
    pub fn select_record(&mut self, disk: &Disk, idx: u8) -> IccResult<()> {
        let tree_idx = self.cur_tree.ok_or(IccError::FsNotFound)?;
        let ef = self.cur_ef.ok_or(IccError::FsNotFound)?;
        if !ef.is_record_structured() {
            return Err(IccError::Param("current EF has no records".into()));
        }
        let count = disk.tree(tree_idx)?.record_count(&ef)?;
        if u32::from(idx) >= count {
            return Err(IccError::FsNotFound);
        }
        self.cur_rcrd = Some(idx);
        Ok(())
    }

    /// Apply the ISO selection rules for a file found in `tree_idx`
    fn commit(
        &mut self,
        disk: &Disk,
        tree_idx: u8,
        file: &File,
        parent: Option<File>,
    ) -> IccResult<()> {
        let root = disk.tree(tree_idx)?.root()?;
        if file.is_folder() {
            *self = ValidityArea {
                cur_tree: Some(tree_idx),
                cur_root: Some(root),
                cur_df: Some(*file),
                cur_ef: None,
                cur_file: Some(*file),
                cur_rcrd: None,
            };
        } else if file.is_ef() {
            let parent = parent.ok_or(IccError::FsNotFound)?;
            *self = ValidityArea {
                cur_tree: Some(tree_idx),
                cur_root: Some(root),
                cur_df: Some(parent),
                cur_ef: Some(*file),
                cur_file: Some(*file),
                cur_rcrd: None,
            };
        } else {
            return Err(IccError::Param("selected item is not a file".into()));
        }
        Ok(())
    }
}
