use crate::common::{OleError, OleResult, NO_STREAM};
use crate::directory::ObjectType;
use crate::ole::Ole;
use crate::tree::{NameKey, Tree};

/// A storage (directory) inside a compound file. The storage holds its
/// directory entry id and a lazily built red-black view of its children;
/// every mutation is published back to the directory entries immediately, so
/// dropping the view loses nothing.
pub struct Storage<'a> {
    ole: &'a mut Ole,
    id: u32,
    tree: Option<Tree>,
}

impl<'a> Storage<'a> {
    pub(crate) fn attach(ole: &'a mut Ole, id: u32) -> Self {
        Storage {
            ole,
            id,
            tree: None,
        }
    }

    pub fn name(&self) -> String {
        self.ole
            .directory()
            .get(self.id)
            .map(|de| de.name())
            .unwrap_or_default()
    }

    /// Rebuilds the sibling tree from the persisted entries, keeping the
    /// exact on-disk shape and colors, so an untouched tree publishes no
    /// rewrites.
    fn ensure_tree(&mut self) -> OleResult<()> {
        if self.tree.is_some() {
            return Ok(());
        }
        let mut tree = Tree::new();
        let child = self.ole.directory().get(self.id)?.child_id;
        let root = build_view(self.ole, &mut tree, child, 0)?;
        tree.set_root(root);
        self.tree = Some(tree);
        Ok(())
    }

    fn view(&self) -> OleResult<&Tree> {
        self.tree
            .as_ref()
            .ok_or_else(|| OleError::Internal("sibling tree view not built".into()))
    }

    fn find_entry(&mut self, name: &str) -> OleResult<Option<u32>> {
        self.ensure_tree()?;
        let tree = self.view()?;
        Ok(tree.find(&NameKey::new(name)).map(|n| tree.entry_of(n)))
    }

    /// Looks up a child stream by name (case-insensitive, per the sibling
    /// ordering rules).
    pub fn get_stream(&mut self, name: &str) -> OleResult<Stream<'_>> {
        if let Some(id) = self.find_entry(name)? {
            if self.ole.directory().get(id)?.object_type == ObjectType::Stream {
                return Ok(Stream {
                    ole: &mut *self.ole,
                    id,
                });
            }
        }
        Err(OleError::StreamNotFound(name.to_string()))
    }

    /// Looks up a child storage by name.
    pub fn get_storage(&mut self, name: &str) -> OleResult<Storage<'_>> {
        if let Some(id) = self.find_entry(name)? {
            if self.ole.directory().get(id)?.object_type == ObjectType::Storage {
                return Ok(Storage {
                    ole: &mut *self.ole,
                    id,
                    tree: None,
                });
            }
        }
        Err(OleError::NotFoundDirectory)
    }

    pub fn add_stream(&mut self, name: &str) -> OleResult<Stream<'_>> {
        let id = self.add_child(name, ObjectType::Stream)?;
        Ok(Stream {
            ole: &mut *self.ole,
            id,
        })
    }

    pub fn add_storage(&mut self, name: &str) -> OleResult<Storage<'_>> {
        let id = self.add_child(name, ObjectType::Storage)?;
        Ok(Storage {
            ole: &mut *self.ole,
            id,
            tree: None,
        })
    }

    fn add_child(&mut self, name: &str, object_type: ObjectType) -> OleResult<u32> {
        self.ensure_tree()?;
        let key = NameKey::new(name);
        if self.view()?.find(&key).is_some() {
            return Err(OleError::DuplicateName(name.to_string()));
        }
        let new_id = self.ole.new_directory_entry(name, object_type)?;
        if let Some(tree) = self.tree.as_mut() {
            tree.insert(new_id, key);
        }
        let tree = self
            .tree
            .as_ref()
            .ok_or_else(|| OleError::Internal("sibling tree view not built".into()))?;
        publish_view(self.ole, tree, self.id, Some(new_id))?;
        Ok(new_id)
    }

    /// Removes a child by name, releasing its directory entry, its sector
    /// chain, and (for a storage) its whole subtree. A name that is not in
    /// the tree means the child does not exist.
    pub fn delete(&mut self, name: &str) -> OleResult<()> {
        self.ensure_tree()?;
        let key = NameKey::new(name);
        let (node, entry_id) = {
            let tree = self.view()?;
            match tree.find(&key) {
                Some(n) => (n, tree.entry_of(n)),
                None => return Err(OleError::NotFoundDirectory),
            }
        };
        if let Some(tree) = self.tree.as_mut() {
            tree.delete(node);
        }
        let tree = self
            .tree
            .as_ref()
            .ok_or_else(|| OleError::Internal("sibling tree view not built".into()))?;
        publish_view(self.ole, tree, self.id, None)?;
        self.ole.release_entry(entry_id)?;
        Ok(())
    }
}

/// Rebuilds one node of the persisted sibling tree; `depth` bounds the walk
/// against cyclic sibling pointers.
fn build_view(ole: &Ole, tree: &mut Tree, id: u32, depth: usize) -> OleResult<Option<usize>> {
    if id == NO_STREAM {
        return Ok(None);
    }
    if depth > ole.directory().len() {
        return Err(OleError::Corrupt("sibling tree cycle".into()));
    }
    let (name, color, left, right) = {
        let de = ole.directory().get(id)?;
        (de.name(), de.color, de.left_sibling_id, de.right_sibling_id)
    };
    let node = tree.push_node(id, NameKey::new(&name), color);
    let l = build_view(ole, tree, left, depth + 1)?;
    let r = build_view(ole, tree, right, depth + 1)?;
    tree.link_left(node, l);
    tree.link_right(node, r);
    Ok(Some(node))
}

/// Writes back every node whose persisted color or sibling ids drifted from
/// the in-memory tree, plus the entry named by `force`, and repoints the
/// parent's child id when the tree root moved.
fn publish_view(ole: &mut Ole, tree: &Tree, parent_id: u32, force: Option<u32>) -> OleResult<()> {
    for node in tree.in_order() {
        let entry_id = tree.entry_of(node);
        let color = tree.color_of(node);
        let left = tree
            .left_of(node)
            .map(|n| tree.entry_of(n))
            .unwrap_or(NO_STREAM);
        let right = tree
            .right_of(node)
            .map(|n| tree.entry_of(n))
            .unwrap_or(NO_STREAM);
        let changed = {
            let de = ole.directory_mut().get_mut(entry_id)?;
            let mut changed = false;
            if de.color != color {
                de.color = color;
                changed = true;
            }
            if de.left_sibling_id != left {
                de.left_sibling_id = left;
                changed = true;
            }
            if de.right_sibling_id != right {
                de.right_sibling_id = right;
                changed = true;
            }
            changed
        };
        if changed || force == Some(entry_id) {
            ole.update_directory(entry_id)?;
        }
    }
    let root_entry = tree
        .root()
        .map(|r| tree.entry_of(r))
        .unwrap_or(NO_STREAM);
    let parent_changed = {
        let de = ole.directory_mut().get_mut(parent_id)?;
        if de.child_id != root_entry {
            de.child_id = root_entry;
            true
        } else {
            false
        }
    };
    if parent_changed {
        ole.update_directory(parent_id)?;
    }
    Ok(())
}

/// A stream of user bytes. Reads materialize the whole stream; writes may
/// move it between the mini and regular allocators.
pub struct Stream<'a> {
    ole: &'a mut Ole,
    id: u32,
}

impl Stream<'_> {
    pub fn name(&self) -> String {
        self.ole
            .directory()
            .get(self.id)
            .map(|de| de.name())
            .unwrap_or_default()
    }

    pub fn size(&self) -> u64 {
        self.ole
            .directory()
            .get(self.id)
            .map(|de| de.size)
            .unwrap_or(0)
    }

    pub fn get_data(&mut self) -> OleResult<Vec<u8>> {
        self.ole.read_stream_data(self.id)
    }

    pub fn set_data(&mut self, data: &[u8]) -> OleResult<()> {
        self.ole.write_stream_data(self.id, data)
    }

    pub fn append(&mut self, data: &[u8]) -> OleResult<()> {
        let mut buf = self.get_data()?;
        buf.extend_from_slice(data);
        self.ole.write_stream_data(self.id, &buf)
    }
}
