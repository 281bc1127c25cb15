//! Byte-sequence trie used to find target GUIDs inside task signatures.
//!
//! A task-ended frame carries the ASCII codes of every contributing target
//! GUID concatenated without delimiters. Walking the trie from each offset
//! answers "does a known GUID begin here" in time bounded by the longest
//! GUID, independent of how many targets are live.

use std::collections::HashMap;

#[derive(Debug)]
struct Node<T> {
    children: HashMap<u8, Node<T>>,
    data: Option<T>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            data: None,
        }
    }

    fn is_prunable(&self) -> bool {
        self.data.is_none() && self.children.is_empty()
    }
}

#[derive(Debug)]
pub struct SignatureIndex<T> {
    root: Node<T>,
    len: usize,
}

impl<T> Default for SignatureIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SignatureIndex<T> {
    pub fn new() -> Self {
        Self {
            root: Node::new(),
            len: 0,
        }
    }

    /// Number of stored signatures.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `data` under `signature`, replacing any previous value.
    /// Empty signatures are ignored since they would match everywhere.
    pub fn insert(&mut self, signature: &[u8], data: T) {
        if signature.is_empty() {
            return;
        }
        let mut node = &mut self.root;
        for byte in signature {
            node = node.children.entry(*byte).or_insert_with(Node::new);
        }
        if node.data.replace(data).is_none() {
            self.len += 1;
        }
    }

    /// Walks `haystack` from `from_index` and returns the data of the first
    /// stored signature that begins exactly there.
    ///
    /// The shortest match wins; the haystack does not need to end where the
    /// signature ends.
    pub fn search_any(&self, haystack: &[u8], from_index: usize) -> Option<&T> {
        let mut node = &self.root;
        for byte in haystack.get(from_index..)? {
            node = node.children.get(byte)?;
            if let Some(data) = node.data.as_ref() {
                return Some(data);
            }
        }
        None
    }

    /// Removes `signature` and prunes nodes left without data or children.
    /// Returns the data that was stored under it.
    pub fn remove(&mut self, signature: &[u8]) -> Option<T> {
        if signature.is_empty() {
            return None;
        }
        let removed = Self::remove_from(&mut self.root, signature);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_from(node: &mut Node<T>, rest: &[u8]) -> Option<T> {
        let (first, tail) = rest.split_first()?;
        let child = node.children.get_mut(first)?;
        let removed = if tail.is_empty() {
            child.data.take()
        } else {
            Self::remove_from(child, tail)
        };
        if child.is_prunable() {
            node.children.remove(first);
        }
        removed
    }
}
