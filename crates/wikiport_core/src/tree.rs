use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde_json::{Value, json};
use tracing::debug;

use crate::titles;
use crate::wiki::WikiApi;

#[derive(Debug, Clone)]
pub struct PageNode {
    pub title: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Set when the node was synthesized as a missing ancestor of a deeper
    /// path and no source page carries this exact title.
    pub placeholder: bool,
}

impl PageNode {
    pub fn leaf_title(&self) -> String {
        titles::display_title(titles::leaf(&self.title))
    }
}

/// Page hierarchy as an index-based arena. Node indices are stable for the
/// lifetime of the tree, so per-run state keyed by index can live outside it.
#[derive(Debug, Default)]
pub struct PageTree {
    nodes: Vec<PageNode>,
    roots: Vec<usize>,
    by_title: HashMap<String, usize>,
}

impl PageTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &PageNode {
        &self.nodes[index]
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn find(&self, title: &str) -> Option<usize> {
        self.by_title.get(title).copied()
    }

    pub fn push_root(&mut self, title: &str) -> usize {
        self.push_node(title, None)
    }

    pub fn push_child(&mut self, parent: usize, title: &str) -> usize {
        self.push_node(title, Some(parent))
    }

    fn push_node(&mut self, title: &str, parent: Option<usize>) -> usize {
        let index = self.nodes.len();
        self.nodes.push(PageNode {
            title: title.to_string(),
            parent,
            children: Vec::new(),
            placeholder: false,
        });
        match parent {
            Some(parent_index) => self.nodes[parent_index].children.push(index),
            None => self.roots.push(index),
        }
        self.by_title.insert(title.to_string(), index);
        index
    }

    /// Inserts a slash-delimited title, creating any missing ancestors along
    /// the way. Ancestors created here are placeholders until a later insert
    /// names them directly.
    pub fn insert_path(&mut self, title: &str) -> usize {
        let segments: Vec<&str> = titles::path_segments(title).collect();
        let mut prefix = String::new();
        let mut parent: Option<usize> = None;
        let mut index = 0;
        for (position, segment) in segments.iter().enumerate() {
            if !prefix.is_empty() {
                prefix.push(titles::PATH_DELIMITER);
            }
            prefix.push_str(segment);
            let is_last = position + 1 == segments.len();
            index = match self.find(&prefix) {
                Some(existing) => existing,
                None => {
                    let created = match parent {
                        Some(parent_index) => self.push_child(parent_index, &prefix),
                        None => self.push_root(&prefix),
                    };
                    self.nodes[created].placeholder = !is_last;
                    created
                }
            };
            if is_last {
                self.nodes[index].placeholder = false;
            }
            parent = Some(index);
        }
        index
    }

    /// Depth-first order with parents ahead of their children.
    pub fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(index) = stack.pop() {
            order.push(index);
            for &child in self.nodes[index].children.iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    /// Breadth-first generations. Every node in level N has its parent in
    /// level N-1, which is what lets a whole level be processed in parallel
    /// once the previous level has finished.
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut levels = Vec::new();
        let mut frontier = self.roots.clone();
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for &index in &frontier {
                next.extend(self.nodes[index].children.iter().copied());
            }
            levels.push(frontier);
            frontier = next;
        }
        levels
    }

    pub fn outline(&self) -> String {
        let mut out = String::new();
        let mut stack: Vec<(usize, usize)> =
            self.roots.iter().rev().map(|&index| (index, 0)).collect();
        while let Some((index, depth)) = stack.pop() {
            let node = &self.nodes[index];
            out.push_str(&"  ".repeat(depth));
            out.push_str(&node.leaf_title());
            if node.placeholder {
                out.push_str(" (placeholder)");
            }
            out.push('\n');
            for &child in node.children.iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        out
    }

    pub fn outline_json(&self) -> Value {
        fn render(tree: &PageTree, index: usize) -> Value {
            let node = tree.node(index);
            json!({
                "title": node.leaf_title(),
                "full_title": node.title,
                "placeholder": node.placeholder,
                "children": node
                    .children
                    .iter()
                    .map(|&child| render(tree, child))
                    .collect::<Vec<Value>>(),
            })
        }
        Value::Array(
            self.roots
                .iter()
                .map(|&root| render(self, root))
                .collect(),
        )
    }
}

pub trait Discoverer {
    fn discover(&mut self) -> Result<PageTree>;
}

/// Builds the hierarchy from slash-delimited title paths, the way the source
/// wiki encodes subpages.
pub struct PathDiscoverer<'a, W: WikiApi> {
    wiki: &'a mut W,
}

impl<'a, W: WikiApi> PathDiscoverer<'a, W> {
    pub fn new(wiki: &'a mut W) -> Self {
        Self { wiki }
    }
}

impl<W: WikiApi> Discoverer for PathDiscoverer<'_, W> {
    fn discover(&mut self) -> Result<PageTree> {
        let mut normalized: Vec<String> = self
            .wiki
            .list_all_titles()?
            .iter()
            .map(|raw| titles::normalize(raw))
            .filter(|title| !title.is_empty())
            .collect();
        normalized.sort();
        normalized.dedup();

        let mut tree = PageTree::new();
        for title in &normalized {
            tree.insert_path(title);
        }
        debug!(pages = normalized.len(), nodes = tree.len(), "discovered page paths");
        Ok(tree)
    }
}

/// Builds the hierarchy by following internal links out from a root page.
/// Each page becomes a child of the first page that linked to it; links to
/// already-seen pages are ignored, so cycles terminate.
pub struct LinkGraphDiscoverer<'a, W: WikiApi> {
    wiki: &'a mut W,
    root: String,
}

impl<'a, W: WikiApi> LinkGraphDiscoverer<'a, W> {
    pub fn new(wiki: &'a mut W, root: &str) -> Self {
        Self {
            wiki,
            root: root.to_string(),
        }
    }
}

impl<W: WikiApi> Discoverer for LinkGraphDiscoverer<'_, W> {
    fn discover(&mut self) -> Result<PageTree> {
        let root_title = titles::normalize(&self.root);
        let mut tree = PageTree::new();
        let root_index = tree.push_root(&root_title);

        let mut visited = HashSet::new();
        visited.insert(root_title);
        let mut stack = vec![root_index];
        while let Some(index) = stack.pop() {
            let title = tree.node(index).title.clone();
            let links = self.wiki.list_links(&title)?;
            let mut discovered = Vec::new();
            for link in links {
                let target = titles::normalize(&link);
                if target.is_empty() || !visited.insert(target.clone()) {
                    continue;
                }
                discovered.push(tree.push_child(index, &target));
            }
            for child in discovered.into_iter().rev() {
                stack.push(child);
            }
        }
        debug!(nodes = tree.len(), "discovered link graph");
        Ok(tree)
    }
}
