use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::titles;
use crate::tree::PageTree;

const MAX_FILENAME_CHARS: usize = 255;
const STRUCTURE_FILENAME: &str = "_structure.txt";

/// Makes a title segment safe as a filename: filesystem-hostile characters
/// are stripped, spaces become underscores, length is bounded.
pub fn sanitize_filename(segment: &str) -> String {
    segment
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .map(|c| if c == ' ' { '_' } else { c })
        .take(MAX_FILENAME_CHARS)
        .collect()
}

/// Writes the discovered tree as a directory hierarchy under `root`. A leaf
/// page becomes `<name>.md`; a page with children becomes a directory of
/// that name holding its own file plus its children. Also writes an indented
/// structure listing at the mirror root. Returns the number of page files
/// written.
pub fn write_mirror(
    root: &Path,
    tree: &PageTree,
    bodies: &HashMap<usize, String>,
) -> Result<usize> {
    fs::create_dir_all(root)
        .with_context(|| format!("failed to create mirror directory {}", root.display()))?;

    let mut written = 0;
    for &index in tree.roots() {
        write_node(root, tree, index, bodies, &mut written)?;
    }

    let structure_path = root.join(STRUCTURE_FILENAME);
    fs::write(&structure_path, tree.outline())
        .with_context(|| format!("failed to write {}", structure_path.display()))?;

    info!(root = %root.display(), written, "wrote filesystem mirror");
    Ok(written)
}

fn write_node(
    dir: &Path,
    tree: &PageTree,
    index: usize,
    bodies: &HashMap<usize, String>,
    written: &mut usize,
) -> Result<()> {
    let node = tree.node(index);
    let name = sanitize_filename(titles::leaf(&node.title));

    let file_dir = if node.children.is_empty() {
        dir.to_path_buf()
    } else {
        dir.join(&name)
    };
    fs::create_dir_all(&file_dir)
        .with_context(|| format!("failed to create {}", file_dir.display()))?;

    match bodies.get(&index) {
        Some(body) => {
            let file_path = file_dir.join(format!("{name}.md"));
            fs::write(&file_path, body)
                .with_context(|| format!("failed to write {}", file_path.display()))?;
            *written += 1;
        }
        None => warn!(title = node.title, "no converted body for mirror entry"),
    }

    for &child in &node.children {
        write_node(&file_dir, tree, child, bodies, written)?;
    }
    Ok(())
}

/// Relative paths of every page file under the mirror root, sorted. Used to
/// check a written mirror against the discovered tree.
pub fn verify_mirror(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|ext| ext.to_str()) != Some("md") {
            continue;
        }
        let relative = entry.path().strip_prefix(root)?;
        files.push(relative.to_string_lossy().replace('\\', "/"));
    }
    files.sort();
    Ok(files)
}
