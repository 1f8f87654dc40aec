//! The filesystem mirror
//!
//! A virtual directory tree shadowing one host directory. Every entry
//! carries an owner (an object handle, -1 for the system) and a flag
//! set. Lookups auto-discover entries that exist on disk but not in the
//! tree; directory listings reconcile with the host and drop stale
//! virtual entries whose file has vanished.
//!
//! Path validation is strict: mudlib paths are absolute, normalized,
//! free of `..` and NULs, and can never escape the host root.
//! Permission decisions live a layer up (the file builtins consult the
//! master object); this module only stores the metadata they use.

use bitflags::bitflags;
use std::path::{Path, PathBuf};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u32 {
        const DIRECTORY = 1 << 0;
        const READ_OK   = 1 << 1;
        const WRITE_OK  = 1 << 2;
        const HIDDEN    = 1 << 3;
    }
}

#[derive(Debug)]
pub struct FileNode {
    pub name: String,
    pub flags: FileFlags,
    /// Owning object's refno; -1 for unowned/system entries.
    pub owner: i64,
    pub children: Vec<FileNode>,
}

impl FileNode {
    fn new(name: &str, flags: FileFlags, owner: i64) -> FileNode {
        FileNode {
            name: name.to_string(),
            flags,
            owner,
            children: Vec::new(),
        }
    }

    fn child(&self, name: &str) -> Option<usize> {
        self.children.iter().position(|c| c.name == name)
    }
}

#[derive(Debug)]
pub struct FsMirror {
    host_root: PathBuf,
    root: FileNode,
}

/// Split a validated mudlib path into components.
fn components(vpath: &str) -> Result<Vec<&str>, String> {
    if !vpath.starts_with('/') {
        return Err(format!("path '{}' is not absolute", vpath));
    }
    if vpath.contains('\0') {
        return Err("path contains NUL".to_string());
    }
    if vpath == "/" {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for part in vpath[1..].split('/') {
        if part.is_empty() {
            return Err(format!("path '{}' is not normalized", vpath));
        }
        if part == "." || part == ".." {
            return Err(format!("path '{}' escapes the mudlib", vpath));
        }
        out.push(part);
    }
    Ok(out)
}

impl FsMirror {
    pub fn new(host_root: PathBuf) -> FsMirror {
        FsMirror {
            host_root,
            root: FileNode::new("", FileFlags::DIRECTORY | FileFlags::READ_OK, 0),
        }
    }

    pub fn root_flags(&self) -> FileFlags {
        self.root.flags
    }

    pub fn root_owner(&self) -> i64 {
        self.root.owner
    }

    pub fn set_root_meta(&mut self, flags: FileFlags, owner: i64) {
        self.root.flags = flags;
        self.root.owner = owner;
    }

    /// Map a mudlib path onto the host, after validation.
    pub fn host_path(&self, vpath: &str) -> Result<PathBuf, String> {
        let parts = components(vpath)?;
        let mut p = self.host_root.clone();
        for part in parts {
            p.push(part);
        }
        Ok(p)
    }

    fn node(&self, parts: &[&str]) -> Option<&FileNode> {
        let mut cur = &self.root;
        for part in parts {
            let idx = cur.child(part)?;
            cur = &cur.children[idx];
        }
        Some(cur)
    }

    fn node_mut(&mut self, parts: &[&str]) -> Option<&mut FileNode> {
        let mut cur = &mut self.root;
        for part in parts {
            let idx = cur.child(part)?;
            cur = &mut cur.children[idx];
        }
        Some(cur)
    }

    /// Find an entry, discovering it from the host when the tree has no
    /// record but the file exists on disk.
    pub fn lookup(&mut self, vpath: &str) -> Result<Option<(FileFlags, i64)>, String> {
        let parts = components(vpath)?;
        if let Some(n) = self.node(&parts) {
            return Ok(Some((n.flags, n.owner)));
        }
        let host = self.host_path(vpath)?;
        let meta = match std::fs::metadata(&host) {
            Ok(m) => m,
            Err(_) => return Ok(None),
        };
        let flags = if meta.is_dir() {
            FileFlags::DIRECTORY | FileFlags::READ_OK
        } else {
            FileFlags::READ_OK
        };
        self.add_entry(vpath, -1, flags)?;
        Ok(Some((flags, -1)))
    }

    /// Insert a virtual entry, creating intermediate directories. Used
    /// by discovery, by file creation, and by the checkpoint restore.
    pub fn add_entry(&mut self, vpath: &str, owner: i64, flags: FileFlags) -> Result<(), String> {
        let parts = components(vpath)?;
        if parts.is_empty() {
            return Err("cannot add the root".to_string());
        }
        let mut cur = &mut self.root;
        for (i, part) in parts.iter().enumerate() {
            let last = i == parts.len() - 1;
            match cur.child(part) {
                Some(idx) => {
                    if last {
                        cur.children[idx].flags = flags;
                        cur.children[idx].owner = owner;
                    }
                    cur = &mut cur.children[idx];
                }
                None => {
                    let node = if last {
                        FileNode::new(part, flags, owner)
                    } else {
                        FileNode::new(part, FileFlags::DIRECTORY | FileFlags::READ_OK, -1)
                    };
                    cur.children.push(node);
                    let idx = cur.children.len() - 1;
                    cur = &mut cur.children[idx];
                }
            }
        }
        Ok(())
    }

    pub fn remove_entry(&mut self, vpath: &str) -> Result<(), String> {
        let parts = components(vpath)?;
        if parts.is_empty() {
            return Err("cannot remove the root".to_string());
        }
        let (dir, name) = parts.split_at(parts.len() - 1);
        if let Some(parent) = self.node_mut(dir) {
            parent.children.retain(|c| c.name != name[0]);
        }
        Ok(())
    }

    pub fn set_meta(&mut self, vpath: &str, owner: Option<i64>, flags: Option<FileFlags>) -> Result<(), String> {
        let parts = components(vpath)?;
        let node = self
            .node_mut(&parts)
            .ok_or_else(|| format!("no such entry '{}'", vpath))?;
        if let Some(o) = owner {
            node.owner = o;
        }
        if let Some(f) = flags {
            node.flags = f;
        }
        Ok(())
    }

    /// List a directory, reconciled against the host: entries present
    /// on disk but unknown to the tree are discovered, and virtual
    /// entries whose file has vanished are dropped. Hidden entries are
    /// excluded.
    pub fn list_dir(&mut self, vpath: &str) -> Result<Vec<String>, String> {
        let parts = components(vpath)?;
        let host = self.host_path(vpath)?;
        let mut on_disk: Vec<(String, bool)> = Vec::new();
        let rd = std::fs::read_dir(&host).map_err(|e| format!("cannot list '{}': {}", vpath, e))?;
        for entry in rd.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            on_disk.push((name, is_dir));
        }
        if self.node(&parts).is_none() {
            self.lookup(vpath)?;
        }
        let node = self
            .node_mut(&parts)
            .ok_or_else(|| format!("no such directory '{}'", vpath))?;
        // Drop stale virtual entries.
        node.children
            .retain(|c| on_disk.iter().any(|(n, _)| n == &c.name));
        // Discover new host entries.
        for (name, is_dir) in &on_disk {
            if node.child(name).is_none() {
                let flags = if *is_dir {
                    FileFlags::DIRECTORY | FileFlags::READ_OK
                } else {
                    FileFlags::READ_OK
                };
                node.children.push(FileNode::new(name, flags, -1));
            }
        }
        let mut names: Vec<String> = node
            .children
            .iter()
            .filter(|c| !c.flags.contains(FileFlags::HIDDEN))
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    // ---- content operations (no permission checks here) --------------

    pub fn read_text(&mut self, vpath: &str) -> Result<String, String> {
        let host = self.host_path(vpath)?;
        self.lookup(vpath)?;
        std::fs::read_to_string(&host).map_err(|e| format!("cannot read '{}': {}", vpath, e))
    }

    /// Append text, creating the file (and its virtual entry) if new.
    pub fn append_text(&mut self, vpath: &str, text: &str, owner: i64) -> Result<(), String> {
        let host = self.host_path(vpath)?;
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&host)
            .map_err(|e| format!("cannot write '{}': {}", vpath, e))?;
        f.write_all(text.as_bytes())
            .map_err(|e| format!("cannot write '{}': {}", vpath, e))?;
        if self.lookup(vpath)? .is_none() {
            self.add_entry(vpath, owner, FileFlags::READ_OK | FileFlags::WRITE_OK)?;
        }
        Ok(())
    }

    /// Truncate a file to empty without removing it.
    pub fn erase(&mut self, vpath: &str) -> Result<(), String> {
        let host = self.host_path(vpath)?;
        std::fs::write(&host, b"").map_err(|e| format!("cannot erase '{}': {}", vpath, e))
    }

    pub fn remove_file(&mut self, vpath: &str) -> Result<(), String> {
        let host = self.host_path(vpath)?;
        std::fs::remove_file(&host).map_err(|e| format!("cannot remove '{}': {}", vpath, e))?;
        self.remove_entry(vpath)
    }

    pub fn copy_file(&mut self, from: &str, to: &str, owner: i64) -> Result<(), String> {
        let src = self.host_path(from)?;
        let dst = self.host_path(to)?;
        std::fs::copy(&src, &dst).map_err(|e| format!("cannot copy '{}': {}", from, e))?;
        if self.lookup(to)?.is_none() {
            self.add_entry(to, owner, FileFlags::READ_OK | FileFlags::WRITE_OK)?;
        }
        Ok(())
    }

    pub fn rename_file(&mut self, from: &str, to: &str, owner: i64) -> Result<(), String> {
        let src = self.host_path(from)?;
        let dst = self.host_path(to)?;
        std::fs::rename(&src, &dst).map_err(|e| format!("cannot rename '{}': {}", from, e))?;
        let meta = self.lookup(from)?;
        self.remove_entry(from)?;
        let (flags, old_owner) = meta.unwrap_or((FileFlags::READ_OK | FileFlags::WRITE_OK, owner));
        self.add_entry(to, old_owner, flags)
    }

    pub fn make_dir(&mut self, vpath: &str, owner: i64) -> Result<(), String> {
        let host = self.host_path(vpath)?;
        std::fs::create_dir(&host).map_err(|e| format!("cannot mkdir '{}': {}", vpath, e))?;
        self.add_entry(
            vpath,
            owner,
            FileFlags::DIRECTORY | FileFlags::READ_OK | FileFlags::WRITE_OK,
        )
    }

    pub fn remove_dir(&mut self, vpath: &str) -> Result<(), String> {
        let host = self.host_path(vpath)?;
        std::fs::remove_dir(&host).map_err(|e| format!("cannot rmdir '{}': {}", vpath, e))?;
        self.remove_entry(vpath)
    }

    pub fn file_size(&mut self, vpath: &str) -> Result<i64, String> {
        let host = self.host_path(vpath)?;
        let meta =
            std::fs::metadata(&host).map_err(|e| format!("cannot stat '{}': {}", vpath, e))?;
        if meta.is_dir() {
            Ok(-2)
        } else {
            Ok(meta.len() as i64)
        }
    }

    /// Visit every virtual entry in pre-order with its full path. The
    /// checkpoint writer persists exactly this walk.
    pub fn for_each_entry<F: FnMut(&str, FileFlags, i64)>(&self, mut f: F) {
        fn walk<F: FnMut(&str, FileFlags, i64)>(node: &FileNode, prefix: &str, f: &mut F) {
            for child in &node.children {
                let path = format!("{}/{}", prefix, child.name);
                f(&path, child.flags, child.owner);
                walk(child, &path, f);
            }
        }
        walk(&self.root, "", &mut f);
    }

    /// Forget all virtual entries (restore path).
    pub fn clear(&mut self) {
        self.root.children.clear();
    }
}

/// Validate a path argument coming from the world. Returns the
/// normalized path or an error for display.
pub fn validate_path(vpath: &str) -> Result<&str, String> {
    components(vpath)?;
    Ok(vpath)
}

/// Host paths are never accepted from the world; this helper rejects
/// anything that does not look like a mudlib path.
pub fn reject_host_path(p: &Path) -> bool {
    p.is_absolute()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mirror() -> (TempDir, FsMirror) {
        let dir = TempDir::new().unwrap();
        let m = FsMirror::new(dir.path().to_path_buf());
        (dir, m)
    }

    #[test]
    fn test_path_validation() {
        assert!(components("/a/b.t").is_ok());
        assert!(components("relative").is_err());
        assert!(components("/a/../b").is_err());
        assert!(components("/a//b").is_err());
        assert!(components("/a/./b").is_err());
        assert!(components("/a\0b").is_err());
    }

    #[test]
    fn test_write_then_read() {
        let (_d, mut m) = mirror();
        m.append_text("/motd.txt", "welcome\n", 3).unwrap();
        assert_eq!(m.read_text("/motd.txt").unwrap(), "welcome\n");
        let (flags, owner) = m.lookup("/motd.txt").unwrap().unwrap();
        assert!(flags.contains(FileFlags::WRITE_OK));
        assert_eq!(owner, 3);
    }

    #[test]
    fn test_append_appends() {
        let (_d, mut m) = mirror();
        m.append_text("/log.txt", "one\n", 0).unwrap();
        m.append_text("/log.txt", "two\n", 0).unwrap();
        assert_eq!(m.read_text("/log.txt").unwrap(), "one\ntwo\n");
        m.erase("/log.txt").unwrap();
        assert_eq!(m.read_text("/log.txt").unwrap(), "");
    }

    #[test]
    fn test_auto_discovery() {
        let (d, mut m) = mirror();
        std::fs::write(d.path().join("found.txt"), "x").unwrap();
        // Never added virtually, but stat discovers it.
        let hit = m.lookup("/found.txt").unwrap();
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().1, -1);
    }

    #[test]
    fn test_listing_reconciles() {
        let (d, mut m) = mirror();
        m.append_text("/a.txt", "a", 0).unwrap();
        std::fs::write(d.path().join("b.txt"), "b").unwrap();
        // Virtual entry whose host file vanished:
        m.add_entry("/ghost.txt", 0, FileFlags::READ_OK).unwrap();
        let names = m.list_dir("/").unwrap();
        assert!(names.contains(&"a.txt".to_string()));
        assert!(names.contains(&"b.txt".to_string()));
        assert!(!names.contains(&"ghost.txt".to_string()));
    }

    #[test]
    fn test_hidden_excluded_from_listing() {
        let (_d, mut m) = mirror();
        m.append_text("/seen.txt", "x", 0).unwrap();
        m.append_text("/secret.txt", "x", 0).unwrap();
        m.set_meta(
            "/secret.txt",
            None,
            Some(FileFlags::READ_OK | FileFlags::HIDDEN),
        )
        .unwrap();
        let names = m.list_dir("/").unwrap();
        assert!(names.contains(&"seen.txt".to_string()));
        assert!(!names.contains(&"secret.txt".to_string()));
    }

    #[test]
    fn test_mkdir_rename() {
        let (_d, mut m) = mirror();
        m.make_dir("/lib", 1).unwrap();
        m.append_text("/lib/x.t", "int a;", 1).unwrap();
        m.rename_file("/lib/x.t", "/lib/y.t", 1).unwrap();
        assert!(m.lookup("/lib/x.t").unwrap().is_none());
        assert_eq!(m.read_text("/lib/y.t").unwrap(), "int a;");
    }

    #[test]
    fn test_for_each_entry_preorder() {
        let (_d, mut m) = mirror();
        m.make_dir("/w", 0).unwrap();
        m.append_text("/w/f.txt", "x", 0).unwrap();
        let mut seen = Vec::new();
        m.for_each_entry(|p, _, _| seen.push(p.to_string()));
        let wi = seen.iter().position(|p| p == "/w").unwrap();
        let fi = seen.iter().position(|p| p == "/w/f.txt").unwrap();
        assert!(wi < fi);
    }

    #[test]
    fn test_file_size() {
        let (_d, mut m) = mirror();
        m.append_text("/s.txt", "12345", 0).unwrap();
        assert_eq!(m.file_size("/s.txt").unwrap(), 5);
        m.make_dir("/dir", 0).unwrap();
        assert_eq!(m.file_size("/dir").unwrap(), -2);
        assert!(m.file_size("/none").is_err());
    }
}
