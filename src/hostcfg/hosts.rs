//! Hosts-file model.
//!
//! A minimal line-preserving parser for `/etc/hosts`: entries the tool did
//! not create pass through untouched, including comments and spacing-only
//! lines. Mutation is whole-file read-then-write; the file is only ever
//! written by the elevated peer (or a root-run CLI), one writer at a time.

use std::path::{Path, PathBuf};

use crate::errors::KubenestResult;

pub const HOSTS_PATH: &str = "/etc/hosts";

#[derive(Debug, Clone)]
enum Line {
    /// `address name [name...]`, with an optional trailing comment.
    Entry {
        address: String,
        names: Vec<String>,
        comment: Option<String>,
    },
    /// Comments, blanks, anything unparseable — preserved verbatim.
    Other(String),
}

fn parse_line(raw: &str) -> Line {
    let (content, comment) = match raw.find('#') {
        Some(idx) => (&raw[..idx], Some(raw[idx..].to_string())),
        None => (raw, None),
    };
    let mut parts = content.split_whitespace();
    let Some(address) = parts.next() else {
        return Line::Other(raw.to_string());
    };
    let names: Vec<String> = parts.map(str::to_string).collect();
    if names.is_empty() {
        return Line::Other(raw.to_string());
    }
    Line::Entry {
        address: address.to_string(),
        names,
        comment,
    }
}

/// In-memory hosts file.
#[derive(Debug)]
pub struct HostsFile {
    path: PathBuf,
    lines: Vec<Line>,
}

impl HostsFile {
    /// Load from `path`; a missing file starts empty.
    pub fn load(path: &Path) -> KubenestResult<HostsFile> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(HostsFile {
            path: path.to_path_buf(),
            lines: content.lines().map(parse_line).collect(),
        })
    }

    /// Names currently bound to `address`, in file order.
    pub fn list_by_address(&self, address: &str) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                Line::Entry {
                    address: a, names, ..
                } if a == address => Some(names.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Bind `names` to `address` (set union). A name already bound to a
    /// different address moves to the new one.
    pub fn add(&mut self, address: &str, names: &[String]) {
        self.remove(names);
        let existing = self.lines.iter_mut().find_map(|line| match line {
            Line::Entry {
                address: a, names, ..
            } if a == address => Some(names),
            _ => None,
        });
        match existing {
            Some(bound) => {
                for name in names {
                    if !bound.iter().any(|n| n == name) {
                        bound.push(name.clone());
                    }
                }
            }
            None => {
                if !names.is_empty() {
                    self.lines.push(Line::Entry {
                        address: address.to_string(),
                        names: names.to_vec(),
                        comment: None,
                    });
                }
            }
        }
    }

    /// Unbind `names` wherever they appear (set difference). Absent names
    /// are a no-op; entries left without names disappear.
    pub fn remove(&mut self, names: &[String]) {
        for line in &mut self.lines {
            if let Line::Entry { names: bound, .. } = line {
                bound.retain(|n| !names.iter().any(|r| r == n));
            }
        }
        self.lines.retain(|line| {
            !matches!(line, Line::Entry { names, .. } if names.is_empty())
        });
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry {
                    address,
                    names,
                    comment,
                } => {
                    out.push_str(address);
                    for name in names {
                        out.push(' ');
                        out.push_str(name);
                    }
                    if let Some(comment) = comment {
                        out.push(' ');
                        out.push_str(comment.trim_end());
                    }
                }
                Line::Other(raw) => out.push_str(raw),
            }
            out.push('\n');
        }
        out
    }

    /// Write the whole file back.
    pub fn save(&self) -> KubenestResult<()> {
        std::fs::write(&self.path, self.render())?;
        Ok(())
    }
}

/// The domain mutation shared by the elevated server and the root-run CLI
/// path. With an empty `domains` list this lists (or, when removing, clears)
/// the names bound to `address`. Returns the names bound to `address` after
/// the mutation.
pub fn apply_domains(
    file: &mut HostsFile,
    address: &str,
    domains: &[String],
    remove: bool,
) -> KubenestResult<Vec<String>> {
    let mut requested = domains.to_vec();
    if requested.is_empty() {
        requested = file.list_by_address(address);
        if !remove {
            return Ok(requested);
        }
    }
    if remove {
        file.remove(&requested);
    } else {
        file.add(address, &requested);
    }
    file.save()?;
    Ok(file.list_by_address(address))
}
