//! SQL files on disk as units of work.
//!
//! Every `*.sql` file in the directory is one unit named after its file
//! stem; files run in file-name order. A file may be split with marker
//! comments:
//!
//! ```sql
//! -- migrate:up
//! CREATE TABLE users (id INTEGER PRIMARY KEY);
//! -- migrate:down
//! DROP TABLE users;
//! ```
//!
//! `-- seed:up`, `-- +up` and a bare `-- up` are accepted as well. A file
//! without markers is entirely `up`.

use super::{ListedUnit, UnitContext, UnitOfWork, UnitSource};
use crate::core::Result;
use crate::storage::check_syntax;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, event};

lazy_static! {
    static ref SECTION_MARKER: Regex =
        Regex::new(r"(?i)^--\s*(?:migrate:|seed:|\+)?\s*(up|down)\s*$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlUnit {
    name: String,
    up: String,
    down: Option<String>,
}

impl SqlUnit {
    /// Parse and syntax-check a unit file body.
    pub fn parse(name: impl Into<String>, body: &str) -> std::result::Result<Self, String> {
        let (up, down) = split_sections(body)?;

        let up_count = check_syntax(&up).map_err(|e| format!("up section: {}", e))?;
        if up_count == 0 {
            return Err("up section has no statements".into());
        }
        if let Some(down) = &down {
            check_syntax(down).map_err(|e| format!("down section: {}", e))?;
        }

        Ok(Self {
            name: name.into(),
            up,
            down,
        })
    }

    pub fn up_sql(&self) -> &str {
        &self.up
    }

    pub fn down_sql(&self) -> Option<&str> {
        self.down.as_deref()
    }
}

fn split_sections(body: &str) -> std::result::Result<(String, Option<String>), String> {
    let mut up: Option<Vec<&str>> = None;
    let mut down: Option<Vec<&str>> = None;
    let mut current: Option<&str> = None;
    let mut saw_marker = false;
    let mut preamble: Vec<&str> = Vec::new();

    for line in body.lines() {
        if let Some(caps) = SECTION_MARKER.captures(line.trim()) {
            saw_marker = true;
            let section = if caps[1].eq_ignore_ascii_case("up") { "up" } else { "down" };
            let slot = if section == "up" { &mut up } else { &mut down };
            if slot.is_some() {
                return Err(format!("duplicate {} section", section));
            }
            *slot = Some(Vec::new());
            current = Some(section);
            continue;
        }

        match current {
            Some("up") => up.get_or_insert_with(Vec::new).push(line),
            Some(_) => down.get_or_insert_with(Vec::new).push(line),
            None => preamble.push(line),
        }
    }

    if !saw_marker {
        return Ok((body.to_string(), None));
    }

    let stray = preamble.iter().map(|l| l.trim()).any(|l| !l.is_empty() && !l.starts_with("--"));
    if stray {
        return Err("statements outside of an up/down section".into());
    }

    let up = up.ok_or_else(|| "missing up section".to_string())?;
    Ok((up.join("\n"), down.map(|lines| lines.join("\n"))))
}

#[async_trait]
impl UnitOfWork for SqlUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn up(&self, ctx: &UnitContext) -> Result<()> {
        ctx.adapter.execute(&self.up).await.map(|_| ())
    }

    fn has_down(&self) -> bool {
        self.down.as_deref().is_some_and(|sql| !sql.trim().is_empty())
    }

    async fn down(&self, ctx: &UnitContext) -> Result<()> {
        match &self.down {
            Some(sql) if !sql.trim().is_empty() => ctx.adapter.execute(sql).await.map(|_| ()),
            _ => Ok(()),
        }
    }
}

/// Lists `*.sql` files of one directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn is_sql_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("sql"))
}

#[async_trait]
impl UnitSource for DirectorySource {
    fn describe(&self) -> String {
        format!("directory '{}'", self.dir.display())
    }

    async fn list(&self) -> Result<Vec<ListedUnit>> {
        let mut read_dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                event!(Level::WARN, dir = %self.dir.display(), "unit directory does not exist");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && is_sql_file(&path) {
                files.push(path);
            }
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut listed = Vec::with_capacity(files.len());
        for path in files {
            let origin = path.display().to_string();
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| origin.clone());

            let body = match tokio::fs::read_to_string(&path).await {
                Ok(body) => body,
                Err(err) => {
                    listed.push(ListedUnit::failed(name, origin, err.to_string()));
                    continue;
                }
            };

            match SqlUnit::parse(name.clone(), &body) {
                Ok(unit) => listed.push(ListedUnit::loaded(origin, Arc::new(unit))),
                Err(reason) => listed.push(ListedUnit::failed(name, origin, reason)),
            }
        }
        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_sections_are_split() {
        let unit = SqlUnit::parse(
            "001_users",
            "-- migrate:up\nCREATE TABLE users (id INTEGER);\n-- migrate:down\nDROP TABLE users;\n",
        )
        .unwrap();
        assert!(unit.up_sql().contains("CREATE TABLE"));
        assert!(unit.down_sql().unwrap().contains("DROP TABLE"));
        assert!(unit.has_down());
    }

    #[test]
    fn test_file_without_markers_is_up_only() {
        let unit = SqlUnit::parse("seed", "INSERT INTO users (id) VALUES (1);").unwrap();
        assert!(!unit.has_down());
    }

    #[test]
    fn test_rejected_bodies() {
        let cases = [
            ("SELECT 1;\n-- up\nSELECT 2;", "outside"),
            ("-- up\nSELECT 1;\n-- up\nSELECT 2;", "duplicate up"),
            ("-- down\nDROP TABLE t;", "missing up"),
            ("-- up\n-- nothing here\n", "no statements"),
            ("-- up\nCREATE TABLE (;", "up section"),
        ];
        for (body, expected) in cases {
            let err = SqlUnit::parse("bad", body).unwrap_err();
            assert!(err.contains(expected), "{} -> {}", body, err);
        }
    }

    #[tokio::test]
    async fn test_directory_listing_is_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("002_b.sql"), "CREATE TABLE b (id INTEGER);").unwrap();
        fs::write(dir.path().join("001_a.SQL"), "CREATE TABLE a (id INTEGER);").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        fs::write(dir.path().join("003_c.sql"), "-- up\nNOT SQL AT ALL").unwrap();

        let listed = DirectorySource::new(dir.path()).list().await.unwrap();
        let names: Vec<_> = listed.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["001_a", "002_b", "003_c"]);
        assert!(listed[0].unit.is_ok());
        assert!(listed[2].unit.is_err());
    }

    #[tokio::test]
    async fn test_missing_directory_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let source = DirectorySource::new(dir.path().join("absent"));
        assert!(source.list().await.unwrap().is_empty());
    }
}
