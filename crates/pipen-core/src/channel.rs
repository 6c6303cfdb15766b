//! The tabular container passed between processes (§3 "Channel"). Rows are
//! drawn from upstream processes' output tables, concatenated horizontally
//! in declaration order.
//!
//! Grounded in `original_source/pipen/channel.py`: `Channel::create` mirrors
//! `Channel.create` (auto-tupling bare scalars into single-column rows),
//! `from_glob`/`from_pairs`/`from_csv` mirror the Python creators, and
//! `expand_dir`/`collapse_files` mirror the `expand_dir`/`collapse_files`
//! verbs registered there.

use anyhow::{anyhow, bail, Context as _, Result};
use serde_json::Value as Json;
use std::path::{Path, PathBuf};

/// A single table cell. Most pipelines only ever see strings and numbers;
/// this wraps `serde_json::Value` so the same value flows unchanged into
/// template rendering contexts.
pub type Cell = Json;

/// A rectangular table of named columns.
#[derive(Debug, Clone, Default)]
pub struct Channel {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Channel {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn ncol(&self) -> usize {
        self.columns.len()
    }

    pub fn nrow(&self) -> usize {
        self.rows.len()
    }

    fn col_index(&self, col: &ColumnRef) -> Result<usize> {
        match col {
            ColumnRef::Index(i) => {
                if *i < self.columns.len() {
                    Ok(*i)
                } else {
                    bail!("column index {i} out of range (channel has {} columns)", self.columns.len())
                }
            }
            ColumnRef::Name(name) => self
                .columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| anyhow!("no such column {name:?}")),
        }
    }

    /// `Channel.create`: wrap a flat list of scalars as a single-column
    /// channel, or a list of equal-length row vectors as a multi-column
    /// channel.
    pub fn create(values: Vec<Vec<Cell>>) -> Self {
        if values.is_empty() {
            return Self::empty();
        }
        let ncol = values[0].len();
        let columns = (0..ncol).map(|i| format!("V{i}")).collect();
        Self {
            columns,
            rows: values,
        }
    }

    pub fn from_scalars(values: Vec<Cell>) -> Self {
        Self::create(values.into_iter().map(|v| vec![v]).collect())
    }

    /// `Channel.from_glob`: glob `pattern`, optionally filtered by file
    /// type, sorted by name/mtime/size, optionally reversed.
    pub fn from_glob(pattern: &str, ftype: FileType, sortby: SortBy, reverse: bool) -> Result<Self> {
        let mut matches: Vec<PathBuf> = glob::glob(pattern)
            .with_context(|| format!("invalid glob pattern {pattern:?}"))?
            .filter_map(|r| r.ok())
            .filter(|p| ftype.matches(p))
            .collect();

        sortby.sort(&mut matches)?;
        if reverse {
            matches.reverse();
        }

        Ok(Self::from_scalars(
            matches
                .into_iter()
                .map(|p| Json::String(p.to_string_lossy().into_owned()))
                .collect(),
        ))
    }

    /// `Channel.from_pairs`: glob then pair up consecutive matches into a
    /// two-column channel (mate-pair files).
    pub fn from_pairs(pattern: &str, ftype: FileType, sortby: SortBy, reverse: bool) -> Result<Self> {
        let mates = Self::from_glob(pattern, ftype, sortby, reverse)?;
        let mut rows = Vec::with_capacity(mates.nrow() / 2);
        let mut iter = mates.rows.into_iter();
        while let (Some(a), Some(b)) = (iter.next(), iter.next()) {
            rows.push(vec![a[0].clone(), b[0].clone()]);
        }
        Ok(Self {
            columns: vec!["V0".into(), "V1".into()],
            rows,
        })
    }

    /// `Channel.from_csv`: read a delimited file, using the header row as
    /// column names.
    pub fn from_csv(path: impl AsRef<Path>, delimiter: u8) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .from_path(path.as_ref())
            .with_context(|| format!("opening {}", path.as_ref().display()))?;
        let columns = reader.headers()?.iter().map(str::to_owned).collect();
        let rows = reader
            .records()
            .map(|rec| {
                rec.map(|r| r.iter().map(|s| Json::String(s.to_owned())).collect())
                    .map_err(Into::into)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { columns, rows })
    }

    /// `expand_dir`: explode a single-row channel into one row per entry of
    /// the directory named in `col`, keeping the other columns fixed.
    pub fn expand_dir(&self, col: ColumnRef, pattern: &str, ftype: FileType, sortby: SortBy, reverse: bool) -> Result<Self> {
        if self.nrow() != 1 {
            bail!("can only expand_dir a single-row channel, got {} rows", self.nrow());
        }
        let idx = self.col_index(&col)?;
        let base = self.rows[0][idx]
            .as_str()
            .ok_or_else(|| anyhow!("expand_dir column is not a path"))?;
        let full_pattern = format!("{}/{}", base.trim_end_matches('/'), pattern);
        let expanded = Self::from_glob(&full_pattern, ftype, sortby, reverse)?;

        let mut rows = Vec::with_capacity(expanded.nrow());
        for expanded_row in &expanded.rows {
            let mut row = self.rows[0].clone();
            row[idx] = expanded_row[0].clone();
            rows.push(row);
        }
        Ok(Self {
            columns: self.columns.clone(),
            rows,
        })
    }

    /// `collapse_files`: collapse all rows to one, taking the longest
    /// common path prefix of `col` and row 0's values for every other
    /// column. Other rows' non-`col` values are discarded.
    pub fn collapse_files(&self, col: ColumnRef) -> Result<Self> {
        if self.nrow() == 0 {
            bail!("cannot collapse_files an empty channel");
        }
        let idx = self.col_index(&col)?;
        let paths: Vec<&str> = self
            .rows
            .iter()
            .map(|r| r[idx].as_str().ok_or_else(|| anyhow!("collapse_files column is not a path")))
            .collect::<Result<_>>()?;
        let common = common_path_prefix(&paths);

        let mut row = self.rows[0].clone();
        row[idx] = Json::String(common);
        Ok(Self {
            columns: self.columns.clone(),
            rows: vec![row],
        })
    }

    /// Horizontal concatenation of several channels' rows, in order. Row
    /// counts must match exactly, matching §4.7's tie-break rule.
    pub fn concat_horizontal(channels: &[Channel]) -> Result<Self> {
        let Some(first) = channels.first() else {
            return Ok(Self::empty());
        };
        let nrow = first.nrow();
        for c in channels {
            if c.nrow() != nrow {
                bail!(
                    "row count mismatch concatenating upstream channels: expected {nrow}, got {}",
                    c.nrow()
                );
            }
        }
        let mut columns = Vec::new();
        for c in channels {
            columns.extend(c.columns.iter().cloned());
        }
        let mut rows = vec![Vec::new(); nrow];
        for c in channels {
            for (i, row) in c.rows.iter().enumerate() {
                rows[i].extend(row.iter().cloned());
            }
        }
        Ok(Self { columns, rows })
    }
}

#[derive(Debug, Clone)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

impl From<usize> for ColumnRef {
    fn from(i: usize) -> Self {
        Self::Index(i)
    }
}

impl From<&str> for ColumnRef {
    fn from(s: &str) -> Self {
        Self::Name(s.to_owned())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum FileType {
    #[default]
    Any,
    File,
    Dir,
    Link,
}

impl FileType {
    fn matches(self, path: &Path) -> bool {
        match self {
            Self::Any => true,
            Self::File => path.is_file(),
            Self::Dir => path.is_dir(),
            Self::Link => path.symlink_metadata().map(|m| m.is_symlink()).unwrap_or(false),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum SortBy {
    #[default]
    Name,
    Mtime,
    Size,
}

impl SortBy {
    fn sort(self, paths: &mut [PathBuf]) -> Result<()> {
        match self {
            Self::Name => paths.sort(),
            Self::Mtime => paths.sort_by_key(|p| {
                std::fs::metadata(p)
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
            }),
            Self::Size => paths.sort_by_key(|p| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0)),
        }
        Ok(())
    }
}

fn common_path_prefix(paths: &[&str]) -> String {
    if paths.is_empty() {
        return String::new();
    }
    let mut common: &str = paths[0];
    for p in &paths[1..] {
        let max = common.chars().zip(p.chars()).take_while(|(a, b)| a == b).count();
        common = &common[..common.char_indices().nth(max).map(|(i, _)| i).unwrap_or(common.len())];
    }
    match Path::new(common).parent() {
        Some(parent) if !common.ends_with('/') => parent.to_string_lossy().into_owned(),
        _ => common.trim_end_matches('/').to_owned(),
    }
}

/// Row/column equality used by tests and by the scenario harness; not part
/// of the production comparison path (signatures compare rendered values,
/// not raw channels).
impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns && self.rows == other.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_auto_tuples_scalars() {
        let ch = Channel::from_scalars(vec![Json::from(1), Json::from(2), Json::from(3)]);
        assert_eq!(ch.nrow(), 3);
        assert_eq!(ch.ncol(), 1);
    }

    #[test]
    fn create_from_rows() {
        let ch = Channel::create(vec![vec![Json::from(1), Json::from("a")]]);
        assert_eq!(ch.nrow(), 1);
        assert_eq!(ch.ncol(), 2);
    }

    #[test]
    fn concat_horizontal_requires_matching_row_counts() {
        let a = Channel::from_scalars(vec![Json::from(1), Json::from(2)]);
        let b = Channel::from_scalars(vec![Json::from(1)]);
        assert!(Channel::concat_horizontal(&[a, b]).is_err());
    }

    #[test]
    fn concat_horizontal_preserves_order() {
        let a = Channel::from_scalars(vec![Json::from(1)]);
        let b = Channel::from_scalars(vec![Json::from("x")]);
        let combined = Channel::concat_horizontal(&[a, b]).unwrap();
        assert_eq!(combined.ncol(), 2);
        assert_eq!(combined.rows[0], vec![Json::from(1), Json::from("x")]);
    }

    #[test]
    fn collapse_files_takes_common_prefix() {
        let ch = Channel::create(vec![
            vec![Json::from("/a/b/x.txt")],
            vec![Json::from("/a/b/y.txt")],
            vec![Json::from("/a/c/z.txt")],
        ]);
        let collapsed = ch.collapse_files(0.into()).unwrap();
        assert_eq!(collapsed.nrow(), 1);
        assert_eq!(collapsed.rows[0][0], Json::String("/a".to_owned()));
    }
}
