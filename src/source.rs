// Input source handling: direct files, glob patterns, and archive members.
// An archive member is addressed by its exact name inside a zip container;
// the container is opened per source and released before the ingest returns.

use std::fs::File;
use std::io::{Cursor, Read};

// One input file of a table spec. If `container` is set, `path` names a
// member inside that zip archive instead of a filesystem path.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    pub path: String,
    pub container: Option<String>,
}

impl FileInfo {
    pub fn plain(path: &str) -> Self {
        Self {
            path: path.to_string(),
            container: None,
        }
    }
}

// One per-row extractor for tree ingest. A trailing '?' on the path marks
// the select as optional; `name` renames the extracted field.
#[derive(Debug, Clone, Default)]
pub struct Select {
    pub path: String,
    pub name: Option<String>,
}

// Open a source for reading. Archive members are decompressed into memory,
// which keeps the zip handle lifetime out of the caller.
pub fn open_source(
    info: &FileInfo,
) -> Result<Box<dyn Read>, Box<dyn std::error::Error + Send + Sync>> {
    match &info.container {
        None => {
            let f = File::open(&info.path)
                .map_err(|e| format!("{}: opening {}", e, info.path))?;
            Ok(Box::new(f))
        }
        Some(container) => {
            let f = File::open(container)
                .map_err(|e| format!("{}: opening {}", e, container))?;
            let mut archive = zip::ZipArchive::new(f)
                .map_err(|e| format!("{}: reading archive {}", e, container))?;
            let mut member = archive
                .by_name(&info.path)
                .map_err(|_| format!("could not find {} in {}", info.path, container))?;
            let mut buf = Vec::new();
            member
                .read_to_end(&mut buf)
                .map_err(|e| format!("{}: reading {} from {}", e, info.path, container))?;
            Ok(Box::new(Cursor::new(buf)))
        }
    }
}

// Read a source fully into a string (tree ingest parses whole documents).
pub fn read_source_string(
    info: &FileInfo,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let mut r = open_source(info)?;
    let mut s = String::new();
    r.read_to_string(&mut s)
        .map_err(|e| format!("{}: reading {}", e, info.path))?;
    Ok(s)
}

// Expand the plan's file entries into concrete sources. Plain paths may be
// glob patterns and must match at least one file; container members are
// taken verbatim since globs cannot see inside an archive.
pub fn expand_sources(
    files: &[FileInfo],
) -> Result<Vec<FileInfo>, Box<dyn std::error::Error + Send + Sync>> {
    let mut sources = Vec::new();
    for info in files {
        if info.container.is_some() {
            sources.push(info.clone());
            continue;
        }
        let mut matched = 0usize;
        for entry in glob::glob(&info.path).map_err(|e| format!("{}: bad pattern", e))? {
            let path = entry.map_err(|e| format!("{}: expanding {}", e, info.path))?;
            sources.push(FileInfo::plain(&path.to_string_lossy()));
            matched += 1;
        }
        if matched == 0 {
            return Err(format!("file {} not found", info.path).into());
        }
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn plain_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hello").unwrap();
        let info = FileInfo::plain(&path.to_string_lossy());
        assert_eq!(read_source_string(&info).unwrap(), "hello");
    }

    #[test]
    fn missing_file_fails() {
        let info = FileInfo::plain("no_such_file.txt");
        assert!(open_source(&info).is_err());
    }

    #[test]
    fn archive_member_by_exact_name() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("data.zip");
        let f = File::create(&zip_path).unwrap();
        let mut w = zip::ZipWriter::new(f);
        w.start_file("inner.csv", zip::write::SimpleFileOptions::default())
            .unwrap();
        w.write_all(b"a;b\n1;2\n").unwrap();
        w.finish().unwrap();

        let info = FileInfo {
            path: "inner.csv".to_string(),
            container: Some(zip_path.to_string_lossy().to_string()),
        };
        assert_eq!(read_source_string(&info).unwrap(), "a;b\n1;2\n");

        let missing = FileInfo {
            path: "other.csv".to_string(),
            container: Some(zip_path.to_string_lossy().to_string()),
        };
        let err = read_source_string(&missing).unwrap_err().to_string();
        assert!(err.contains("could not find other.csv"));
    }

    #[test]
    fn glob_must_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t1.csv"), "x\n").unwrap();
        std::fs::write(dir.path().join("t2.csv"), "y\n").unwrap();
        let patt = dir.path().join("t*.csv");
        let sources =
            expand_sources(&[FileInfo::plain(&patt.to_string_lossy())]).unwrap();
        assert_eq!(sources.len(), 2);

        let bad = dir.path().join("z*.csv");
        let err = expand_sources(&[FileInfo::plain(&bad.to_string_lossy())])
            .unwrap_err()
            .to_string();
        assert!(err.contains("not found"));
    }
}
