// The embedded store and the ingest contract: ensure a table exists with
// the right columns, then fill it inside one transaction. Also binds the
// sql/error section lambdas for template rendering.

use crate::logger;
use crate::progress::ProgressManager;
use crate::source::{self, FileInfo, Select};
use crate::template::{self, Context, Lambdas, Value};
use crate::tree::{self, TreeKind};
use regex::Regex;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

pub struct Musql {
    db: Connection,
    progress: ProgressManager,
}

enum TableState {
    Missing,
    Matching,
    Mismatched,
}

impl Musql {
    // Open an in-memory store.
    pub fn new_db() -> Result<Musql, Box<dyn std::error::Error + Send + Sync>> {
        let db = Connection::open_in_memory().map_err(|e| format!("{}: opening store", e))?;
        Ok(Musql {
            db,
            progress: ProgressManager::new(false),
        })
    }

    // Open a persistent store at the given path.
    pub fn open_db(filename: &str) -> Result<Musql, Box<dyn std::error::Error + Send + Sync>> {
        let db = Connection::open(filename)
            .map_err(|e| format!("{}: opening store {}", e, filename))?;
        Ok(Musql {
            db,
            progress: ProgressManager::new(false),
        })
    }

    pub fn set_progress(&mut self, progress: ProgressManager) {
        self.progress = progress;
    }

    // Probe for an existing table and compare its column list.
    fn have_table(&self, tablename: &str, header: &[String]) -> TableState {
        let stmt = match self
            .db
            .prepare(&format!("select * from \"{}\" limit 1", tablename))
        {
            Ok(s) => s,
            Err(_) => return TableState::Missing,
        };
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        if verify_header(&columns, header).is_ok() {
            TableState::Matching
        } else {
            TableState::Mismatched
        }
    }

    // Ensure the table exists with exactly the given columns: truncate a
    // matching table, drop and recreate a mismatched one.
    fn ensure_table(
        &self,
        tablename: &str,
        header: &[String],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if header.is_empty() {
            return Err(format!("creating {}: empty header", tablename).into());
        }
        match self.have_table(tablename, header) {
            TableState::Matching => {
                self.db
                    .execute(&format!("delete from \"{}\"", tablename), [])
                    .map_err(|e| format!("{}: deleting rows", e))?;
                return Ok(());
            }
            TableState::Mismatched => {
                self.db
                    .execute(&format!("drop table \"{}\"", tablename), [])
                    .map_err(|e| format!("{}: dropping table {}", e, tablename))?;
            }
            TableState::Missing => {}
        }
        let columns: Vec<String> = header.iter().map(|c| format!("\"{}\"", c)).collect();
        self.db
            .execute(
                &format!("create table \"{}\" ( {} )", tablename, columns.join(" , ")),
                [],
            )
            .map_err(|e| format!("{}: creating {}", e, tablename))?;
        Ok(())
    }

    // Load delimited files, inferring the header from the first file.
    pub fn add_csv(
        &mut self,
        tablename: &str,
        files: &[FileInfo],
        sep: Option<char>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.add_csv_files(tablename, files, sep, None)
    }

    // Load delimited files with an explicit header; every line is data.
    pub fn add_csv_with_header(
        &mut self,
        tablename: &str,
        files: &[FileInfo],
        sep: Option<char>,
        header: &[String],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.add_csv_files(tablename, files, sep, Some(header))
    }

    fn add_csv_files(
        &mut self,
        tablename: &str,
        files: &[FileInfo],
        sep: Option<char>,
        inheader: Option<&[String]>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let sep = sep.unwrap_or(';');
        if !sep.is_ascii() {
            return Err(format!("separator {:?} is not a single-byte character", sep).into());
        }
        let sources = source::expand_sources(files)?;
        logger::debug(&format!(
            "AddCsv: table {} from {} sources",
            tablename,
            sources.len()
        ));

        let file_header = inheader.is_none();
        let header: Vec<String> = match inheader {
            Some(h) => h.to_vec(),
            None => match sources.first() {
                Some(first) => read_csv_header(first, sep)?,
                // nothing to infer from and nothing to load
                None => return Ok(()),
            },
        };
        self.ensure_table(tablename, &header)?;
        if sources.is_empty() {
            return Ok(());
        }

        let tx = self.db.transaction()?;
        {
            let mut stmt = tx
                .prepare(&insert_sql(tablename, header.len()))
                .map_err(|e| format!("{} preparing insert", e))?;
            for info in &sources {
                let bar = self
                    .progress
                    .new_file_bar(&info.path, &format!("Loading {}", basename(&info.path)));
                add_csv_source(&mut stmt, info, &header, sep, file_header, bar.as_ref())?;
                if let Some(b) = bar {
                    b.finish();
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    // Load XML files: rows per xpath, fields per select.
    pub fn add_xml(
        &mut self,
        tablename: &str,
        files: &[FileInfo],
        xpath_str: &str,
        selects: &[Select],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.add_tree(tablename, files, xpath_str, selects, TreeKind::Xml)
    }

    // Load JSON files with the same row/select contract as XML.
    pub fn add_json(
        &mut self,
        tablename: &str,
        files: &[FileInfo],
        xpath_str: &str,
        selects: &[Select],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.add_tree(tablename, files, xpath_str, selects, TreeKind::Json)
    }

    fn add_tree(
        &mut self,
        tablename: &str,
        files: &[FileInfo],
        xpath_str: &str,
        selects: &[Select],
        kind: TreeKind,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let first = files
            .first()
            .ok_or_else(|| format!("no files for table {}", tablename))?;
        logger::debug(&format!(
            "AddTree: table {} from {} files, rows {}",
            tablename,
            files.len(),
            xpath_str
        ));
        // The first file's sorted field union defines the table.
        let (header, _) = tree::read_tree_file(first, xpath_str, selects, kind)?;
        self.ensure_table(tablename, &header)?;

        let tx = self.db.transaction()?;
        {
            let mut stmt = tx
                .prepare(&insert_sql(tablename, header.len()))
                .map_err(|e| format!("{} preparing insert", e))?;
            for info in files {
                let (nheader, data) = tree::read_tree_file(info, xpath_str, selects, kind)?;
                verify_header(&header, &nheader)?;
                for d in data {
                    let row: Vec<String> = header
                        .iter()
                        .map(|h| d.get(h).cloned().unwrap_or_default())
                        .collect();
                    stmt.execute(rusqlite::params_from_iter(row.iter()))
                        .map_err(|e| format!("{}: fill table from {}", e, info.path))?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    // Walk a directory into a (fullpath, filename, content) table.
    pub fn add_files(
        &mut self,
        tablename: &str,
        root: &str,
        with_content: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let header: Vec<String> = ["fullpath", "filename", "content"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        logger::debug(&format!("AddFiles: table {} from {}", tablename, root));
        self.ensure_table(tablename, &header)?;

        let tx = self.db.transaction()?;
        {
            let mut stmt = tx
                .prepare(&insert_sql(tablename, header.len()))
                .map_err(|e| format!("{} preparing insert", e))?;
            walk_dir(&mut stmt, Path::new(root), with_content)?;
        }
        tx.commit()?;
        Ok(())
    }

    // Materialize the parameter map as a (paramkey, value) table.
    pub fn add_parameters(
        &mut self,
        tablename: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let header: Vec<String> = ["paramkey", "value"].iter().map(|s| s.to_string()).collect();
        self.ensure_table(tablename, &header)?;

        let tx = self.db.transaction()?;
        {
            let mut stmt = tx
                .prepare(&insert_sql(tablename, header.len()))
                .map_err(|e| format!("{} preparing insert", e))?;
            for (key, value) in parameters {
                stmt.execute(params![key, value])
                    .map_err(|e| format!("{}: storing parameter {}", e, key))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // Mount an external database file under an alias.
    pub fn add_database(
        &mut self,
        fname: &str,
        name: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.db
            .execute(&format!("attach '{}' as {}", fname, name), [])
            .map_err(|e| format!("{}: attaching {}", e, fname))?;
        Ok(())
    }

    // Execute a SQL file's contents as one batch.
    pub fn apply_sql(
        &mut self,
        fname: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let text = std::fs::read_to_string(fname)
            .map_err(|e| format!("{}: reading {}", e, fname))?;
        logger::debug(&format!("ApplySql: executing {}", fname));
        self.db
            .execute_batch(&text)
            .map_err(|e| format!("{}: executing {}", e, fname))?;
        Ok(())
    }

    // Run a statement and return its column list plus rows of text cells.
    pub fn query_rows(
        &self,
        stmt_str: &str,
    ) -> Result<(Vec<String>, Vec<HashMap<String, String>>), Box<dyn std::error::Error + Send + Sync>>
    {
        let mut stmt = self
            .db
            .prepare(stmt_str)
            .map_err(|e| format!("{}: {}", e, stmt_str))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt
            .query([])
            .map_err(|e| format!("{}: {}", e, stmt_str))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut map = HashMap::new();
            for (i, name) in columns.iter().enumerate() {
                let v: rusqlite::types::Value = row.get(i)?;
                map.insert(name.clone(), value_to_text(v));
            }
            out.push(map);
        }
        Ok((columns, out))
    }

    // Bind a query's rows into the render context along with the `<var>?`
    // non-empty indicator.
    fn bind_query(
        &self,
        ctx: &mut Context,
        resultvar: &str,
        stmt_str: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (_, rows) = self.query_rows(stmt_str)?;
        ctx.set(&format!("{}?", resultvar), Value::Bool(!rows.is_empty()));
        ctx.set(resultvar, Value::Rows(rows));
        Ok(())
    }

    // Seed the context with every non-internal table and view.
    fn tables_to_context(
        &self,
        ctx: &mut Context,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut names = Vec::new();
        {
            let mut stmt = self.db.prepare("select tbl_name from sqlite_master")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(0)?;
                if name.is_empty() || name.starts_with('_') {
                    // leading underscore marks scratch tables/views
                    continue;
                }
                names.push(name);
            }
        }
        for name in names {
            self.bind_query(ctx, &name, &format!("select * from \"{}\"", name))?;
        }
        Ok(())
    }

    // Render a template to the given writer with strict missing-variable
    // checking and the sql/error lambdas bound.
    pub fn run_template(
        &self,
        template_src: &str,
        out: &mut dyn Write,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let tpl = template::parse(template_src)
            .map_err(|e| format!("{} (parsing the template)", e))?;
        let mut ctx = Context::new(true);
        self.tables_to_context(&mut ctx)?;
        let mut lambdas = SqlLambdas::new(self);
        let rendered = tpl
            .render(&mut ctx, &mut lambdas)
            .map_err(|e| format!("{} (executing the template)", e))?;
        out.write_all(rendered.as_bytes())
            .map_err(|e| format!("{}: writing output", e))?;
        Ok(())
    }
}

// The statement shapes the sql lambda dispatches on. Detection is
// case-insensitive and matched anywhere in the rendered statement; the
// fragment shape requires a trailing newline, so an unterminated one-line
// fragment falls through to generic query execution.
struct SqlLambdas<'a> {
    engine: &'a Musql,
    view_re: Regex,
    var_re: Regex,
    insert_re: Regex,
    fragment_re: Regex,
}

impl<'a> SqlLambdas<'a> {
    fn new(engine: &'a Musql) -> Self {
        let view_re = Regex::new(r"(?i)create *(view|table) *([^ ]*) as")
            .expect("valid view regex");
        let var_re = Regex::new(r"(?i)create *var *([^ ]*) *as *((?s:.*))$")
            .expect("valid var regex");
        let insert_re = Regex::new(r"(?i)insert into").expect("valid insert regex");
        let fragment_re = Regex::new(r"(?i)with *fragment *([^ ]*) as[ \r\n]*((?s:.*))[\r\n]+$")
            .expect("valid fragment regex");
        Self {
            engine,
            view_re,
            var_re,
            insert_re,
            fragment_re,
        }
    }

    fn run_sql(
        &mut self,
        raw: &str,
        ctx: &mut Context,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let stmt = template::render_str(raw, ctx, self)?;
        if stmt.is_empty() {
            return Ok(());
        }
        let db = &self.engine.db;

        if let Some(caps) = self.view_re.captures(&stmt) {
            let kind = caps[1].to_string();
            let name = caps[2].to_string();
            // recreate, then read the object back into a variable named
            // after it
            db.execute(&format!("drop {} if exists \"{}\"", kind, name), [])
                .map_err(|e| format!("{}: dropping {}", e, name))?;
            db.execute_batch(&stmt)
                .map_err(|e| format!("{}: creating {}", e, name))?;
            return self
                .engine
                .bind_query(ctx, &name, &format!("select * from {}", name));
        }
        if let Some(caps) = self.var_re.captures(&stmt) {
            let name = caps[1].to_string();
            let body = caps[2].to_string();
            return self.engine.bind_query(ctx, &name, &body);
        }
        if self.insert_re.is_match(&stmt) {
            db.execute_batch(&stmt)
                .map_err(|e| format!("{}: executing insert", e))?;
            return Ok(());
        }
        if let Some(caps) = self.fragment_re.captures(&stmt) {
            // bind the raw fragment body without touching the store
            ctx.set(&caps[1], Value::Text(caps[2].to_string()));
            return Ok(());
        }
        self.engine.bind_query(ctx, "result", &stmt)
    }
}

impl<'a> Lambdas for SqlLambdas<'a> {
    fn expand(
        &mut self,
        name: &str,
        raw: &str,
        ctx: &mut Context,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        match name {
            "sql" => {
                self.run_sql(raw, ctx)?;
                Ok(Some(String::new()))
            }
            "error" => {
                let msg = template::render_str(raw, ctx, self)?;
                Err(msg.into())
            }
            _ => Ok(None),
        }
    }
}

// Order-sensitive, element-wise header comparison.
fn verify_header(
    collist1: &[String],
    collist2: &[String],
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if collist1.len() != collist2.len()
        || collist1.iter().zip(collist2.iter()).any(|(a, b)| a != b)
    {
        return Err(format!(
            "header mismatch: >{}< >{}<",
            collist1.join(";"),
            collist2.join(";")
        )
        .into());
    }
    Ok(())
}

fn insert_sql(tablename: &str, width: usize) -> String {
    format!(
        "insert into \"{}\" values ( {} )",
        tablename,
        vec!["?"; width].join(" , ")
    )
}

// Read the header line of a delimited source.
fn read_csv_header(
    info: &FileInfo,
    sep: char,
) -> Result<Vec<String>, Box<dyn std::error::Error + Send + Sync>> {
    let reader = source::open_source(info)?;
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(sep as u8)
        .has_headers(false)
        .from_reader(reader);
    let first = rdr
        .records()
        .next()
        .ok_or_else(|| format!("reading header of {}: empty file", info.path))?
        .map_err(|e| format!("{}: reading header of {}", e, info.path))?;
    Ok(first.iter().map(|s| s.to_string()).collect())
}

// Fill the table from one delimited source. With `file_header` the first
// line is verified against the table header and discarded.
fn add_csv_source(
    stmt: &mut rusqlite::Statement,
    info: &FileInfo,
    header: &[String],
    sep: char,
    file_header: bool,
    bar: Option<&indicatif::ProgressBar>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let reader = source::open_source(info)?;
    let reader: Box<dyn Read> = match bar {
        Some(b) => Box::new(b.wrap_read(reader)),
        None => reader,
    };
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(sep as u8)
        .has_headers(false)
        .from_reader(reader);
    let mut records = rdr.records();

    if file_header {
        let first = records
            .next()
            .ok_or_else(|| format!("reading header of {}: empty file", info.path))?
            .map_err(|e| format!("{}: reading header of {}", e, info.path))?;
        let row: Vec<String> = first.iter().map(|s| s.to_string()).collect();
        verify_header(header, &row)?;
    }

    for rec in records {
        let rec = rec.map_err(|e| format!("{}: fill table from {}", e, info.path))?;
        stmt.execute(rusqlite::params_from_iter(rec.iter()))
            .map_err(|e| format!("{}: fill table from {}", e, info.path))?;
    }
    Ok(())
}

// Insert every regular file below `dir` in lexical order.
fn walk_dir(
    stmt: &mut rusqlite::Statement,
    dir: &Path,
    with_content: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| format!("{}: walking {}", e, dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("{}: walking {}", e, dir.display()))?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            walk_dir(stmt, &path, with_content)?;
            continue;
        }
        let content = if with_content {
            let bytes = std::fs::read(&path)
                .map_err(|e| format!("{}: reading {}", e, path.display()))?;
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            String::new()
        };
        let fullpath = path.to_string_lossy().into_owned();
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        stmt.execute(params![fullpath, filename, content])
            .map_err(|e| format!("{}: storing file info for {}", e, filename))?;
    }
    Ok(())
}

fn value_to_text(v: rusqlite::types::Value) -> String {
    match v {
        rusqlite::types::Value::Null => String::new(),
        rusqlite::types::Value::Integer(i) => i.to_string(),
        rusqlite::types::Value::Real(f) => f.to_string(),
        rusqlite::types::Value::Text(s) => s,
        rusqlite::types::Value::Blob(b) => String::from_utf8_lossy(&b).into_owned(),
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string()
}
