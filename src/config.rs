// Directive parser and plan executor. A flat token stream (argument vector
// plus included ini files) is recognized by a fixed list of sub-parsers;
// each either advances the cursor past its directive or leaves it alone.
// The accumulated plan is then executed in fixed phase order: ingest,
// parameters, attaches, SQL files, templates.

use crate::engine::Musql;
use crate::logger;
use crate::progress::ProgressManager;
use crate::source::{FileInfo, Select};
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::Path;

// One table to materialize. `kind` is the declared file type (csv, xml,
// json, auto when unset); dispatch happens at execution time.
#[derive(Debug, Clone, Default)]
pub struct TableSpec {
    pub tablename: String,
    pub files: Vec<FileInfo>,
    pub kind: Option<String>,
    pub sep: Option<char>,
    pub header: Vec<String>,
    pub content: bool,
    pub xpath: Option<String>,
    pub selects: Vec<Select>,
}

#[derive(Debug, Clone)]
pub struct AttachSpec {
    pub file: String,
    pub alias: String,
}

// A template to render. `template` is the text, read eagerly at parse
// time; `outname` is a path or the literal "stdout".
#[derive(Debug, Clone)]
pub struct TemplateSpec {
    pub name: String,
    pub template: String,
    pub outname: String,
}

#[derive(Debug, Clone)]
struct ArgPart {
    basedir: String,
    argv: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Config {
    pub tables: Vec<TableSpec>,
    pub templates: Vec<TemplateSpec>,
    pub sqls: Vec<String>,
    pub dbname: Option<String>,
    pub params: HashMap<String, String>,
    pub attaches: Vec<AttachSpec>,
    parts: Vec<ArgPart>,
}

type SubParser = fn(
    &mut Config,
    &[String],
    usize,
    &str,
) -> Result<usize, Box<dyn std::error::Error + Send + Sync>>;

// Tried in order at every cursor position; order is fixed.
const SUB_PARSERS: &[SubParser] = &[
    Config::arg_source,
    Config::arg_template,
    Config::arg_select,
    Config::arg_param,
    Config::arg_sql,
    Config::arg_attach,
    Config::arg_ini,
    Config::arg_db,
    Config::arg_comment,
    Config::arg_empty,
];

// Resolve a token against the base directory of its parse part.
fn get_path(basedir: &str, fname: &str) -> String {
    if basedir == "." {
        return fname.to_string();
    }
    Path::new(basedir).join(fname).to_string_lossy().into_owned()
}

impl Config {
    // Recognize the whole token stream into a plan. Included ini files are
    // enqueued as new parse parts and processed in enqueue order.
    pub fn parse(argv: &[String]) -> Result<Config, Box<dyn std::error::Error + Send + Sync>> {
        let mut c = Config::default();
        c.parts = vec![ArgPart {
            basedir: ".".to_string(),
            argv: argv.to_vec(),
        }];

        let mut pi = 0usize;
        while pi < c.parts.len() {
            let argv = c.parts[pi].argv.clone();
            let basedir = c.parts[pi].basedir.clone();
            logger::debug(&format!(
                "Parse: part {} with {} tokens (basedir {})",
                pi,
                argv.len(),
                basedir
            ));
            let mut i = 0usize;
            loop {
                let curr = i;
                for p in SUB_PARSERS {
                    i = p(&mut c, &argv, i, &basedir)?;
                    if i != curr {
                        break;
                    }
                }
                if i == curr {
                    if i < argv.len() {
                        return Err(format!(
                            "{} args left: {:?}",
                            argv.len() - i,
                            &argv[i..]
                        )
                        .into());
                    }
                    break;
                }
            }
            pi += 1;
        }
        Ok(c)
    }

    // insert <file>[ from <container>]... into <table> [as <kind>]
    // [separator <char>] ( with ( content | <col>... as header )
    //   | [using <path>[ as <name>]... from xpath] [xpath <expr>] )
    fn arg_source(
        &mut self,
        argv: &[String],
        start: usize,
        basedir: &str,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let mut i = start;
        if i >= argv.len() || (argv[i] != "insert" && argv[i] != "-insert") {
            return Ok(start);
        }
        i += 1;
        let mut t = TableSpec::default();
        while i < argv.len() && argv[i] != "into" {
            let mut f = FileInfo::plain(&get_path(basedir, &argv[i]));
            i += 1;
            if i < argv.len() && argv[i] == "from" {
                i += 1;
                if i >= argv.len() {
                    return Err("missing container file after 'from'".into());
                }
                f.container = Some(get_path(basedir, &argv[i]));
                i += 1;
            }
            t.files.push(f);
        }
        if i >= argv.len() {
            return Err("missing 'into' for insert".into());
        }
        i += 1;
        if i >= argv.len() {
            return Err("missing table name after 'into'".into());
        }
        t.tablename = argv[i].clone();
        i += 1;
        if i < argv.len() && argv[i] == "as" {
            i += 1;
            if i >= argv.len() {
                return Err("missing file-type after 'as'".into());
            }
            t.kind = Some(argv[i].clone());
            i += 1;
        }
        if i < argv.len() && argv[i] == "separator" {
            i += 1;
            if i >= argv.len() {
                return Err("missing separator after 'separator'".into());
            }
            // first code point only; anything after it is ignored
            t.sep = argv[i].chars().next();
            i += 1;
        }
        if i < argv.len() && argv[i] == "with" {
            i += 1;
            if i < argv.len() && argv[i] == "content" {
                i += 1;
                t.content = true;
            } else {
                while i < argv.len() && argv[i] != "as" {
                    t.header.push(argv[i].clone());
                    i += 1;
                }
                if i + 1 >= argv.len() || argv[i] != "as" || argv[i + 1] != "header" {
                    return Err("missing 'content' or 'as header' after 'with'".into());
                }
                i += 2;
            }
        } else {
            if i < argv.len() && argv[i] == "using" {
                i += 1;
                while i < argv.len() && argv[i] != "from" {
                    let mut s = Select {
                        path: argv[i].clone(),
                        name: None,
                    };
                    i += 1;
                    if i < argv.len() && argv[i] == "as" {
                        i += 1;
                        if i >= argv.len() {
                            return Err("missing name after 'as'".into());
                        }
                        s.name = Some(argv[i].clone());
                        i += 1;
                    }
                    t.selects.push(s);
                }
                if i + 1 >= argv.len() || argv[i] != "from" || argv[i + 1] != "xpath" {
                    return Err("missing 'from xpath' after 'using' list".into());
                }
                i += 1;
            }
            if i < argv.len() && argv[i] == "xpath" {
                i += 1;
                if i >= argv.len() {
                    return Err("missing xpath after 'xpath'".into());
                }
                t.xpath = Some(argv[i].clone());
                i += 1;
            }
        }
        self.tables.push(t);
        Ok(i)
    }

    // expand <template-path> [as <output-path>]
    fn arg_template(
        &mut self,
        argv: &[String],
        start: usize,
        basedir: &str,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let mut i = start;
        if i >= argv.len() || (argv[i] != "expand" && argv[i] != "-expand") {
            return Ok(start);
        }
        i += 1;
        if i >= argv.len() {
            return Err("missing template name after 'expand'".into());
        }
        let name = get_path(basedir, &argv[i]);
        i += 1;
        let outname = if i < argv.len() && argv[i] == "as" {
            i += 1;
            if i >= argv.len() {
                return Err("missing output name after 'as'".into());
            }
            let o = get_path(basedir, &argv[i]);
            i += 1;
            o
        } else {
            "stdout".to_string()
        };
        let template = std::fs::read_to_string(&name)
            .map_err(|e| format!("{}: reading template {}", e, name))?;
        self.templates.push(TemplateSpec {
            name,
            template,
            outname,
        });
        Ok(i)
    }

    // select <tokens>... expanding <suffix>
    // The keyword itself doubles as the statement's leading SELECT.
    fn arg_select(
        &mut self,
        argv: &[String],
        start: usize,
        _basedir: &str,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let mut i = start;
        if i >= argv.len() || (argv[i] != "select" && argv[i] != "-select") {
            return Ok(start);
        }
        let mut txt = vec![argv[i].trim_start_matches('-').to_string()];
        i += 1;
        while i < argv.len() && argv[i] != "expanding" {
            txt.push(argv[i].clone());
            i += 1;
        }
        if i >= argv.len() {
            return Err("missing 'expanding' for select".into());
        }
        i += 1;
        if i >= argv.len() {
            return Err("missing suffix after 'expanding'".into());
        }
        let expand = argv[i].clone();
        i += 1;
        self.templates.push(TemplateSpec {
            name: "command line".to_string(),
            template: format!("{{{{#sql}}}}{}{{{{/sql}}}}{}", txt.join(" "), expand),
            outname: "stdout".to_string(),
        });
        Ok(i)
    }

    // set <key> <value>
    fn arg_param(
        &mut self,
        argv: &[String],
        start: usize,
        _basedir: &str,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let mut i = start;
        if i + 2 < argv.len() && argv[i] == "set" {
            i += 1;
            let key = argv[i].clone();
            i += 1;
            let value = argv[i].clone();
            i += 1;
            self.params.insert(key, value);
        }
        Ok(i)
    }

    // sql <path>
    fn arg_sql(
        &mut self,
        argv: &[String],
        start: usize,
        basedir: &str,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let mut i = start;
        if i >= argv.len() || argv[i] != "sql" {
            return Ok(start);
        }
        i += 1;
        if i >= argv.len() {
            return Err("missing sql filename".into());
        }
        self.sqls.push(get_path(basedir, &argv[i]));
        i += 1;
        Ok(i)
    }

    // attach <file> as <alias>
    fn arg_attach(
        &mut self,
        argv: &[String],
        start: usize,
        basedir: &str,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let mut i = start;
        if i >= argv.len() || argv[i] != "attach" {
            return Ok(start);
        }
        i += 1;
        if i >= argv.len() {
            return Err("missing filename of attachable db".into());
        }
        let file = get_path(basedir, &argv[i]);
        i += 1;
        if i >= argv.len() || argv[i] != "as" {
            return Err("missing 'as' for attachable db".into());
        }
        i += 1;
        if i >= argv.len() {
            return Err("missing name for attached db".into());
        }
        let alias = argv[i].clone();
        i += 1;
        self.attaches.push(AttachSpec { file, alias });
        Ok(i)
    }

    // ini/-ini/-defini <path>: whitespace-split the file and enqueue it
    // as a new parse part rooted at the file's directory. Only -defini
    // tolerates a missing file.
    fn arg_ini(
        &mut self,
        argv: &[String],
        start: usize,
        basedir: &str,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let mut i = start;
        if i >= argv.len() || (argv[i] != "ini" && argv[i] != "-ini" && argv[i] != "-defini") {
            return Ok(start);
        }
        i += 1;
        if i >= argv.len() {
            return Err(format!("missing filename after '{}'", argv[start]).into());
        }
        let ininame = get_path(basedir, &argv[i]);
        i += 1;
        let data = match std::fs::read_to_string(&ininame) {
            Ok(d) => d,
            Err(e) => {
                if argv[start] == "-defini" {
                    return Ok(i);
                }
                return Err(format!("{}: reading {}", e, ininame).into());
            }
        };
        // split on runs of spaces and newlines; empty tokens are consumed
        // later by the empty-token skipper
        let splitter = Regex::new("[ \n]+").expect("valid split regex");
        let words: Vec<String> = splitter.split(&data).map(|s| s.to_string()).collect();
        let parent = Path::new(&ininame)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| ".".to_string());
        logger::debug(&format!(
            "ArgIni: enqueuing {} tokens from {} (basedir {})",
            words.len(),
            ininame,
            parent
        ));
        self.parts.push(ArgPart {
            basedir: parent,
            argv: words,
        });
        Ok(i)
    }

    // db <path>: only recognized when the path token is present.
    fn arg_db(
        &mut self,
        argv: &[String],
        start: usize,
        basedir: &str,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let mut i = start;
        if i + 1 < argv.len() && argv[i] == "db" {
            i += 1;
            self.dbname = Some(get_path(basedir, &argv[i]));
            i += 1;
        }
        Ok(i)
    }

    // Consume tokens from '/*' to '*/' inclusive.
    fn arg_comment(
        &mut self,
        argv: &[String],
        start: usize,
        _basedir: &str,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let mut i = start;
        if i >= argv.len() || argv[i] != "/*" {
            return Ok(start);
        }
        i += 1;
        while i < argv.len() && argv[i] != "*/" {
            i += 1;
        }
        if i >= argv.len() {
            return Err(format!(
                "missing closing '*/' for comment '{}'",
                argv[start..].join(" ")
            )
            .into());
        }
        i += 1;
        Ok(i)
    }

    // Consume a single empty token (ini splitting produces them).
    fn arg_empty(
        &mut self,
        argv: &[String],
        start: usize,
        _basedir: &str,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let mut i = start;
        if i < argv.len() && argv[i].is_empty() {
            i += 1;
        }
        Ok(i)
    }

    // Execute the plan in fixed phase order and return the store.
    pub fn apply(
        &self,
        progress: ProgressManager,
    ) -> Result<Musql, Box<dyn std::error::Error + Send + Sync>> {
        let mut m = match &self.dbname {
            None => Musql::new_db()?,
            Some(path) => Musql::open_db(path)?,
        };
        m.set_progress(progress);

        for t in &self.tables {
            self.apply_table(&mut m, t)?;
        }
        m.add_parameters("parameter", &self.params)?;
        for a in &self.attaches {
            m.add_database(&a.file, &a.alias)?;
        }
        for fname in &self.sqls {
            m.apply_sql(fname)?;
        }
        for tpl in &self.templates {
            if tpl.outname == "stdout" {
                let stdout = io::stdout();
                let mut lock = stdout.lock();
                m.run_template(&tpl.template, &mut lock)
                    .map_err(|e| format!("{} for {}", e, tpl.name))?;
            } else {
                let mut f = File::create(&tpl.outname)
                    .map_err(|e| format!("{}: creating {}", e, tpl.outname))?;
                m.run_template(&tpl.template, &mut f)
                    .map_err(|e| format!("{} for {}", e, tpl.name))?;
            }
        }
        Ok(m)
    }

    // Pick the ingest shape for one table spec.
    fn apply_table(
        &self,
        m: &mut Musql,
        t: &TableSpec,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Some(xpath) = &t.xpath {
            let is_xml = t.kind.as_deref() == Some("xml")
                || (t.kind.is_none()
                    && t.files.first().map_or(false, |f| f.path.ends_with(".xml")));
            if is_xml {
                return m.add_xml(&t.tablename, &t.files, xpath, &t.selects);
            }
            return m.add_json(&t.tablename, &t.files, xpath, &t.selects);
        }
        if t.files.len() == 1
            && t.files[0].container.is_none()
            && Path::new(&t.files[0].path).is_dir()
        {
            return m.add_files(&t.tablename, &t.files[0].path, t.content);
        }
        if !t.header.is_empty() {
            return m.add_csv_with_header(&t.tablename, &t.files, t.sep, &t.header);
        }
        m.add_csv(&t.tablename, &t.files, t.sep)
    }
}
