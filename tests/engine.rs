// End-to-end coverage: ingest shapes, the ensure-then-insert contract,
// template rendering with sql/error lambdas, and full plans driven through
// the directive parser.

use musql::config::Config;
use musql::engine::Musql;
use musql::progress::ProgressManager;
use musql::source::FileInfo;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

fn write_file(dir: &Path, name: &str, content: &str) -> FileInfo {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write test input");
    FileInfo::plain(&path.to_string_lossy())
}

fn count(m: &Musql, table: &str) -> usize {
    let (_, rows) = m
        .query_rows(&format!("select count(*) as c from \"{}\"", table))
        .unwrap();
    rows[0]["c"].parse().unwrap()
}

fn render(m: &Musql, template: &str) -> Result<String, String> {
    let mut out = Vec::new();
    m.run_template(template, &mut out)
        .map_err(|e| e.to_string())?;
    Ok(String::from_utf8(out).unwrap())
}

#[test]
fn csv_ingest_counts_data_rows_across_files() {
    let dir = TempDir::new().unwrap();
    let t1 = write_file(dir.path(), "t.csv", "a;b\n1;2\n3;4\n");
    let t2 = write_file(dir.path(), "t2.csv", "a;b\n5;6\n");
    let mut m = Musql::new_db().unwrap();
    m.add_csv("mytable", &[t1, t2], None).unwrap();
    assert_eq!(count(&m, "mytable"), 3);

    let (cols, rows) = m.query_rows("select * from \"mytable\"").unwrap();
    assert_eq!(cols, vec!["a", "b"]);
    assert_eq!(rows[0]["a"], "1");
    assert_eq!(rows[2]["b"], "6");
}

#[test]
fn csv_header_mismatch_fails() {
    let dir = TempDir::new().unwrap();
    let t1 = write_file(dir.path(), "t.csv", "a;b\n1;2\n");
    let t2 = write_file(dir.path(), "other_t.csv", "x;y\n3;4\n");
    let mut m = Musql::new_db().unwrap();
    let err = m.add_csv("mytable_2", &[t1, t2], None).unwrap_err().to_string();
    assert!(err.contains("header mismatch"), "{}", err);
}

#[test]
fn csv_missing_file_fails() {
    let mut m = Musql::new_db().unwrap();
    let err = m
        .add_csv("a", &[FileInfo::plain("no_file.csv")], None)
        .unwrap_err()
        .to_string();
    assert!(err.contains("no_file.csv not found"), "{}", err);
}

#[test]
fn csv_explicit_header_treats_every_line_as_data() {
    let dir = TempDir::new().unwrap();
    let t = write_file(dir.path(), "raw.csv", "1;2\n3;4\n");
    let mut m = Musql::new_db().unwrap();
    let header: Vec<String> = vec!["left".into(), "right".into()];
    m.add_csv_with_header("raw", &[t], None, &header).unwrap();
    assert_eq!(count(&m, "raw"), 2);
    let (cols, _) = m.query_rows("select * from \"raw\"").unwrap();
    assert_eq!(cols, vec!["left", "right"]);
}

#[test]
fn csv_custom_separator() {
    let dir = TempDir::new().unwrap();
    let t = write_file(dir.path(), "c.csv", "a,b\n1,2\n");
    let mut m = Musql::new_db().unwrap();
    m.add_csv("c", &[t], Some(',')).unwrap();
    assert_eq!(count(&m, "c"), 1);
}

#[test]
fn reingest_truncates_matching_and_recreates_mismatched() {
    let dir = TempDir::new().unwrap();
    let t1 = write_file(dir.path(), "t.csv", "a;b\n1;2\n3;4\n");
    let mut m = Musql::new_db().unwrap();
    m.add_csv("t", &[t1.clone()], None).unwrap();
    m.add_csv("t", &[t1], None).unwrap();
    // truncate + refill, not append
    assert_eq!(count(&m, "t"), 2);

    let t3 = write_file(dir.path(), "new.csv", "x\n9\n");
    m.add_csv("t", &[t3], None).unwrap();
    let (cols, _) = m.query_rows("select * from \"t\"").unwrap();
    assert_eq!(cols, vec!["x"]);
    assert_eq!(count(&m, "t"), 1);
}

#[test]
fn csv_from_archive_member() {
    let dir = TempDir::new().unwrap();
    let zip_path = dir.path().join("bundle.zip");
    let f = std::fs::File::create(&zip_path).unwrap();
    let mut w = zip::ZipWriter::new(f);
    w.start_file("m.csv", zip::write::SimpleFileOptions::default())
        .unwrap();
    w.write_all(b"v\n1\n2\n").unwrap();
    w.finish().unwrap();

    let info = FileInfo {
        path: "m.csv".to_string(),
        container: Some(zip_path.to_string_lossy().to_string()),
    };
    let mut m = Musql::new_db().unwrap();
    m.add_csv("zipped", &[info], None).unwrap();
    assert_eq!(count(&m, "zipped"), 2);
}

#[test]
fn files_walk_ingest() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("x.txt"), "xx").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub").join("y.txt"), "yy").unwrap();

    let mut m = Musql::new_db().unwrap();
    m.add_files("fs", &dir.path().to_string_lossy(), true).unwrap();
    let (cols, rows) = m
        .query_rows("select * from \"fs\" order by filename")
        .unwrap();
    assert_eq!(cols, vec!["fullpath", "filename", "content"]);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["filename"], "x.txt");
    assert_eq!(rows[0]["content"], "xx");
    assert_eq!(rows[1]["filename"], "y.txt");

    // without the content flag the column stays empty
    m.add_files("fs2", &dir.path().to_string_lossy(), false).unwrap();
    let (_, rows) = m.query_rows("select * from \"fs2\"").unwrap();
    assert!(rows.iter().all(|r| r["content"].is_empty()));
}

#[test]
fn parameter_table_shape() {
    let mut m = Musql::new_db().unwrap();
    let mut params = std::collections::HashMap::new();
    params.insert("alpha".to_string(), "1".to_string());
    params.insert("beta".to_string(), "2".to_string());
    m.add_parameters("parameter", &params).unwrap();

    let (cols, rows) = m
        .query_rows("select * from \"parameter\" order by paramkey")
        .unwrap();
    assert_eq!(cols, vec!["paramkey", "value"]);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["paramkey"], "alpha");
    assert_eq!(rows[1]["value"], "2");
}

#[test]
fn attach_exposes_tables_under_alias() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("test.db");
    {
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "create table tt ( v ); insert into tt values ('7');",
        )
        .unwrap();
    }
    let mut m = Musql::new_db().unwrap();
    m.add_database(&db_path.to_string_lossy(), "test").unwrap();
    let (_, rows) = m.query_rows("select v from test.tt").unwrap();
    assert_eq!(rows[0]["v"], "7");
}

#[test]
fn xml_ingest_end_to_end() {
    let dir = TempDir::new().unwrap();
    let xml = write_file(
        dir.path(),
        "d.xml",
        r#"<list><row id="1"><v>a</v></row><row id="2"><v>b</v></row></list>"#,
    );
    let mut m = Musql::new_db().unwrap();
    m.add_xml("x", &[xml], "/list/row", &[]).unwrap();
    let (cols, rows) = m.query_rows("select * from \"x\" order by id").unwrap();
    assert_eq!(cols, vec!["id", "v"]);
    assert_eq!(rows[1]["v"], "b");
}

#[test]
fn sql_lambda_binds_result_and_indicator() {
    let m = Musql::new_db().unwrap();
    let out = render(&m, "{{#sql}}select 1 as v{{/sql}}{{#result}}{{v}}{{/result}}").unwrap();
    assert_eq!(out, "1");

    let out = render(
        &m,
        "{{#sql}}select 1 as v where 1 = 0{{/sql}}{{#result?}}some{{/result?}}{{^result?}}none{{/result?}}",
    )
    .unwrap();
    assert_eq!(out, "none");
}

#[test]
fn mustache_query_interleaves_framing_whitespace() {
    let dir = TempDir::new().unwrap();
    let t = write_file(dir.path(), "t.csv", "Wert\n15000\n30000\n17000\n");
    let mut m = Musql::new_db().unwrap();
    m.add_csv("must", &[t], None).unwrap();

    let out = render(
        &m,
        "\n{{#sql}}\nselect Wert from must\n{{/sql}}\n{{#result}}\n\t{{Wert}}\n{{/result}}\n",
    )
    .unwrap();
    assert_eq!(out, "\n\t15000\n\t30000\n\t17000\n");

    // ingested tables are seeded into the context before each render
    let out = render(&m, "{{#must}}<{{Wert}}>{{/must}}").unwrap();
    assert_eq!(out, "<15000><30000><17000>");
}

#[test]
fn create_view_table_var_and_insert_shapes() {
    let m = Musql::new_db().unwrap();
    let out = render(
        &m,
        "{{#sql}}create view v as select 2 as n{{/sql}}{{#v}}{{n}}{{/v}}",
    )
    .unwrap();
    assert_eq!(out, "2");

    let out = render(
        &m,
        "{{#sql}}create var x as select 3 as m{{/sql}}{{#x}}{{m}}{{/x}}",
    )
    .unwrap();
    assert_eq!(out, "3");

    // the var body may span lines and is taken verbatim
    let out = render(
        &m,
        "{{#sql}}create var y as\nselect 4 as m\n{{/sql}}{{#y}}{{m}}{{/y}}",
    )
    .unwrap();
    assert_eq!(out, "4");

    let out = render(
        &m,
        "{{#sql}}create table t2 as select 1 as a{{/sql}}\
         {{#sql}}insert into t2 values (9){{/sql}}\
         {{#sql}}select count(*) as c from t2{{/sql}}{{#result}}{{c}}{{/result}}",
    )
    .unwrap();
    assert_eq!(out, "2");

    // recreating a view must not fail on the existing one
    let out = render(
        &m,
        "{{#sql}}create view v as select 5 as n{{/sql}}{{#v}}{{n}}{{/v}}",
    )
    .unwrap();
    assert_eq!(out, "5");
}

#[test]
fn with_fragment_binds_body_without_executing() {
    let m = Musql::new_db().unwrap();
    // table tt does not exist, so any execution attempt would fail
    let out = render(
        &m,
        "{{#sql}}\nwith fragment t_t as (\n  select * from tt\n)\n{{/sql}}{{t_t}}",
    )
    .unwrap();
    assert_eq!(out, "(\n  select * from tt\n)");
}

#[test]
fn single_line_fragment_without_newline_falls_through() {
    let m = Musql::new_db().unwrap();
    // without a trailing newline the fragment shape does not match and the
    // text runs as a query, which fails
    let err = render(&m, "{{#sql}}with fragment f as (select 1){{/sql}}").unwrap_err();
    assert!(err.contains("executing the template"), "{}", err);
}

#[test]
fn error_lambda_fails_the_render() {
    let m = Musql::new_db().unwrap();
    let err = render(&m, "pre{{#error}}boom{{/error}}post").unwrap_err();
    assert!(err.contains("boom"), "{}", err);
}

#[test]
fn strict_mode_rejects_unbound_interpolations() {
    let m = Musql::new_db().unwrap();
    let err = render(&m, "{{nope}}").unwrap_err();
    assert!(err.contains("missing variable nope"), "{}", err);
}

#[test]
fn empty_sql_section_is_a_no_op() {
    let m = Musql::new_db().unwrap();
    let out = render(&m, "a{{#sql}}{{/sql}}b").unwrap();
    assert_eq!(out, "ab");
}

#[test]
fn full_plan_through_directives() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("data.csv"), "name;qty\nbolt;4\nnut;6\n").unwrap();
    std::fs::write(
        dir.path().join("setup.sql"),
        "create view totals as select sum(qty) as total from items;",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("report.mustache"),
        "{{#totals}}total={{total}}{{/totals}};{{#parameter}}{{paramkey}}={{value}}{{/parameter}}",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("main.ini"),
        "/* demo plan */\ninsert data.csv into items\nset who world\nsql setup.sql\nexpand report.mustache as out.txt\n",
    )
    .unwrap();

    let argv = vec![
        "ini".to_string(),
        dir.path().join("main.ini").to_string_lossy().to_string(),
    ];
    let config = Config::parse(&argv).unwrap();
    config.apply(ProgressManager::new(false)).unwrap();

    let out = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
    assert_eq!(out, "total=10;who=world");
}

#[test]
fn persistent_store_path() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("store.db");
    let csv = dir.path().join("d.csv");
    std::fs::write(&csv, "k\n1\n").unwrap();

    let argv = vec![
        "db".to_string(),
        db_path.to_string_lossy().to_string(),
        "insert".to_string(),
        csv.to_string_lossy().to_string(),
        "into".to_string(),
        "kept".to_string(),
    ];
    let config = Config::parse(&argv).unwrap();
    let m = config.apply(ProgressManager::new(false)).unwrap();
    assert_eq!(count(&m, "kept"), 1);
    drop(m);

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    let n: i64 = conn
        .query_row("select count(*) from kept", [], |r| r.get(0))
        .unwrap();
    assert_eq!(n, 1);
}
