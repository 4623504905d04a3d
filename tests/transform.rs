use std::path::Path;
use std::sync::Arc;

use colcalc::allowlist::AllowListSource;
use colcalc::container::{Codec, JsonlContainer};
use colcalc::formula::{CompileError, Compiler};
use colcalc::record::Record;
use colcalc::registry::Registry;
use colcalc::schema::{Field, FieldType, Primitive, Schema};
use colcalc::transform::{CalcColumn, CancelToken, TransformRequest, TransformResponse, Transformer};
use colcalc::value::Value;
use pretty_assertions::assert_eq;

fn registry() -> Registry {
    Registry::open(
        AllowListSource::inline("builtins.yaml", "- abs\n- str\n- round\n"),
        AllowListSource::inline("imports.yaml", "- math\n"),
    )
    .unwrap()
}

fn input(dir: &Path, codec: Codec) -> Arc<JsonlContainer> {
    let container = Arc::new(JsonlContainer::new(dir, codec));
    let schema = Schema::new(
        "Row",
        vec![
            Field::new("a", FieldType::Primitive(Primitive::Long)),
            Field::new("b", FieldType::Primitive(Primitive::Long)),
        ],
    );
    let record: Record = [("a".to_string(), Value::Int(1)), ("b".to_string(), Value::Int(2))]
        .into_iter()
        .collect();
    container.write_all("in.jsonl", &schema, [&record]).unwrap();
    container
}

fn transform(container: &Arc<JsonlContainer>, output: &str, columns: &[(&str, &str)]) -> TransformResponse {
    let request = TransformRequest {
        input_file_name: "in.jsonl".to_string(),
        output_file_name: output.to_string(),
        calc_columns: columns.iter().map(|(n, f)| CalcColumn::new(*n, *f)).collect(),
    };
    Transformer::new(container.clone()).run(&request, &registry().current(), &CancelToken::new())
}

#[test]
fn computes_a_column() {
    let dir = tempfile::tempdir().unwrap();
    let container = input(dir.path(), Codec::Deflate);

    let response = transform(&container, "out.jsonl", &[("c", "a+b")]);
    assert_eq!(response.error_code, 0, "{}", response.error_message);
    assert_eq!(response.output_file_name, "out.jsonl");
    assert_eq!(response.column_errors["c"].failures, 0);

    let (schema, records) = container.read_all("out.jsonl").unwrap();
    assert_eq!(schema.field_names().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    assert_eq!(
        records[0].iter().collect::<Vec<_>>(),
        vec![("a", &Value::Int(1)), ("b", &Value::Int(2)), ("c", &Value::Int(3))]
    );
}

#[test]
fn failing_record_gets_null() {
    let dir = tempfile::tempdir().unwrap();
    let container = input(dir.path(), Codec::Null);

    let response = transform(&container, "out.jsonl", &[("c", "a/0")]);
    assert!(response.is_success());
    assert_eq!(response.column_errors["c"].failures, 1);
    assert_eq!(response.column_errors["c"].samples, vec!["record 0: division by zero"]);

    let (_, records) = container.read_all("out.jsonl").unwrap();
    assert_eq!(records[0].get("c"), Some(&Value::Null));
}

#[test]
fn existing_column_name_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let container = input(dir.path(), Codec::Null);

    let response = transform(&container, "out.jsonl", &[("a", "1")]);
    assert_eq!(response.error_code, 1);
    assert!(response.error_message.contains("already in input schema 'a'"));
    assert!(!dir.path().join("out.jsonl").exists());
}

#[test]
fn imports_outside_the_allow_list_do_not_compile() {
    let registry = registry();
    let capabilities = registry.current();
    let errors = Compiler::new(&capabilities)
        .compile("os.system('rm -rf /')")
        .unwrap_err();
    assert!(
        matches!(&errors[..], [CompileError::ImportNotAllowed { error, .. }] if error.module == "os"),
        "{errors:?}"
    );

    let dir = tempfile::tempdir().unwrap();
    let container = input(dir.path(), Codec::Null);
    let response = transform(&container, "out.jsonl", &[("c", "os.system('rm -rf /')")]);
    assert_eq!(response.error_code, 2);
    assert_eq!(response.records, 0);
    assert!(!dir.path().join("out.jsonl").exists());
}

#[test]
fn no_columns_copies_the_input() {
    let dir = tempfile::tempdir().unwrap();
    let container = input(dir.path(), Codec::Deflate);

    let response = transform(&container, "copy.jsonl", &[]);
    assert!(response.is_success());
    assert!(response.column_errors.is_empty());
    assert_eq!(container.read_all("copy.jsonl").unwrap(), container.read_all("in.jsonl").unwrap());
}

#[test]
fn same_request_gives_same_output() {
    let dir = tempfile::tempdir().unwrap();
    let container = input(dir.path(), Codec::Null);
    let columns = [("x", "round(math.sqrt(a + b), 3)"), ("y", "str(b) + '!'"), ("z", "b // (a - 1)")];

    let mut first = transform(&container, "one.jsonl", &columns);
    let mut second = transform(&container, "two.jsonl", &columns);
    first.elapsed_ms = 0;
    second.elapsed_ms = 0;
    second.output_file_name = first.output_file_name.clone();
    assert_eq!(first, second);

    let one = std::fs::read(dir.path().join("one.jsonl")).unwrap();
    let two = std::fs::read(dir.path().join("two.jsonl")).unwrap();
    assert_eq!(one, two);
}

#[test]
fn readers_see_whole_snapshots_during_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let builtins = dir.path().join("builtins.yaml");
    let imports = dir.path().join("imports.yaml");
    let write = |small: bool| {
        let (b, i) = if small {
            ("- abs\n", "- math\n")
        } else {
            ("- abs\n- len\n", "- math\n- re\n")
        };
        std::fs::write(&builtins, b).unwrap();
        std::fs::write(&imports, i).unwrap();
    };

    write(true);
    let registry = Registry::open(AllowListSource::file(&builtins), AllowListSource::file(&imports)).unwrap();

    std::thread::scope(|scope| {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    for _ in 0..500 {
                        let snapshot = registry.current();
                        let builtins = snapshot.builtin_names().len();
                        let imports = snapshot.import_names().len();
                        assert_eq!(builtins, imports, "torn snapshot");
                        assert!(Compiler::new(&snapshot).compile("abs(math.pi)").is_ok());
                    }
                })
            })
            .collect();

        for round in 0..50 {
            write(round % 2 == 1);
            registry.reload().unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
    });
}
