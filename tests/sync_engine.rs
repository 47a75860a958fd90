#![cfg(feature = "compression-gzip")]

use anyhow::Result;
use openalex_sync::testing::{Script, ScriptedConverter, TestProject};
use openalex_sync::{
    ArrowConverter, EntityCategory, ExecMode, FileOutcome, NormalizationPolicy, ProcessingLedger,
    RunSummary, SourceFile, SyncEngine, Transform, fingerprint,
};
use serde_json::{Value, json};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

fn authors(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| json!({"id": format!("A{i}"), "display_name": format!("Author {i}")}))
        .collect()
}

fn engine_with(
    project: &TestProject,
    policy: NormalizationPolicy,
    converter: &Arc<ScriptedConverter>,
) -> Result<SyncEngine> {
    let ledger = ProcessingLedger::open(&project.config.ledger_path)?;
    Ok(SyncEngine::new(
        project.config.clone(),
        ledger,
        policy,
        Arc::clone(converter),
    ))
}

#[test]
fn second_run_without_changes_converts_nothing() -> Result<()> {
    let project = TestProject::new()?;
    let src = project.source();
    src.records("authors/part_0.gz", &authors(3))?;
    src.records("works/updated_date=2025-01-01/part_0.gz", &authors(2))?;
    src.records("works/updated_date=2025-01-02/part_0.gz", &authors(1))?;

    let conv = Arc::new(ScriptedConverter::new());
    let engine = engine_with(&project, NormalizationPolicy::empty(), &conv)?;

    let first = engine.run()?;
    let t = first.stats.totals();
    assert_eq!((t.discovered, t.processed, t.skipped), (3, 3, 0));
    assert_eq!(t.records_added, 6);

    let second = engine.run()?;
    let t = second.stats.totals();
    assert_eq!((t.discovered, t.processed, t.skipped), (3, 0, 3));
    assert_eq!(t.records_added, 0);
    assert_eq!(conv.calls().len(), 3);
    assert_eq!(first.ledger, second.ledger);
    Ok(())
}

#[test]
fn changed_content_is_reprocessed_and_identical_rewrite_is_not() -> Result<()> {
    let project = TestProject::new()?;
    let src = project.source();
    let path = src.records("authors/part_0.gz", &authors(2))?;

    let conv = Arc::new(ScriptedConverter::new());
    let engine = engine_with(&project, NormalizationPolicy::empty(), &conv)?;
    engine.run()?;
    let before = engine.ledger().entry(&path)?.expect("ledger entry");

    // Same bytes written again: new mtime, same fingerprint.
    let bytes = fs::read(&path)?;
    fs::write(&path, &bytes)?;
    let report = engine.run()?;
    assert_eq!(report.stats.totals().skipped, 1);

    src.records("authors/part_0.gz", &authors(5))?;
    let report = engine.run()?;
    assert_eq!(report.stats.totals().processed, 1);

    let after = engine.ledger().entry(&path)?.expect("ledger entry");
    assert_ne!(before.fingerprint, after.fingerprint);
    assert_eq!(after.fingerprint, fingerprint(&path)?);
    assert_eq!(after.record_count, 5);
    assert_eq!(conv.calls().len(), 2);
    Ok(())
}

#[test]
fn one_failing_file_does_not_stop_the_others() -> Result<()> {
    let project = TestProject::new()?;
    let src = project.source();
    for i in 0..5 {
        src.records(&format!("authors/part_{i}.gz"), &authors(1))?;
    }
    src.records("works/part_0.gz", &authors(1))?;

    let conv = Arc::new(ScriptedConverter::new().on("authors/part_2.gz", Script::Fail("corrupt gzip".into())));
    let engine = engine_with(&project, NormalizationPolicy::empty(), &conv)?;
    let report = engine.run()?;

    let a = report.stats.category(EntityCategory::Authors);
    assert_eq!((a.processed, a.failed), (4, 1));
    assert_eq!(report.stats.category(EntityCategory::Works).processed, 1);
    assert_eq!(report.exit_code(), 1);

    let attempted: Vec<_> = conv
        .converted()
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        attempted,
        vec!["part_0.gz", "part_1.gz", "part_2.gz", "part_3.gz", "part_4.gz", "part_0.gz"]
    );

    let failed = src.path("authors/part_2.gz");
    let entry = engine.ledger().failure(&failed)?.expect("failure entry");
    assert_eq!(entry.retry_count, 1);
    assert!(entry.message.contains("corrupt gzip"));
    assert!(engine.ledger().entry(&failed)?.is_none());

    let log = fs::read_to_string(&project.config.error_log)?;
    assert_eq!(log.lines().count(), 1);
    assert!(log.contains("part_2.gz"));
    assert!(log.contains(" | "));

    // Retried on the next run, everything else skipped.
    let report = engine.run()?;
    let a = report.stats.category(EntityCategory::Authors);
    assert_eq!((a.skipped, a.failed), (4, 1));
    assert_eq!(engine.ledger().failure(&failed)?.unwrap().retry_count, 2);
    Ok(())
}

#[test]
fn success_after_failure_clears_the_failure_row() -> Result<()> {
    let project = TestProject::new()?;
    let path = project.source().records("topics/part_0.gz", &authors(2))?;

    let conv = Arc::new(ScriptedConverter::new().on("part_0.gz", Script::Fail("disk full".into())));
    let engine = engine_with(&project, NormalizationPolicy::empty(), &conv)?;
    assert!(!engine.run()?.succeeded());

    conv.set("part_0.gz", Script::Count);
    let report = engine.run()?;
    assert!(report.succeeded());
    assert!(engine.ledger().failure(&path)?.is_none());
    assert_eq!(engine.ledger().entry(&path)?.unwrap().record_count, 2);
    Ok(())
}

#[test]
fn new_file_is_processed_and_known_file_is_skipped() -> Result<()> {
    let project = TestProject::new()?;
    let src = project.source();
    let part_0 = src.records("authors/part_0.gz", &authors(7))?;
    let part_1 = src.records("authors/part_1.gz", &authors(3))?;

    // part_1 was converted by an earlier run.
    {
        let ledger = ProcessingLedger::open(&project.config.ledger_path)?;
        ledger.mark_processed(
            &part_1,
            &fingerprint(&part_1)?,
            EntityCategory::Authors,
            fs::metadata(&part_1)?.len(),
            42,
            &project.dest("authors/part_1.parquet"),
        )?;
    }

    let conv = Arc::new(ScriptedConverter::new());
    let mut project_config = project.config.clone();
    project_config.reconcile_orphans = false;
    let engine = SyncEngine::new(
        project_config,
        ProcessingLedger::open(&project.config.ledger_path)?,
        NormalizationPolicy::empty(),
        Arc::clone(&conv),
    );
    let report = engine.run()?;

    assert_eq!(conv.converted(), vec![part_0.clone()]);
    assert!(project.dest("authors/part_0.parquet").exists());
    let a = report.stats.category(EntityCategory::Authors);
    assert_eq!((a.processed, a.skipped), (1, 1));

    let stats = report.ledger.category(EntityCategory::Authors);
    assert_eq!(stats.files, 2);
    assert_eq!(stats.records, 42 + 7);
    assert_eq!(engine.ledger().entry(&part_1)?.unwrap().record_count, 42);
    Ok(())
}

#[test]
fn normalized_categories_receive_a_projection() -> Result<()> {
    let project = TestProject::new()?;
    let src = project.source();
    src.records(
        "works/part_0.gz",
        &[json!({"id": "W1", "type": "article", "abstract_inverted_index": {"a": [0]}})],
    )?;
    src.records("authors/part_0.gz", &authors(1))?;

    let policy = NormalizationPolicy::from_json(
        r#"{"works": {"toText": ["type"], "toSerializedText": ["abstract_inverted_index"]}}"#,
    )?;
    let conv = Arc::new(ScriptedConverter::new());
    let engine = engine_with(&project, policy, &conv)?;
    engine.run()?;

    let calls = conv.calls();
    let works = calls
        .iter()
        .find(|c| c.source.ends_with("works/part_0.gz"))
        .unwrap();
    let projection = works.projection.as_ref().expect("works is normalized");
    let names: Vec<_> = projection.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "type", "abstract_inverted_index"]);
    assert_eq!(projection.transform_of("type"), Some(Transform::CastToText));
    assert_eq!(
        projection.transform_of("abstract_inverted_index"),
        Some(Transform::SerializeToText)
    );

    let authors_call = calls
        .iter()
        .find(|c| c.source.ends_with("authors/part_0.gz"))
        .unwrap();
    assert!(authors_call.projection.is_none());
    Ok(())
}

#[test]
fn introspection_failure_degrades_to_plain_conversion() -> Result<()> {
    let project = TestProject::new()?;
    project
        .source()
        .records("works/part_0.gz", &[json!({"id": "W1"})])?;

    let policy = NormalizationPolicy::from_json(r#"{"works": {"toText": ["id"]}}"#)?;
    let conv = Arc::new(ScriptedConverter::new().on("part_0.gz", Script::FailIntrospection));
    let engine = engine_with(&project, policy, &conv)?;
    let report = engine.run()?;

    assert_eq!(report.stats.totals().processed, 1);
    assert!(conv.calls()[0].projection.is_none());
    Ok(())
}

#[test]
fn slow_conversion_times_out_and_the_run_continues() -> Result<()> {
    let mut project = TestProject::new()?;
    project.config.file_timeout = Some(Duration::from_millis(200));
    let src = project.source();
    let slow = src.records("authors/part_0.gz", &authors(1))?;
    let fast = src.records("authors/part_1.gz", &authors(1))?;

    let conv = Arc::new(
        ScriptedConverter::new().on("part_0.gz", Script::Sleep(Duration::from_secs(5))),
    );
    let engine = engine_with(&project, NormalizationPolicy::empty(), &conv)?;
    let report = engine.run()?;

    let a = report.stats.category(EntityCategory::Authors);
    assert_eq!((a.processed, a.failed), (1, 1));
    let failure = engine.ledger().failure(&slow)?.expect("timed out file is failed");
    assert!(failure.message.contains("timed out"), "{}", failure.message);
    assert!(engine.ledger().entry(&slow)?.is_none());
    assert!(engine.ledger().entry(&fast)?.is_some());
    Ok(())
}

#[test]
fn vanished_source_is_not_a_failure() -> Result<()> {
    let project = TestProject::new()?;
    let conv = Arc::new(ScriptedConverter::new());
    let engine = engine_with(&project, NormalizationPolicy::empty(), &conv)?;

    let gone = project.source().path("authors/part_9.gz");
    let outcome = engine.process_file(&SourceFile {
        path: gone.clone(),
        category: EntityCategory::Authors,
        size: 10,
    })?;
    assert_eq!(outcome, FileOutcome::Vanished);
    assert!(engine.ledger().failure(&gone)?.is_none());
    assert!(conv.calls().is_empty());
    Ok(())
}

#[test]
fn removed_source_loses_its_output_and_ledger_row() -> Result<()> {
    let project = TestProject::new()?;
    let src = project.source();
    let kept = src.records("authors/part_0.gz", &authors(1))?;
    let dropped = src.records("authors/part_1.gz", &authors(1))?;

    let conv = Arc::new(ScriptedConverter::new());
    let engine = engine_with(&project, NormalizationPolicy::empty(), &conv)?;
    engine.run()?;
    assert!(project.dest("authors/part_1.parquet").exists());

    src.remove("authors/part_1.gz")?;
    let report = engine.run()?;
    let recon = report.reconciliation.as_ref().expect("reconciliation ran");
    assert_eq!((recon.scanned, recon.kept, recon.removed, recon.errors), (2, 1, 1, 0));
    assert!(!project.dest("authors/part_1.parquet").exists());
    assert!(project.dest("authors/part_0.parquet").exists());
    assert!(report.succeeded());

    assert!(engine.ledger().entry(&dropped)?.is_none());
    assert!(engine.ledger().entry(&kept)?.is_some());

    // Restoring the same content converts it again.
    src.records("authors/part_1.gz", &authors(1))?;
    let report = engine.run()?;
    assert_eq!(report.stats.totals().processed, 1);
    assert!(project.dest("authors/part_1.parquet").exists());
    Ok(())
}

#[test]
fn ledger_rows_of_orphans_can_be_kept() -> Result<()> {
    let mut project = TestProject::new()?;
    project.config.invalidate_orphan_ledger_rows = false;
    let src = project.source();
    let dropped = src.records("authors/part_1.gz", &authors(1))?;

    let conv = Arc::new(ScriptedConverter::new());
    let engine = engine_with(&project, NormalizationPolicy::empty(), &conv)?;
    engine.run()?;
    src.remove("authors/part_1.gz")?;
    let report = engine.run()?;

    assert_eq!(report.reconciliation.unwrap().removed, 1);
    assert!(engine.ledger().entry(&dropped)?.is_some());
    Ok(())
}

#[test]
fn forced_category_is_converted_again() -> Result<()> {
    let mut project = TestProject::new()?;
    let src = project.source();
    src.records("authors/part_0.gz", &authors(1))?;
    src.records("works/part_0.gz", &authors(1))?;

    let conv = Arc::new(ScriptedConverter::new());
    engine_with(&project, NormalizationPolicy::empty(), &conv)?.run()?;

    project.config.force_categories = vec![EntityCategory::Works];
    let report = engine_with(&project, NormalizationPolicy::empty(), &conv)?.run()?;
    assert_eq!(report.stats.category(EntityCategory::Works).processed, 1);
    assert_eq!(report.stats.category(EntityCategory::Authors).skipped, 1);
    assert_eq!(conv.calls().len(), 3);
    Ok(())
}

#[test]
fn parallel_mode_matches_sequential_results() -> Result<()> {
    let mut project = TestProject::new()?;
    project.config.exec_mode = ExecMode::Parallel { threads: Some(4) };
    let src = project.source();
    for i in 0..12 {
        src.records(&format!("works/d={}/part_{i}.gz", i % 3), &authors(i + 1))?;
    }
    src.records("works/d=0/part_bad.gz", &authors(1))?;

    let conv = Arc::new(ScriptedConverter::new().on("part_bad.gz", Script::Fail("bad".into())));
    let engine = engine_with(&project, NormalizationPolicy::empty(), &conv)?;
    let report = engine.run()?;

    let w = report.stats.category(EntityCategory::Works);
    assert_eq!((w.discovered, w.processed, w.failed), (13, 12, 1));
    assert_eq!(w.records_added, (1..=12).sum::<u64>());
    assert_eq!(report.ledger.category(EntityCategory::Works).files, 12);
    assert_eq!(report.ledger.category(EntityCategory::Works).failures, 1);

    let again = engine.run()?;
    let w = again.stats.category(EntityCategory::Works);
    assert_eq!((w.skipped, w.failed), (12, 1));
    Ok(())
}

#[test]
fn run_summary_is_written() -> Result<()> {
    let project = TestProject::new()?;
    let src = project.source();
    src.records("authors/part_0.gz", &authors(4))?;
    src.records("authors/part_1.gz", &authors(1))?;

    let conv = Arc::new(ScriptedConverter::new().on("part_1.gz", Script::Fail("x".into())));
    engine_with(&project, NormalizationPolicy::empty(), &conv)?.run()?;

    let path = project.config.summary_path.clone().unwrap();
    let summary = RunSummary::load_from_file(&path)?;
    assert!(!summary.success);
    assert_eq!(summary.files_processed, 1);
    assert_eq!(summary.files_failed, 1);
    assert_eq!(summary.records_added, 4);
    assert_eq!(summary.records_total, 4);
    assert_eq!(summary.entity_stats[&EntityCategory::Authors].files, 1);

    let raw: Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
    assert_eq!(raw["entity_stats"]["authors"]["records"], json!(4));
    assert!(raw["timestamp"].is_string());
    Ok(())
}

#[test]
fn works_partitions_get_text_columns_end_to_end() -> Result<()> {
    let project = TestProject::new()?;
    let src = project.source();
    src.records(
        "works/updated_date=2025-01-01/part_0.gz",
        &[
            json!({"id": "W1", "abstract_inverted_index": {"deep": [0, 3], "learning": [1]}}),
            json!({"id": "W2", "abstract_inverted_index": null}),
        ],
    )?;
    src.records(
        "works/updated_date=2025-01-02/part_0.gz",
        &[json!({"id": "W3", "abstract_inverted_index": {"graph": [2]}})],
    )?;
    src.records(
        "works/updated_date=2025-01-03/part_0.gz",
        &[
            json!({"id": "W4", "abstract_inverted_index": null}),
            json!({"id": "W5", "abstract_inverted_index": null}),
        ],
    )?;

    let policy = NormalizationPolicy::from_json(
        r#"{"works": {"toSerializedText": ["abstract_inverted_index"]}}"#,
    )?;
    let engine = SyncEngine::new(
        project.config.clone(),
        ProcessingLedger::open(&project.config.ledger_path)?,
        policy,
        ArrowConverter::new(),
    );
    let report = engine.run()?;
    assert_eq!(report.stats.totals().processed, 3);
    assert_eq!(report.stats.totals().records_added, 5);

    for day in ["2025-01-01", "2025-01-02", "2025-01-03"] {
        let out = project.dest(&format!("works/updated_date={day}/part_0.parquet"));
        let schema = openalex_sync::io::parquet::parquet_schema(&out)?;
        let field = schema.field_with_name("abstract_inverted_index")?;
        assert_eq!(field.data_type(), &arrow::datatypes::DataType::Utf8, "{day}");
    }
    Ok(())
}

#[test]
fn empty_partition_of_a_normalized_category_is_processed() -> Result<()> {
    let project = TestProject::new()?;
    let src = project.source();
    src.records("works/updated_date=2025-01-01/part_0.gz", &[])?;
    src.records(
        "works/updated_date=2025-01-02/part_0.gz",
        &[json!({"id": "W1", "abstract_inverted_index": {"a": [0]}})],
    )?;

    let policy = NormalizationPolicy::from_json(
        r#"{"works": {"toSerializedText": ["abstract_inverted_index"]}}"#,
    )?;
    let engine = SyncEngine::new(
        project.config.clone(),
        ProcessingLedger::open(&project.config.ledger_path)?,
        policy,
        ArrowConverter::new(),
    );
    let report = engine.run()?;

    let works = report.stats.category(EntityCategory::Works);
    assert_eq!((works.processed, works.failed, works.records_added), (2, 0, 1));
    let empty = project.dest("works/updated_date=2025-01-01/part_0.parquet");
    assert_eq!(openalex_sync::io::parquet::parquet_row_count(&empty)?, 0);
    assert!(engine.ledger().failures(None)?.is_empty());
    Ok(())
}
