#![forbid(unsafe_code)]

pub mod cases;
pub mod compare;
pub mod driver;
pub mod logging;

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use rayon::prelude::*;
use serde::Deserialize;
use serde_json::{Value, json};
use sh_core::ElementPrecision;
use sh_device::{CpuEngine, ExecutionEngine};
use sh_graph::{GraphPair, build_shape_of_graph, interpret_reference};

pub use cases::{
    ConfigError, LayoutSpec, RejectedEntry, RejectedSubject, ShapeFamily, ShapeOfSuite, TestCase,
    enumerate_test_cases, layouts_for_rank, parse_precision, validate_family,
    validate_suite_coverage,
};
pub use compare::{
    Divergence, DivergenceKind, OracleError, ShapeComparison, ShapeObservation, compare_shape,
    reference_shape_of,
};
pub use driver::{DriverError, DriverState, ExecutionDriver};
pub use logging::StructuredCaseLog;

use cases::ShapeOfFixtureFile;
use logging::{digest_dims, digest_outputs};

pub const SHAPE_OF_FIXTURE: &str = "shape_of_cases.json";
pub const SHAPE_OF_LOG_ENV: &str = "SH_SHAPE_OF_LOG_PATH";
const SUITE_ID: &str = "shape_of";
const MAX_FIXTURE_BYTES: u64 = 1_048_576;

static CASE_LOG_PATH: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    /// JSONL file each case log is appended to. Falls back to
    /// [`set_case_log_path`] and then `SH_SHAPE_OF_LOG_PATH`.
    pub log_path: Option<PathBuf>,
    pub parallel: bool,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            log_path: None,
            parallel: true,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub cases_total: usize,
    pub cases_passed: usize,
    pub divergences: usize,
    pub config_errors: usize,
}

/// Outcome of one case. Reports for rejected fixture entries carry only what
/// the entry defined, so `rank`, `precision` and `layout` may be absent.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeOfCaseReport {
    pub name: String,
    pub index: usize,
    pub rank: Option<usize>,
    pub precision: Option<ElementPrecision>,
    pub layout: Option<LayoutSpec>,
    pub config_error: Option<ConfigError>,
    pub compile_error: Option<String>,
    pub compile_count: usize,
    pub shapes: Vec<ShapeComparison>,
    pub divergences: Vec<Divergence>,
    pub forensic_log: StructuredCaseLog,
}

impl ShapeOfCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.config_error.is_none()
            && self.compile_error.is_none()
            && self.compile_count == 1
            && !self.shapes.is_empty()
            && self.shapes.iter().all(ShapeComparison::passed)
            && self.divergences.is_empty()
    }

    pub fn divergences_of(&self, kind: DivergenceKind) -> impl Iterator<Item = &Divergence> {
        self.divergences
            .iter()
            .filter(move |divergence| divergence.kind == kind)
    }
}

/// Narrows the enumerated cases. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseFilter {
    pub rank: Option<usize>,
    pub precision: Option<ElementPrecision>,
    pub name_contains: Option<String>,
}

impl CaseFilter {
    #[must_use]
    pub fn matches(&self, case: &TestCase) -> bool {
        self.rank.is_none_or(|rank| rank == case.rank())
            && self
                .precision
                .is_none_or(|precision| precision == case.precision)
            && self
                .name_contains
                .as_deref()
                .is_none_or(|needle| case.name().contains(needle))
    }

    /// A rejected family applies to every precision; a rejected precision
    /// label never matches a precision filter.
    #[must_use]
    pub fn matches_rejected(&self, entry: &RejectedEntry) -> bool {
        self.rank.is_none_or(|rank| entry.rank() == Some(rank))
            && (self.precision.is_none()
                || !matches!(entry.subject, RejectedSubject::Precision { .. }))
            && self
                .name_contains
                .as_deref()
                .is_none_or(|needle| entry.label().contains(needle))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixSummary {
    pub output_path: PathBuf,
    pub log_entries: usize,
    pub failed_entries: usize,
    pub divergences: usize,
    pub config_errors: usize,
}

pub fn set_case_log_path(path: Option<PathBuf>) {
    let cell = CASE_LOG_PATH.get_or_init(|| Mutex::new(None));
    if let Ok(mut slot) = cell.lock() {
        *slot = path;
    }
}

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .count();

    let (cases_total, cases_passed, divergences, config_errors) = run_shape_of_conformance(config)
        .map_or((0, 0, 0, 0), |(report, _)| {
            (
                report.cases_total,
                report.cases_passed,
                report.divergences,
                report.config_errors,
            )
        });

    HarnessReport {
        suite: "smoke",
        fixture_count,
        cases_total,
        cases_passed,
        divergences,
        config_errors,
    }
}

pub fn load_shape_of_suite(config: &HarnessConfig) -> Result<ShapeOfSuite, String> {
    let fixture_path = config.fixture_root.join(SHAPE_OF_FIXTURE);
    let fixture: ShapeOfFixtureFile = load_fixture(&fixture_path)?;
    Ok(fixture.into_suite())
}

pub fn run_shape_of_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<ShapeOfCaseReport>), String> {
    run_shape_of_conformance_with(config, &CpuEngine::new(), &CaseFilter::default())
}

pub fn run_shape_of_conformance_with<E>(
    config: &HarnessConfig,
    engine: &E,
    filter: &CaseFilter,
) -> Result<(HarnessReport, Vec<ShapeOfCaseReport>), String>
where
    E: ExecutionEngine + ?Sized,
{
    let suite = load_shape_of_suite(config)?;
    let mut cases = suite
        .test_cases()
        .map_err(|error| format!("failed enumerating shape_of cases: {error}"))?;
    let enumerated = cases.len();
    cases.retain(|case| filter.matches(case));

    let mut case_reports = run_cases(engine, &cases, config.parallel);
    case_reports.extend(
        suite
            .rejected
            .iter()
            .filter(|entry| filter.matches_rejected(entry))
            .enumerate()
            .map(|(offset, entry)| rejected_entry_report(engine.name(), enumerated + offset, entry)),
    );
    for case in &case_reports {
        maybe_append_case_log(config, &case.forensic_log)?;
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(ShapeOfCaseReport::passed));
    let report = HarnessReport {
        suite: SUITE_ID,
        fixture_count: 1,
        cases_total,
        cases_passed,
        divergences: case_reports.iter().map(|case| case.divergences.len()).sum(),
        config_errors: case_reports
            .iter()
            .filter(|case| case.config_error.is_some())
            .count(),
    };
    Ok((report, case_reports))
}

/// Runs independent cases, in parallel when asked. Reports come back in case
/// order either way.
pub fn run_cases<E>(engine: &E, cases: &[TestCase], parallel: bool) -> Vec<ShapeOfCaseReport>
where
    E: ExecutionEngine + ?Sized,
{
    if parallel {
        cases
            .par_iter()
            .map(|case| run_shape_of_case(engine, case))
            .collect()
    } else {
        cases
            .iter()
            .map(|case| run_shape_of_case(engine, case))
            .collect()
    }
}

/// Builds, compiles once and drives one case through its shape sequence,
/// comparing every shape against the oracle and the reference graph.
pub fn run_shape_of_case<E>(engine: &E, case: &TestCase) -> ShapeOfCaseReport
where
    E: ExecutionEngine + ?Sized,
{
    let started = Instant::now();

    if let Err(error) = case.validate() {
        return finish_case(engine, case, CaseRun::rejected(error), started);
    }

    let pair = match build_shape_of_graph(&case.symbolic, case.precision, case.layout.rt_info()) {
        Ok(pair) => pair,
        Err(error) => {
            return finish_case(engine, case, CaseRun::failed(error.to_string()), started);
        }
    };
    let GraphPair { device, reference } = pair;

    let mut driver = match ExecutionDriver::new(engine, device) {
        Ok(driver) => driver,
        Err(error) => {
            return finish_case(engine, case, CaseRun::failed(error.to_string()), started);
        }
    };
    let outcomes = match driver.run_sequence(&case.shapes) {
        Ok(outcomes) => outcomes,
        Err(error) => {
            return finish_case(engine, case, CaseRun::failed(error.to_string()), started);
        }
    };

    let first_compiled_id = driver.compiled_id();
    let mut run = CaseRun {
        config_error: None,
        compile_error: None,
        compile_count: driver.compile_count(),
        compiled_id: first_compiled_id,
        shapes: Vec::with_capacity(case.shapes.len()),
        divergences: Vec::new(),
    };
    for (shape_index, (shape, outcome)) in case.shapes.iter().zip(outcomes.iter()).enumerate() {
        let observation = ShapeObservation {
            shape_index,
            shape,
            device: outcome,
            reference: interpret_reference(&reference, shape).map_err(|error| error.to_string()),
            first_compiled_id,
        };
        let (comparison, divergences) = compare_shape(case, &observation);
        run.shapes.push(comparison);
        run.divergences.extend(divergences);
    }
    finish_case(engine, case, run, started)
}

struct CaseRun {
    config_error: Option<ConfigError>,
    compile_error: Option<String>,
    compile_count: usize,
    compiled_id: Option<u64>,
    shapes: Vec<ShapeComparison>,
    divergences: Vec<Divergence>,
}

impl CaseRun {
    fn failed(error: String) -> Self {
        Self {
            compile_error: Some(error),
            ..Self::empty()
        }
    }

    fn rejected(error: ConfigError) -> Self {
        Self {
            config_error: Some(error),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            config_error: None,
            compile_error: None,
            compile_count: 0,
            compiled_id: None,
            shapes: Vec::new(),
            divergences: Vec::new(),
        }
    }
}

const CONFIG_ERROR_REASON: &str = "shape_of_config_error";

fn reason_code(run: &CaseRun, passed: bool) -> &'static str {
    let has = |kind: DivergenceKind| run.divergences.iter().any(|d| d.kind == kind);
    if run.config_error.is_some() {
        CONFIG_ERROR_REASON
    } else if run.compile_error.is_some() {
        "shape_of_compile_failed"
    } else if has(DivergenceKind::Execution) {
        "shape_of_execution_divergence"
    } else if has(DivergenceKind::Recompile) {
        "shape_of_recompile_divergence"
    } else if has(DivergenceKind::LayoutSelection) {
        "shape_of_layout_selection_divergence"
    } else if has(DivergenceKind::Reference) {
        "shape_of_reference_divergence"
    } else if !passed {
        "shape_of_compile_contract_violated"
    } else {
        "shape_of_parity_ok"
    }
}

fn finish_case<E>(engine: &E, case: &TestCase, run: CaseRun, started: Instant) -> ShapeOfCaseReport
where
    E: ExecutionEngine + ?Sized,
{
    let name = case.name();
    let passed = run.config_error.is_none()
        && run.compile_error.is_none()
        && run.compile_count == 1
        && !run.shapes.is_empty()
        && run.shapes.iter().all(ShapeComparison::passed)
        && run.divergences.is_empty();

    let input_digest = digest_dims(case.shapes.iter().map(|shape| shape.dims()));
    let output_digest = digest_outputs(
        run.shapes
            .iter()
            .filter_map(|shape| shape.actual.as_deref()),
    );
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let forensic_log = StructuredCaseLog::new(
        SUITE_ID,
        SHAPE_OF_FIXTURE,
        name.as_str(),
        format!(
            "shape_of/rank{}:{}:{}",
            case.rank(),
            case.precision,
            case.layout.input_format
        ),
        input_digest,
        output_digest,
        vec![format!("crates/sh-conformance/fixtures/{SHAPE_OF_FIXTURE}")],
        format!("cargo run -p sh-conformance --bin run_shape_of_matrix -- --filter '{name}'"),
        if passed { "pass" } else { "fail" },
        reason_code(&run, passed),
    )
    .with_duration_ms(duration_ms)
    .with_extra_fields(case_forensic_fields(engine.name(), case, &run));

    ShapeOfCaseReport {
        name,
        index: case.index,
        rank: Some(case.rank()),
        precision: Some(case.precision),
        layout: Some(case.layout),
        config_error: run.config_error,
        compile_error: run.compile_error,
        compile_count: run.compile_count,
        shapes: run.shapes,
        divergences: run.divergences,
        forensic_log,
    }
}

fn case_forensic_fields(engine: &str, case: &TestCase, run: &CaseRun) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    fields.insert("engine".to_string(), json!(engine));
    fields.insert("family".to_string(), json!(case.family));
    fields.insert("rank".to_string(), json!(case.rank()));
    fields.insert("precision".to_string(), json!(case.precision.label()));
    fields.insert(
        "input_format".to_string(),
        json!(case.layout.input_format.name()),
    );
    fields.insert(
        "output_format".to_string(),
        json!(case.layout.output_format.name()),
    );
    fields.insert("expected_type".to_string(), json!(case.expected_type()));
    fields.insert(
        "symbolic_shape".to_string(),
        json!(case.symbolic.to_string()),
    );
    fields.insert(
        "shapes".to_string(),
        json!(
            case.shapes
                .iter()
                .map(|shape| shape.dims().to_vec())
                .collect::<Vec<_>>()
        ),
    );
    fields.insert(
        "outputs".to_string(),
        json!(
            run.shapes
                .iter()
                .map(|shape| shape.actual.clone())
                .collect::<Vec<_>>()
        ),
    );
    fields.insert("comparisons".to_string(), json!(run.shapes));
    fields.insert("compile_count".to_string(), json!(run.compile_count));
    fields.insert("compiled_id".to_string(), json!(run.compiled_id));
    fields.insert("compile_error".to_string(), json!(run.compile_error));
    fields.insert(
        "config_error".to_string(),
        json!(run.config_error.as_ref().map(ToString::to_string)),
    );
    fields.insert("divergences".to_string(), json!(run.divergences));
    fields
}

/// Report for a fixture entry that never became a runnable case.
fn rejected_entry_report(engine: &str, index: usize, entry: &RejectedEntry) -> ShapeOfCaseReport {
    let name = format!("ShapeOfConfig_{index}_{}", entry.label());
    let shapes: &[Vec<usize>] = match &entry.subject {
        RejectedSubject::Family { shapes, .. } => shapes.as_slice(),
        RejectedSubject::Precision { .. } | RejectedSubject::Coverage { .. } => &[],
    };

    let mut fields = BTreeMap::new();
    fields.insert("engine".to_string(), json!(engine));
    fields.insert("rank".to_string(), json!(entry.rank()));
    fields.insert("shapes".to_string(), json!(shapes));
    fields.insert("config_error".to_string(), json!(entry.error.to_string()));
    match &entry.subject {
        RejectedSubject::Family { name, .. } => {
            fields.insert("family".to_string(), json!(name));
        }
        RejectedSubject::Precision { label } => {
            fields.insert("precision".to_string(), json!(label));
        }
        RejectedSubject::Coverage { .. } => {}
    }

    let forensic_log = StructuredCaseLog::new(
        SUITE_ID,
        SHAPE_OF_FIXTURE,
        name.as_str(),
        format!("shape_of/config:{}", entry.label()),
        digest_dims(shapes.iter().map(Vec::as_slice)),
        digest_outputs(std::iter::empty()),
        vec![format!("crates/sh-conformance/fixtures/{SHAPE_OF_FIXTURE}")],
        format!(
            "cargo run -p sh-conformance --bin run_shape_of_matrix -- --filter '{}'",
            entry.label()
        ),
        "fail",
        CONFIG_ERROR_REASON,
    )
    .with_extra_fields(fields);

    ShapeOfCaseReport {
        name,
        index,
        rank: entry.rank(),
        precision: None,
        layout: None,
        config_error: Some(entry.error.clone()),
        compile_error: None,
        compile_count: 0,
        shapes: Vec::new(),
        divergences: Vec::new(),
        forensic_log,
    }
}

/// Runs the filtered suite and writes every case log to `output_path` as
/// JSONL, replacing any previous file.
pub fn emit_shape_of_matrix(
    config: &HarnessConfig,
    output_path: &Path,
    filter: &CaseFilter,
) -> Result<MatrixSummary, String> {
    let (report, case_reports) =
        run_shape_of_conformance_with(config, &CpuEngine::new(), filter)?;

    let mut lines = String::new();
    for case in &case_reports {
        let line = serde_json::to_string(&case.forensic_log)
            .map_err(|error| format!("failed to serialize structured log entry: {error}"))?;
        lines.push_str(&line);
        lines.push('\n');
    }

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            format!(
                "failed to create shape_of matrix output dir {}: {error}",
                parent.display()
            )
        })?;
    }
    fs::write(output_path, lines).map_err(|error| {
        format!(
            "failed to write shape_of matrix log {}: {error}",
            output_path.display()
        )
    })?;

    Ok(MatrixSummary {
        output_path: output_path.to_path_buf(),
        log_entries: case_reports.len(),
        failed_entries: report.cases_total - report.cases_passed,
        divergences: report.divergences,
        config_errors: report.config_errors,
    })
}

fn maybe_append_case_log(config: &HarnessConfig, entry: &StructuredCaseLog) -> Result<(), String> {
    let configured = CASE_LOG_PATH
        .get()
        .and_then(|cell| cell.lock().ok())
        .and_then(|slot| slot.clone());
    let from_env = std::env::var_os(SHAPE_OF_LOG_ENV).map(PathBuf::from);
    let Some(path) = config.log_path.clone().or(configured).or(from_env) else {
        return Ok(());
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed creating {}: {err}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| format!("failed opening {}: {err}", path.display()))?;
    let line = serde_json::to_string(entry)
        .map_err(|err| format!("failed serializing shape_of log entry: {err}"))?;
    let mut payload = line.into_bytes();
    payload.push(b'\n');
    file.write_all(&payload)
        .map_err(|err| format!("failed appending shape_of log {}: {err}", path.display()))
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}
