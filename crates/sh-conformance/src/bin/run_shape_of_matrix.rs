#![forbid(unsafe_code)]

use std::path::PathBuf;

use serde_json::json;
use sh_conformance::{CaseFilter, HarnessConfig, emit_shape_of_matrix};
use sh_core::ElementPrecision;

const USAGE: &str = "usage: run_shape_of_matrix [--rank 3|4|5] [--precision f32|bf16|i32|i8] [--filter substring] [--output path] [--sequential] [--print-full-log]";

fn main() -> Result<(), String> {
    let mut filter = CaseFilter::default();
    let mut output: Option<PathBuf> = None;
    let mut print_full_log = false;
    let mut config = HarnessConfig::default_paths();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rank" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--rank requires one of: 3|4|5".to_string())?;
                filter.rank = Some(parse_rank(value.as_str())?);
            }
            "--precision" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--precision requires one of: f32|bf16|i32|i8".to_string())?;
                let precision = ElementPrecision::from_label(value.as_str())
                    .map_err(|error| error.to_string())?;
                filter.precision = Some(precision);
            }
            "--filter" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--filter requires a case-name substring".to_string())?;
                filter.name_contains = Some(value);
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--sequential" => {
                config.parallel = false;
            }
            "--print-full-log" => {
                print_full_log = true;
            }
            other => {
                return Err(format!("unknown arg '{other}'. {USAGE}"));
            }
        }
    }

    let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
    let output_path =
        output.unwrap_or_else(|| repo_root.join("artifacts/shape_of/shape_of_matrix.jsonl"));

    let summary = emit_shape_of_matrix(&config, output_path.as_path(), &filter)?;

    if print_full_log {
        let raw = std::fs::read_to_string(summary.output_path.as_path()).map_err(|error| {
            format!(
                "failed to read generated shape_of log {}: {error}",
                summary.output_path.display()
            )
        })?;
        print!("{raw}");
        return Ok(());
    }

    let status = if summary.failed_entries == 0 {
        "ok"
    } else {
        "divergent"
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": status,
            "output_path": summary.output_path.display().to_string(),
            "log_entries": summary.log_entries,
            "failed_entries": summary.failed_entries,
            "divergences": summary.divergences,
            "config_errors": summary.config_errors,
            "rank_filter": filter.rank,
            "precision_filter": filter.precision.map(ElementPrecision::label),
            "name_filter": filter.name_contains,
            "parallel": config.parallel,
        }))
        .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    Ok(())
}

fn parse_rank(raw: &str) -> Result<usize, String> {
    match raw {
        "3" => Ok(3),
        "4" => Ok(4),
        "5" => Ok(5),
        _ => Err(format!("unsupported rank '{raw}'; expected 3|4|5")),
    }
}
