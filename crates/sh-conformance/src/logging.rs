use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

pub const LOG_SCHEMA_VERSION: &str = "sh-case-log-v1";

/// One structured log line per executed case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub schema_version: &'static str,
    pub ts_unix_ms: u64,
    pub suite_id: &'static str,
    pub test_id: String,
    pub fixture_id: &'static str,
    pub scenario_id: String,
    pub seed: u64,
    pub input_digest: String,
    pub output_digest: String,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub duration_ms: u64,
    pub outcome: &'static str,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &'static str,
        fixture_id: &'static str,
        test_id: impl Into<String>,
        scenario_id: impl Into<String>,
        input_digest: u64,
        output_digest: u64,
        artifact_refs: Vec<String>,
        replay_command: impl Into<String>,
        outcome: &'static str,
        reason_code: impl Into<String>,
    ) -> Self {
        let ts = sh_runtime::now_unix_ms();
        Self {
            schema_version: LOG_SCHEMA_VERSION,
            ts_unix_ms: u64::try_from(ts).unwrap_or(u64::MAX),
            suite_id,
            test_id: test_id.into(),
            fixture_id,
            scenario_id: scenario_id.into(),
            seed: det_seed(&[input_digest, output_digest]),
            input_digest: det64_label(input_digest),
            output_digest: det64_label(output_digest),
            env_fingerprint: env_fingerprint(),
            artifact_refs,
            replay_command: replay_command.into(),
            duration_ms: 0,
            outcome,
            reason_code: reason_code.into(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra_fields(mut self, fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(fields);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == "pass"
    }
}

/// FNV-1a over the little-endian bytes of each part.
#[must_use]
pub fn det_seed(parts: &[u64]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for value in parts {
        for byte in value.to_le_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

#[must_use]
pub fn det64_label(digest: u64) -> String {
    format!("det64:{digest:016x}")
}

#[must_use]
pub fn digest_dims<'a, I>(shapes: I) -> u64
where
    I: IntoIterator<Item = &'a [usize]>,
{
    let mut parts = Vec::new();
    for dims in shapes {
        parts.push(dims.len() as u64);
        parts.extend(dims.iter().map(|&dim| dim as u64));
    }
    det_seed(&parts)
}

#[must_use]
pub fn digest_outputs<'a, I>(outputs: I) -> u64
where
    I: IntoIterator<Item = &'a [i32]>,
{
    let mut parts = Vec::new();
    for values in outputs {
        parts.push(values.len() as u64);
        parts.extend(values.iter().map(|&value| u64::from(value as u32)));
    }
    det_seed(&parts)
}

fn env_fingerprint() -> String {
    let mut parts = Vec::new();
    for text in [
        std::env::consts::OS,
        std::env::consts::ARCH,
        env!("CARGO_PKG_VERSION"),
    ] {
        parts.extend(text.bytes().map(u64::from));
        parts.push(0);
    }
    det64_label(det_seed(&parts))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{Value, json};

    use super::{StructuredCaseLog, det_seed, det64_label, digest_dims, digest_outputs};

    fn sample() -> StructuredCaseLog {
        StructuredCaseLog::new(
            "shape_of",
            "shape_of_cases.json",
            "ShapeOfTest_0",
            "shape_of/rank3:f32:abc",
            7,
            9,
            vec!["crates/sh-conformance/fixtures/shape_of_cases.json".to_string()],
            "cargo test -p sh-conformance",
            "pass",
            "shape_of_parity_ok",
        )
    }

    #[test]
    fn det_seed_is_stable_and_order_sensitive() {
        assert_eq!(det_seed(&[]), 0xcbf2_9ce4_8422_2325);
        assert_eq!(det_seed(&[1, 2]), det_seed(&[1, 2]));
        assert_ne!(det_seed(&[1, 2]), det_seed(&[2, 1]));
        assert_eq!(det64_label(0xab), "det64:00000000000000ab");
    }

    #[test]
    fn digests_distinguish_shape_boundaries() {
        let split: [&[usize]; 2] = [&[8, 5], &[4]];
        let joined: [&[usize]; 1] = [&[8, 5, 4]];
        assert_ne!(digest_dims(split), digest_dims(joined));

        let a: [&[i32]; 1] = [&[8, 5, 2]];
        let b: [&[i32]; 1] = [&[8, 5, 3]];
        assert_ne!(digest_outputs(a), digest_outputs(b));
    }

    #[test]
    fn extra_fields_are_flattened_into_the_json_line() {
        let mut fields = BTreeMap::new();
        fields.insert("rank".to_string(), json!(3));
        let log = sample().with_extra_fields(fields).with_duration_ms(4);

        let value = serde_json::to_value(&log).expect("log should serialize");
        let object = value.as_object().expect("log is a JSON object");
        for key in [
            "schema_version",
            "suite_id",
            "test_id",
            "fixture_id",
            "scenario_id",
            "seed",
            "input_digest",
            "output_digest",
            "env_fingerprint",
            "artifact_refs",
            "replay_command",
            "duration_ms",
            "outcome",
            "reason_code",
        ] {
            assert!(object.contains_key(key), "missing log field '{key}'");
        }
        assert_eq!(object.get("rank"), Some(&json!(3)));
        assert_eq!(object.get("duration_ms").and_then(Value::as_u64), Some(4));
        assert!(!object.contains_key("extra_fields"));
        assert!(log.passed());
    }
}
