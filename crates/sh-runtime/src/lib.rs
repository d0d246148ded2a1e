#![forbid(unsafe_code)]

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvidenceKind {
    Policy,
    Selection,
    Compile,
    Bind,
    Execute,
    Failure,
}

impl EvidenceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Selection => "selection",
            Self::Compile => "compile",
            Self::Bind => "bind",
            Self::Execute => "execute",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn count(&self, kind: EvidenceKind) -> usize {
        self.entries.iter().filter(|entry| entry.kind == kind).count()
    }

    pub fn summaries_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |entry| entry.kind == kind)
            .map(|entry| entry.summary.as_str())
    }
}

/// Ledger plus the label of the policy the owning engine runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    policy: String,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(policy: impl Into<String>) -> Self {
        let policy = policy.into();
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!("policy initialized to {policy}"),
        );
        Self { policy, ledger }
    }

    #[must_use]
    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: impl Into<String>) {
        self.policy = policy.into();
        self.ledger.record(
            EvidenceKind::Policy,
            format!("policy switched to {}", self.policy),
        );
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn record_failure<E>(&mut self, stage: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger.record(
            EvidenceKind::Failure,
            format!("{stage} failed: {error}"),
        );
    }
}

#[must_use]
pub fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
