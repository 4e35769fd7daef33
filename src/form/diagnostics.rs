use tracing::warn;

use super::schema::ValidatorFailure;
use crate::path::FieldPath;

/// Receives validator problems that never surface as `Err` values.
pub trait Diagnostics: Send + Sync {
    /// A validator returned an error or panicked. The field shows the form's
    /// failure message instead.
    fn validator_failed(&self, path: &FieldPath, failure: &ValidatorFailure);

    /// A schema or validator is set up wrong. Reported once per field until
    /// the schema is replaced; `path` is `None` for schema-level problems.
    fn misconfigured(&self, path: Option<&FieldPath>, detail: &str);
}

/// Default sink: `warn!` events on the `calmform` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn validator_failed(&self, path: &FieldPath, failure: &ValidatorFailure) {
        warn!(target: "calmform", path = %path, %failure, "validator failed");
    }

    fn misconfigured(&self, path: Option<&FieldPath>, detail: &str) {
        match path {
            Some(path) => {
                warn!(target: "calmform", path = %path, detail, "validator misconfigured")
            }
            None => warn!(target: "calmform", detail, "validation schema misconfigured"),
        }
    }
}
