//! Structural comparison of responses from the primary and the diff target.
//!
//! Responses are compared through their serde data model, so any [`Serialize`] response type can
//! be diffed without knowing its schema. The comparison is exact: the same shape, the same values
//! and the same ordering of sequences. There is no tolerance for semantically equal but
//! differently encoded values.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::mem;
use std::sync::Arc;

use serde::Serialize;
use serde_value::Value;

use crate::metrics::{Counter, MetricsSink};

/// How two values at the same path differ.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MismatchKind {
    /// The values have different types, for instance a number and a string.
    Type,
    /// Sequences or maps contain a different number of entries.
    Length {
        /// Number of entries in the primary response.
        primary: usize,
        /// Number of entries in the diff response.
        diff: usize,
    },
    /// A field or map key is present in only one of the two responses.
    MissingField {
        /// The field name, or the formatted map key.
        field: String,
    },
    /// Two leaf values differ.
    Value,
    /// A response could not be mapped to a comparable form.
    Unrepresentable {
        /// The serialization error.
        reason: String,
    },
}

/// The first difference found between two responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    /// Location of the difference, starting with `$` for the root.
    pub path: String,
    /// The kind of difference at `path`.
    pub kind: MismatchKind,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MismatchKind::Type => write!(f, "type differs at {}", self.path),
            MismatchKind::Length { primary, diff } => {
                write!(f, "length differs at {} ({primary} vs {diff})", self.path)
            }
            MismatchKind::MissingField { field } => {
                write!(f, "field `{field}` missing on one side at {}", self.path)
            }
            MismatchKind::Value => write!(f, "value differs at {}", self.path),
            MismatchKind::Unrepresentable { reason } => {
                write!(f, "cannot compare at {}: {reason}", self.path)
            }
        }
    }
}

/// Returns the first structural difference between two values, if any.
///
/// Floats are compared by value with all NaNs equal to each other, so `NaN`, `inf` and `-inf`
/// remain distinguishable. Map keys of any type are supported.
pub fn structural_diff(primary: &Value, diff: &Value) -> Option<Mismatch> {
    diff_at("$", primary, diff)
}

fn diff_at(path: &str, primary: &Value, diff: &Value) -> Option<Mismatch> {
    let mismatch = |kind| {
        Some(Mismatch {
            path: path.to_owned(),
            kind,
        })
    };

    match (primary, diff) {
        (Value::Seq(a), Value::Seq(b)) => {
            if a.len() != b.len() {
                return mismatch(MismatchKind::Length {
                    primary: a.len(),
                    diff: b.len(),
                });
            }
            a.iter()
                .zip(b)
                .enumerate()
                .find_map(|(index, (a, b))| diff_at(&format!("{path}[{index}]"), a, b))
        }
        (Value::Map(a), Value::Map(b)) => diff_maps(path, a, b),
        (Value::Option(Some(a)), Value::Option(Some(b))) => diff_at(path, a, b),
        (Value::Option(a), Value::Option(b)) if a.is_some() != b.is_some() => {
            mismatch(MismatchKind::Value)
        }
        (Value::Newtype(a), Value::Newtype(b)) => diff_at(path, a, b),
        (a, b) if mem::discriminant(a) != mem::discriminant(b) => mismatch(MismatchKind::Type),
        (a, b) if a != b => mismatch(MismatchKind::Value),
        _ => None,
    }
}

fn diff_maps(
    path: &str,
    primary: &BTreeMap<Value, Value>,
    diff: &BTreeMap<Value, Value>,
) -> Option<Mismatch> {
    let missing = primary
        .keys()
        .find(|key| !diff.contains_key(*key))
        .or_else(|| diff.keys().find(|key| !primary.contains_key(*key)));
    if let Some(key) = missing {
        return Some(Mismatch {
            path: path.to_owned(),
            kind: MismatchKind::MissingField {
                field: format_key(key),
            },
        });
    }

    primary.iter().find_map(|(key, a)| {
        let path = match key {
            Value::String(field) => format!("{path}.{field}"),
            key => format!("{path}[{}]", format_key(key)),
        };
        diff.get(key).and_then(|b| diff_at(&path, a, b))
    })
}

fn format_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Bool(v) => v.to_string(),
        Value::U8(v) => v.to_string(),
        Value::U16(v) => v.to_string(),
        Value::U32(v) => v.to_string(),
        Value::U64(v) => v.to_string(),
        Value::I8(v) => v.to_string(),
        Value::I16(v) => v.to_string(),
        Value::I32(v) => v.to_string(),
        Value::I64(v) => v.to_string(),
        Value::Char(v) => v.to_string(),
        key => format!("{key:?}"),
    }
}

/// A request whose responses diverged between the primary and the diff target.
#[derive(Clone, Debug, PartialEq)]
pub struct DivergenceEvent<Req, Resp> {
    /// The request sent to both targets.
    pub request: Req,
    /// The response of the primary target.
    pub primary: Resp,
    /// The response of the diff target.
    pub diff: Resp,
    /// The first difference between the two responses.
    pub mismatch: Mismatch,
}

/// Compares primary and diff responses and records divergence.
#[derive(Debug)]
pub struct DiffComparator {
    metrics: Arc<dyn MetricsSink>,
}

impl DiffComparator {
    /// Creates a comparator reporting to the given metrics sink.
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self { metrics }
    }

    /// Compares two responses to the same request.
    ///
    /// Returns `None` if they are structurally equal. Otherwise, increments the diff counter, logs
    /// the request and both responses, and returns the divergence.
    pub fn compare<Req, Resp>(
        &self,
        request: &Req,
        primary: &Resp,
        diff: &Resp,
    ) -> Option<DivergenceEvent<Req, Resp>>
    where
        Req: Clone + Debug,
        Resp: Clone + Debug + Serialize,
    {
        let mismatch = match (serde_value::to_value(primary), serde_value::to_value(diff)) {
            (Ok(a), Ok(b)) => structural_diff(&a, &b)?,
            (Err(error), _) | (_, Err(error)) => Mismatch {
                path: "$".into(),
                kind: MismatchKind::Unrepresentable {
                    reason: error.to_string(),
                },
            },
        };

        self.metrics.increment_counter(Counter::Diffs, 1);
        tracing::warn!(
            request = ?request,
            primary = ?primary,
            diff = ?diff,
            %mismatch,
            "responses diverged"
        );

        Some(DivergenceEvent {
            request: request.clone(),
            primary: primary.clone(),
            diff: diff.clone(),
            mismatch,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io;
    use std::sync::Mutex;

    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::metrics::LocalMetrics;
    use crate::target::{SingleKeyRequest, SingleKeyResponse};

    fn value(json: serde_json::Value) -> Value {
        serde_value::to_value(json).unwrap()
    }

    fn comparator() -> (DiffComparator, Arc<LocalMetrics>) {
        let metrics = Arc::new(LocalMetrics::new());
        (DiffComparator::new(metrics.clone()), metrics)
    }

    fn response(values: &[(i32, &'static str)]) -> SingleKeyResponse {
        SingleKeyResponse {
            key_count: values.len() as i32,
            values: values
                .iter()
                .map(|(index, value)| (*index, Bytes::from_static(value.as_bytes())))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn request() -> SingleKeyRequest {
        SingleKeyRequest {
            collection: "testdata".into(),
            sorted_keys: vec![Bytes::from_static(b"key-1")],
        }
    }

    #[test]
    fn equal_values_have_no_diff() {
        let a = value(json!({"a": [1, 2, {"b": null}], "c": "d", "e": true}));
        assert_eq!(structural_diff(&a, &a.clone()), None);
    }

    #[test]
    fn leaf_value_differs() {
        let mismatch = structural_diff(
            &value(json!({"a": [1, 2]})),
            &value(json!({"a": [1, 3]})),
        )
        .unwrap();
        assert_eq!(mismatch.path, "$.a[1]");
        assert_eq!(mismatch.kind, MismatchKind::Value);
    }

    #[test]
    fn ordering_matters() {
        let mismatch = structural_diff(&value(json!([1, 2])), &value(json!([2, 1]))).unwrap();
        assert_eq!(mismatch.path, "$[0]");
    }

    #[test]
    fn length_differs() {
        let mismatch = structural_diff(&value(json!([1, 2])), &value(json!([1, 2, 3]))).unwrap();
        assert_eq!(
            mismatch.kind,
            MismatchKind::Length {
                primary: 2,
                diff: 3
            }
        );
    }

    #[test]
    fn missing_field_on_either_side() {
        let mismatch = structural_diff(
            &value(json!({"a": 1})),
            &value(json!({"a": 1, "b": 2})),
        )
        .unwrap();
        assert_eq!(
            mismatch.kind,
            MismatchKind::MissingField { field: "b".into() }
        );

        let mismatch = structural_diff(
            &value(json!({"a": 1, "b": 2})),
            &value(json!({"b": 2})),
        )
        .unwrap();
        assert_eq!(
            mismatch.kind,
            MismatchKind::MissingField { field: "a".into() }
        );
    }

    #[test]
    fn type_differs() {
        let mismatch = structural_diff(
            &value(json!({"a": 1})),
            &value(json!({"a": "1"})),
        )
        .unwrap();
        assert_eq!(mismatch.path, "$.a");
        assert_eq!(mismatch.kind, MismatchKind::Type);
        assert!(structural_diff(&value(json!(null)), &value(json!(false))).is_some());
    }

    #[derive(Clone, Debug, Serialize)]
    struct Scored {
        score: f64,
    }

    #[test]
    fn non_finite_floats_are_distinct() {
        let (comparator, metrics) = comparator();
        let nan = Scored { score: f64::NAN };
        let inf = Scored {
            score: f64::INFINITY,
        };
        let neg_inf = Scored {
            score: f64::NEG_INFINITY,
        };

        let event = comparator.compare(&"req", &nan, &inf).unwrap();
        assert_eq!(event.mismatch.path, "$.score");
        assert_eq!(event.mismatch.kind, MismatchKind::Value);
        assert!(comparator.compare(&"req", &inf, &neg_inf).is_some());
        assert!(comparator.compare(&"req", &nan, &nan.clone()).is_none());
        assert_eq!(metrics.counter(Counter::Diffs), 2);
    }

    #[test]
    fn non_string_map_keys_are_compared() {
        let (comparator, metrics) = comparator();
        let primary = BTreeMap::from([((1, 2), 3), ((4, 5), 6)]);

        assert!(comparator.compare(&"req", &primary, &primary.clone()).is_none());
        assert_eq!(metrics.counter(Counter::Diffs), 0);

        let mut diff = primary.clone();
        diff.insert((4, 5), 7);
        let event = comparator.compare(&"req", &primary, &diff).unwrap();
        assert_eq!(event.mismatch.kind, MismatchKind::Value);
        assert!(event.mismatch.path.starts_with("$["));

        diff.remove(&(1, 2));
        let event = comparator.compare(&"req", &primary, &diff).unwrap();
        assert!(matches!(
            event.mismatch.kind,
            MismatchKind::MissingField { .. }
        ));
    }

    #[test]
    fn identical_responses_do_not_count() {
        let (comparator, metrics) = comparator();
        let primary = response(&[(0, "v1"), (1, "v2")]);

        assert!(comparator.compare(&request(), &primary, &primary.clone()).is_none());
        assert_eq!(metrics.counter(Counter::Diffs), 0);
    }

    #[test]
    fn count_mismatch_diverges() {
        let (comparator, metrics) = comparator();
        let primary = response(&[(0, "v1")]);
        let diff = response(&[]);

        let event = comparator.compare(&request(), &primary, &diff).unwrap();
        assert_eq!(event.mismatch.path, "$.key_count");
        assert_eq!(metrics.counter(Counter::Diffs), 1);
    }

    /// Collects formatted log output for inspection.
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn single_value_divergence_is_logged() {
        let (comparator, metrics) = comparator();
        let request = request();
        let primary = response(&[(0, "value-one")]);
        let diff = response(&[(0, "value-two")]);

        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let capture = capture.clone();
                move || capture.clone()
            })
            .with_ansi(false)
            .finish();

        let event = tracing::subscriber::with_default(subscriber, || {
            comparator.compare(&request, &primary, &diff)
        })
        .unwrap();

        assert_eq!(metrics.counter(Counter::Diffs), 1);
        assert_eq!(event.request, request);
        assert_eq!(event.primary, primary);
        assert_eq!(event.diff, diff);
        assert!(event.mismatch.path.starts_with("$.values[0]"));

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("responses diverged"));
        assert!(output.contains(&format!("{request:?}")));
        assert!(output.contains(&format!("{primary:?}")));
        assert!(output.contains(&format!("{diff:?}")));
    }
}
