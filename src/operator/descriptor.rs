// SPDX-License-Identifier: Apache-2.0

//! Decoding of operator descriptors from a pipeline configuration document.

use serde_yaml::{Mapping, Value};
use std::collections::HashSet;

use crate::error::{Error, Result};

/// One decoded operator descriptor: the `id`/`type`/`output` head plus the
/// remaining type-specific settings.
#[derive(Debug, Clone)]
pub struct OperatorDescriptor {
    pub id: String,
    pub operator_type: String,
    /// Resolved downstream ids, after default chaining
    pub outputs: Vec<String>,
    /// Whether `output` was given explicitly (disables default chaining and
    /// is rejected by sinks)
    pub explicit_output: bool,
    /// The full descriptor mapping as written, for type-specific decoding
    pub settings: Mapping,
}

impl OperatorDescriptor {
    /// The type-specific settings: everything except the descriptor head
    pub fn params(&self) -> Mapping {
        let mut params = self.settings.clone();
        for key in ["id", "type", "output"] {
            params.remove(&Value::String(key.to_string()));
        }
        params
    }

    /// Decode the type-specific settings into a typed configuration
    pub fn decode_settings<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_yaml::from_value(Value::Mapping(self.params())).map_err(|e| {
            Error::Config(format!(
                "invalid configuration for operator '{}' (type {}): {}",
                self.id, self.operator_type, e
            ))
        })
    }

    /// Input queue capacity for this operator: the optional `buffer`
    /// setting, or the build default
    pub fn buffer_capacity(&self, default: usize) -> Result<usize> {
        match get(&self.settings, "buffer") {
            None => Ok(default),
            Some(value) => match value.as_u64() {
                Some(n) if n > 0 => Ok(n as usize),
                _ => Err(Error::Config(format!(
                    "operator '{}': buffer must be a positive integer",
                    self.id
                ))),
            },
        }
    }

    /// Re-emit this descriptor with its resolved id and outputs explicit
    pub fn to_value(&self) -> Value {
        let mut mapping = self.params();
        mapping.insert(
            Value::String("id".to_string()),
            Value::String(self.id.clone()),
        );
        mapping.insert(
            Value::String("type".to_string()),
            Value::String(self.operator_type.clone()),
        );
        mapping.insert(
            Value::String("output".to_string()),
            Value::Sequence(
                self.outputs
                    .iter()
                    .map(|o| Value::String(o.clone()))
                    .collect(),
            ),
        );
        Value::Mapping(mapping)
    }
}

fn get<'a>(mapping: &'a Mapping, key: &str) -> Option<&'a Value> {
    mapping.get(&Value::String(key.to_string()))
}

fn decode_output(value: &Value, id: &str) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Sequence(seq) => seq
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                _ => Err(Error::Config(format!(
                    "operator '{}': output entries must be strings",
                    id
                ))),
            })
            .collect(),
        _ => Err(Error::Config(format!(
            "operator '{}': output must be a string or a list of strings",
            id
        ))),
    }
}

/// Decode a pipeline document into descriptors.
///
/// `id` defaults to `type`; ids must be unique after defaulting. An
/// operator that omits `output` is chained to the next operator in
/// declaration order; the last operator without an explicit output emits to
/// the pipeline end.
pub fn decode_descriptors(document: &Value) -> Result<Vec<OperatorDescriptor>> {
    let sequence = document.as_sequence().ok_or_else(|| {
        Error::Config("pipeline configuration must be a sequence of operators".to_string())
    })?;

    let mut descriptors = Vec::with_capacity(sequence.len());
    for item in sequence {
        let mapping = item.as_mapping().ok_or_else(|| {
            Error::Config("each pipeline entry must be an operator descriptor".to_string())
        })?;

        let operator_type = match get(mapping, "type") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(_) => {
                return Err(Error::Config(
                    "operator type must be a non-empty string".to_string(),
                ))
            }
            None => {
                return Err(Error::Config(
                    "operator descriptor is missing 'type'".to_string(),
                ))
            }
        };

        let id = match get(mapping, "id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(_) => {
                return Err(Error::Config(
                    "operator id must be a non-empty string".to_string(),
                ))
            }
            None => operator_type.clone(),
        };

        let (outputs, explicit_output) = match get(mapping, "output") {
            Some(value) => (decode_output(value, &id)?, true),
            None => (Vec::new(), false),
        };

        descriptors.push(OperatorDescriptor {
            id,
            operator_type,
            outputs,
            explicit_output,
            settings: mapping.clone(),
        });
    }

    check_unique_ids(&descriptors)?;

    // Default chaining: an operator without an explicit output emits to the
    // next operator in declaration order
    for i in 0..descriptors.len() {
        if !descriptors[i].explicit_output && i + 1 < descriptors.len() {
            let next_id = descriptors[i + 1].id.clone();
            descriptors[i].outputs = vec![next_id];
        }
    }

    Ok(descriptors)
}

/// Fail on duplicate operator ids
pub fn check_unique_ids(descriptors: &[OperatorDescriptor]) -> Result<()> {
    let mut seen = HashSet::new();
    for d in descriptors {
        if !seen.insert(d.id.as_str()) {
            return Err(Error::Config(format!(
                "duplicate operator identifier '{}'",
                d.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(yaml: &str) -> Result<Vec<OperatorDescriptor>> {
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        decode_descriptors(&value)
    }

    #[test]
    fn test_id_defaults_to_type() {
        let descs = decode("- type: noop\n").unwrap();
        assert_eq!(descs[0].id, "noop");
        assert_eq!(descs[0].operator_type, "noop");
    }

    #[test]
    fn test_default_chaining() {
        let descs = decode("- type: a_op\n- type: b_op\n- type: c_op\n").unwrap();
        assert_eq!(descs[0].outputs, vec!["b_op"]);
        assert_eq!(descs[1].outputs, vec!["c_op"]);
        assert!(descs[2].outputs.is_empty());
    }

    #[test]
    fn test_explicit_output_disables_chaining() {
        let descs = decode("- type: a_op\n  output: c_op\n- type: b_op\n- type: c_op\n").unwrap();
        assert_eq!(descs[0].outputs, vec!["c_op"]);
        assert!(descs[0].explicit_output);
    }

    #[test]
    fn test_output_list() {
        let descs = decode("- type: copy\n  output: [a, b]\n").unwrap();
        assert_eq!(descs[0].outputs, vec!["a", "b"]);
    }

    #[test]
    fn test_duplicate_id_fails() {
        let err = decode("- type: noop\n- type: noop\n").unwrap_err();
        assert!(err.to_string().contains("duplicate operator identifier"));
    }

    #[test]
    fn test_missing_type_fails() {
        let err = decode("- id: something\n").unwrap_err();
        assert!(err.to_string().contains("missing 'type'"));
    }

    #[test]
    fn test_non_sequence_fails() {
        let value: Value = serde_yaml::from_str("type: noop\n").unwrap();
        assert!(decode_descriptors(&value).is_err());
    }

    #[test]
    fn test_buffer_capacity() {
        let descs = decode("- type: noop\n  buffer: 7\n- type: noop\n  id: other\n").unwrap();
        assert_eq!(descs[0].buffer_capacity(100).unwrap(), 7);
        assert_eq!(descs[1].buffer_capacity(100).unwrap(), 100);

        let descs = decode("- type: noop\n  buffer: 0\n").unwrap();
        assert!(descs[0].buffer_capacity(100).is_err());
    }

    #[test]
    fn test_to_value_round_trip() {
        let descs = decode("- type: metadata\n  labels:\n    env: prod\n- type: noop\n").unwrap();
        let reemitted = Value::Sequence(descs.iter().map(|d| d.to_value()).collect());
        let redecoded = decode_descriptors(&reemitted).unwrap();

        assert_eq!(redecoded.len(), descs.len());
        for (a, b) in descs.iter().zip(redecoded.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.operator_type, b.operator_type);
            assert_eq!(a.outputs, b.outputs);
        }
    }
}
