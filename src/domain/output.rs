//! Stack outputs
//!
//! Every stack declares a fixed schema of named, typed output fields. The
//! values an engine returns are checked against that schema before they are
//! published. Sensitive fields never travel as values: the driver moves them
//! into a secret sink and publishes a [`SecretRef`] in their place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use super::id::{Generation, IdError, StackName};

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("Output '{0}' is declared but was not returned")]
    MissingField(String),

    #[error("Output '{field}' should be a {expected}, got {found}")]
    WrongType {
        field: String,
        expected: OutputKind,
        found: String,
    },

    #[error("Output '{0}' is not declared in the stack's output schema")]
    UndeclaredField(String),

    #[error("Output '{0}' is declared more than once")]
    DuplicateField(String),

    #[error("Output '{0}' is sensitive and must be published by reference")]
    PlaintextSecret(String),
}

/// Type of an output field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    #[default]
    String,
    Number,
    Bool,
    List,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::String => "string",
            OutputKind::Number => "number",
            OutputKind::Bool => "bool",
            OutputKind::List => "list",
        }
    }

    /// Returns true if the JSON value has this kind
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            OutputKind::String => value.is_string(),
            OutputKind::Number => value.is_number(),
            OutputKind::Bool => value.is_boolean(),
            OutputKind::List => value.is_array(),
        }
    }

    /// A neutral placeholder value of this kind
    pub fn placeholder(&self) -> Value {
        match self {
            OutputKind::String => Value::String(String::new()),
            OutputKind::Number => Value::from(0),
            OutputKind::Bool => Value::Bool(false),
            OutputKind::List => Value::Array(Vec::new()),
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// One declared output field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,

    #[serde(rename = "type", default)]
    pub kind: OutputKind,

    /// Sensitive outputs are stored in the secret sink and published by reference
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sensitive: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl OutputField {
    pub fn new(name: impl Into<String>, kind: OutputKind) -> Self {
        Self {
            name: name.into(),
            kind,
            sensitive: false,
            description: None,
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// The fixed set of outputs a stack publishes
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputSchema {
    fields: Vec<OutputField>,
}

impl OutputSchema {
    pub fn new(fields: Vec<OutputField>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[OutputField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&OutputField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Checks the schema itself for duplicate names
    pub fn check(&self) -> Result<(), SchemaError> {
        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
        }
        Ok(())
    }

    /// Validates raw engine outputs against this schema
    ///
    /// Every declared field must be present with the declared type and no
    /// undeclared field may appear.
    pub fn validate(&self, raw: &BTreeMap<String, Value>) -> Result<(), SchemaError> {
        for field in &self.fields {
            let value = raw
                .get(&field.name)
                .ok_or_else(|| SchemaError::MissingField(field.name.clone()))?;

            if !field.kind.matches(value) {
                return Err(SchemaError::WrongType {
                    field: field.name.clone(),
                    expected: field.kind,
                    found: json_type_name(value).to_string(),
                });
            }
        }

        if let Some(extra) = raw.keys().find(|k| self.field(k).is_none()) {
            return Err(SchemaError::UndeclaredField(extra.clone()));
        }

        Ok(())
    }

    /// Validates a set about to be published
    ///
    /// Sensitive fields must hold a [`SecretRef`]; their type was checked
    /// against the raw value before it moved to the secret sink.
    pub fn validate_published(&self, values: &BTreeMap<String, OutputValue>) -> Result<(), SchemaError> {
        for field in &self.fields {
            let value = values
                .get(&field.name)
                .ok_or_else(|| SchemaError::MissingField(field.name.clone()))?;

            match value {
                OutputValue::Secret(_) => {}
                OutputValue::Plain(_) if field.sensitive => {
                    return Err(SchemaError::PlaintextSecret(field.name.clone()));
                }
                OutputValue::Plain(v) if !field.kind.matches(v) => {
                    return Err(SchemaError::WrongType {
                        field: field.name.clone(),
                        expected: field.kind,
                        found: json_type_name(v).to_string(),
                    });
                }
                OutputValue::Plain(_) => {}
            }
        }

        if let Some(extra) = values.keys().find(|k| self.field(k).is_none()) {
            return Err(SchemaError::UndeclaredField(extra.clone()));
        }

        Ok(())
    }
}

/// Reference to a value held by the secret sink
///
/// Format: `secret://{environment}/{stack}/{key}@{generation}`. Each apply
/// writes under its own generation, so a failed apply never changes the
/// value behind a reference that is already recorded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretRef(String);

impl SecretRef {
    pub const SCHEME: &'static str = "secret://";

    pub fn new(environment: &str, stack: &StackName, key: &str, generation: Generation) -> Self {
        Self(format!(
            "{}{}/{}/{}@{}",
            Self::SCHEME,
            environment,
            stack,
            key,
            generation
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses a reference string, if it uses the secret scheme
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix(Self::SCHEME)?;
        let (path, generation) = rest.rsplit_once('@')?;
        generation.parse::<Generation>().ok()?;
        let parts: Vec<_> = path.split('/').collect();
        if parts.len() == 3 && parts.iter().all(|p| !p.is_empty()) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }
}

impl TryFrom<String> for SecretRef {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s).ok_or(IdError::InvalidSecretRef(s))
    }
}

impl From<SecretRef> for String {
    fn from(reference: SecretRef) -> Self {
        reference.0
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A plaintext sensitive value that redacts itself when formatted
#[derive(Clone, PartialEq, Eq)]
pub struct Sensitive(String);

impl Sensitive {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the plaintext; callers must not log it
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Wraps an arbitrary JSON value, keeping strings verbatim
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::String(s) => Self(s.clone()),
            other => Self(other.to_string()),
        }
    }
}

impl fmt::Debug for Sensitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sensitive(***)")
    }
}

impl fmt::Display for Sensitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// A published output value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OutputValue {
    Plain(Value),
    Secret(SecretRef),
}

impl OutputValue {
    /// The JSON form seen by downstream stacks (secrets by reference)
    pub fn to_json(&self) -> Value {
        match self {
            OutputValue::Plain(v) => v.clone(),
            OutputValue::Secret(r) => Value::String(r.as_str().to_string()),
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, OutputValue::Secret(_))
    }

    pub fn secret_ref(&self) -> Option<&SecretRef> {
        match self {
            OutputValue::Secret(r) => Some(r),
            OutputValue::Plain(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OutputValue::Plain(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            OutputValue::Plain(v) => v.as_i64(),
            OutputValue::Secret(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OutputValue::Plain(v) => v.as_bool(),
            OutputValue::Secret(_) => None,
        }
    }

    pub fn as_string_list(&self) -> Option<Vec<String>> {
        match self {
            OutputValue::Plain(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }
}

impl From<Value> for OutputValue {
    fn from(value: Value) -> Self {
        OutputValue::Plain(value)
    }
}

impl fmt::Display for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputValue::Plain(Value::String(s)) => f.write_str(s),
            OutputValue::Plain(v) => write!(f, "{}", v),
            OutputValue::Secret(r) => write!(f, "{} (sensitive)", r),
        }
    }
}

/// The complete output set of one stack for one apply generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSet {
    pub generation: Generation,
    pub published_at: DateTime<Utc>,
    pub values: BTreeMap<String, OutputValue>,
}

impl OutputSet {
    pub fn new(generation: Generation, values: BTreeMap<String, OutputValue>) -> Self {
        Self {
            generation,
            published_at: Utc::now(),
            values,
        }
    }

    pub fn get(&self, key: &str) -> Option<&OutputValue> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vpc_schema() -> OutputSchema {
        OutputSchema::new(vec![
            OutputField::new("vpc_id", OutputKind::String),
            OutputField::new("public_subnet_ids", OutputKind::List),
        ])
    }

    fn raw(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn validate_accepts_matching_outputs() {
        let outputs = raw(&[
            ("vpc_id", json!("vpc-123")),
            ("public_subnet_ids", json!(["subnet-a", "subnet-b"])),
        ]);
        assert!(vpc_schema().validate(&outputs).is_ok());
    }

    #[test]
    fn validate_rejects_missing_field() {
        let outputs = raw(&[("vpc_id", json!("vpc-123"))]);
        assert_eq!(
            vpc_schema().validate(&outputs),
            Err(SchemaError::MissingField("public_subnet_ids".to_string()))
        );
    }

    #[test]
    fn validate_rejects_wrong_type() {
        let outputs = raw(&[
            ("vpc_id", json!(42)),
            ("public_subnet_ids", json!([])),
        ]);
        assert!(matches!(
            vpc_schema().validate(&outputs),
            Err(SchemaError::WrongType { ref field, expected: OutputKind::String, .. }) if field == "vpc_id"
        ));
    }

    #[test]
    fn validate_rejects_undeclared_field() {
        let outputs = raw(&[
            ("vpc_id", json!("vpc-123")),
            ("public_subnet_ids", json!([])),
            ("cidr_block", json!("10.0.0.0/16")),
        ]);
        assert_eq!(
            vpc_schema().validate(&outputs),
            Err(SchemaError::UndeclaredField("cidr_block".to_string()))
        );
    }

    #[test]
    fn schema_check_finds_duplicates() {
        let schema = OutputSchema::new(vec![
            OutputField::new("vpc_id", OutputKind::String),
            OutputField::new("vpc_id", OutputKind::String),
        ]);
        assert_eq!(
            schema.check(),
            Err(SchemaError::DuplicateField("vpc_id".to_string()))
        );
    }

    #[test]
    fn schema_parses_from_yaml() {
        let yaml = r#"
- name: cluster_arn
- name: db_secret_arn
  type: string
  sensitive: true
- name: instance_count
  type: number
"#;
        let schema: OutputSchema = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(schema.fields().len(), 3);
        assert_eq!(schema.fields()[0].kind, OutputKind::String);
        assert!(schema.field("db_secret_arn").unwrap().sensitive);
        assert_eq!(schema.field("instance_count").unwrap().kind, OutputKind::Number);
    }

    #[test]
    fn published_sensitive_field_must_be_reference() {
        let stack = StackName::new("aurora").unwrap();
        let schema = OutputSchema::new(vec![
            OutputField::new("db_secret_arn", OutputKind::String).sensitive(),
            OutputField::new("instance_count", OutputKind::Number),
        ]);

        let mut values = BTreeMap::new();
        values.insert("db_secret_arn".to_string(), OutputValue::from(json!("arn:plain")));
        values.insert("instance_count".to_string(), OutputValue::from(json!(1)));
        assert_eq!(
            schema.validate_published(&values),
            Err(SchemaError::PlaintextSecret("db_secret_arn".to_string()))
        );

        values.insert(
            "db_secret_arn".to_string(),
            OutputValue::Secret(SecretRef::new("dev", &stack, "db_secret_arn", Generation::new(1))),
        );
        assert!(schema.validate_published(&values).is_ok());
    }

    #[test]
    fn sensitive_redacts_when_formatted() {
        let secret = Sensitive::new("hunter2");
        assert_eq!(format!("{}", secret), "***");
        assert_eq!(format!("{:?}", secret), "Sensitive(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn secret_output_displays_reference_only() {
        let stack = StackName::new("aurora").unwrap();
        let value = OutputValue::Secret(SecretRef::new("dev", &stack, "db_secret_arn", Generation::new(1)));

        let shown = value.to_string();
        assert!(shown.starts_with("secret://dev/aurora/db_secret_arn@g1"));
        assert_eq!(value.to_json(), json!("secret://dev/aurora/db_secret_arn@g1"));
        assert!(value.as_str().is_none());
    }

    #[test]
    fn secret_ref_parse() {
        assert!(SecretRef::parse("secret://dev/aurora/key@g3").is_some());
        assert!(SecretRef::parse("secret://dev/aurora/key").is_none());
        assert!(SecretRef::parse("secret://dev/aurora/key@latest").is_none());
        assert!(SecretRef::parse("secret://dev/aurora@g1").is_none());
        assert!(SecretRef::parse("arn:aws:secretsmanager:x").is_none());
    }

    #[test]
    fn secret_refs_are_checked_when_loaded() {
        let loaded: OutputValue =
            serde_json::from_value(json!({"kind": "secret", "value": "secret://dev/aurora/key@g2"})).unwrap();
        assert!(loaded.is_secret());

        let plaintext = json!({"kind": "secret", "value": "hunter2"});
        assert!(serde_json::from_value::<OutputValue>(plaintext).is_err());
    }

    #[test]
    fn typed_accessors() {
        let list = OutputValue::from(json!(["a", "b"]));
        assert_eq!(list.as_string_list(), Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(OutputValue::from(json!(3)).as_i64(), Some(3));
        assert_eq!(OutputValue::from(json!(true)).as_bool(), Some(true));
        assert_eq!(OutputValue::from(json!("x")).as_str(), Some("x"));
        assert!(OutputValue::from(json!([1, 2])).as_string_list().is_none());
    }

    #[test]
    fn output_value_serde_is_tagged() {
        let value = OutputValue::from(json!("vpc-1"));
        let encoded = serde_json::to_value(&value).unwrap();
        assert_eq!(encoded, json!({"kind": "plain", "value": "vpc-1"}));
    }
}
