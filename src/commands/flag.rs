use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declared value type of a flag, named the way the browser sees it in `data-type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FlagType {
    #[default]
    #[serde(rename = "string")]
    String,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "stringSlice", alias = "string-list")]
    StringSlice,
    #[serde(rename = "intSlice", alias = "int-list")]
    IntSlice,
}

impl FlagType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FlagType::String => "string",
            FlagType::Bool => "bool",
            FlagType::Int => "int",
            FlagType::Float => "float",
            FlagType::StringSlice => "stringSlice",
            FlagType::IntSlice => "intSlice",
        }
    }

    /// List types accept repeated assignments and render as a multi-value control
    #[must_use]
    pub fn is_list(self) -> bool {
        matches!(self, FlagType::StringSlice | FlagType::IntSlice)
    }
}

impl fmt::Display for FlagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown flag type `{0}`")]
pub struct UnknownFlagType(pub String);

impl FromStr for FlagType {
    type Err = UnknownFlagType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(FlagType::String),
            "bool" => Ok(FlagType::Bool),
            "int" => Ok(FlagType::Int),
            "float" => Ok(FlagType::Float),
            "stringSlice" | "string-list" => Ok(FlagType::StringSlice),
            "intSlice" | "int-list" => Ok(FlagType::IntSlice),
            other => Err(UnknownFlagType(other.to_string())),
        }
    }
}

/// A value that failed to parse as its flag's declared type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {expected} value `{value}`: {reason}")]
pub struct ParseValueError {
    pub expected: FlagType,
    pub value: String,
    pub reason: String,
}

impl ParseValueError {
    fn new(expected: FlagType, value: &str, reason: impl fmt::Display) -> Self {
        Self {
            expected,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A typed flag value
#[derive(Debug, Clone, PartialEq)]
pub enum FlagValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    StrList(Vec<String>),
    IntList(Vec<i64>),
}

impl FlagValue {
    /// Parse the serialized form of a value.
    ///
    /// # Errors
    ///
    /// Returns `ParseValueError` if `text` is not a valid `flag_type` value.
    pub fn parse(flag_type: FlagType, text: &str) -> Result<Self, ParseValueError> {
        match flag_type {
            FlagType::String => Ok(FlagValue::Str(text.to_string())),
            FlagType::Bool => parse_bool(text)
                .map(FlagValue::Bool)
                .ok_or_else(|| ParseValueError::new(flag_type, text, "expected true or false")),
            FlagType::Int => text
                .parse()
                .map(FlagValue::Int)
                .map_err(|e| ParseValueError::new(flag_type, text, e)),
            FlagType::Float => text
                .parse()
                .map(FlagValue::Float)
                .map_err(|e| ParseValueError::new(flag_type, text, e)),
            FlagType::StringSlice => read_csv_record(text)
                .map(FlagValue::StrList)
                .map_err(|e| ParseValueError::new(flag_type, text, e)),
            FlagType::IntSlice => {
                if text.is_empty() {
                    return Ok(FlagValue::IntList(Vec::new()));
                }
                text.split(',')
                    .map(|part| part.parse::<i64>())
                    .collect::<Result<Vec<_>, _>>()
                    .map(FlagValue::IntList)
                    .map_err(|e| ParseValueError::new(flag_type, text, e))
            }
        }
    }

    #[must_use]
    pub fn flag_type(&self) -> FlagType {
        match self {
            FlagValue::Str(_) => FlagType::String,
            FlagValue::Bool(_) => FlagType::Bool,
            FlagValue::Int(_) => FlagType::Int,
            FlagValue::Float(_) => FlagType::Float,
            FlagValue::StrList(_) => FlagType::StringSlice,
            FlagValue::IntList(_) => FlagType::IntSlice,
        }
    }

    /// Fold a later assignment of the same flag into this one. Lists append,
    /// scalars take the newer value.
    pub fn merge(&mut self, later: FlagValue) {
        match (self, later) {
            (FlagValue::StrList(current), FlagValue::StrList(more)) => current.extend(more),
            (FlagValue::IntList(current), FlagValue::IntList(more)) => current.extend(more),
            (current, later) => *current = later,
        }
    }

    /// Serialized elements, each of which parses back to a single-element value.
    /// Scalars yield exactly one element.
    #[must_use]
    pub fn elements(&self) -> Vec<String> {
        match self {
            FlagValue::StrList(values) => values
                .iter()
                .map(|v| write_csv_record(std::slice::from_ref(v)))
                .collect(),
            FlagValue::IntList(values) => values.iter().map(ToString::to_string).collect(),
            scalar => vec![scalar.to_string()],
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FlagValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            FlagValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            FlagValue::StrList(values) => Some(values),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int_list(&self) -> Option<&[i64]> {
        match self {
            FlagValue::IntList(values) => Some(values),
            _ => None,
        }
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Str(s) => f.write_str(s),
            FlagValue::Bool(b) => write!(f, "{b}"),
            FlagValue::Int(i) => write!(f, "{i}"),
            FlagValue::Float(x) => write!(f, "{x}"),
            FlagValue::StrList(values) => f.write_str(&write_csv_record(values)),
            FlagValue::IntList(values) => {
                let joined: Vec<String> = values.iter().map(ToString::to_string).collect();
                f.write_str(&joined.join(","))
            }
        }
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Parse a single CSV record. Empty input is the empty list.
pub(crate) fn read_csv_record(text: &str) -> Result<Vec<String>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(text.as_bytes());
    match reader.records().next() {
        Some(record) => Ok(record?.iter().map(str::to_string).collect()),
        None => Ok(Vec::new()),
    }
}

/// Serialize values as one CSV record, without the trailing line terminator.
pub(crate) fn write_csv_record(values: &[String]) -> String {
    if values.is_empty() {
        return String::new();
    }
    let mut writer = csv::Writer::from_writer(Vec::new());
    let encoded = writer
        .write_record(values)
        .and_then(|()| writer.into_inner().map_err(|e| e.into_error().into()));
    match encoded {
        Ok(bytes) => String::from_utf8_lossy(&bytes)
            .trim_end_matches(['\r', '\n'])
            .to_string(),
        // Writing into a Vec only fails on invariants csv itself guarantees.
        Err(_) => values.join(","),
    }
}

/// A named, typed parameter of a command
#[derive(Debug, Clone, PartialEq)]
pub struct Flag {
    pub name: String,
    pub usage: String,
    pub flag_type: FlagType,
    pub default: FlagValue,
    pub uploadable: bool,
}

impl Flag {
    /// Declare a flag whose default is given in serialized form.
    ///
    /// # Errors
    ///
    /// Returns `ParseValueError` if `default` does not parse as `flag_type`.
    pub fn new(
        name: impl Into<String>,
        flag_type: FlagType,
        default: &str,
    ) -> Result<Self, ParseValueError> {
        Ok(Flag {
            name: name.into(),
            usage: String::new(),
            flag_type,
            default: FlagValue::parse(flag_type, default)?,
            uploadable: false,
        })
    }

    #[must_use]
    pub fn string(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self::typed(name, FlagValue::Str(default.into()))
    }

    #[must_use]
    pub fn bool(name: impl Into<String>, default: bool) -> Self {
        Self::typed(name, FlagValue::Bool(default))
    }

    #[must_use]
    pub fn int(name: impl Into<String>, default: i64) -> Self {
        Self::typed(name, FlagValue::Int(default))
    }

    #[must_use]
    pub fn float(name: impl Into<String>, default: f64) -> Self {
        Self::typed(name, FlagValue::Float(default))
    }

    #[must_use]
    pub fn string_list<S: Into<String>>(
        name: impl Into<String>,
        default: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::typed(
            name,
            FlagValue::StrList(default.into_iter().map(Into::into).collect()),
        )
    }

    #[must_use]
    pub fn int_list(name: impl Into<String>, default: impl IntoIterator<Item = i64>) -> Self {
        Self::typed(name, FlagValue::IntList(default.into_iter().collect()))
    }

    fn typed(name: impl Into<String>, default: FlagValue) -> Self {
        Flag {
            name: name.into(),
            usage: String::new(),
            flag_type: default.flag_type(),
            default,
            uploadable: false,
        }
    }

    #[must_use]
    pub fn usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }

    /// Offer a file picker for this flag; the stored upload path becomes its value
    #[must_use]
    pub fn uploadable(mut self) -> Self {
        self.uploadable = true;
        self
    }
}
