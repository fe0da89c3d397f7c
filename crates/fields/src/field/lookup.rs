//! Query lookups against encrypted columns.
//!
//! A field turns a [`Lookup`] into a [`Condition`] over stored ciphertext.
//! Only null checks and (for deterministic fields) equality can be expressed
//! that way.

/// A filter the storage layer wants to apply to a field.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
    Exact(V),
    IExact(V),
    In(Vec<V>),
    IsNull(bool),
    Contains(V),
    IContains(V),
    StartsWith(V),
    IStartsWith(V),
    EndsWith(V),
    IEndsWith(V),
    Gt(V),
    Gte(V),
    Lt(V),
    Lte(V),
    Range(V, V),
    Regex(String),
    IRegex(String),
}

impl<V> Lookup<V> {
    /// Lookup name as used in query keyword arguments (`exact`, `isnull`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            Lookup::Exact(_) => "exact",
            Lookup::IExact(_) => "iexact",
            Lookup::In(_) => "in",
            Lookup::IsNull(_) => "isnull",
            Lookup::Contains(_) => "contains",
            Lookup::IContains(_) => "icontains",
            Lookup::StartsWith(_) => "startswith",
            Lookup::IStartsWith(_) => "istartswith",
            Lookup::EndsWith(_) => "endswith",
            Lookup::IEndsWith(_) => "iendswith",
            Lookup::Gt(_) => "gt",
            Lookup::Gte(_) => "gte",
            Lookup::Lt(_) => "lt",
            Lookup::Lte(_) => "lte",
            Lookup::Range(_, _) => "range",
            Lookup::Regex(_) => "regex",
            Lookup::IRegex(_) => "iregex",
        }
    }
}

/// A predicate over the stored (encrypted) column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// `column IS NULL` when `true`, `column IS NOT NULL` otherwise.
    IsNull(bool),
    /// The column equals one of these ciphertexts. Empty matches nothing.
    In(Vec<Vec<u8>>),
}

impl Condition {
    /// Evaluate against a stored value, for stores without SQL.
    pub fn matches(&self, stored: Option<&[u8]>) -> bool {
        match self {
            Condition::IsNull(is_null) => stored.is_none() == *is_null,
            Condition::In(candidates) => {
                stored.is_some_and(|s| candidates.iter().any(|c| c.as_slice() == s))
            }
        }
    }

    /// Render as a SQL fragment with `?` placeholders and its parameters.
    pub fn to_sql(&self, column: &str) -> (String, Vec<Vec<u8>>) {
        match self {
            Condition::IsNull(true) => (format!("{column} IS NULL"), Vec::new()),
            Condition::IsNull(false) => (format!("{column} IS NOT NULL"), Vec::new()),
            Condition::In(candidates) if candidates.is_empty() => ("1 = 0".to_owned(), Vec::new()),
            Condition::In(candidates) => {
                let placeholders = vec!["?"; candidates.len()].join(", ");
                (format!("{column} IN ({placeholders})"), candidates.clone())
            }
        }
    }
}
