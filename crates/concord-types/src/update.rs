use crate::{ConcordError, Versioned};

/// Precondition attached to a conditional update.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Match<T> {
    /// Always satisfied.
    #[default]
    Any,
    /// Satisfied only when nothing is currently stored.
    IsAbsent,
    /// Satisfied only when the current value equals `T`.
    Equals(T),
}

impl<T: PartialEq> Match<T> {
    pub fn matches(&self, current: Option<&T>) -> bool {
        match self {
            Match::Any => true,
            Match::IsAbsent => current.is_none(),
            Match::Equals(expected) => current.map(|c| c == expected).unwrap_or(false),
        }
    }
}

impl<T> Match<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Match<U> {
        match self {
            Match::Any => Match::Any,
            Match::IsAbsent => Match::IsAbsent,
            Match::Equals(t) => Match::Equals(f(t)),
        }
    }

    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Match<U>, E> {
        Ok(match self {
            Match::Any => Match::Any,
            Match::IsAbsent => Match::IsAbsent,
            Match::Equals(t) => Match::Equals(f(t)?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum UpdateType {
    Put,
    PutIfAbsent,
    PutIfVersionMatch,
    PutIfValueMatch,
    Remove,
    RemoveIfVersionMatch,
    RemoveIfValueMatch,
}

impl UpdateType {
    pub fn is_remove(self) -> bool {
        matches!(
            self,
            UpdateType::Remove | UpdateType::RemoveIfVersionMatch | UpdateType::RemoveIfValueMatch
        )
    }
}

/// A single write in a batch update or transaction.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UpdateOperation<K, V> {
    pub table: String,
    pub key: K,
    pub kind: UpdateType,
    pub value: Option<V>,
    pub current_value: Option<V>,
    pub current_version: Option<u64>,
}

/// The encoded form stored by partitions: hex keys and raw byte values.
pub type RawUpdateOperation = UpdateOperation<String, Vec<u8>>;

impl<K, V> UpdateOperation<K, V> {
    pub fn builder(table: impl Into<String>, key: K, kind: UpdateType) -> UpdateOperationBuilder<K, V> {
        UpdateOperationBuilder {
            op: UpdateOperation {
                table: table.into(),
                key,
                kind,
                value: None,
                current_value: None,
                current_version: None,
            },
        }
    }

    pub fn put(table: impl Into<String>, key: K, value: V) -> Self {
        Self::builder(table, key, UpdateType::Put).value(value).build_unchecked()
    }

    pub fn put_if_absent(table: impl Into<String>, key: K, value: V) -> Self {
        Self::builder(table, key, UpdateType::PutIfAbsent).value(value).build_unchecked()
    }

    pub fn put_if_version_match(table: impl Into<String>, key: K, value: V, version: u64) -> Self {
        Self::builder(table, key, UpdateType::PutIfVersionMatch)
            .value(value)
            .current_version(version)
            .build_unchecked()
    }

    pub fn put_if_value_match(table: impl Into<String>, key: K, value: V, current: V) -> Self {
        Self::builder(table, key, UpdateType::PutIfValueMatch)
            .value(value)
            .current_value(current)
            .build_unchecked()
    }

    pub fn remove(table: impl Into<String>, key: K) -> Self {
        Self::builder(table, key, UpdateType::Remove).build_unchecked()
    }

    pub fn remove_if_version_match(table: impl Into<String>, key: K, version: u64) -> Self {
        Self::builder(table, key, UpdateType::RemoveIfVersionMatch)
            .current_version(version)
            .build_unchecked()
    }

    pub fn remove_if_value_match(table: impl Into<String>, key: K, current: V) -> Self {
        Self::builder(table, key, UpdateType::RemoveIfValueMatch)
            .current_value(current)
            .build_unchecked()
    }

    /// Check that the fields required by `kind` are present.
    pub fn validate(&self) -> Result<(), ConcordError> {
        if self.table.is_empty() {
            return Err(ConcordError::InvalidArgument("table name must not be empty".into()));
        }
        let missing = |field: &str| {
            Err(ConcordError::InvalidArgument(format!("{:?} requires {field}", self.kind)))
        };
        match self.kind {
            UpdateType::Put | UpdateType::PutIfAbsent if self.value.is_none() => missing("value"),
            UpdateType::PutIfVersionMatch if self.value.is_none() => missing("value"),
            UpdateType::PutIfVersionMatch if self.current_version.is_none() => {
                missing("current_version")
            }
            UpdateType::PutIfValueMatch if self.value.is_none() => missing("value"),
            UpdateType::PutIfValueMatch if self.current_value.is_none() => missing("current_value"),
            UpdateType::RemoveIfVersionMatch if self.current_version.is_none() => {
                missing("current_version")
            }
            UpdateType::RemoveIfValueMatch if self.current_value.is_none() => {
                missing("current_value")
            }
            _ => Ok(()),
        }
    }

    /// Convert key and value representations, e.g. logical types to bytes.
    pub fn try_map<K2, V2, E>(
        self,
        key_fn: impl FnOnce(K) -> Result<K2, E>,
        mut value_fn: impl FnMut(V) -> Result<V2, E>,
    ) -> Result<UpdateOperation<K2, V2>, E> {
        Ok(UpdateOperation {
            table: self.table,
            key: key_fn(self.key)?,
            kind: self.kind,
            value: self.value.map(&mut value_fn).transpose()?,
            current_value: self.current_value.map(&mut value_fn).transpose()?,
            current_version: self.current_version,
        })
    }
}

impl<K, V: PartialEq> UpdateOperation<K, V> {
    /// Whether this operation may apply on top of `existing`.
    pub fn precondition_holds(&self, existing: Option<&Versioned<V>>) -> bool {
        match self.kind {
            UpdateType::Put | UpdateType::Remove => true,
            UpdateType::PutIfAbsent => existing.is_none(),
            UpdateType::PutIfVersionMatch | UpdateType::RemoveIfVersionMatch => {
                existing.map(|e| Some(e.version) == self.current_version).unwrap_or(false)
            }
            UpdateType::PutIfValueMatch | UpdateType::RemoveIfValueMatch => existing
                .map(|e| self.current_value.as_ref() == Some(&e.value))
                .unwrap_or(false),
        }
    }
}

pub struct UpdateOperationBuilder<K, V> {
    op: UpdateOperation<K, V>,
}

impl<K, V> UpdateOperationBuilder<K, V> {
    pub fn value(mut self, value: V) -> Self {
        self.op.value = Some(value);
        self
    }

    pub fn current_value(mut self, value: V) -> Self {
        self.op.current_value = Some(value);
        self
    }

    pub fn current_version(mut self, version: u64) -> Self {
        self.op.current_version = Some(version);
        self
    }

    pub fn build(self) -> Result<UpdateOperation<K, V>, ConcordError> {
        self.op.validate()?;
        Ok(self.op)
    }

    fn build_unchecked(self) -> UpdateOperation<K, V> {
        self.op
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpdateStatus {
    Ok,
    /// The key is prepared by a transaction that has not yet committed or
    /// rolled back. Transient; distinct from a failed precondition.
    Locked,
}

/// Outcome of one conditional update attempt at a partition.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UpdateResult<V> {
    pub status: UpdateStatus,
    pub value: Option<V>,
}

impl<V> UpdateResult<V> {
    pub fn ok(value: V) -> Self {
        UpdateResult { status: UpdateStatus::Ok, value: Some(value) }
    }

    pub fn locked() -> Self {
        UpdateResult { status: UpdateStatus::Locked, value: None }
    }

    pub fn is_locked(&self) -> bool {
        self.status == UpdateStatus::Locked
    }
}

/// Effect of an update on a single entry. `updated == false` means the
/// precondition did not hold and `old_value == new_value`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MapEntryUpdate {
    pub table: String,
    pub key: String,
    pub updated: bool,
    pub old_value: Option<Versioned<Vec<u8>>>,
    pub new_value: Option<Versioned<Vec<u8>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_variants() {
        assert!(Match::<u64>::Any.matches(None));
        assert!(Match::<u64>::Any.matches(Some(&3)));
        assert!(Match::<u64>::IsAbsent.matches(None));
        assert!(!Match::<u64>::IsAbsent.matches(Some(&3)));
        assert!(Match::Equals(3u64).matches(Some(&3)));
        assert!(!Match::Equals(3u64).matches(Some(&4)));
        assert!(!Match::Equals(3u64).matches(None));
    }

    #[test]
    fn match_bytes_compare_bytewise() {
        let m = Match::Equals(b"abc".to_vec());
        assert!(m.matches(Some(&vec![b'a', b'b', b'c'])));
        assert!(!m.matches(Some(&b"abd".to_vec())));
    }

    #[test]
    fn builder_rejects_missing_fields() {
        let err = UpdateOperation::<String, String>::builder("t", "k".into(), UpdateType::PutIfVersionMatch)
            .value("v".into())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConcordError::InvalidArgument(_)));

        let err = UpdateOperation::<String, String>::builder("t", "k".into(), UpdateType::Put)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConcordError::InvalidArgument(_)));

        let err = UpdateOperation::<String, String>::builder("", "k".into(), UpdateType::Remove)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConcordError::InvalidArgument(_)));

        let ok = UpdateOperation::<String, String>::builder("t", "k".into(), UpdateType::RemoveIfVersionMatch)
            .current_version(0)
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn preconditions() {
        let cur = Versioned::new(b"a".to_vec(), 5);
        let k = "k".to_string();

        assert!(UpdateOperation::put("t", k.clone(), b"x".to_vec()).precondition_holds(None));
        assert!(UpdateOperation::put_if_absent("t", k.clone(), b"x".to_vec()).precondition_holds(None));
        assert!(!UpdateOperation::put_if_absent("t", k.clone(), b"x".to_vec()).precondition_holds(Some(&cur)));

        let by_version = UpdateOperation::put_if_version_match("t", k.clone(), b"x".to_vec(), 5);
        assert!(by_version.precondition_holds(Some(&cur)));
        assert!(!by_version.precondition_holds(None));
        let stale = UpdateOperation::remove_if_version_match("t", k.clone(), 4);
        assert!(!stale.precondition_holds(Some(&cur)));

        let by_value = UpdateOperation::remove_if_value_match("t", k, b"a".to_vec());
        assert!(by_value.precondition_holds(Some(&cur)));
    }

    #[test]
    fn try_map_encodes_all_values() {
        let op = UpdateOperation::put_if_value_match("t", 1u32, "new".to_string(), "old".to_string());
        let raw: RawUpdateOperation = op
            .try_map(|k| Ok::<_, ConcordError>(k.to_string()), |v| Ok(v.into_bytes()))
            .unwrap();
        assert_eq!(raw.key, "1");
        assert_eq!(raw.value.as_deref(), Some(&b"new"[..]));
        assert_eq!(raw.current_value.as_deref(), Some(&b"old"[..]));
    }
}
