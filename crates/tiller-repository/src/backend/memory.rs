//! In-memory backend implementation for testing.
//!
//! Thread-safe via `RwLock`. Not suitable for production: no durability, no
//! cross-process visibility. Transactions stage their writes on a copy and
//! swap on success, so a failing operation leaves the store untouched.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use tiller_core::{Error, Result};

use super::{Backend, CasOutcome, InsertPosition, KeyKind, WriteOp};

/// In-memory [`Backend`] for tests and development.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
}

#[derive(Debug, Clone)]
enum Entry {
    Str(String),
    Hash(HashMap<String, String>),
    List(Vec<String>),
    Set(BTreeSet<String>),
    Sorted(Vec<(f64, String)>),
}

impl Entry {
    fn kind(&self) -> KeyKind {
        match self {
            Self::Str(_) => KeyKind::String,
            Self::Hash(_) => KeyKind::Hash,
            Self::List(_) => KeyKind::List,
            Self::Set(_) => KeyKind::Set,
            Self::Sorted(_) => KeyKind::SortedSet,
        }
    }
}

/// Converts a lock poison error to a backend error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::backend("lock poisoned")
}

fn wrong_type(key: &str) -> Error {
    Error::backend(format!(
        "WRONGTYPE operation against a key holding the wrong kind of value: {key}"
    ))
}

/// Translates Redis-style inclusive range indices (negative counts from the
/// end) into a concrete index pair, or `None` for an empty selection.
fn range_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = isize::try_from(len).unwrap_or(isize::MAX);
    let start = if start < 0 { len + start } else { start }.max(0);
    let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
    if start > stop || stop < 0 {
        return None;
    }
    Some((
        usize::try_from(start).unwrap_or(0),
        usize::try_from(stop).unwrap_or(0),
    ))
}

fn sorted_insert(members: &mut Vec<(f64, String)>, score: f64, member: String) {
    members.retain(|(_, m)| *m != member);
    members.push((score, member));
    members.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
}

fn apply_op(entries: &mut HashMap<String, Entry>, op: WriteOp) -> Result<()> {
    match op {
        WriteOp::Del { key } => {
            entries.remove(&key);
        }
        WriteOp::Set { key, value } => {
            entries.insert(key, Entry::Str(value));
        }
        WriteOp::HSet { key, fields } => {
            let hash = hash_mut(entries, &key)?;
            for (field, value) in fields {
                hash.insert(field, value);
            }
        }
        WriteOp::HDel { key, fields } => {
            if let Some(entry) = entries.get_mut(&key) {
                let Entry::Hash(hash) = entry else {
                    return Err(wrong_type(&key));
                };
                for field in &fields {
                    hash.remove(field);
                }
                if hash.is_empty() {
                    entries.remove(&key);
                }
            }
        }
        WriteOp::SAdd { key, member } => {
            set_mut(entries, &key)?.insert(member);
        }
        WriteOp::SRem { key, member } => {
            if let Some(entry) = entries.get_mut(&key) {
                let Entry::Set(set) = entry else {
                    return Err(wrong_type(&key));
                };
                set.remove(&member);
                if set.is_empty() {
                    entries.remove(&key);
                }
            }
        }
        WriteOp::ZAdd { key, score, member } => {
            sorted_insert(sorted_mut(entries, &key)?, score, member);
        }
        WriteOp::ZRem { key, member } => {
            if let Some(entry) = entries.get_mut(&key) {
                let Entry::Sorted(members) = entry else {
                    return Err(wrong_type(&key));
                };
                members.retain(|(_, m)| *m != member);
                if members.is_empty() {
                    entries.remove(&key);
                }
            }
        }
        WriteOp::RPush { key, values } => {
            list_mut(entries, &key)?.extend(values);
        }
        WriteOp::LRem { key, value } => {
            if let Some(entry) = entries.get_mut(&key) {
                let Entry::List(list) = entry else {
                    return Err(wrong_type(&key));
                };
                list.retain(|v| *v != value);
                if list.is_empty() {
                    entries.remove(&key);
                }
            }
        }
        WriteOp::LInsert {
            key,
            position,
            pivot,
            value,
        } => {
            if let Some(entry) = entries.get_mut(&key) {
                let Entry::List(list) = entry else {
                    return Err(wrong_type(&key));
                };
                if let Some(at) = list.iter().position(|v| *v == pivot) {
                    let at = match position {
                        InsertPosition::Before => at,
                        InsertPosition::After => at + 1,
                    };
                    list.insert(at, value);
                }
            }
        }
    }
    Ok(())
}

fn hash_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut HashMap<String, String>> {
    match entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::Hash(HashMap::new()))
    {
        Entry::Hash(hash) => Ok(hash),
        _ => Err(wrong_type(key)),
    }
}

fn set_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut BTreeSet<String>> {
    match entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::Set(BTreeSet::new()))
    {
        Entry::Set(set) => Ok(set),
        _ => Err(wrong_type(key)),
    }
}

fn sorted_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut Vec<(f64, String)>> {
    match entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::Sorted(Vec::new()))
    {
        Entry::Sorted(members) => Ok(members),
        _ => Err(wrong_type(key)),
    }
}

fn list_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut Vec<String>> {
    match entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::List(Vec::new()))
    {
        Entry::List(list) => Ok(list),
        _ => Err(wrong_type(key)),
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the score of a sorted-set member. Test support.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the key holds a different kind of value.
    pub fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let entries = self.entries.read().map_err(poison_err)?;
        match entries.get(key) {
            None => Ok(None),
            Some(Entry::Sorted(members)) => Ok(members
                .iter()
                .find(|(_, m)| m == member)
                .map(|(score, _)| *score)),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(poison_err)?;
        match entries.get(key) {
            None => Ok(None),
            Some(Entry::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries.contains_key(key))
    }

    async fn key_kind(&self, key: &str) -> Result<KeyKind> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries.get(key).map_or(KeyKind::Missing, Entry::kind))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(poison_err)?;
        match entries.get(key) {
            None => Ok(None),
            Some(Entry::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hget_many(&self, keys: &[String], field: &str) -> Result<Vec<Option<String>>> {
        let entries = self.entries.read().map_err(poison_err)?;
        keys.iter()
            .map(|key| match entries.get(key) {
                None => Ok(None),
                Some(Entry::Hash(hash)) => Ok(hash.get(field).cloned()),
                Some(_) => Err(wrong_type(key)),
            })
            .collect()
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let entries = self.entries.read().map_err(poison_err)?;
        match entries.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().map_err(poison_err)?;
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let entries = self.entries.read().map_err(poison_err)?;
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Sorted(members)) => {
                let reversed: Vec<&String> = members.iter().rev().map(|(_, m)| m).collect();
                Ok(range_bounds(reversed.len(), start, stop)
                    .map(|(from, to)| reversed[from..=to].iter().map(|m| (*m).clone()).collect())
                    .unwrap_or_default())
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let entries = self.entries.read().map_err(poison_err)?;
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::List(list)) => Ok(range_bounds(list.len(), start, stop)
                .map(|(from, to)| list[from..=to].to_vec())
                .unwrap_or_default()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn read_hash_and_list(
        &self,
        hash_key: &str,
        list_key: &str,
    ) -> Result<(HashMap<String, String>, Vec<String>)> {
        let entries = self.entries.read().map_err(poison_err)?;
        let hash = match entries.get(hash_key) {
            None => HashMap::new(),
            Some(Entry::Hash(hash)) => hash.clone(),
            Some(_) => return Err(wrong_type(hash_key)),
        };
        let list = match entries.get(list_key) {
            None => Vec::new(),
            Some(Entry::List(list)) => list.clone(),
            Some(_) => return Err(wrong_type(list_key)),
        };
        Ok((hash, list))
    }

    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let mut staged = entries.clone();
        for op in ops {
            apply_op(&mut staged, op)?;
        }
        *entries = staged;
        Ok(())
    }

    async fn hset_if_unchanged(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<CasOutcome> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let current = match entries.get(key) {
            None => None,
            Some(Entry::Hash(hash)) => hash.get(field).cloned(),
            Some(_) => return Err(wrong_type(key)),
        };
        if current.as_deref() != expected {
            return Ok(CasOutcome::Conflict);
        }
        hash_mut(&mut entries, key)?.insert(field.to_string(), value.to_string());
        Ok(CasOutcome::Applied)
    }
}
