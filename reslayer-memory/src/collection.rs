//! Document operations over a single in-memory collection.

use std::cmp::Ordering;

use bson::{Bson, Document, oid::ObjectId};

use reslayer_core::{
    backend::UpdateCounts,
    error::{ResourceError, ResourceResult},
    query::{Expr, Query, SortDirection, Update},
};

use crate::evaluator::{Comparable, DocumentEvaluator};

/// Documents of one collection, in insertion order.
#[derive(Debug, Clone, Default)]
pub(crate) struct Collection {
    documents: Vec<Document>,
}

impl Collection {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn insert(&mut self, name: &str, document: Document) -> ResourceResult<Bson> {
        let (id, document) = with_id(document);
        if self.contains(&id) {
            return Err(duplicate(name, &id));
        }

        self.documents.push(document);
        Ok(id)
    }

    /// Inserts every document or none of them.
    pub fn insert_many(&mut self, name: &str, documents: Vec<Document>) -> ResourceResult<Vec<Bson>> {
        let prepared = documents.into_iter().map(with_id).collect::<Vec<_>>();

        for (index, (id, _)) in prepared.iter().enumerate() {
            if self.contains(id) || prepared[..index].iter().any(|(other, _)| other == id) {
                return Err(duplicate(name, id));
            }
        }

        Ok(prepared
            .into_iter()
            .map(|(id, document)| {
                self.documents.push(document);
                id
            })
            .collect())
    }

    pub fn count(&self, filter: &Expr) -> u64 {
        self.documents
            .iter()
            .filter(|document| DocumentEvaluator::matches(document, filter))
            .count() as u64
    }

    pub fn find(&self, query: &Query) -> Vec<Document> {
        let mut matched = self
            .documents
            .iter()
            .filter(|document| match &query.filter {
                Some(filter) => DocumentEvaluator::matches(document, filter),
                None => true,
            })
            .collect::<Vec<_>>();

        if !query.sort.is_empty() {
            matched.sort_by(|a, b| {
                query
                    .sort
                    .iter()
                    .map(|sort| {
                        let left = sort_key(a, &sort.field);
                        let right = sort_key(b, &sort.field);
                        let ordering = Comparable::from(left).sort_cmp(&Comparable::from(right));
                        match sort.direction {
                            SortDirection::Asc => ordering,
                            SortDirection::Desc => ordering.reverse(),
                        }
                    })
                    .find(|ordering| *ordering != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }

        matched
            .into_iter()
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|document| match &query.projection {
                Some(keys) => project(document, keys),
                None => document.clone(),
            })
            .collect()
    }

    /// Applies `update` to the first (or, with `many`, every) match. Either every
    /// matched document is updated or none is.
    pub fn update(&mut self, filter: &Expr, update: &Update, many: bool) -> ResourceResult<UpdateCounts> {
        let mut changed = Vec::new();
        let mut counts = UpdateCounts::default();

        for (index, document) in self.documents.iter().enumerate() {
            if !DocumentEvaluator::matches(document, filter) {
                continue;
            }

            counts.matched += 1;
            let mut updated = document.clone();
            apply_update(&mut updated, update)?;
            if &updated != document {
                counts.modified += 1;
                changed.push((index, updated));
            }

            if !many {
                break;
            }
        }

        for (index, updated) in changed {
            self.documents[index] = updated;
        }

        Ok(counts)
    }

    /// Applies each `(filter, update)` pair to its first match. Either every pair is
    /// applied or the collection is left untouched.
    pub fn update_batch(&mut self, updates: &[(Expr, Update)]) -> ResourceResult<UpdateCounts> {
        let mut staged = self.documents.clone();
        let mut counts = UpdateCounts::default();

        for (filter, update) in updates {
            let Some(document) = staged
                .iter_mut()
                .find(|document| DocumentEvaluator::matches(document, filter))
            else {
                continue;
            };

            counts.matched += 1;
            let mut updated = document.clone();
            apply_update(&mut updated, update)?;
            if &updated != document {
                counts.modified += 1;
                *document = updated;
            }
        }

        self.documents = staged;
        Ok(counts)
    }

    pub fn replace(&mut self, filter: &Expr, replacement: Document) -> UpdateCounts {
        let Some(document) = self
            .documents
            .iter_mut()
            .find(|document| DocumentEvaluator::matches(document, filter))
        else {
            return UpdateCounts::default();
        };

        let mut replaced = Document::new();
        if let Some(id) = document.get("_id") {
            replaced.insert("_id", id.clone());
        }
        replaced.extend(replacement.into_iter().filter(|(key, _)| key != "_id"));

        let modified = u64::from(replaced != *document);
        *document = replaced;

        UpdateCounts { matched: 1, modified }
    }

    pub fn delete(&mut self, filter: &Expr, many: bool) -> u64 {
        if !many {
            return match self
                .documents
                .iter()
                .position(|document| DocumentEvaluator::matches(document, filter))
            {
                Some(index) => {
                    self.documents.remove(index);
                    1
                }
                None => 0,
            };
        }

        let before = self.documents.len();
        self.documents
            .retain(|document| !DocumentEvaluator::matches(document, filter));

        (before - self.documents.len()) as u64
    }

    fn contains(&self, id: &Bson) -> bool {
        self.documents
            .iter()
            .any(|document| document.get("_id") == Some(id))
    }
}

fn duplicate(name: &str, id: &Bson) -> ResourceError {
    ResourceError::Store(format!("duplicate key {id} in collection {name}"))
}

/// Moves `_id` to the front, generating an ObjectId when absent.
pub(crate) fn with_id(mut document: Document) -> (Bson, Document) {
    let id = document
        .remove("_id")
        .unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));

    let mut stored = Document::new();
    stored.insert("_id", id.clone());
    stored.extend(document);

    (id, stored)
}

static MISSING: Bson = Bson::Null;

fn sort_key<'a>(document: &'a Document, field: &str) -> &'a Bson {
    get_path(document, field).unwrap_or(&MISSING)
}

fn project(document: &Document, keys: &[String]) -> Document {
    let mut projected = Document::new();
    if let Some(id) = document.get("_id") {
        projected.insert("_id", id.clone());
    }

    for key in keys.iter().filter(|key| key.as_str() != "_id") {
        if let Some(value) = get_path(document, key) {
            // Intermediate segments were documents in the source, so this cannot fail.
            let _ = set_path(&mut projected, key, value.clone());
        }
    }

    projected
}

pub(crate) fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    match path.split_once('.') {
        None => document.get(path),
        Some((head, rest)) => match document.get(head)? {
            Bson::Document(nested) => get_path(nested, rest),
            _ => None,
        },
    }
}

pub(crate) fn set_path(document: &mut Document, path: &str, value: Bson) -> ResourceResult<()> {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if document.get(head).is_none() {
                document.insert(head, Document::new());
            }

            match document.get_mut(head) {
                Some(Bson::Document(nested)) => set_path(nested, rest, value),
                _ => Err(ResourceError::Store(format!(
                    "cannot set {path}: {head} is not a document"
                ))),
            }
        }
    }
}

pub(crate) fn remove_path(document: &mut Document, path: &str) -> Option<Bson> {
    match path.split_once('.') {
        None => document.remove(path),
        Some((head, rest)) => match document.get_mut(head)? {
            Bson::Document(nested) => remove_path(nested, rest),
            _ => None,
        },
    }
}

pub(crate) fn apply_update(document: &mut Document, update: &Update) -> ResourceResult<()> {
    for (path, value) in &update.set {
        set_path(document, path, value.clone())?;
    }

    for path in &update.unset {
        remove_path(document, path);
    }

    for (path, by) in &update.inc {
        let sum = increment(get_path(document, path), by, path)?;
        set_path(document, path, sum)?;
    }

    Ok(())
}

fn increment(current: Option<&Bson>, by: &Bson, path: &str) -> ResourceResult<Bson> {
    let integer = |value: &Bson| match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        _ => None,
    };
    let float = |value: &Bson| match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    };

    match (current, by) {
        (None, _) => Ok(by.clone()),
        (Some(Bson::Int32(a)), Bson::Int32(b)) => Ok(match a.checked_add(*b) {
            Some(sum) => Bson::Int32(sum),
            None => Bson::Int64(i64::from(*a) + i64::from(*b)),
        }),
        (Some(current), by) => match (integer(current), integer(by)) {
            (Some(a), Some(b)) => Ok(Bson::Int64(a.saturating_add(b))),
            _ => match (float(current), float(by)) {
                (Some(a), Some(b)) => Ok(Bson::Double(a + b)),
                _ => Err(ResourceError::Store(format!(
                    "cannot increment non-numeric field {path}"
                ))),
            },
        },
    }
}
