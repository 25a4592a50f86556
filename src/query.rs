//! Document queries in the MongoDB shape.
//!
//! The repository only needs a narrow slice of a document store's query
//! language: equality, `$in`, `$gt`, `$and`/`$or`, sorted/limited finds and a
//! three-stage aggregation. Everything here is plain data so any backend can
//! either translate it (`to_json`) or evaluate it directly (`matches`, `run`).

use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// A stored document.
pub type Document = Map<String, Value>;

/// Predicate over documents.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,
    Eq(String, Value),
    In(String, Vec<Value>),
    Gt(String, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(field.into(), value.into())
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In(field.into(), values)
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    /// Evaluate against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => doc
                .get(field)
                .map_or(false, |v| compare_values(v, value) == Ordering::Equal),
            Filter::In(field, values) => doc.get(field).map_or(false, |v| {
                values
                    .iter()
                    .any(|candidate| compare_values(v, candidate) == Ordering::Equal)
            }),
            Filter::Gt(field, value) => doc.get(field).map_or(false, |v| {
                same_type_class(v, value) && compare_values(v, value) == Ordering::Greater
            }),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }

    /// Render as a MongoDB query document.
    pub fn to_json(&self) -> Value {
        match self {
            Filter::All => json!({}),
            Filter::Eq(field, value) => json!({ field.as_str(): value }),
            Filter::In(field, values) => json!({ field.as_str(): { "$in": values } }),
            Filter::Gt(field, value) => json!({ field.as_str(): { "$gt": value } }),
            Filter::And(filters) => {
                json!({ "$and": filters.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
            Filter::Or(filters) => {
                json!({ "$or": filters.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
        }
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    fn as_i32(self) -> i32 {
        match self {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        }
    }
}

/// Sort and limit applied to a find.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Vec<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sorted(keys: &[(&str, SortOrder)]) -> Self {
        Self {
            sort: keys.iter().map(|(k, o)| (k.to_string(), *o)).collect(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sort documents in place. The sort is stable, so documents with equal
    /// keys keep their insertion order.
    pub fn apply(&self, docs: &mut Vec<Document>) {
        if !self.sort.is_empty() {
            docs.sort_by(|a, b| compare_documents(a, b, &self.sort));
        }
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
    }

    pub fn to_json(&self) -> Value {
        let mut sort = Map::new();
        for (field, order) in &self.sort {
            sort.insert(field.clone(), Value::from(order.as_i32()));
        }
        json!({ "sort": sort, "limit": self.limit })
    }
}

/// Group accumulator.
#[derive(Clone, Debug, PartialEq)]
pub enum Accumulator {
    /// Largest value of the field within the group.
    Max(String),
    /// Value of the field on the last document of the group.
    Last(String),
}

/// One aggregation stage.
#[derive(Clone, Debug, PartialEq)]
pub enum Stage {
    Match(Filter),
    /// Group by `key`, producing `{ "_id": key, <name>: <accumulated> }`.
    Group {
        key: String,
        accumulators: Vec<(String, Accumulator)>,
    },
    /// Produce `{ <output>: doc[<source>] }` for each pair.
    Project(Vec<(String, String)>),
}

/// Ordered aggregation pipeline.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pipeline(pub Vec<Stage>);

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Pipeline(stages)
    }

    /// Evaluate the pipeline over a set of documents.
    pub fn run(&self, docs: Vec<Document>) -> Vec<Document> {
        self.0.iter().fold(docs, |docs, stage| run_stage(stage, docs))
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.0.iter().map(stage_to_json).collect())
    }
}

fn run_stage(stage: &Stage, docs: Vec<Document>) -> Vec<Document> {
    match stage {
        Stage::Match(filter) => docs.into_iter().filter(|d| filter.matches(d)).collect(),
        Stage::Group { key, accumulators } => {
            let mut order: Vec<Document> = Vec::new();
            let mut slots: HashMap<String, usize> = HashMap::new();

            for doc in docs {
                let key_value = doc.get(key).cloned().unwrap_or(Value::Null);
                let slot = *slots.entry(key_value.to_string()).or_insert_with(|| {
                    let mut group = Document::new();
                    group.insert("_id".to_string(), key_value.clone());
                    order.push(group);
                    order.len() - 1
                });
                let group = &mut order[slot];

                for (name, acc) in accumulators {
                    match acc {
                        Accumulator::Last(field) => {
                            let value = doc.get(field).cloned().unwrap_or(Value::Null);
                            group.insert(name.clone(), value);
                        }
                        Accumulator::Max(field) => {
                            let Some(value) = doc.get(field) else { continue };
                            let replace = group
                                .get(name)
                                .map_or(true, |cur| compare_values(value, cur) == Ordering::Greater);
                            if replace {
                                group.insert(name.clone(), value.clone());
                            }
                        }
                    }
                }
            }
            order
        }
        Stage::Project(fields) => docs
            .into_iter()
            .map(|doc| {
                let mut out = Document::new();
                for (output, source) in fields {
                    if let Some(value) = doc.get(source) {
                        out.insert(output.clone(), value.clone());
                    }
                }
                out
            })
            .collect(),
    }
}

fn stage_to_json(stage: &Stage) -> Value {
    match stage {
        Stage::Match(filter) => json!({ "$match": filter.to_json() }),
        Stage::Group { key, accumulators } => {
            let mut group = Map::new();
            group.insert("_id".into(), Value::from(format!("${}", key)));
            for (name, acc) in accumulators {
                let rendered = match acc {
                    Accumulator::Max(f) => json!({ "$max": format!("${}", f) }),
                    Accumulator::Last(f) => json!({ "$last": format!("${}", f) }),
                };
                group.insert(name.clone(), rendered);
            }
            json!({ "$group": group })
        }
        Stage::Project(fields) => {
            let mut project = Map::new();
            project.insert("_id".into(), Value::from(0));
            for (output, source) in fields {
                let rendered = if output == source {
                    Value::from(1)
                } else {
                    Value::from(format!("${}", source))
                };
                project.insert(output.clone(), rendered);
            }
            json!({ "$project": project })
        }
    }
}

/// Index key specification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSpec {
    pub keys: Vec<(String, SortOrder)>,
}

impl IndexSpec {
    pub fn ascending(fields: &[&str]) -> Self {
        Self {
            keys: fields
                .iter()
                .map(|f| (f.to_string(), SortOrder::Ascending))
                .collect(),
        }
    }

    /// Conventional index name, e.g. `id_1_revision_1`.
    pub fn name(&self) -> String {
        self.keys
            .iter()
            .map(|(k, o)| format!("{}_{}", k, o.as_i32()))
            .collect::<Vec<_>>()
            .join("_")
    }
}

fn compare_documents(a: &Document, b: &Document, sort: &[(String, SortOrder)]) -> Ordering {
    for (field, order) in sort {
        let left = a.get(field).unwrap_or(&Value::Null);
        let right = b.get(field).unwrap_or(&Value::Null);
        let ord = compare_values(left, right);
        let ord = match order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

fn same_type_class(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b)
}

/// Total order over JSON values, following the BSON comparison order.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
