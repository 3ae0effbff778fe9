use bytes::Bytes;

use crate::condition::{Condition, Equals, HeaderSequence, Not};

/// One step of a header-sequence template: a value that must appear, or a
/// gap standing for any run of same-name headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceMatch {
    Value(Bytes),
    Skip,
}

/// One condition of a client filter. A filter's conditions are conjoined;
/// the filters of a subscription are disjoined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterCondition {
    /// Match records whose key equals `value`; a None value matches the
    /// null key.
    Key { value: Option<Bytes> },
    /// Match records carrying a header equal to (name, value).
    Header { name: Bytes, value: Bytes },
    /// Match records the nested condition does not match.
    Not(Box<FilterCondition>),
    /// Match records whose headers named `name` follow the template.
    Headers {
        name: Bytes,
        sequence: Vec<SequenceMatch>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub conditions: Vec<FilterCondition>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    /// Double negation is collapsed for key and header conditions; over a
    /// header sequence its meaning is ambiguous and it is refused.
    #[error("NOT(NOT(HEADERS)) is ambiguous")]
    AmbiguousDoubleNegation,
    #[error("filter condition list is empty")]
    EmptyConjunction,
}

/// Compile client filters into a condition tree. No filters means no
/// predicate: the full partition scan.
pub fn compile(filters: &[Filter]) -> Result<Condition, FilterError> {
    let mut disjuncts = Vec::with_capacity(filters.len());
    for filter in filters {
        disjuncts.push(compile_conjunction(&filter.conditions)?);
    }
    Ok(match disjuncts.len() {
        0 => Condition::None,
        1 => disjuncts.pop().unwrap(),
        _ => Condition::Or(disjuncts),
    })
}

fn compile_conjunction(conditions: &[FilterCondition]) -> Result<Condition, FilterError> {
    if conditions.is_empty() {
        return Err(FilterError::EmptyConjunction);
    }
    let mut compiled = Vec::with_capacity(conditions.len());
    for condition in conditions {
        compiled.push(compile_condition(condition)?);
    }
    Ok(match compiled.len() {
        1 => compiled.pop().unwrap(),
        _ => Condition::And(compiled),
    })
}

fn compile_condition(condition: &FilterCondition) -> Result<Condition, FilterError> {
    Ok(match condition {
        FilterCondition::Key { value } => Condition::Key(Equals::key(value.clone())),
        FilterCondition::Header { name, value } => {
            Condition::Header(Equals::header(name.clone(), value.clone()))
        }
        FilterCondition::Headers { name, sequence } => {
            Condition::HeaderSequence(HeaderSequence::new(name.clone(), sequence.clone()))
        }
        FilterCondition::Not(nested) => match nested.as_ref() {
            FilterCondition::Not(inner) => match inner.as_ref() {
                FilterCondition::Key { .. } | FilterCondition::Header { .. } => {
                    compile_condition(inner)?
                }
                FilterCondition::Headers { .. } => {
                    return Err(FilterError::AmbiguousDoubleNegation)
                }
                FilterCondition::Not(_) => {
                    Condition::Not(Box::new(Not::new(compile_condition(nested)?)))
                }
            },
            _ => Condition::Not(Box::new(Not::new(compile_condition(nested)?))),
        },
    })
}
