//! Access predicates.
//!
//! Predicates are plain data over the indexed columns of a
//! [`StoredDocument`], so any backend can either evaluate them directly
//! ([`Predicate::matches`]) or translate them into its own query language.

use serde::{Deserialize, Serialize};

use crate::storage::StoredDocument;
use crate::{MetaError, Result};

/// Default page size when a caller does not ask for one.
pub const DEFAULT_LIMIT: u64 = 99_999;

/// Identity of the requesting user. `None` is anonymous.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller(Option<String>);

impl Caller {
    pub fn anonymous() -> Self {
        Caller(None)
    }

    pub fn user(id: impl Into<String>) -> Self {
        Caller(Some(id.into()))
    }

    /// Empty ids are treated as anonymous.
    pub fn from_option(id: Option<String>) -> Self {
        Caller(id.filter(|s| !s.is_empty()))
    }

    pub fn id(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    Id,
    Owner,
    IsPublic,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Literal {
    Str(String),
    Bool(bool),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    True,
    Eq(Field, Literal),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn id(id: impl Into<String>) -> Self {
        Predicate::Eq(Field::Id, Literal::Str(id.into()))
    }

    pub fn owner(owner: impl Into<String>) -> Self {
        Predicate::Eq(Field::Owner, Literal::Str(owner.into()))
    }

    pub fn public(flag: bool) -> Self {
        Predicate::Eq(Field::IsPublic, Literal::Bool(flag))
    }

    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::True, p) | (p, Predicate::True) => p,
            (Predicate::And(mut a), Predicate::And(b)) => {
                a.extend(b);
                Predicate::And(a)
            }
            (Predicate::And(mut a), p) => {
                a.push(p);
                Predicate::And(a)
            }
            (a, b) => Predicate::And(vec![a, b]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::True, _) | (_, Predicate::True) => Predicate::True,
            (Predicate::Or(mut a), p) => {
                a.push(p);
                Predicate::Or(a)
            }
            (a, b) => Predicate::Or(vec![a, b]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    pub fn matches(&self, doc: &StoredDocument) -> bool {
        match self {
            Predicate::True => true,
            Predicate::Eq(field, lit) => match (field, lit) {
                (Field::Id, Literal::Str(s)) => doc.id == *s,
                (Field::Owner, Literal::Str(s)) => doc.owner == *s,
                (Field::IsPublic, Literal::Bool(b)) => doc.is_public == *b,
                // type mismatch never matches
                _ => false,
            },
            Predicate::And(ps) => ps.iter().all(|p| p.matches(doc)),
            Predicate::Or(ps) => ps.iter().any(|p| p.matches(doc)),
            Predicate::Not(p) => !p.matches(doc),
        }
    }
}

/// `is_public OR owner == caller`, or just `is_public` for anonymous callers.
pub fn visible_to(caller: &Caller) -> Predicate {
    match caller.id() {
        Some(user) => Predicate::public(true).or(Predicate::owner(user)),
        None => Predicate::public(true),
    }
}

pub fn visible_by_id(caller: &Caller, id: &str) -> Predicate {
    Predicate::id(id).and(visible_to(caller))
}

pub fn owned_by(user: &str, id: &str) -> Predicate {
    Predicate::id(id).and(Predicate::owner(user))
}

/// Validated skip/limit window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

impl Page {
    pub fn new(offset: i64, limit: i64) -> Result<Self> {
        if offset < 0 {
            return Err(MetaError::Validation(format!(
                "offset must not be negative (got {offset})"
            )));
        }
        if limit < 0 {
            return Err(MetaError::Validation(format!(
                "limit must not be negative (got {limit})"
            )));
        }
        Ok(Page {
            offset: offset as u64,
            limit: limit as u64,
        })
    }

    /// Builds a page from optional request parameters.
    pub fn from_params(offset: Option<i64>, limit: Option<i64>) -> Result<Self> {
        Page::new(offset.unwrap_or(0), limit.unwrap_or(DEFAULT_LIMIT as i64))
    }

    pub fn all() -> Self {
        Page {
            offset: 0,
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn single() -> Self {
        Page { offset: 0, limit: 1 }
    }
}

impl Default for Page {
    fn default() -> Self {
        Page::all()
    }
}
