//! The fact-store primitive: an [`Assertion`] about a named individual.
//!
//! Three shapes exist, mirroring the assertion kinds an OWL ontology carries
//! for individuals: class membership, an object relation to another
//! individual, and a data attribute holding a [`Literal`].

use serde::{Deserialize, Serialize};

use crate::{KbError, Result};

/// Separator between the individual id and the rest of a canonical key.
///
/// Control characters are rejected in ids, so this can never appear inside
/// one and prefix scans on `"{individual}\u{1f}"` are exact.
pub(crate) const KEY_SEPARATOR: char = '\u{1f}';

/// The value stored in a data attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Literal {
    /// A text string.
    Text(String),
    /// A floating point value (prices, budgets).
    Number(f64),
    /// An integral value (stock counts).
    Integer(i64),
    /// A boolean.
    Boolean(bool),
}

impl Literal {
    /// Numeric view of the literal. Text is parsed leniently, so values
    /// loaded from an ontology as plain strings still project as numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Number(n) => Some(*n),
            Literal::Integer(i) => Some(*i as f64),
            Literal::Text(s) => s.trim().parse().ok(),
            Literal::Boolean(_) => None,
        }
    }

    /// Integral view of the literal. Whole floats convert; fractional ones do not.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Literal::Integer(i) => Some(*i),
            Literal::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            Literal::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Literal::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::Text(s.to_string())
    }
}
impl From<String> for Literal {
    fn from(s: String) -> Self {
        Literal::Text(s)
    }
}
impl From<f64> for Literal {
    fn from(n: f64) -> Self {
        Literal::Number(n)
    }
}
impl From<i64> for Literal {
    fn from(i: i64) -> Self {
        Literal::Integer(i)
    }
}
impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Literal::Boolean(b)
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::Text(s) => write!(f, "{s}"),
            Literal::Number(n) => write!(f, "{n}"),
            Literal::Integer(i) => write!(f, "{i}"),
            Literal::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// A single fact in the store.
///
/// Two assertions are the same fact iff their [`Assertion::key`]s are equal;
/// the store keeps at most one row per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assertion {
    /// `individual rdf:type class`.
    ClassMembership { individual: String, class: String },
    /// `subject relation object`, where `object` is another individual.
    ObjectRelation {
        subject: String,
        relation: String,
        object: String,
    },
    /// `individual attribute "literal"`.
    DataAttribute {
        individual: String,
        attribute: String,
        value: Literal,
    },
}

impl Assertion {
    pub fn class_membership(individual: impl Into<String>, class: impl Into<String>) -> Self {
        Assertion::ClassMembership {
            individual: individual.into(),
            class: class.into(),
        }
    }

    pub fn object_relation(
        subject: impl Into<String>,
        relation: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Assertion::ObjectRelation {
            subject: subject.into(),
            relation: relation.into(),
            object: object.into(),
        }
    }

    pub fn data_attribute(
        individual: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<Literal>,
    ) -> Self {
        Assertion::DataAttribute {
            individual: individual.into(),
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// The individual this assertion is about (the subject position).
    pub fn individual(&self) -> &str {
        match self {
            Assertion::ClassMembership { individual, .. }
            | Assertion::DataAttribute { individual, .. } => individual,
            Assertion::ObjectRelation { subject, .. } => subject,
        }
    }

    /// The class, relation or attribute name.
    pub fn predicate(&self) -> &str {
        match self {
            Assertion::ClassMembership { class, .. } => class,
            Assertion::ObjectRelation { relation, .. } => relation,
            Assertion::DataAttribute { attribute, .. } => attribute,
        }
    }

    /// Reject assertions that cannot name a fact.
    pub fn validate(&self) -> Result<()> {
        check_id("individual id", self.individual())?;
        match self {
            Assertion::ClassMembership { class, .. } => check_name("class name", class),
            Assertion::ObjectRelation {
                relation, object, ..
            } => {
                check_name("relation name", relation)?;
                check_id("relation target", object)
            }
            Assertion::DataAttribute {
                attribute, value, ..
            } => {
                check_name("attribute name", attribute)?;
                match value {
                    Literal::Number(n) if !n.is_finite() => Err(KbError::MalformedAssertion(
                        format!("attribute {attribute} has non-finite value {n}"),
                    )),
                    _ => Ok(()),
                }
            }
        }
    }

    /// Canonical identity of this fact: `"{individual}\u{1f}{json}"`.
    ///
    /// The JSON body is deterministic because field order is fixed by the
    /// enum definition.
    pub fn key(&self) -> Result<String> {
        let body = serde_json::to_string(self)?;
        Ok(format!("{}{KEY_SEPARATOR}{body}", self.individual()))
    }
}

impl std::fmt::Display for Assertion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Assertion::ClassMembership { individual, class } => {
                write!(f, "{individual} a {class}")
            }
            Assertion::ObjectRelation {
                subject,
                relation,
                object,
            } => write!(f, "{subject} {relation} {object}"),
            Assertion::DataAttribute {
                individual,
                attribute,
                value,
            } => write!(f, "{individual} {attribute} {value:?}"),
        }
    }
}

fn check_name(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(KbError::MalformedAssertion(format!("{what} is empty")));
    }
    Ok(())
}

fn check_id(what: &str, value: &str) -> Result<()> {
    check_name(what, value)?;
    if value.chars().any(char::is_control) {
        return Err(KbError::MalformedAssertion(format!(
            "{what} {value:?} contains control characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_individual_is_malformed() {
        let a = Assertion::class_membership("", "Product");
        assert!(matches!(a.validate(), Err(KbError::MalformedAssertion(_))));
    }

    #[test]
    fn empty_relation_is_malformed() {
        let a = Assertion::object_relation("phone1", " ", "Acme");
        assert!(matches!(a.validate(), Err(KbError::MalformedAssertion(_))));
    }

    #[test]
    fn control_characters_in_ids_are_rejected() {
        let a = Assertion::object_relation("phone\u{1f}1", "hasBrand", "Acme");
        assert!(a.validate().is_err());
    }

    #[test]
    fn non_finite_numbers_are_rejected() {
        let a = Assertion::data_attribute("phone1", "price", f64::NAN);
        assert!(a.validate().is_err());
    }

    #[test]
    fn keys_distinguish_literal_types() {
        let int = Assertion::data_attribute("phone1", "stock", 3_i64);
        let float = Assertion::data_attribute("phone1", "stock", 3.0_f64);
        assert_ne!(int.key().unwrap(), float.key().unwrap());
        assert!(int.key().unwrap().starts_with("phone1\u{1f}"));
    }

    #[test]
    fn literal_numeric_views() {
        assert_eq!(Literal::from("12.5").as_f64(), Some(12.5));
        assert_eq!(Literal::from(4.0_f64).as_i64(), Some(4));
        assert_eq!(Literal::from(4.5_f64).as_i64(), None);
        assert_eq!(Literal::from(true).as_f64(), None);
    }
}
