//! Instance and attribute-value representation.
//!
//! An [`Instance`] is an ordered map from [`AttrName`] to [`AttrValue`]. Two
//! attribute names are reserved: [`AttrName::ctx`] (the contextual
//! attribute, stored internally as `"#Ctxt#"` to mirror the original design)
//! and [`CV_KEY`] (the inner key the original design nests a continuous-value
//! accumulator under inside a numeric attribute's count map; here
//! `AttrCounts::Numeric` holds the accumulator directly as its own enum
//! variant, so `CV_KEY` has no lookup use but is kept as the reserved-name
//! constant for callers matching against the original token set). Attribute
//! names beginning with `_` are "hidden" and are skipped by
//! [`crate::node::ConceptNode::is_exact_match`].

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

use crate::context::ContextHandleId;

/// The internal token used for the reserved contextual attribute.
pub const CTX_KEY: &str = "#Ctxt#";
/// The internal token used for the reserved continuous-value inner key.
pub const CV_KEY: &str = "cv";

/// An attribute name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize)]
pub struct AttrName(String);

impl AttrName {
    /// Builds an attribute name from any string-like value.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The reserved contextual attribute name.
    #[must_use]
    pub fn ctx() -> Self {
        Self(CTX_KEY.to_string())
    }

    /// Whether this is the reserved contextual attribute.
    #[must_use]
    pub fn is_ctx(&self) -> bool {
        self.0 == CTX_KEY
    }

    /// Whether this attribute is hidden (name begins with `_`) and should be
    /// skipped by [`crate::node::ConceptNode::is_exact_match`].
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.0.starts_with('_')
    }

    /// The innermost component of a tuple-structured attribute name, used by
    /// [`crate::tree::TreeConfig::inner_attr_scaling`]. Tuple-structured
    /// names (as produced by structure-mapping preprocessing, out of scope
    /// here) are written as `outer::inner`; plain names are their own inner
    /// component.
    #[must_use]
    pub fn inner(&self) -> &str {
        match self.0.rsplit_once("::") {
            Some((_, inner)) => inner,
            None => &self.0,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AttrName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A categorical attribute value (an interned-by-equality token).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize)]
pub struct NominalValue(String);

impl NominalValue {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NominalValue {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A single attribute value: numeric, nominal, or (under the reserved `CTX`
/// key only) a list of context handles.
#[derive(Debug, Clone, PartialEq, From)]
pub enum AttrValue {
    /// A real-valued measurement.
    Numeric(f64),
    /// A categorical token.
    Nominal(NominalValue),
    /// The contextual attribute: the handles of the neighboring instances
    /// currently being categorized alongside this one. Only valid under
    /// [`AttrName::ctx`].
    Context(Vec<ContextHandleId>),
}

impl AttrValue {
    #[must_use]
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            Self::Numeric(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_nominal(&self) -> Option<&NominalValue> {
        match self {
            Self::Nominal(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_context(&self) -> Option<&[ContextHandleId]> {
        match self {
            Self::Context(handles) => Some(handles),
            _ => None,
        }
    }
}

impl Display for AttrValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "{v}"),
            Self::Nominal(v) => write!(f, "{v}"),
            Self::Context(handles) => write!(f, "{handles:?}"),
        }
    }
}

/// An input record: attribute name to value, in insertion-independent
/// (sorted) order so iteration is deterministic regardless of how the
/// instance was built.
pub type Instance = BTreeMap<AttrName, AttrValue>;
