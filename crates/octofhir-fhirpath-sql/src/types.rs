//! FHIRPath primitive types and the alias registry.
//!
//! FHIR defines many primitive types that behave identically once they are
//! evaluated (`code`, `id` and `markdown` are all strings). The
//! [`TypeRegistry`] folds those aliases onto a small set of canonical
//! [`FhirPathType`]s so `is`, `as` and `ofType` only ever hand canonical names
//! to a dialect.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Canonical FHIRPath value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FhirPathType {
    /// Boolean values.
    Boolean,

    /// String values (`code`, `id`, `markdown`, ...).
    String,

    /// URI values (`url`, `canonical`, `oid`, `uuid`).
    Uri,

    /// Integer values (`positiveInt`, `unsignedInt`, `integer64`).
    Integer,

    /// Decimal values.
    Decimal,

    /// Date values (YYYY, YYYY-MM or YYYY-MM-DD).
    Date,

    /// DateTime values (`instant` included).
    DateTime,

    /// Time values (HH:MM:SS).
    Time,

    /// Base64 encoded binary data.
    Base64Binary,

    /// Quantity and its FHIR specializations.
    Quantity,
}

impl FhirPathType {
    /// Every canonical type, in registry order.
    pub const ALL: [FhirPathType; 10] = [
        Self::Boolean,
        Self::String,
        Self::Uri,
        Self::Integer,
        Self::Decimal,
        Self::Date,
        Self::DateTime,
        Self::Time,
        Self::Base64Binary,
        Self::Quantity,
    ];

    /// The canonical spelling of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Uri => "uri",
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Date => "date",
            Self::DateTime => "dateTime",
            Self::Time => "time",
            Self::Base64Binary => "base64Binary",
            Self::Quantity => "Quantity",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Decimal)
    }

    /// Types whose JSON representation is a string.
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            Self::String
                | Self::Uri
                | Self::Date
                | Self::DateTime
                | Self::Time
                | Self::Base64Binary
        )
    }
}

impl fmt::Display for FhirPathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DEFAULT_ALIASES: &[(&str, FhirPathType)] = &[
    ("code", FhirPathType::String),
    ("id", FhirPathType::String),
    ("markdown", FhirPathType::String),
    ("xhtml", FhirPathType::String),
    ("url", FhirPathType::Uri),
    ("canonical", FhirPathType::Uri),
    ("oid", FhirPathType::Uri),
    ("uuid", FhirPathType::Uri),
    ("unsignedint", FhirPathType::Integer),
    ("positiveint", FhirPathType::Integer),
    ("integer64", FhirPathType::Integer),
    ("instant", FhirPathType::DateTime),
    ("age", FhirPathType::Quantity),
    ("count", FhirPathType::Quantity),
    ("distance", FhirPathType::Quantity),
    ("duration", FhirPathType::Quantity),
    ("simplequantity", FhirPathType::Quantity),
    ("moneyquantity", FhirPathType::Quantity),
];

/// Namespaces a type name may be qualified with (`System.String`, `FHIR.code`).
const NAMESPACES: &[&str] = &["system.", "fhir."];

/// Case-insensitive lookup from FHIR type names and aliases to canonical types.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    /// Lower-cased name -> canonical type. Canonical names are entries too.
    entries: IndexMap<String, FhirPathType>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Create a registry holding the FHIR primitive aliases.
    pub fn new() -> Self {
        let mut entries = IndexMap::new();
        for ty in FhirPathType::ALL {
            entries.insert(ty.as_str().to_ascii_lowercase(), ty);
        }
        for (alias, ty) in DEFAULT_ALIASES {
            entries.insert((*alias).to_string(), *ty);
        }
        Self { entries }
    }

    /// Register an additional alias. Returns the canonical type it replaced, if any.
    pub fn register_alias(
        &mut self,
        alias: impl AsRef<str>,
        canonical: FhirPathType,
    ) -> Option<FhirPathType> {
        self.entries
            .insert(normalize(alias.as_ref()).to_string(), canonical)
    }

    /// Resolve a type name or alias to its canonical type.
    ///
    /// The lookup trims the input, ignores case and accepts `System.` and
    /// `FHIR.` qualifiers. Unknown names return `None`; callers decide how to
    /// report them.
    pub fn resolve_to_canonical(&self, name: &str) -> Option<FhirPathType> {
        let key = normalize(name);
        if key.is_empty() {
            return None;
        }
        self.entries.get(key.as_str()).copied()
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.resolve_to_canonical(name).is_some()
    }

    /// Whether two type names resolve to the same canonical type.
    ///
    /// Returns `None` when either name is unknown.
    pub fn is_compatible(&self, actual: &str, target: &str) -> Option<bool> {
        let actual = self.resolve_to_canonical(actual)?;
        let target = self.resolve_to_canonical(target)?;
        Some(actual == target)
    }

    /// All registered aliases of a canonical type, excluding the canonical name itself.
    pub fn aliases_of(&self, canonical: FhirPathType) -> Vec<&str> {
        let own = canonical.as_str().to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(name, ty)| **ty == canonical && **name != own)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Canonical names, used to build actionable error messages.
    pub fn canonical_names(&self) -> Vec<String> {
        FhirPathType::ALL
            .iter()
            .map(|ty| ty.as_str().to_string())
            .collect()
    }
}

fn normalize(name: &str) -> String {
    let lowered = name.trim().to_ascii_lowercase();
    NAMESPACES
        .iter()
        .find_map(|ns| lowered.strip_prefix(ns))
        .map(str::to_string)
        .unwrap_or(lowered)
}
