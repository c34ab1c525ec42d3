//! Path-based coercion of request documents into their stored forms.
//!
//! A [`TransformRules`] set maps dotted paths to a [`CoercionKind`]. The path segment `$`
//! stands for "every element of this array", so `items.$.owner` touches the `owner` field
//! of each entry in `items`.
//!
//! Missing or `null` values and intermediate values that are not documents skip a rule
//! silently. A value that is present but not an array where `$` demands one, and any leaf
//! that cannot be parsed, fail the whole call with [`ResourceError::TransformFailed`].
//! Values already in their target form are left untouched.

use std::{fmt, str::FromStr, sync::Arc};

use bson::{Bson, DateTime, Document, oid::ObjectId};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ResourceError, ResourceResult},
    secret::{FieldCipher, SecretHasher},
};

/// The coercion applied to the value found at a rule's path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoercionKind {
    /// Hex string to ObjectId.
    Oid,
    /// Array of hex strings to an array of ObjectIds.
    Oids,
    /// RFC-1123 / RFC-2822 string to a date.
    Date,
    /// Array of RFC-1123 / RFC-2822 strings to dates.
    Dates,
    /// RFC-3339 string to a date.
    Timestamp,
    /// Array of RFC-3339 strings to dates.
    Timestamps,
    /// Plaintext secret to an Argon2id PHC string.
    Password,
    /// Any value to an AES-256-GCM encrypted binary.
    Cipher,
}

impl CoercionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoercionKind::Oid => "oid",
            CoercionKind::Oids => "oids",
            CoercionKind::Date => "date",
            CoercionKind::Dates => "dates",
            CoercionKind::Timestamp => "timestamp",
            CoercionKind::Timestamps => "timestamps",
            CoercionKind::Password => "password",
            CoercionKind::Cipher => "cipher",
        }
    }
}

impl fmt::Display for CoercionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoercionKind {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "oid" => CoercionKind::Oid,
            "oids" => CoercionKind::Oids,
            "date" => CoercionKind::Date,
            "dates" => CoercionKind::Dates,
            "timestamp" => CoercionKind::Timestamp,
            "timestamps" => CoercionKind::Timestamps,
            "password" => CoercionKind::Password,
            "cipher" => CoercionKind::Cipher,
            other => {
                return Err(ResourceError::ValidationFailed(format!(
                    "unknown transform kind {other:?}"
                )));
            }
        })
    }
}

/// An ordered set of path to coercion rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformRules {
    rules: Vec<(String, CoercionKind)>,
}

impl TransformRules {
    pub fn new() -> Self {
        TransformRules::default()
    }

    /// Appends a rule. Rules run in insertion order.
    pub fn rule(mut self, path: impl Into<String>, kind: CoercionKind) -> Self {
        self.rules.push((path.into(), kind));
        self
    }

    /// Parses a `{ "path": "kind" }` document, keeping the document's key order.
    pub fn from_document(document: &Document) -> ResourceResult<Self> {
        document
            .iter()
            .map(|(path, kind)| match kind {
                Bson::String(kind) => Ok((path.clone(), kind.parse()?)),
                _ => Err(ResourceError::ValidationFailed(format!(
                    "transform kind for {path} must be a string"
                ))),
            })
            .collect::<ResourceResult<Vec<_>>>()
            .map(|rules| TransformRules { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, CoercionKind)> {
        self.rules.iter().map(|(path, kind)| (path.as_str(), *kind))
    }
}

/// Applies [`TransformRules`] to documents.
#[derive(Debug, Clone, Default)]
pub struct Transformer {
    hasher: SecretHasher,
    cipher: Option<Arc<FieldCipher>>,
}

impl Transformer {
    pub fn new() -> Self {
        Transformer::default()
    }

    /// Enables the `cipher` coercion.
    pub fn with_cipher(mut self, cipher: FieldCipher) -> Self {
        self.cipher = Some(Arc::new(cipher));
        self
    }

    pub fn cipher(&self) -> Option<&FieldCipher> {
        self.cipher.as_deref()
    }

    pub fn hasher(&self) -> &SecretHasher {
        &self.hasher
    }

    /// Rewrites `document` in place according to `rules`.
    ///
    /// On error the document may be partially rewritten; callers discard it.
    pub fn apply(&self, document: &mut Document, rules: &TransformRules) -> ResourceResult<()> {
        for (path, kind) in rules.iter() {
            let segments = path.split('.').collect::<Vec<_>>();
            let Some((head, rest)) = segments.split_first() else {
                continue;
            };

            if let Some(value) = document.get_mut(*head) {
                self.walk(value, rest, &Rule { path, kind })?;
            }
        }

        Ok(())
    }

    fn walk(&self, value: &mut Bson, rest: &[&str], rule: &Rule<'_>) -> ResourceResult<()> {
        if matches!(value, Bson::Null) {
            return Ok(());
        }

        let Some((segment, tail)) = rest.split_first() else {
            let coerced = self.coerce(value, rule)?;
            *value = coerced;
            return Ok(());
        };

        if *segment == "$" {
            return match value {
                Bson::Array(items) => {
                    for item in items.iter_mut() {
                        self.walk(item, tail, rule)?;
                    }
                    Ok(())
                }
                other => Err(rule.failed(format!(
                    "expected an array for `$`, found {:?}",
                    other.element_type()
                ))),
            };
        }

        match value {
            Bson::Document(nested) => match nested.get_mut(*segment) {
                Some(child) => self.walk(child, tail, rule),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn coerce(&self, value: &Bson, rule: &Rule<'_>) -> ResourceResult<Bson> {
        match rule.kind {
            CoercionKind::Oid => coerce_oid(value, rule),
            CoercionKind::Date => coerce_date(value, rule),
            CoercionKind::Timestamp => coerce_timestamp(value, rule),
            CoercionKind::Oids => coerce_each(value, rule, coerce_oid),
            CoercionKind::Dates => coerce_each(value, rule, coerce_date),
            CoercionKind::Timestamps => coerce_each(value, rule, coerce_timestamp),
            CoercionKind::Password => match value {
                Bson::String(secret) if SecretHasher::is_hashed(secret) => Ok(value.clone()),
                Bson::String(secret) => self
                    .hasher
                    .hash(secret)
                    .map(Bson::String)
                    .map_err(|e| rule.failed(e.to_string())),
                other => Err(rule.failed(format!("expected a string, found {:?}", other.element_type()))),
            },
            CoercionKind::Cipher => {
                if FieldCipher::is_encrypted(value) {
                    return Ok(value.clone());
                }

                let cipher = self.cipher.as_ref().ok_or_else(|| {
                    ResourceError::Configuration("no cipher key configured".to_string())
                })?;

                cipher.encrypt(value).map_err(|e| rule.failed(e.to_string()))
            }
        }
    }
}

struct Rule<'a> {
    path: &'a str,
    kind: CoercionKind,
}

impl Rule<'_> {
    fn failed(&self, reason: impl Into<String>) -> ResourceError {
        ResourceError::TransformFailed {
            kind: self.kind,
            path: self.path.to_string(),
            reason: reason.into(),
        }
    }
}

fn coerce_each(
    value: &Bson,
    rule: &Rule<'_>,
    coerce: fn(&Bson, &Rule<'_>) -> ResourceResult<Bson>,
) -> ResourceResult<Bson> {
    match value {
        Bson::Array(items) => items
            .iter()
            .map(|item| coerce(item, rule))
            .collect::<ResourceResult<Vec<_>>>()
            .map(Bson::Array),
        other => Err(rule.failed(format!("expected an array, found {:?}", other.element_type()))),
    }
}

fn coerce_oid(value: &Bson, rule: &Rule<'_>) -> ResourceResult<Bson> {
    match value {
        Bson::ObjectId(_) => Ok(value.clone()),
        Bson::String(hex) => ObjectId::parse_str(hex)
            .map(Bson::ObjectId)
            .map_err(|e| rule.failed(e.to_string())),
        other => Err(rule.failed(format!("expected a hex string, found {:?}", other.element_type()))),
    }
}

fn coerce_date(value: &Bson, rule: &Rule<'_>) -> ResourceResult<Bson> {
    match value {
        Bson::DateTime(_) => Ok(value.clone()),
        Bson::String(text) => chrono::DateTime::parse_from_rfc2822(text)
            .map(|parsed| Bson::DateTime(DateTime::from_chrono(parsed.with_timezone(&Utc))))
            .map_err(|e| rule.failed(e.to_string())),
        other => Err(rule.failed(format!("expected a date string, found {:?}", other.element_type()))),
    }
}

fn coerce_timestamp(value: &Bson, rule: &Rule<'_>) -> ResourceResult<Bson> {
    match value {
        Bson::DateTime(_) => Ok(value.clone()),
        Bson::String(text) => chrono::DateTime::parse_from_rfc3339(text)
            .map(|parsed| Bson::DateTime(DateTime::from_chrono(parsed.with_timezone(&Utc))))
            .map_err(|e| rule.failed(e.to_string())),
        other => Err(rule.failed(format!(
            "expected a timestamp string, found {:?}",
            other.element_type()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use chrono::TimeZone;

    use super::*;
    use crate::secret::KEY_SIZE;

    const OID: &str = "64b7f0c2a1b2c3d4e5f60718";

    fn oid() -> Bson {
        Bson::ObjectId(ObjectId::parse_str(OID).unwrap())
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> Bson {
        Bson::DateTime(DateTime::from_chrono(Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()))
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in [
            CoercionKind::Oid,
            CoercionKind::Oids,
            CoercionKind::Date,
            CoercionKind::Dates,
            CoercionKind::Timestamp,
            CoercionKind::Timestamps,
            CoercionKind::Password,
            CoercionKind::Cipher,
        ] {
            assert_eq!(kind.to_string().parse::<CoercionKind>().unwrap(), kind);
        }
        assert!("uuid".parse::<CoercionKind>().is_err());
    }

    #[test]
    fn test_wildcard_fans_out_over_array() {
        let mut document = doc! {
            "items": [
                { "owner": OID },
                { "owner": OID },
                { "name": "no owner" },
                "not a document",
            ]
        };
        let rules = TransformRules::new().rule("items.$.owner", CoercionKind::Oid);

        Transformer::new().apply(&mut document, &rules).unwrap();

        assert_eq!(
            document,
            doc! {
                "items": [
                    { "owner": oid() },
                    { "owner": oid() },
                    { "name": "no owner" },
                    "not a document",
                ]
            }
        );
    }

    #[test]
    fn test_missing_null_and_scalar_intermediates_skip() {
        let original = doc! {
            "a": null,
            "b": 5,
            "c": { "d": null },
        };
        let mut document = original.clone();
        let rules = TransformRules::new()
            .rule("missing.owner", CoercionKind::Oid)
            .rule("a.owner", CoercionKind::Oid)
            .rule("b.owner", CoercionKind::Oid)
            .rule("c.d", CoercionKind::Timestamp)
            .rule("c.e", CoercionKind::Timestamp);

        Transformer::new().apply(&mut document, &rules).unwrap();

        assert_eq!(document, original);
    }

    #[test]
    fn test_wildcard_on_non_array_fails() {
        let mut document = doc! { "items": { "owner": OID } };
        let rules = TransformRules::new().rule("items.$.owner", CoercionKind::Oid);

        let err = Transformer::new().apply(&mut document, &rules).unwrap_err();

        match err {
            ResourceError::TransformFailed { kind, path, .. } => {
                assert_eq!(kind, CoercionKind::Oid);
                assert_eq!(path, "items.$.owner");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_bad_leaf_fails_with_kind_and_path() {
        let mut document = doc! { "owner": "zzz" };
        let rules = TransformRules::new().rule("owner", CoercionKind::Oid);

        let err = Transformer::new().apply(&mut document, &rules).unwrap_err();

        assert!(matches!(
            err,
            ResourceError::TransformFailed { kind: CoercionKind::Oid, ref path, .. } if path == "owner"
        ));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_dates_accept_obsolete_zone_names() {
        let mut document = doc! {
            "due": "Mon, 02 Jan 2006 15:04:05 MST",
            "holidays": ["Tue, 25 Dec 2007 00:00:00 GMT"],
        };
        let rules = TransformRules::new()
            .rule("due", CoercionKind::Date)
            .rule("holidays", CoercionKind::Dates);

        Transformer::new().apply(&mut document, &rules).unwrap();

        assert_eq!(document.get("due"), Some(&at(2006, 1, 2, 22, 4, 5)));
        assert_eq!(
            document.get("holidays"),
            Some(&Bson::Array(vec![at(2007, 12, 25, 0, 0, 0)]))
        );
    }

    #[test]
    fn test_dates_inside_arrays_of_documents() {
        let mut document = doc! {
            "items": [{ "d": "Mon, 02 Jan 2006 15:04:05 MST" }, { "sku": "A1" }],
        };
        let rules = TransformRules::new().rule("items.$.d", CoercionKind::Date);

        Transformer::new().apply(&mut document, &rules).unwrap();

        assert_eq!(
            document,
            doc! { "items": [{ "d": at(2006, 1, 2, 22, 4, 5) }, { "sku": "A1" }] }
        );
    }

    #[test]
    fn test_timestamps() {
        let mut document = doc! {
            "seen": ["2024-05-01T10:00:00Z", "2024-05-01T12:00:00+02:00"],
            "at": "2024-05-01T10:00:00.000Z",
        };
        let rules = TransformRules::new()
            .rule("seen", CoercionKind::Timestamps)
            .rule("at", CoercionKind::Timestamp);

        Transformer::new().apply(&mut document, &rules).unwrap();

        assert_eq!(
            document.get("seen"),
            Some(&Bson::Array(vec![at(2024, 5, 1, 10, 0, 0), at(2024, 5, 1, 10, 0, 0)]))
        );
        assert_eq!(document.get("at"), Some(&at(2024, 5, 1, 10, 0, 0)));

        let mut bad = doc! { "at": "yesterday" };
        assert!(Transformer::new().apply(&mut bad, &rules).is_err());
    }

    #[test]
    fn test_oids_require_an_array() {
        let mut document = doc! { "members": OID };
        let rules = TransformRules::new().rule("members", CoercionKind::Oids);

        assert!(Transformer::new().apply(&mut document, &rules).is_err());
    }

    #[test]
    fn test_password_is_hashed_once() {
        let transformer = Transformer::new();
        let rules = TransformRules::new().rule("password", CoercionKind::Password);
        let mut document = doc! { "password": "hunter2" };

        transformer.apply(&mut document, &rules).unwrap();
        let hashed = document.get_str("password").unwrap().to_string();
        assert!(transformer.hasher().verify("hunter2", &hashed).is_ok());

        transformer.apply(&mut document, &rules).unwrap();
        assert_eq!(document.get_str("password").unwrap(), hashed);
    }

    #[test]
    fn test_cipher_requires_key_and_is_idempotent() {
        let rules = TransformRules::new().rule("card", CoercionKind::Cipher);

        let mut document = doc! { "card": { "number": "4111" } };
        assert!(matches!(
            Transformer::new().apply(&mut document, &rules),
            Err(ResourceError::Configuration(_))
        ));

        let transformer = Transformer::new().with_cipher(FieldCipher::new(&[3u8; KEY_SIZE]).unwrap());
        transformer.apply(&mut document, &rules).unwrap();
        let sealed = document.get("card").unwrap().clone();
        assert!(FieldCipher::is_encrypted(&sealed));

        transformer.apply(&mut document, &rules).unwrap();
        assert_eq!(document.get("card"), Some(&sealed));
        assert_eq!(
            transformer.cipher().unwrap().decrypt(&sealed).unwrap(),
            Bson::Document(doc! { "number": "4111" })
        );
    }

    #[test]
    fn test_already_typed_values_pass_through() {
        let mut document = doc! { "owner": oid(), "at": at(2024, 1, 1, 0, 0, 0) };
        let original = document.clone();
        let rules = TransformRules::new()
            .rule("owner", CoercionKind::Oid)
            .rule("at", CoercionKind::Timestamp);

        Transformer::new().apply(&mut document, &rules).unwrap();

        assert_eq!(document, original);
    }

    #[test]
    fn test_rules_from_document() {
        let rules = TransformRules::from_document(&doc! {
            "owner": "oid",
            "items.$.at": "timestamp",
        })
        .unwrap();

        assert_eq!(
            rules.iter().collect::<Vec<_>>(),
            vec![("owner", CoercionKind::Oid), ("items.$.at", CoercionKind::Timestamp)]
        );
        assert!(TransformRules::from_document(&doc! { "a": "uuid" }).is_err());
        assert!(TransformRules::from_document(&doc! { "a": 1 }).is_err());
    }
}
