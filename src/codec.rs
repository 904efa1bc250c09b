//! Self-describing record encoding.
//!
//! An encoded record starts with a per-record delimiter base character `d`
//! that occurs nowhere else in the payload. `d1`, `d2` and `d3` separate the
//! three nesting levels:
//!
//! ```text
//! d name d1 color d1 created d1 updated d1 labels d1 fields d1 barcode d1 images
//! labels:  label d2 label ...
//! fields:  name d3 value d3 secret d2 ...
//! barcode: code d3 type d3 show_text   (or a bare d3 when absent)
//! images:  path d2 path ...
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::trace;
use rand::Rng;

use crate::domain::{Barcode, Credential, CredentialField, CredentialId};
use crate::error::CodecError;

const COMPONENTS: usize = 8;
const RANDOM_ATTEMPTS: usize = 64;

struct Separators {
    base: char,
    level1: String,
    level2: String,
    level3: String,
}

impl Separators {
    fn new(base: char) -> Self {
        Self {
            base,
            level1: format!("{base}1"),
            level2: format!("{base}2"),
            level3: format!("{base}3"),
        }
    }
}

pub fn encode(credential: &Credential) -> String {
    let sep = Separators::new(choose_delimiter(credential));

    let labels = credential
        .labels
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(sep.level2.as_str());

    let fields = credential
        .fields
        .iter()
        .map(|f| [f.name.as_str(), f.value.as_str(), bool_str(f.secret)].join(sep.level3.as_str()))
        .collect::<Vec<_>>()
        .join(sep.level2.as_str());

    let barcode = match &credential.barcode {
        Some(b) => [b.code.as_str(), b.kind.as_str(), bool_str(b.show_text)].join(sep.level3.as_str()),
        None => sep.level3.clone(),
    };

    let images = credential
        .image_paths
        .iter()
        .map(|p| p.to_string_lossy())
        .collect::<Vec<_>>()
        .join(sep.level2.as_str());

    let components = [
        credential.name.clone(),
        credential.color.to_string(),
        credential.created_at.timestamp_millis().to_string(),
        credential.updated_at.timestamp_millis().to_string(),
        labels,
        fields,
        barcode,
        images,
    ];

    let mut out = String::new();
    out.push(sep.base);
    out.push_str(&components.join(sep.level1.as_str()));
    out
}

pub fn decode(encoded: &str, id: CredentialId) -> Result<Credential, CodecError> {
    let base = encoded.chars().next().ok_or(CodecError::Empty)?;
    let sep = Separators::new(base);
    let body = &encoded[base.len_utf8()..];

    let parts: Vec<&str> = body.split(sep.level1.as_str()).collect();
    if parts.len() != COMPONENTS {
        return Err(CodecError::ComponentCount {
            expected: COMPONENTS,
            found: parts.len(),
        });
    }

    let color = parts[1]
        .parse::<u32>()
        .map_err(|_| CodecError::InvalidNumber {
            what: "color",
            value: parts[1].to_string(),
        })?;

    let labels: BTreeSet<String> = items(parts[4], &sep.level2)
        .map(str::to_string)
        .collect();

    let fields = items(parts[5], &sep.level2)
        .map(|item| {
            let sub: Vec<&str> = item.split(sep.level3.as_str()).collect();
            match sub.as_slice() {
                [name, value, secret] => Ok(CredentialField {
                    name: name.to_string(),
                    value: value.to_string(),
                    secret: parse_bool(secret)?,
                }),
                _ => Err(CodecError::SubFieldCount {
                    what: "field",
                    found: sub.len(),
                }),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let barcode = if parts[6] == sep.level3 {
        None
    } else {
        let sub: Vec<&str> = parts[6].split(sep.level3.as_str()).collect();
        match sub.as_slice() {
            [code, kind, show_text] => Some(Barcode {
                code: code.to_string(),
                kind: kind.parse()?,
                show_text: parse_bool(show_text)?,
            }),
            _ => {
                return Err(CodecError::SubFieldCount {
                    what: "barcode",
                    found: sub.len(),
                });
            }
        }
    };

    let image_paths = items(parts[7], &sep.level2).map(PathBuf::from).collect();

    Ok(Credential {
        id,
        name: parts[0].to_string(),
        color,
        created_at: parse_millis("creation date", parts[2])?,
        updated_at: parse_millis("alteration date", parts[3])?,
        labels,
        fields,
        barcode,
        image_paths,
    })
}

/// The delimiter base character a record was encoded with.
pub fn delimiter_of(encoded: &str) -> Option<char> {
    encoded.chars().next()
}

fn choose_delimiter(credential: &Credential) -> char {
    let numeric = [
        credential.color.to_string(),
        credential.created_at.timestamp_millis().to_string(),
        credential.updated_at.timestamp_millis().to_string(),
    ];
    let collides = |c: char| {
        c.is_ascii_digit()
            || credential.name.contains(c)
            || numeric.iter().any(|s| s.contains(c))
            || credential.labels.iter().any(|l| l.contains(c))
            || credential.fields.iter().any(|f| {
                f.name.contains(c) || f.value.contains(c) || bool_str(f.secret).contains(c)
            })
            || credential.barcode.as_ref().is_some_and(|b| {
                b.code.contains(c) || b.kind.as_str().contains(c) || bool_str(b.show_text).contains(c)
            })
            || credential
                .image_paths
                .iter()
                .any(|p| p.to_string_lossy().contains(c))
    };

    let mut rng = rand::rng();
    for attempt in 0..RANDOM_ATTEMPTS {
        let Some(candidate) = char::from_u32(rng.random_range(0..=char::MAX as u32)) else {
            continue;
        };
        if !collides(candidate) {
            trace!("delimiter chosen after {} draws", attempt + 1);
            return candidate;
        }
    }

    (0..=char::MAX as u32)
        .filter_map(char::from_u32)
        .find(|&c| !collides(c))
        .unwrap_or_else(|| unreachable!("payload uses every unicode scalar value"))
}

fn items<'a>(blob: &'a str, sep: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    blob.split(sep).filter(|item| !item.is_empty())
}

fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn parse_bool(value: &str) -> Result<bool, CodecError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(CodecError::InvalidBool(other.to_string())),
    }
}

fn parse_millis(what: &'static str, value: &str) -> Result<DateTime<Utc>, CodecError> {
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| CodecError::InvalidNumber {
            what,
            value: value.to_string(),
        })
}
